//! Producer-side fan-out of accepted spots.
//!
//! Producers hand every accepted spot to a [`SpotDispatcher`]. The call
//! never waits: the spot is enriched in place, the spot log and each
//! eligible reporting sink run as their own tasks, and every listener is
//! fed through its own unbounded mailbox. One task per listener drains the
//! mailbox, so each listener sees a producer's spots in the order they were
//! dispatched and a slow listener only delays itself.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::geo::Enricher;
use crate::sinks::{ReportSink, SpotLog};
use crate::spot::{Spot, SpotKind};
use crate::stats::PipelineStats;

type Mailbox = mpsc::UnboundedSender<(SpotKind, Arc<Spot>)>;

/// Observer list. Cloning shares the same registrations.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Mailbox>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async listener. It is called once per spot, one call at
    /// a time, in dispatch order. Must be called inside a tokio runtime.
    pub fn register<F, Fut>(&self, listener: F)
    where
        F: Fn(SpotKind, Arc<Spot>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SpotKind, Arc<Spot>)>();
        tokio::spawn(async move {
            while let Some((kind, spot)) = rx.recv().await {
                listener(kind, spot).await;
            }
        });
        let mut list = self.write();
        list.retain(|mailbox| !mailbox.is_closed());
        list.push(tx);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a spot for every listener.
    pub fn notify(&self, kind: SpotKind, spot: Arc<Spot>) {
        for mailbox in self.read().iter() {
            let _ = mailbox.send((kind, Arc::clone(&spot)));
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Mailbox>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Mailbox>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Enriches spots and fans them out to the log, the reporting sinks and the
/// listeners.
#[derive(Clone)]
pub struct SpotDispatcher {
    enricher: Enricher,
    spot_log: Option<Arc<SpotLog>>,
    reporters: Arc<Vec<Arc<dyn ReportSink>>>,
    listeners: Listeners,
    stats: Arc<PipelineStats>,
}

impl SpotDispatcher {
    pub fn new(
        enricher: Enricher,
        spot_log: Option<Arc<SpotLog>>,
        reporters: Vec<Arc<dyn ReportSink>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            enricher,
            spot_log,
            reporters: Arc::new(reporters),
            listeners: Listeners::new(),
            stats,
        }
    }

    /// The listener registry of this dispatcher.
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Shared pipeline statistics.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Hand a spot off. Never blocks the caller.
    pub fn dispatch(&self, kind: SpotKind, mut spot: Spot) {
        self.enricher.enrich(&mut spot);
        let spot = Arc::new(spot);
        self.stats.record_spot(kind, &spot);
        debug!("{} {}", kind, spot);

        if let Some(ref log) = self.spot_log
            && log.accepts(&spot)
        {
            let log = Arc::clone(log);
            let spot = Arc::clone(&spot);
            let stats = Arc::clone(&self.stats);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = log.append(&spot) {
                    PipelineStats::incr(&stats.sink_failures);
                    warn!("Spot log append failed: {}", e);
                }
            });
        }

        for (idx, reporter) in self.reporters.iter().enumerate() {
            if !reporter.accepts(&spot) {
                continue;
            }
            let reporters = Arc::clone(&self.reporters);
            let spot = Arc::clone(&spot);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                let reporter = &reporters[idx];
                if let Err(e) = reporter.submit(spot).await {
                    PipelineStats::incr(&stats.sink_failures);
                    warn!("{}: {}", reporter.name(), e);
                }
            });
        }

        self.listeners.notify(kind, spot);
    }
}
