//! Fan-out of spot events to connected subscribers.
//!
//! The hub keeps one dedup cache and one replay buffer per [`SpotKind`].
//! Events that survive dedup are serialized once and written to every
//! subscriber concurrently. A subscriber whose write fails or times out is
//! removed after the pass; the others never wait on it.

mod dedup;
mod keepalive;
mod replay;
mod throughput;

pub use dedup::{DedupCache, dedup_key};
pub use keepalive::run_keepalive;
pub use replay::ReplayBuffer;
pub use throughput::ThroughputTracker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::client::{ConnectionState, SkimmerStatus};
use crate::dispatch::Listeners;
use crate::spot::{Spot, SpotKind};
use crate::stats::PipelineStats;

/// How often stale dedup entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from writing to a subscriber.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("subscriber connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Tunables for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long an identical event is suppressed after a broadcast.
    pub dedup_window: Duration,
    /// Extra age past the window before a dedup entry is swept.
    pub dedup_margin: Duration,
    /// Replay entries kept per event kind.
    pub replay_capacity: usize,
    /// Pause between the status frame and the replay on connect.
    pub settle_delay: Duration,
    /// Upper bound on a single write to one subscriber.
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(120),
            dedup_margin: Duration::from_secs(30),
            replay_capacity: 100,
            settle_delay: Duration::from_millis(500),
            write_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            status_interval: Duration::from_secs(10),
        }
    }
}

/// Payload of the `status` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub skimmer_connected: bool,
    pub skimmer_state: ConnectionState,
    pub subscribers: usize,
    pub uptime_secs: u64,
    pub bands: Vec<String>,
}

/// A text frame on the subscriber wire.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame<'a> {
    DxSpot(&'a Spot),
    DigitalSpot(&'a Spot),
    CwSpot(&'a Spot),
    Status(&'a Status),
}

impl<'a> Frame<'a> {
    pub fn spot(kind: SpotKind, spot: &'a Spot) -> Self {
        match kind {
            SpotKind::DxSpot => Frame::DxSpot(spot),
            SpotKind::DigitalSpot => Frame::DigitalSpot(spot),
            SpotKind::CwSpot => Frame::CwSpot(spot),
        }
    }

    pub fn to_json(&self) -> Result<Arc<str>, HubError> {
        Ok(serde_json::to_string(self)?.into())
    }
}

/// What the hub hands to a [`FrameSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutFrame {
    Text(Arc<str>),
    Ping,
}

impl OutFrame {
    /// Payload size for throughput accounting.
    pub fn len(&self) -> usize {
        match self {
            OutFrame::Text(text) => text.len(),
            OutFrame::Ping => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The write half of a subscriber connection.
pub trait FrameSink: Send {
    fn send(&mut self, frame: OutFrame) -> BoxFuture<'_, Result<(), HubError>>;

    /// Close the connection. Errors are ignored.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// A connected peer.
pub struct Subscriber {
    id: u64,
    correlation: Option<String>,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    removed: watch::Sender<bool>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Correlation id supplied by the client, if any.
    pub fn correlation(&self) -> Option<&str> {
        self.correlation.as_deref()
    }

    /// Resolves once the hub has dropped this subscriber.
    pub fn on_removed(&self) -> watch::Receiver<bool> {
        self.removed.subscribe()
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.borrow()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("correlation", &self.correlation)
            .finish()
    }
}

struct ChannelState {
    dedup: DedupCache,
    replay: ReplayBuffer<Arc<str>>,
}

impl ChannelState {
    fn new(config: &HubConfig) -> Self {
        Self {
            dedup: DedupCache::new(config.dedup_window),
            replay: ReplayBuffer::new(config.replay_capacity),
        }
    }
}

struct HubInner {
    config: HubConfig,
    stats: Arc<PipelineStats>,
    skimmer: Option<SkimmerStatus>,
    bands: Vec<String>,
    started: Instant,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    channels: [Mutex<ChannelState>; 3],
    throughput: ThroughputTracker,
}

impl HubInner {
    fn channel(&self, kind: SpotKind) -> &Mutex<ChannelState> {
        match kind {
            SpotKind::DxSpot => &self.channels[0],
            SpotKind::DigitalSpot => &self.channels[1],
            SpotKind::CwSpot => &self.channels[2],
        }
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to the hub.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new(
        config: HubConfig,
        stats: Arc<PipelineStats>,
        skimmer: Option<SkimmerStatus>,
        bands: Vec<String>,
    ) -> Self {
        let channels = [
            Mutex::new(ChannelState::new(&config)),
            Mutex::new(ChannelState::new(&config)),
            Mutex::new(ChannelState::new(&config)),
        ];
        Self {
            inner: Arc::new(HubInner {
                config,
                stats,
                skimmer,
                bands,
                started: Instant::now(),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                channels,
                throughput: ThroughputTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn throughput(&self) -> &ThroughputTracker {
        &self.inner.throughput
    }

    /// Publish every dispatched spot through this hub.
    pub fn attach(&self, listeners: &Listeners) {
        let hub = self.clone();
        listeners.register(move |kind, spot: Arc<Spot>| {
            let hub = hub.clone();
            async move {
                hub.publish(kind, &spot).await;
            }
        });
    }

    /// Add a subscriber to the registry without sending anything.
    pub fn register(
        &self,
        sink: Box<dyn FrameSink>,
        correlation: Option<String>,
    ) -> Arc<Subscriber> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (removed, _) = watch::channel(false);
        let subscriber = Arc::new(Subscriber {
            id,
            correlation,
            sink: tokio::sync::Mutex::new(sink),
            removed,
        });
        if let Some(correlation) = subscriber.correlation() {
            self.inner.throughput.attach(correlation);
        }

        let count = {
            let mut subscribers = lock(&self.inner.subscribers);
            subscribers.insert(id, Arc::clone(&subscriber));
            subscribers.len()
        };
        info!("Subscriber {} connected ({} total)", id, count);
        subscriber
    }

    /// Send the status frame, wait for the client to settle, then replay
    /// each kind's history oldest-first.
    pub async fn greet(&self, subscriber: &Arc<Subscriber>) -> Result<(), HubError> {
        let status = Frame::Status(&self.status()).to_json()?;
        self.send_or_remove(subscriber, OutFrame::Text(status))
            .await?;

        tokio::time::sleep(self.inner.config.settle_delay).await;

        let mut replayed = 0;
        for kind in SpotKind::ALL {
            let frames = lock(self.inner.channel(kind)).replay.snapshot();
            for text in frames {
                if subscriber.is_removed() {
                    return Err(HubError::Closed);
                }
                self.send_or_remove(subscriber, OutFrame::Text(text)).await?;
                replayed += 1;
            }
        }
        debug!("Replayed {} events to subscriber {}", replayed, subscriber.id);
        Ok(())
    }

    /// Register and greet a new subscriber.
    pub async fn connect(
        &self,
        sink: Box<dyn FrameSink>,
        correlation: Option<String>,
    ) -> Result<Arc<Subscriber>, HubError> {
        let subscriber = self.register(sink, correlation);
        self.greet(&subscriber).await?;
        Ok(subscriber)
    }

    /// Dedup, record for replay and broadcast one event.
    ///
    /// Returns `false` when the event was suppressed as a duplicate.
    pub async fn publish(&self, kind: SpotKind, spot: &Spot) -> bool {
        let text = match Frame::spot(kind, spot).to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping {} for {}: {}", kind, spot.callsign, e);
                return false;
            }
        };

        {
            let mut channel = lock(self.inner.channel(kind));
            if !channel
                .dedup
                .check_and_insert(dedup_key(kind, spot), Instant::now())
            {
                PipelineStats::incr(&self.inner.stats.hub_duplicates);
                return false;
            }
            channel.replay.push(Arc::clone(&text));
        }

        PipelineStats::incr(&self.inner.stats.hub_broadcasts);
        self.broadcast(OutFrame::Text(text)).await;
        true
    }

    /// Write a frame to every subscriber. Returns how many writes succeeded.
    pub async fn broadcast(&self, frame: OutFrame) -> usize {
        let peers: Vec<Arc<Subscriber>> =
            lock(&self.inner.subscribers).values().cloned().collect();
        if peers.is_empty() {
            return 0;
        }

        let results = join_all(peers.iter().map(|peer| {
            let frame = frame.clone();
            async move { (peer.id, self.send_to(peer, frame).await) }
        }))
        .await;

        let failed: Vec<u64> = results
            .into_iter()
            .filter_map(|(id, result)| {
                result.err().map(|e| {
                    debug!("Write to subscriber {} failed: {}", id, e);
                    PipelineStats::incr(&self.inner.stats.hub_write_failures);
                    id
                })
            })
            .collect();

        let delivered = peers.len() - failed.len();
        if !failed.is_empty() {
            self.remove_many(&failed).await;
        }
        delivered
    }

    /// Send a keepalive ping, removing the subscriber if it fails.
    pub async fn ping(&self, subscriber: &Arc<Subscriber>) -> Result<(), HubError> {
        self.send_or_remove(subscriber, OutFrame::Ping).await
    }

    /// Drop a subscriber and close its connection.
    pub async fn remove(&self, id: u64) -> bool {
        self.remove_many(&[id]).await > 0
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    pub fn replay_len(&self, kind: SpotKind) -> usize {
        lock(self.inner.channel(kind)).replay.len()
    }

    pub fn status(&self) -> Status {
        let (skimmer_connected, skimmer_state) = match &self.inner.skimmer {
            Some(status) => (status.is_connected(), status.state()),
            None => (false, ConnectionState::Disconnected),
        };
        Status {
            skimmer_connected,
            skimmer_state,
            subscribers: self.subscriber_count(),
            uptime_secs: self.inner.started.elapsed().as_secs(),
            bands: self.inner.bands.clone(),
        }
    }

    pub async fn broadcast_status(&self) {
        match Frame::Status(&self.status()).to_json() {
            Ok(text) => {
                self.broadcast(OutFrame::Text(text)).await;
            }
            Err(e) => warn!("Failed to serialize status: {}", e),
        }
    }

    /// Remove dedup entries older than window plus margin.
    pub fn sweep_dedup(&self, now: Instant) -> usize {
        let max_age = self.inner.config.dedup_window + self.inner.config.dedup_margin;
        SpotKind::ALL
            .iter()
            .map(|kind| lock(self.inner.channel(*kind)).dedup.sweep(now, max_age))
            .sum()
    }

    /// Start the status ticker and dedup sweeper. On shutdown every
    /// subscriber is closed.
    pub fn spawn_background(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let period = hub.inner.config.status_interval.max(Duration::from_millis(100));
            let mut status_tick = interval(period);
            status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            status_tick.tick().await;
            let mut sweep_tick = interval(SWEEP_INTERVAL);
            sweep_tick.tick().await;

            loop {
                tokio::select! {
                    _ = status_tick.tick() => {
                        if hub.subscriber_count() > 0 {
                            hub.broadcast_status().await;
                        }
                    }
                    _ = sweep_tick.tick() => {
                        let swept = hub.sweep_dedup(Instant::now());
                        if swept > 0 {
                            debug!("Swept {} dedup entries", swept);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            let ids: Vec<u64> = lock(&hub.inner.subscribers).keys().copied().collect();
            hub.remove_many(&ids).await;
            info!("Hub stopped");
        })
    }

    async fn send_to(&self, subscriber: &Subscriber, frame: OutFrame) -> Result<(), HubError> {
        let limit = self.inner.config.write_timeout;
        let len = frame.len();
        timeout(limit, async {
            let mut sink = subscriber.sink.lock().await;
            sink.send(frame).await
        })
        .await
        .map_err(|_| HubError::WriteTimeout(limit))??;

        if let Some(correlation) = subscriber.correlation() {
            self.inner.throughput.record(correlation, len);
        }
        Ok(())
    }

    async fn send_or_remove(
        &self,
        subscriber: &Arc<Subscriber>,
        frame: OutFrame,
    ) -> Result<(), HubError> {
        if let Err(e) = self.send_to(subscriber, frame).await {
            debug!("Write to subscriber {} failed: {}", subscriber.id, e);
            PipelineStats::incr(&self.inner.stats.hub_write_failures);
            self.remove(subscriber.id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove_many(&self, ids: &[u64]) -> usize {
        let (removed, remaining): (Vec<Arc<Subscriber>>, usize) = {
            let mut subscribers = lock(&self.inner.subscribers);
            let removed = ids.iter().filter_map(|id| subscribers.remove(id)).collect();
            (removed, subscribers.len())
        };

        for subscriber in &removed {
            subscriber.removed.send_replace(true);
            if let Some(correlation) = subscriber.correlation() {
                self.inner.throughput.detach(correlation);
            }
            let _ = timeout(self.inner.config.write_timeout, async {
                subscriber.sink.lock().await.close().await
            })
            .await;
            info!(
                "Subscriber {} disconnected ({} remaining)",
                subscriber.id, remaining
            );
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::Mode;
    use chrono::Utc;
    use futures::FutureExt;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct TestSink {
        frames: Arc<Mutex<Vec<OutFrame>>>,
        closed: Arc<AtomicBool>,
        fail: bool,
        stall: bool,
        pong: Option<Arc<Notify>>,
    }

    impl TestSink {
        fn texts(&self) -> Vec<serde_json::Value> {
            lock(&self.frames)
                .iter()
                .filter_map(|frame| match frame {
                    OutFrame::Text(text) => serde_json::from_str(text).ok(),
                    OutFrame::Ping => None,
                })
                .collect()
        }

        fn pings(&self) -> usize {
            lock(&self.frames)
                .iter()
                .filter(|frame| **frame == OutFrame::Ping)
                .count()
        }
    }

    impl FrameSink for TestSink {
        fn send(&mut self, frame: OutFrame) -> BoxFuture<'_, Result<(), HubError>> {
            async move {
                if self.stall {
                    futures::future::pending::<()>().await;
                }
                if self.fail {
                    return Err(HubError::Closed);
                }
                if frame == OutFrame::Ping
                    && let Some(pong) = &self.pong
                {
                    pong.notify_one();
                }
                lock(&self.frames).push(frame);
                Ok(())
            }
            .boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            self.closed.store(true, Ordering::SeqCst);
            futures::future::ready(()).boxed()
        }
    }

    fn test_config() -> HubConfig {
        HubConfig {
            settle_delay: Duration::from_millis(10),
            write_timeout: Duration::from_millis(100),
            ..HubConfig::default()
        }
    }

    fn test_hub(config: HubConfig) -> (FanoutHub, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let hub = FanoutHub::new(
            config,
            Arc::clone(&stats),
            None,
            vec!["40m".to_string()],
        );
        (hub, stats)
    }

    fn spot(call: &str, hz: u64) -> Spot {
        Spot::new(Mode::Cw, call, hz, 12, Utc::now())
    }

    #[tokio::test]
    async fn test_late_joiner_gets_status_then_replay() {
        let (hub, _) = test_hub(test_config());
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1AAA", 7_020_000)).await);
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1BBB", 7_021_000)).await);
        let mut ft8 = spot("K1CCC", 7_075_000);
        ft8.mode = Mode::Ft8;
        assert!(hub.publish(SpotKind::DigitalSpot, &ft8).await);

        let sink = TestSink::default();
        hub.connect(Box::new(sink.clone()), None).await.unwrap();

        let frames = sink.texts();
        let types: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["status", "digital_spot", "cw_spot", "cw_spot"]);
        assert_eq!(frames[0]["data"]["subscribers"], 1);
        assert_eq!(frames[0]["data"]["skimmer_state"], "disconnected");
        assert_eq!(frames[0]["data"]["bands"][0], "40m");
        assert_eq!(frames[2]["data"]["callsign"], "K1AAA");
        assert_eq!(frames[3]["data"]["callsign"], "K1BBB");
    }

    #[tokio::test]
    async fn test_late_joiner_replay_ignores_other_subscribers() {
        let (hub, _) = test_hub(test_config());
        let others: Vec<TestSink> = (0..3).map(|_| TestSink::default()).collect();
        for sink in &others {
            hub.register(Box::new(sink.clone()), None);
        }
        let stuck = TestSink {
            stall: true,
            ..Default::default()
        };
        let bad = TestSink {
            fail: true,
            ..Default::default()
        };
        hub.register(Box::new(stuck.clone()), None);
        hub.register(Box::new(bad.clone()), None);

        let calls = ["K1AAA", "K1BBB", "K1CCC", "K1DDD", "K1EEE"];
        for (i, call) in calls.iter().enumerate() {
            assert!(
                hub.publish(SpotKind::CwSpot, &spot(call, 7_020_000 + i as u64 * 1000))
                    .await
            );
        }
        // A peer that stalls while the newcomer is greeted.
        hub.register(
            Box::new(TestSink {
                stall: true,
                ..Default::default()
            }),
            None,
        );

        let joiner = TestSink::default();
        let greeted = timeout(
            Duration::from_secs(1),
            hub.connect(Box::new(joiner.clone()), None),
        )
        .await
        .expect("greeting must not wait on other peers");
        assert!(greeted.is_ok());

        let frames = joiner.texts();
        assert_eq!(frames.len(), 1 + calls.len());
        assert_eq!(frames[0]["type"], "status");
        let replayed: Vec<&str> = frames[1..]
            .iter()
            .map(|f| f["data"]["callsign"].as_str().unwrap())
            .collect();
        assert_eq!(replayed, calls);
        for sink in &others {
            assert_eq!(sink.texts().len(), calls.len());
        }
    }

    #[derive(Clone, Default)]
    struct ExclusiveSink {
        busy: Arc<AtomicBool>,
        overlaps: Arc<std::sync::atomic::AtomicUsize>,
        writes: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FrameSink for ExclusiveSink {
        fn send(&mut self, _frame: OutFrame) -> BoxFuture<'_, Result<(), HubError>> {
            async move {
                if self.busy.swap(true, Ordering::SeqCst) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                self.writes.fetch_add(1, Ordering::SeqCst);
                self.busy.store(false, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            futures::future::ready(()).boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_never_interleave_writes() {
        let (hub, _) = test_hub(HubConfig {
            write_timeout: Duration::from_secs(5),
            ..test_config()
        });
        let sink = ExclusiveSink::default();
        let sub = hub.register(Box::new(sink.clone()), None);

        let spots: Vec<Spot> = (0..50)
            .map(|i| spot(&format!("K{}ABC", i), 7_000_000 + i * 1000))
            .collect();
        let handles: Vec<_> = spots
            .into_iter()
            .map(|s| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.publish(SpotKind::CwSpot, &s).await })
            })
            .collect();
        let pings: Vec<_> = (0..5)
            .map(|_| {
                let hub = hub.clone();
                let sub = Arc::clone(&sub);
                tokio::spawn(async move { hub.ping(&sub).await.is_ok() })
            })
            .collect();
        for published in join_all(handles).await {
            assert!(published.unwrap());
        }
        for pinged in join_all(pings).await {
            assert!(pinged.unwrap());
        }

        assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 55);
        assert!(!sub.is_removed());
    }

    #[tokio::test]
    async fn test_duplicates_suppressed_within_window() {
        let (hub, stats) = test_hub(HubConfig {
            dedup_window: Duration::from_millis(100),
            ..test_config()
        });
        let sink = TestSink::default();
        hub.register(Box::new(sink.clone()), None);

        assert!(hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_000)).await);
        assert!(!hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_100)).await);
        // Same call on another frequency is a different key.
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_025_000)).await);
        // Kinds dedup independently.
        assert!(hub.publish(SpotKind::DxSpot, &spot("K1ABC", 7_020_000)).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_000)).await);

        assert_eq!(sink.texts().len(), 4);
        assert_eq!(stats.hub_duplicates.load(Ordering::Relaxed), 1);
        assert_eq!(stats.hub_broadcasts.load(Ordering::Relaxed), 4);
        assert_eq!(hub.replay_len(SpotKind::CwSpot), 3);
    }

    #[tokio::test]
    async fn test_replay_is_bounded() {
        let (hub, _) = test_hub(HubConfig {
            replay_capacity: 2,
            ..test_config()
        });
        for (i, call) in ["K1AAA", "K1BBB", "K1CCC"].iter().enumerate() {
            hub.publish(SpotKind::CwSpot, &spot(call, 7_020_000 + i as u64 * 1000))
                .await;
        }
        assert_eq!(hub.replay_len(SpotKind::CwSpot), 2);

        let sink = TestSink::default();
        hub.connect(Box::new(sink.clone()), None).await.unwrap();
        let calls: Vec<String> = sink.texts()[1..]
            .iter()
            .map(|f| f["data"]["callsign"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(calls, vec!["K1BBB", "K1CCC"]);
    }

    #[tokio::test]
    async fn test_failed_peer_is_isolated() {
        let (hub, stats) = test_hub(test_config());
        let good = TestSink::default();
        let bad = TestSink {
            fail: true,
            ..Default::default()
        };
        let stuck = TestSink {
            stall: true,
            ..Default::default()
        };
        hub.register(Box::new(good.clone()), None);
        let bad_sub = hub.register(Box::new(bad.clone()), None);
        let stuck_sub = hub.register(Box::new(stuck.clone()), None);
        assert_eq!(hub.subscriber_count(), 3);

        let started = Instant::now();
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_000)).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(good.texts().len(), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(bad_sub.is_removed());
        assert!(stuck_sub.is_removed());
        assert!(bad.closed.load(Ordering::SeqCst));
        assert_eq!(stats.hub_write_failures.load(Ordering::Relaxed), 2);

        // The survivor keeps receiving.
        assert!(hub.publish(SpotKind::CwSpot, &spot("K1XYZ", 7_030_000)).await);
        assert_eq!(good.texts().len(), 2);
    }

    #[tokio::test]
    async fn test_throughput_follows_correlation_id() {
        let (hub, _) = test_hub(test_config());
        let sink = TestSink::default();
        let sub = hub.register(Box::new(sink.clone()), Some("tab-1".to_string()));
        hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_000)).await;

        let sent = hub.throughput().total_bytes("tab-1").unwrap();
        assert_eq!(sent as usize, lock(&sink.frames)[0].len());

        hub.remove(sub.id()).await;
        assert!(hub.throughput().total_bytes("tab-1").is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_entries() {
        let (hub, _) = test_hub(test_config());
        hub.publish(SpotKind::CwSpot, &spot("K1ABC", 7_020_000)).await;
        assert_eq!(hub.sweep_dedup(Instant::now()), 0);
        assert_eq!(
            hub.sweep_dedup(Instant::now() + Duration::from_secs(151)),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_pong_removes_subscriber() {
        let (hub, stats) = test_hub(HubConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(30),
            ..test_config()
        });
        let sink = TestSink::default();
        let sub = hub.register(Box::new(sink.clone()), None);
        let task = tokio::spawn(run_keepalive(
            hub.clone(),
            Arc::clone(&sub),
            Arc::new(Notify::new()),
        ));

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(sub.is_removed());
        assert_eq!(sink.pings(), 1);
        assert_eq!(hub.subscriber_count(), 0);
        // A missed pong is not a write failure.
        assert_eq!(stats.hub_write_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_stale_pong_does_not_answer_next_ping() {
        let (hub, _) = test_hub(HubConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(30),
            ..test_config()
        });
        let sink = TestSink::default();
        let sub = hub.register(Box::new(sink.clone()), None);
        let pongs = Arc::new(Notify::new());
        // An unsolicited pong before any ping leaves a stored permit.
        pongs.notify_one();
        let task = tokio::spawn(run_keepalive(hub.clone(), Arc::clone(&sub), pongs));

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(sub.is_removed());
        assert_eq!(sink.pings(), 1);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_subscriber() {
        let (hub, _) = test_hub(HubConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_timeout: Duration::from_millis(50),
            ..test_config()
        });
        let pongs = Arc::new(Notify::new());
        let sink = TestSink {
            pong: Some(Arc::clone(&pongs)),
            ..Default::default()
        };
        let sub = hub.register(Box::new(sink.clone()), None);
        let task = tokio::spawn(run_keepalive(hub.clone(), Arc::clone(&sub), pongs));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sub.is_removed());
        assert!(sink.pings() >= 3);

        // Removal elsewhere stops the keepalive.
        hub.remove(sub.id()).await;
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dispatched_spots_reach_subscribers() {
        use crate::dispatch::SpotDispatcher;
        use crate::geo::{Enricher, PrefixTable};

        let (hub, stats) = test_hub(test_config());
        let dispatcher = SpotDispatcher::new(
            Enricher::new(Arc::new(PrefixTable::new()), None),
            None,
            Vec::new(),
            stats,
        );
        hub.attach(dispatcher.listeners());
        let sink = TestSink::default();
        hub.register(Box::new(sink.clone()), None);

        dispatcher.dispatch(SpotKind::CwSpot, spot("K1ABC", 7_020_000));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.texts().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let frames = sink.texts();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "cw_spot");
        assert_eq!(frames[0]["data"]["band"], "40m");
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let (hub, _) = test_hub(test_config());
        let sink = TestSink::default();
        let sub = hub.register(Box::new(sink.clone()), None);
        let (tx, rx) = watch::channel(false);
        let task = hub.spawn_background(rx);
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(sub.is_removed());
        assert!(sink.closed.load(Ordering::SeqCst));
    }
}
