//! Local decoder orchestration.
//!
//! One monitor task runs per configured band. Slotted digital modes use the
//! batch regime: audio is recorded into one WAV artifact per cycle and an
//! external decoder is run on each closed artifact. Free-running modes (CW)
//! use the streaming regime: audio is piped into a long-lived decoder.
//!
//! Decoder failures are counted and logged, never propagated: the next cycle
//! simply runs again.

mod cycle;
mod output;
mod process;
mod stream;

pub use cycle::{BandRecorder, ClosedArtifact, ModeTiming};
pub use output::{is_callsign, message_locator, parse_decode_line, sender_callsign};
pub use process::{ArtifactGuard, DecodeOutput, Decoder, ExternalDecoder, expand_args};
pub use stream::{StreamResult, StreamingDecoder, result_to_spot};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::audio::AudioChunk;
use crate::dispatch::SpotDispatcher;
use crate::spot::{Mode, SpotKind};
use crate::stats::PipelineStats;

/// Pause between attempts to start a streaming decoder that failed to spawn.
const STREAM_RETRY: Duration = Duration::from_secs(1);

/// Errors from recording or decoding a band.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Recording artifact {path} failed: {source}")]
    Artifact {
        path: String,
        #[source]
        source: hound::Error,
    },

    #[error("Failed to start decoder {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Decoder {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Decoder {command} exited with {status}: {stderr}")]
    ExitStatus {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Streaming decoder input is closed")]
    StreamClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a band turns audio into decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Cyclic recording plus one decoder run per cycle.
    Batch,
    /// Continuous audio into a long-lived decoder.
    Streaming,
}

impl Regime {
    pub fn default_for(mode: Mode) -> Self {
        if ModeTiming::for_mode(mode).is_some() {
            Regime::Batch
        } else {
            Regime::Streaming
        }
    }
}

/// Event type a decoded spot is published as.
pub fn kind_for_mode(mode: Mode) -> SpotKind {
    if mode.is_digital() {
        SpotKind::DigitalSpot
    } else {
        SpotKind::CwSpot
    }
}

/// One monitored band.
#[derive(Debug, Clone)]
pub struct BandConfig {
    /// Band label, also used in artifact names.
    pub name: String,
    pub mode: Mode,
    /// Receiver dial frequency; decoder offsets are relative to it.
    pub dial_frequency_hz: u64,
    pub regime: Regime,
    /// Decoder executable.
    pub command: String,
    pub args: Vec<String>,
    /// Deadline for one batch decoder run.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory for recording artifacts.
    pub work_dir: PathBuf,
    pub sample_rate: u32,
    /// Capacity of each band's audio queue.
    pub queue_capacity: usize,
    pub bands: Vec<BandConfig>,
}

/// Handle to the running band monitors.
pub struct Orchestrator {
    senders: HashMap<String, mpsc::Sender<AudioChunk>>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Orchestrator {
    /// Start one monitor per band. Monitors stop when `shutdown` flips to true
    /// or their audio queue closes.
    pub fn start(
        config: OrchestratorConfig,
        decoder: Arc<dyn Decoder>,
        dispatcher: SpotDispatcher,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, DecodeError> {
        std::fs::create_dir_all(&config.work_dir)?;

        let mut senders = HashMap::new();
        let mut tasks = Vec::new();
        for band in config.bands {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            info!(
                "{}: monitoring {} at {} Hz ({:?})",
                band.name, band.mode, band.dial_frequency_hz, band.regime
            );
            let monitor = BandMonitor {
                stats: Arc::clone(dispatcher.stats()),
                band: band.clone(),
                decoder: Arc::clone(&decoder),
                dispatcher: dispatcher.clone(),
                work_dir: config.work_dir.clone(),
                sample_rate: config.sample_rate,
            };
            let handle = tokio::spawn(monitor.run(rx, shutdown.clone()));
            senders.insert(band.name.clone(), tx);
            tasks.push((band.name, handle));
        }

        Ok(Self { senders, tasks })
    }

    /// Audio queue of a band.
    pub fn audio_sender(&self, band: &str) -> Option<mpsc::Sender<AudioChunk>> {
        self.senders.get(band).cloned()
    }

    /// Names of the monitored bands.
    pub fn band_names(&self) -> Vec<String> {
        self.tasks.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Wait for every band monitor to finish.
    ///
    /// Monitors flush their open artifact and wait for outstanding decodes
    /// before they return.
    pub async fn join(self) {
        drop(self.senders);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!("{}: band monitor failed: {}", name, e);
            }
        }
        info!("All band monitors stopped");
    }
}

struct BandMonitor {
    band: BandConfig,
    decoder: Arc<dyn Decoder>,
    dispatcher: SpotDispatcher,
    stats: Arc<PipelineStats>,
    work_dir: PathBuf,
    sample_rate: u32,
}

impl BandMonitor {
    async fn run(self, rx: mpsc::Receiver<AudioChunk>, shutdown: watch::Receiver<bool>) {
        match self.band.regime {
            Regime::Batch => self.run_batch(rx, shutdown).await,
            Regime::Streaming => self.run_streaming(rx, shutdown).await,
        }
        info!("{}: monitor stopped", self.band.name);
    }

    async fn run_batch(&self, mut rx: mpsc::Receiver<AudioChunk>, mut shutdown: watch::Receiver<bool>) {
        let Some(timing) = ModeTiming::for_mode(self.band.mode) else {
            warn!("{}: {} has no cycle timing", self.band.name, self.band.mode);
            return;
        };
        let mut recorder = BandRecorder::new(
            self.band.name.clone(),
            self.band.mode,
            timing,
            self.work_dir.clone(),
            self.sample_rate,
        );
        let mut decodes = JoinSet::new();

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    match recorder.push(&chunk) {
                        Ok(Some(artifact)) => self.spawn_decode(&mut decodes, artifact),
                        Ok(None) => {}
                        Err(e) => {
                            PipelineStats::incr(&self.stats.decode_failures);
                            warn!("{}: {}", self.band.name, e);
                        }
                    }
                }
                Some(joined) = decodes.join_next(), if !decodes.is_empty() => {
                    if let Err(e) = joined {
                        warn!("{}: decode task failed: {}", self.band.name, e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        match recorder.close() {
            Ok(Some(artifact)) => self.spawn_decode(&mut decodes, artifact),
            Ok(None) => {}
            Err(e) => {
                PipelineStats::incr(&self.stats.decode_failures);
                warn!("{}: {}", self.band.name, e);
            }
        }
        while let Some(joined) = decodes.join_next().await {
            if let Err(e) = joined {
                warn!("{}: decode task failed: {}", self.band.name, e);
            }
        }
    }

    fn spawn_decode(&self, decodes: &mut JoinSet<()>, artifact: ClosedArtifact) {
        PipelineStats::incr(&self.stats.decode_cycles);
        let decoder = Arc::clone(&self.decoder);
        let band = self.band.clone();
        let dispatcher = self.dispatcher.clone();
        let stats = Arc::clone(&self.stats);
        decodes.spawn(async move {
            run_decode(decoder.as_ref(), &band, artifact, &dispatcher, &stats).await;
        });
    }

    async fn run_streaming(&self, mut rx: mpsc::Receiver<AudioChunk>, mut shutdown: watch::Receiver<bool>) {
        let mut decoder: Option<StreamingDecoder> = None;
        let mut retry_at = Instant::now();

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    let stopped = tokio::select! {
                        _ = self.feed_stream(&mut decoder, &mut retry_at, &chunk) => false,
                        _ = shutdown.changed() => true,
                    };
                    if stopped {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        if let Some(decoder) = decoder.take() {
            decoder.shutdown().await;
        }
    }

    async fn feed_stream(
        &self,
        slot: &mut Option<StreamingDecoder>,
        retry_at: &mut Instant,
        chunk: &AudioChunk,
    ) {
        if slot.as_mut().is_some_and(|decoder| decoder.has_exited()) {
            PipelineStats::incr(&self.stats.decode_failures);
            warn!("{}: streaming decoder exited, restarting", self.band.name);
            if let Some(dead) = slot.take() {
                dead.shutdown().await;
            }
        }

        if slot.is_none() {
            if Instant::now() < *retry_at {
                return;
            }
            match StreamingDecoder::spawn(&self.band, self.sample_rate, self.dispatcher.clone()) {
                Ok(decoder) => *slot = Some(decoder),
                Err(e) => {
                    PipelineStats::incr(&self.stats.decode_failures);
                    warn!("{}: {}", self.band.name, e);
                    *retry_at = Instant::now() + STREAM_RETRY;
                    return;
                }
            }
        }

        let fed = match slot.as_mut() {
            Some(decoder) => decoder.feed(chunk).await,
            None => return,
        };
        if let Err(e) = fed {
            PipelineStats::incr(&self.stats.decode_failures);
            warn!("{}: streaming decoder input failed: {}", self.band.name, e);
            if let Some(dead) = slot.take() {
                dead.kill().await;
            }
        }
    }
}

/// Decode one closed artifact. The artifact and its log are removed however
/// this ends.
async fn run_decode(
    decoder: &dyn Decoder,
    band: &BandConfig,
    artifact: ClosedArtifact,
    dispatcher: &SpotDispatcher,
    stats: &PipelineStats,
) {
    let mut guard = ArtifactGuard::new(artifact.path.clone());

    let output = match decoder.decode(&artifact.path, band).await {
        Ok(output) => output,
        Err(e) => {
            PipelineStats::incr(&stats.decode_failures);
            warn!("{}: decode failed: {}", band.name, e);
            return;
        }
    };
    if let Some(log) = output.log_path {
        guard.track(log);
    }

    let kind = kind_for_mode(band.mode);
    let mut emitted = 0;
    for line in &output.lines {
        match parse_decode_line(line, band, artifact.cycle_start) {
            Some(spot) => {
                emitted += 1;
                PipelineStats::incr(&stats.decoded_spots);
                dispatcher.dispatch(kind, spot);
            }
            None => PipelineStats::incr(&stats.decode_lines_rejected),
        }
    }
    debug!(
        "{}: cycle {} decoded {} spots in {:?}",
        band.name,
        artifact.cycle_start.format("%H:%M:%S"),
        emitted,
        output.duration
    );
}
