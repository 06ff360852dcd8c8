//! Raw audio input for the band monitors.
//!
//! The receiver session hands each band a bounded queue of [`AudioChunk`]s:
//! mono 16-bit little-endian PCM at a fixed sample rate, stamped with the
//! wall-clock capture time. [`spawn_pcm_reader`] feeds such a queue from a
//! file or FIFO.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Length of one chunk produced by the PCM reader.
const CHUNK_MS: u64 = 100;

/// One block of mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: i64,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(captured_at_ms: i64, samples: Vec<i16>) -> Self {
        Self {
            captured_at_ms,
            samples,
        }
    }

    /// Decode little-endian 16-bit samples. A trailing odd byte is ignored.
    pub fn from_le_bytes(captured_at_ms: i64, bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(captured_at_ms, samples)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Duration of the chunk at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / sample_rate.max(1) as u64)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Read raw PCM from `path` in real-time-paced chunks and push them to `tx`.
///
/// The task ends at end of file, when the receiving band monitor goes away,
/// or on shutdown.
pub fn spawn_pcm_reader(
    band: String,
    path: PathBuf,
    sample_rate: u32,
    tx: mpsc::Sender<AudioChunk>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("{}: cannot open audio input {}: {}", band, path.display(), e);
                return;
            }
        };
        info!("{}: reading audio from {}", band, path.display());

        let chunk_bytes = (sample_rate as u64 * CHUNK_MS / 1000) as usize * 2;
        let mut buf = vec![0u8; chunk_bytes];
        let mut ticker = tokio::time::interval(Duration::from_millis(CHUNK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        warn!("{}: audio read failed: {}", band, e);
                        return;
                    }
                }
            }
            if filled == 0 {
                info!("{}: end of audio input", band);
                break;
            }

            let chunk = AudioChunk::from_le_bytes(now_ms(), &buf[..filled]);
            if tx.send(chunk).await.is_err() {
                break;
            }
            if filled < buf.len() {
                info!("{}: end of audio input", band);
                break;
            }
        }
    })
}
