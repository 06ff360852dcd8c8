//! Streaming regime: one long-lived decoder fed continuously on stdin.
//!
//! The decoder reads raw little-endian PCM on stdin and prints one JSON
//! object per decode on stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{BandConfig, DecodeError, kind_for_mode};
use crate::audio::AudioChunk;
use crate::dispatch::SpotDispatcher;
use crate::spot::{Mode, Spot};
use crate::stats::PipelineStats;

/// How long to wait for the decoder to exit after stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long one chunk may take to reach the decoder's stdin.
pub const FEED_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the result reader once the process is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// One decode as printed by a streaming decoder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamResult {
    pub callsign: Option<String>,
    pub frequency_hz: Option<u64>,
    pub offset_hz: Option<f64>,
    pub snr: Option<i32>,
    pub wpm: Option<u16>,
    pub dt: Option<f32>,
    pub drift: Option<i32>,
    pub message: Option<String>,
    pub locator: Option<String>,
}

/// Apply the mode filter and build a spot.
///
/// Results without a callsign are dropped. CW results also need a speed.
pub fn result_to_spot(result: StreamResult, band: &BandConfig) -> Option<Spot> {
    let callsign = result
        .callsign
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())?;
    if band.mode == Mode::Cw && result.wpm.is_none() {
        return None;
    }

    let frequency_hz = match (result.frequency_hz, result.offset_hz) {
        (Some(hz), _) => hz,
        (None, Some(offset)) if offset.is_finite() && offset >= 0.0 => {
            band.dial_frequency_hz + offset.round() as u64
        }
        _ => band.dial_frequency_hz,
    };

    let mut spot = Spot::new(
        band.mode,
        callsign,
        frequency_hz,
        result.snr.unwrap_or(0),
        Utc::now(),
    );
    if spot.band == "unknown" {
        spot.band = band.name.clone();
    }
    spot.wpm = result.wpm;
    spot.dt_s = result.dt;
    spot.drift_hz = result.drift;
    spot.message = result.message;
    spot.locator = result
        .locator
        .filter(|l| crate::geo::is_valid_locator(l))
        .map(|l| l.to_ascii_uppercase());
    Some(spot)
}

/// A running streaming decoder and its stdout reader.
pub struct StreamingDecoder {
    band: String,
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

impl StreamingDecoder {
    /// Start the decoder process and its result reader.
    pub fn spawn(
        band: &BandConfig,
        sample_rate: u32,
        dispatcher: SpotDispatcher,
    ) -> Result<Self, DecodeError> {
        let args: Vec<String> = band
            .args
            .iter()
            .map(|arg| {
                arg.replace("{freq}", &band.dial_frequency_hz.to_string())
                    .replace("{mode}", &band.mode.to_string())
                    .replace("{rate}", &sample_rate.to_string())
            })
            .collect();

        let mut child = Command::new(&band.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DecodeError::Spawn {
                command: band.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Spawn {
            command: band.command.clone(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        info!("{}: streaming decoder {} started", band.name, band.command);

        let reader = tokio::spawn(read_results(band.clone(), stdout, dispatcher));
        Ok(Self {
            band: band.name.clone(),
            command: band.command.clone(),
            child,
            stdin,
            reader,
        })
    }

    /// Whether the process has already exited.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Write one chunk of PCM to the decoder.
    ///
    /// A decoder that stops reading fails the write after [`FEED_TIMEOUT`].
    pub async fn feed(&mut self, chunk: &AudioChunk) -> Result<(), DecodeError> {
        let stdin = self.stdin.as_mut().ok_or(DecodeError::StreamClosed)?;
        timeout(FEED_TIMEOUT, stdin.write_all(&chunk.to_le_bytes()))
            .await
            .map_err(|_| DecodeError::Timeout {
                command: self.command.clone(),
                after: FEED_TIMEOUT,
            })??;
        Ok(())
    }

    /// Kill the process without waiting for it to finish its input.
    pub async fn kill(mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            debug!("{}: killing streaming decoder: {}", self.band, e);
        }
        self.finish_reader().await;
    }

    /// Close stdin, reap the process and wait for the reader to drain.
    pub async fn shutdown(mut self) {
        drop(self.stdin.take());
        match timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("{}: streaming decoder exited with {}", self.band, status),
            Ok(Err(e)) => warn!("{}: waiting for streaming decoder: {}", self.band, e),
            Err(_) => {
                warn!("{}: streaming decoder did not exit, killing", self.band);
                let _ = self.child.kill().await;
            }
        }
        self.finish_reader().await;
    }

    /// The reader ends on stdout EOF, which a leftover grandchild can hold
    /// open, so it only gets a short grace period.
    async fn finish_reader(&mut self) {
        if timeout(READER_GRACE, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
    }
}

async fn read_results(
    band: BandConfig,
    stdout: tokio::process::ChildStdout,
    dispatcher: SpotDispatcher,
) {
    let stats = Arc::clone(dispatcher.stats());
    let kind = kind_for_mode(band.mode);
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("{}: reading streaming decoder output: {}", band.name, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let spot = serde_json::from_str::<StreamResult>(line)
            .ok()
            .and_then(|result| result_to_spot(result, &band));
        match spot {
            Some(spot) => {
                PipelineStats::incr(&stats.decoded_spots);
                dispatcher.dispatch(kind, spot);
            }
            None => {
                PipelineStats::incr(&stats.decode_lines_rejected);
                debug!("{}: dropped decoder output: {}", band.name, line);
            }
        }
    }
}
