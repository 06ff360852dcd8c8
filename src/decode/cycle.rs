//! Cyclic recording state machine for slotted digital modes.
//!
//! FT8, FT4 and WSPR transmissions start on fixed wall-clock boundaries. A
//! [`BandRecorder`] turns a continuous stream of timestamped audio into one
//! WAV artifact per cycle, covering only the transmission window.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::debug;

use super::DecodeError;
use crate::audio::AudioChunk;
use crate::spot::Mode;

/// Cycle length and transmission window of a slotted mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTiming {
    pub cycle_ms: i64,
    pub window_ms: i64,
}

impl ModeTiming {
    pub const FT8: ModeTiming = ModeTiming {
        cycle_ms: 15_000,
        window_ms: 12_600,
    };
    pub const FT4: ModeTiming = ModeTiming {
        cycle_ms: 7_500,
        window_ms: 6_000,
    };
    pub const WSPR: ModeTiming = ModeTiming {
        cycle_ms: 120_000,
        window_ms: 114_000,
    };

    /// Timing for a slotted mode; `None` for free-running modes.
    pub fn for_mode(mode: Mode) -> Option<Self> {
        match mode {
            Mode::Ft8 => Some(Self::FT8),
            Mode::Ft4 => Some(Self::FT4),
            Mode::Wspr => Some(Self::WSPR),
            Mode::Cw | Mode::Rtty => None,
        }
    }

    /// Cycle index and offset into the cycle for an epoch-ms timestamp.
    pub fn locate(&self, ts_ms: i64) -> (i64, i64) {
        (ts_ms.div_euclid(self.cycle_ms), ts_ms.rem_euclid(self.cycle_ms))
    }
}

/// A finished recording waiting to be decoded.
#[derive(Debug)]
pub struct ClosedArtifact {
    pub path: PathBuf,
    pub cycle_start: DateTime<Utc>,
    pub samples: u64,
}

struct OpenArtifact {
    cycle: i64,
    cycle_start_ms: i64,
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    samples: u64,
}

/// Per-band recording state. Holds at most one open artifact.
pub struct BandRecorder {
    band: String,
    mode: Mode,
    timing: ModeTiming,
    work_dir: PathBuf,
    sample_rate: u32,
    open: Option<OpenArtifact>,
}

impl BandRecorder {
    pub fn new(
        band: impl Into<String>,
        mode: Mode,
        timing: ModeTiming,
        work_dir: impl Into<PathBuf>,
        sample_rate: u32,
    ) -> Self {
        Self {
            band: band.into(),
            mode,
            timing,
            work_dir: work_dir.into(),
            sample_rate,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Cycle index of the open artifact.
    pub fn open_cycle(&self) -> Option<i64> {
        self.open.as_ref().map(|a| a.cycle)
    }

    /// Feed one chunk. Returns the artifact that this chunk closed, if any.
    pub fn push(&mut self, chunk: &AudioChunk) -> Result<Option<ClosedArtifact>, DecodeError> {
        let (cycle, offset) = self.timing.locate(chunk.captured_at_ms);

        let stale = self
            .open
            .as_ref()
            .is_some_and(|open| open.cycle != cycle || offset > self.timing.window_ms);
        let closed = if stale { self.close()? } else { None };

        if self.open.is_none() && offset <= self.timing.window_ms {
            self.open_artifact(cycle, cycle * self.timing.cycle_ms)?;
        }

        if let Some(open) = self.open.as_mut() {
            let written = chunk
                .samples
                .iter()
                .try_for_each(|&s| open.writer.write_sample(s));
            match written {
                Ok(()) => open.samples += chunk.samples.len() as u64,
                Err(source) => {
                    let path = open.path.display().to_string();
                    self.discard();
                    return Err(DecodeError::Artifact { path, source });
                }
            }
        }

        Ok(closed)
    }

    /// Finalize the open artifact, if any.
    pub fn close(&mut self) -> Result<Option<ClosedArtifact>, DecodeError> {
        let Some(open) = self.open.take() else {
            return Ok(None);
        };
        let path = open.path;
        if let Err(source) = open.writer.finalize() {
            remove_quietly(&path);
            return Err(DecodeError::Artifact {
                path: path.display().to_string(),
                source,
            });
        }
        debug!(
            "{}: closed {} ({} samples)",
            self.band,
            path.display(),
            open.samples
        );
        Ok(Some(ClosedArtifact {
            path,
            cycle_start: Utc
                .timestamp_millis_opt(open.cycle_start_ms)
                .single()
                .unwrap_or_else(Utc::now),
            samples: open.samples,
        }))
    }

    fn open_artifact(&mut self, cycle: i64, cycle_start_ms: i64) -> Result<(), DecodeError> {
        let name = format!(
            "{}_{}_{}.wav",
            self.band,
            self.mode.to_string().to_ascii_lowercase(),
            cycle_start_ms
        );
        let path = self.work_dir.join(name);
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec).map_err(|source| DecodeError::Artifact {
            path: path.display().to_string(),
            source,
        })?;
        debug!("{}: opened {}", self.band, path.display());
        self.open = Some(OpenArtifact {
            cycle,
            cycle_start_ms,
            path,
            writer,
            samples: 0,
        });
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(open) = self.open.take() {
            drop(open.writer);
            remove_quietly(&open.path);
        }
    }
}

impl Drop for BandRecorder {
    fn drop(&mut self) {
        self.discard();
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("Failed to remove {}: {}", path.display(), e);
    }
}
