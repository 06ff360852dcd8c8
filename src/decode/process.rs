//! External decoder invocation for batch cycles.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{BandConfig, DecodeError};

/// What a decoder run produced.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    /// Raw output lines, one decode per line.
    pub lines: Vec<String>,

    /// Log file written by the decoder, removed together with the artifact.
    pub log_path: Option<PathBuf>,

    /// Wall-clock time the decoder took.
    pub duration: Duration,
}

/// Decodes one recorded cycle.
pub trait Decoder: Send + Sync {
    fn decode<'a>(
        &'a self,
        artifact: &'a Path,
        band: &'a BandConfig,
    ) -> BoxFuture<'a, Result<DecodeOutput, DecodeError>>;
}

/// Runs `band.command` as a child process.
///
/// Arguments may contain `{wav}`, `{log}`, `{freq}` and `{mode}`
/// placeholders. A log file at `{log}` is returned when the decoder
/// created it.
#[derive(Debug, Clone, Default)]
pub struct ExternalDecoder;

impl ExternalDecoder {
    pub fn new() -> Self {
        Self
    }
}

/// Substitute the decoder argument placeholders.
pub fn expand_args(args: &[String], band: &BandConfig, wav: &Path, log: &Path) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{wav}", &wav.to_string_lossy())
                .replace("{log}", &log.to_string_lossy())
                .replace("{freq}", &band.dial_frequency_hz.to_string())
                .replace("{mode}", &band.mode.to_string())
        })
        .collect()
}

impl Decoder for ExternalDecoder {
    fn decode<'a>(
        &'a self,
        artifact: &'a Path,
        band: &'a BandConfig,
    ) -> BoxFuture<'a, Result<DecodeOutput, DecodeError>> {
        Box::pin(async move {
            let log = artifact.with_extension("log");
            let args = expand_args(&band.args, band, artifact, &log);

            let mut command = Command::new(&band.command);
            command
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = artifact.parent() {
                command.current_dir(dir);
            }

            let started = Instant::now();
            let child = command.spawn().map_err(|source| DecodeError::Spawn {
                command: band.command.clone(),
                source,
            })?;

            // Dropping the child on timeout kills it.
            let output = timeout(band.timeout, child.wait_with_output())
                .await
                .map_err(|_| DecodeError::Timeout {
                    command: band.command.clone(),
                    after: band.timeout,
                })??;
            let duration = started.elapsed();

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(DecodeError::ExitStatus {
                    command: band.command.clone(),
                    status: output.status.to_string(),
                    stderr: stderr.trim().to_string(),
                });
            }

            let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            debug!(
                "{}: {} produced {} lines in {:?}",
                band.name,
                band.command,
                lines.len(),
                duration
            );

            Ok(DecodeOutput {
                lines,
                log_path: log.exists().then_some(log),
                duration,
            })
        })
    }
}

/// Removes a recorded artifact and its decoder log when dropped.
#[derive(Debug)]
pub struct ArtifactGuard {
    paths: Vec<PathBuf>,
}

impl ArtifactGuard {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![artifact.into()],
        }
    }

    /// Also remove `path` when the guard drops.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}
