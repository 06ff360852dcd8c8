//! Downstream sinks for accepted spots.
//!
//! The persistent spot log appends one JSON object per line to a daily file.
//! Reporting sinks forward spots to external services on a best-effort basis:
//! failures are returned to the caller to be logged, never retried.

use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::spot::{Mode, Spot};

/// Errors raised by sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Spot log I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spot log lock poisoned")]
    Poisoned,

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Report to {sink} failed: {source}")]
    Http {
        sink: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Spot log settings.
#[derive(Debug, Clone)]
pub struct SpotLogConfig {
    /// Directory holding `spots-YYYY-MM-DD.jsonl` files.
    pub dir: PathBuf,

    /// Only log spots that carry a valid locator.
    pub require_locator: bool,
}

struct LogState {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// Append-only JSON-lines spot log with daily files.
pub struct SpotLog {
    config: SpotLogConfig,
    state: Mutex<LogState>,
}

impl SpotLog {
    /// Open (or create) today's log file.
    pub fn open(config: SpotLogConfig) -> Result<Self, SinkError> {
        let date = Utc::now().date_naive();
        let writer = Self::open_writer(&config.dir, date)?;
        info!("Spot log writing to {}", config.dir.display());
        Ok(Self {
            config,
            state: Mutex::new(LogState { date, writer }),
        })
    }

    fn file_path(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("spots-{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn open_writer(dir: &Path, date: NaiveDate) -> Result<BufWriter<File>, SinkError> {
        let io_err = |path: &Path| {
            let path = path.display().to_string();
            move |source| SinkError::Io { path, source }
        };
        create_dir_all(dir).map_err(io_err(dir))?;
        let path = Self::file_path(dir, date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        Ok(BufWriter::new(file))
    }

    /// Whether the log policy admits this spot.
    pub fn accepts(&self, spot: &Spot) -> bool {
        !self.config.require_locator || spot.has_valid_locator()
    }

    /// Append a spot, rotating to a new file when the UTC date changes.
    pub fn append(&self, spot: &Spot) -> Result<(), SinkError> {
        let line = serde_json::to_string(&json!({
            "logged_at": Utc::now(),
            "spot": spot,
        }))?;

        let mut state = self.state.lock().map_err(|_| SinkError::Poisoned)?;
        let today = Utc::now().date_naive();
        if today != state.date {
            state.writer.flush().ok();
            state.writer = Self::open_writer(&self.config.dir, today)?;
            state.date = today;
        }
        let path = Self::file_path(&self.config.dir, state.date);
        let io_err = |source| SinkError::Io {
            path: path.display().to_string(),
            source,
        };
        writeln!(state.writer, "{}", line).map_err(io_err)?;
        state.writer.flush().map_err(io_err)
    }
}

/// An external, best-effort spot reporting service.
pub trait ReportSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether this sink wants the spot.
    fn accepts(&self, spot: &Spot) -> bool;

    /// Submit one spot.
    fn submit(&self, spot: Arc<Spot>) -> BoxFuture<'_, Result<(), SinkError>>;
}

/// Settings for an HTTP reporting sink.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub name: String,
    pub url: String,
    /// Reject spots without a valid locator.
    pub requires_locator: bool,
    /// Accepted modes; `None` accepts all.
    pub modes: Option<Vec<Mode>>,
    pub timeout: Duration,
}

/// Posts each spot as JSON to a URL.
pub struct HttpReportSink {
    config: HttpSinkConfig,
    client: reqwest::Client,
}

impl HttpReportSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|source| SinkError::Http {
                sink: config.name.clone(),
                source,
            })?;
        Ok(Self { config, client })
    }
}

impl ReportSink for HttpReportSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn accepts(&self, spot: &Spot) -> bool {
        if self.config.requires_locator && !spot.has_valid_locator() {
            return false;
        }
        match self.config.modes {
            Some(ref modes) => modes.contains(&spot.mode),
            None => true,
        }
    }

    fn submit(&self, spot: Arc<Spot>) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            let http_err = |source| SinkError::Http {
                sink: self.config.name.clone(),
                source,
            };
            self.client
                .post(&self.config.url)
                .json(spot.as_ref())
                .send()
                .await
                .map_err(http_err)?
                .error_for_status()
                .map_err(http_err)?;
            Ok(())
        })
    }
}
