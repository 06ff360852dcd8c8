//! Configuration file support for spot-relay.
//!
//! Loads settings from `~/.config/spot-relay/config.toml` on Linux
//! (or platform-appropriate location on other OSes), or from an explicit
//! path given on the command line. Durations are whole seconds unless the
//! field name says otherwise.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{SKIMMER_HOST, SKIMMER_PORT, SkimmerClientConfig};
use crate::decode::{BandConfig, OrchestratorConfig, Regime};
use crate::geo::{is_valid_locator, locator_to_lat_lon};
use crate::hub::HubConfig;
use crate::sinks::{HttpSinkConfig, SpotLogConfig};
use crate::spot::{Mode, SpotKind};

/// Fixed receiver location used for distance and bearing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Maidenhead locator of the receiver.
    pub locator: Option<String>,

    /// Latitude in degrees; overrides the locator when both coordinates are set.
    pub latitude: Option<f64>,

    /// Longitude in degrees.
    pub longitude: Option<f64>,
}

impl ReceiverConfig {
    /// Resolve the receiver position, if configured.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => self.locator.as_deref().and_then(locator_to_lat_lon),
        }
    }
}

/// Skimmer telnet connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkimmerSection {
    /// Whether to run the skimmer client at all.
    pub enabled: bool,

    /// Skimmer server hostname.
    pub host: String,

    /// Skimmer server port.
    pub port: u16,

    /// Login callsign; falls back to the top-level callsign.
    pub callsign: Option<String>,

    /// Dial timeout in seconds.
    pub connect_timeout: u64,

    /// Per-step banner/welcome read timeout in seconds.
    pub banner_timeout: u64,

    /// Overall login timeout in seconds.
    pub login_timeout: u64,

    /// Idle read timeout in seconds.
    pub idle_timeout: u64,

    /// Delay before retrying after a failed dial, in seconds.
    pub reconnect_delay: u64,

    /// Event type the skimmer publishes under.
    pub publish_as: SpotKind,
}

impl Default for SkimmerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: SKIMMER_HOST.to_string(),
            port: SKIMMER_PORT,
            callsign: None,
            connect_timeout: 10,
            banner_timeout: 10,
            login_timeout: 30,
            idle_timeout: 15 * 60,
            reconnect_delay: 5,
            publish_as: SpotKind::CwSpot,
        }
    }
}

/// Fan-out hub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Dedup window in seconds.
    pub dedup_window: u64,

    /// Extra age past the window before entries are swept, in seconds.
    pub dedup_margin: u64,

    /// Replay buffer size per event type.
    pub replay_capacity: usize,

    /// Delay between the status frame and the replay, in milliseconds.
    pub settle_delay_ms: u64,

    /// Per-subscriber write deadline, in milliseconds.
    pub write_timeout_ms: u64,

    /// Keepalive probe interval in seconds.
    pub keepalive_interval: u64,

    /// Keepalive acknowledgment deadline in seconds.
    pub keepalive_timeout: u64,

    /// Status frame broadcast interval in seconds.
    pub status_interval: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            dedup_window: 120,
            dedup_margin: 30,
            replay_capacity: 100,
            settle_delay_ms: 500,
            write_timeout_ms: 2000,
            keepalive_interval: 30,
            keepalive_timeout: 10,
            status_interval: 10,
        }
    }
}

/// One monitored band.
#[derive(Debug, Clone, Deserialize)]
pub struct BandSection {
    /// Band label, e.g. "40m". Must be unique.
    pub name: String,

    /// Mode decoded on this band.
    pub mode: Mode,

    /// Receiver dial frequency in Hz; decoder offsets are added to it.
    pub dial_frequency_hz: u64,

    /// Decoder executable.
    pub command: String,

    /// Decoder arguments; `{wav}`, `{freq}` and `{mode}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,

    /// Force the streaming (true) or batch (false) regime.
    pub streaming: Option<bool>,

    /// Decoder run timeout in seconds (batch regime).
    #[serde(default = "default_decode_timeout")]
    pub timeout: u64,

    /// Optional raw PCM file or FIFO feeding this band.
    pub input: Option<PathBuf>,
}

fn default_decode_timeout() -> u64 {
    30
}

/// Local decoder settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderSection {
    /// Directory for recording artifacts.
    pub work_dir: PathBuf,

    /// Audio sample rate in Hz.
    pub sample_rate: u32,

    /// Bounded audio queue length per band, in chunks.
    pub queue_capacity: usize,

    /// Bands to monitor.
    pub bands: Vec<BandSection>,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("spot-relay"),
            sample_rate: 12_000,
            queue_capacity: 64,
            bands: Vec::new(),
        }
    }
}

/// Persistent spot log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpotLogSection {
    pub enabled: bool,
    pub dir: PathBuf,
    pub require_locator: bool,
}

impl Default for SpotLogSection {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("spots"),
            require_locator: true,
        }
    }
}

/// One external reporting sink.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingSection {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub requires_locator: bool,
    /// Modes the sink accepts; all modes when omitted.
    pub modes: Option<Vec<Mode>>,
    #[serde(default = "default_report_timeout")]
    pub timeout: u64,
}

fn default_report_timeout() -> u64 {
    10
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Station callsign.
    pub callsign: String,

    /// Address the subscriber/metrics HTTP server binds to.
    pub listen: String,

    /// Optional callsign prefix table for enrichment.
    pub prefix_table: Option<PathBuf>,

    pub receiver: ReceiverConfig,
    pub skimmer: SkimmerSection,
    pub hub: HubSection,
    pub decoder: DecoderSection,
    pub spot_log: SpotLogSection,
    pub reporting: Vec<ReportingSection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: "N0CALL".to_string(),
            listen: "0.0.0.0:8073".to_string(),
            prefix_table: None,
            receiver: ReceiverConfig::default(),
            skimmer: SkimmerSection::default(),
            hub: HubSection::default(),
            decoder: DecoderSection::default(),
            spot_log: SpotLogSection::default(),
            reporting: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// Returns default config if no path is given and the default file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Config::default()),
            },
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the default config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("spot-relay/config.toml"))
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref locator) = self.receiver.locator
            && !is_valid_locator(locator)
        {
            bail!("Invalid receiver locator: {}", locator);
        }

        if self.skimmer.enabled && self.skimmer_callsign().trim().is_empty() {
            bail!("Skimmer login requires a callsign");
        }

        if self.hub.replay_capacity == 0 {
            bail!("hub.replay_capacity must be at least 1");
        }

        let mut names = HashSet::new();
        for (i, band) in self.decoder.bands.iter().enumerate() {
            if !names.insert(band.name.as_str()) {
                bail!("Duplicate band [{}]: {}", i, band.name);
            }
            if band.command.trim().is_empty() {
                bail!("Band {} has no decoder command", band.name);
            }
            if band.dial_frequency_hz == 0 {
                bail!("Band {} has no dial frequency", band.name);
            }
            if band.streaming == Some(false) && !band.mode.is_digital() {
                bail!("Band {}: {} can only be decoded in streaming mode", band.name, band.mode);
            }
        }

        for (i, sink) in self.reporting.iter().enumerate() {
            if !sink.url.starts_with("http://") && !sink.url.starts_with("https://") {
                bail!("Invalid reporting sink [{}] {}: bad url {}", i, sink.name, sink.url);
            }
        }
        Ok(())
    }

    fn skimmer_callsign(&self) -> &str {
        self.skimmer.callsign.as_deref().unwrap_or(&self.callsign)
    }

    /// Build the skimmer client configuration.
    pub fn skimmer_client_config(&self) -> SkimmerClientConfig {
        SkimmerClientConfig {
            host: self.skimmer.host.clone(),
            port: self.skimmer.port,
            callsign: self.skimmer_callsign().to_string(),
            connect_timeout: Duration::from_secs(self.skimmer.connect_timeout),
            banner_timeout: Duration::from_secs(self.skimmer.banner_timeout),
            login_timeout: Duration::from_secs(self.skimmer.login_timeout),
            idle_timeout: Duration::from_secs(self.skimmer.idle_timeout),
            reconnect_delay: Duration::from_secs(self.skimmer.reconnect_delay),
            publish_as: self.skimmer.publish_as,
        }
    }

    /// Build the hub configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            dedup_window: Duration::from_secs(self.hub.dedup_window),
            dedup_margin: Duration::from_secs(self.hub.dedup_margin),
            replay_capacity: self.hub.replay_capacity,
            settle_delay: Duration::from_millis(self.hub.settle_delay_ms),
            write_timeout: Duration::from_millis(self.hub.write_timeout_ms),
            keepalive_interval: Duration::from_secs(self.hub.keepalive_interval),
            keepalive_timeout: Duration::from_secs(self.hub.keepalive_timeout),
            status_interval: Duration::from_secs(self.hub.status_interval),
        }
    }

    /// Build the decoder orchestrator configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let bands = self
            .decoder
            .bands
            .iter()
            .map(|b| BandConfig {
                name: b.name.clone(),
                mode: b.mode,
                dial_frequency_hz: b.dial_frequency_hz,
                regime: match b.streaming {
                    Some(true) => Regime::Streaming,
                    Some(false) => Regime::Batch,
                    None => Regime::default_for(b.mode),
                },
                command: b.command.clone(),
                args: b.args.clone(),
                timeout: Duration::from_secs(b.timeout),
            })
            .collect();
        OrchestratorConfig {
            work_dir: self.decoder.work_dir.clone(),
            sample_rate: self.decoder.sample_rate,
            queue_capacity: self.decoder.queue_capacity,
            bands,
        }
    }

    /// Build the spot log configuration, if enabled.
    pub fn spot_log_config(&self) -> Option<SpotLogConfig> {
        self.spot_log.enabled.then(|| SpotLogConfig {
            dir: self.spot_log.dir.clone(),
            require_locator: self.spot_log.require_locator,
        })
    }

    /// Build the reporting sink configurations.
    pub fn report_sink_configs(&self) -> Vec<HttpSinkConfig> {
        self.reporting
            .iter()
            .map(|r| HttpSinkConfig {
                name: r.name.clone(),
                url: r.url.clone(),
                requires_locator: r.requires_locator,
                modes: r.modes.clone(),
                timeout: Duration::from_secs(r.timeout),
            })
            .collect()
    }
}
