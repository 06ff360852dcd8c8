//! Data structures representing normalized spots.
//!
//! Both producers (the local decoder orchestrator and the skimmer client)
//! reduce their input to a [`Spot`]. Once enriched, a spot is shared as
//! `Arc<Spot>` and never mutated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper edge of the frequency range accepted from the skimmer (30 MHz).
pub const MAX_HF_FREQUENCY_HZ: u64 = 30_000_000;

/// The transmission mode of the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Continuous Wave (Morse code)
    Cw,
    /// Radio Teletype
    Rtty,
    /// FT8 digital mode
    Ft8,
    /// FT4 digital mode
    Ft4,
    /// WSPR beacon mode
    Wspr,
}

impl Mode {
    /// Whether this is one of the slotted digital modes.
    pub fn is_digital(self) -> bool {
        matches!(self, Mode::Ft8 | Mode::Ft4 | Mode::Wspr)
    }

    /// Parse a mode token case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "CW" => Some(Mode::Cw),
            "RTTY" => Some(Mode::Rtty),
            "FT8" => Some(Mode::Ft8),
            "FT4" => Some(Mode::Ft4),
            "WSPR" => Some(Mode::Wspr),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cw => write!(f, "CW"),
            Mode::Rtty => write!(f, "RTTY"),
            Mode::Ft8 => write!(f, "FT8"),
            Mode::Ft4 => write!(f, "FT4"),
            Mode::Wspr => write!(f, "WSPR"),
        }
    }
}

/// The event type a spot is published under.
///
/// Each kind has its own dedup cache and replay buffer in the hub, and its
/// own `type` tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotKind {
    /// Radio-cluster style spots.
    DxSpot,
    /// Locally decoded FT8/FT4/WSPR spots.
    DigitalSpot,
    /// CW skimmer spots.
    CwSpot,
}

impl SpotKind {
    /// All kinds, in replay order.
    pub const ALL: [SpotKind; 3] = [SpotKind::DxSpot, SpotKind::DigitalSpot, SpotKind::CwSpot];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            SpotKind::DxSpot => "dx_spot",
            SpotKind::DigitalSpot => "digital_spot",
            SpotKind::CwSpot => "cw_spot",
        }
    }
}

impl fmt::Display for SpotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic enrichment attached to a spot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// DXCC entity name.
    pub country: Option<String>,
    /// CQ zone.
    pub cq_zone: Option<u8>,
    /// ITU zone.
    pub itu_zone: Option<u8>,
    /// Two-letter continent code.
    pub continent: Option<String>,
    /// Great-circle distance from the receiver.
    pub distance_km: Option<f64>,
    /// Initial bearing from the receiver, degrees true.
    pub bearing_deg: Option<f64>,
}

/// A normalized spot.
///
/// # Example
///
/// A skimmer line like:
/// ```text
/// DX de W1AW-#:   14025.0  K2ABC          15 dB  25 WPM  CQ            1234Z
/// ```
///
/// becomes a `Spot` with `callsign = "K2ABC"`, `frequency_hz = 14_025_000`,
/// `band = "20m"`, `snr_db = 15`, `wpm = Some(25)`, `comment = Some("CQ")`
/// and `spotter = Some("W1AW")`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Transmission mode.
    pub mode: Mode,

    /// Band label derived from the frequency (e.g. "20m").
    pub band: String,

    /// The station that was heard.
    pub callsign: String,

    /// Maidenhead locator, when the transmission carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    /// Absolute frequency in Hz.
    pub frequency_hz: u64,

    /// When the signal was heard.
    pub timestamp: DateTime<Utc>,

    /// Signal-to-noise ratio in dB.
    pub snr_db: i32,

    /// CW speed in words per minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wpm: Option<u16>,

    /// Time offset from the cycle start (digital modes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt_s: Option<f32>,

    /// Frequency drift in Hz (WSPR).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_hz: Option<i32>,

    /// Decoded message text (digital modes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Skimmer that reported the spot, with its connection suffix removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotter: Option<String>,

    /// Free-text comment from the skimmer line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(flatten)]
    pub geo: Enrichment,
}

impl Spot {
    /// Build a bare spot; the band is derived from the frequency.
    pub fn new(
        mode: Mode,
        callsign: impl Into<String>,
        frequency_hz: u64,
        snr_db: i32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            mode,
            band: band_for_hz(frequency_hz).unwrap_or("unknown").to_string(),
            callsign: callsign.into(),
            locator: None,
            frequency_hz,
            timestamp,
            snr_db,
            wpm: None,
            dt_s: None,
            drift_hz: None,
            message: None,
            spotter: None,
            comment: None,
            geo: Enrichment::default(),
        }
    }

    /// Frequency in kHz.
    pub fn frequency_khz(&self) -> f64 {
        self.frequency_hz as f64 / 1000.0
    }

    /// Whether the spot carries a plausible Maidenhead locator.
    pub fn has_valid_locator(&self) -> bool {
        self.locator
            .as_deref()
            .is_some_and(crate::geo::is_valid_locator)
    }
}

impl fmt::Display for Spot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>9.1} {:<10} {} {:>3} dB",
            self.timestamp.format("%H%MZ"),
            self.frequency_khz(),
            self.callsign,
            self.mode,
            self.snr_db,
        )?;
        if let Some(wpm) = self.wpm {
            write!(f, " {} WPM", wpm)?;
        }
        if let Some(ref locator) = self.locator {
            write!(f, " {}", locator)?;
        }
        Ok(())
    }
}

/// Returns the amateur radio band for a frequency in Hz.
///
/// Returns `None` if the frequency doesn't fall within a recognized band.
pub fn band_for_hz(frequency_hz: u64) -> Option<&'static str> {
    match frequency_hz / 1000 {
        135..=138 => Some("2200m"),
        472..=479 => Some("630m"),
        1800..=2000 => Some("160m"),
        3500..=4000 => Some("80m"),
        5330..=5410 => Some("60m"),
        7000..=7300 => Some("40m"),
        10100..=10150 => Some("30m"),
        14000..=14350 => Some("20m"),
        18068..=18168 => Some("17m"),
        21000..=21450 => Some("15m"),
        24890..=24990 => Some("12m"),
        28000..=29700 => Some("10m"),
        50000..=54000 => Some("6m"),
        144000..=148000 => Some("2m"),
        _ => None,
    }
}
