//! Callsign geography and spot enrichment.
//!
//! Lookups are synchronous. The default [`PrefixTable`] is loaded from a
//! plain text file with one `prefix,country,cq,itu,continent,lat,lon` row
//! per line, and resolves callsigns by longest matching prefix.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::spot::Spot;

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Errors loading a prefix table.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Failed to read prefix table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid prefix table row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },
}

/// Result of a callsign lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub country: String,
    pub cq_zone: u8,
    pub itu_zone: u8,
    pub continent: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Synchronous callsign to geography lookup.
pub trait CallsignLookup: Send + Sync {
    fn lookup(&self, callsign: &str) -> Option<GeoInfo>;
}

/// Longest-prefix callsign table.
#[derive(Debug, Default)]
pub struct PrefixTable {
    entries: HashMap<String, GeoInfo>,
    longest_prefix: usize,
}

impl PrefixTable {
    /// Create an empty table; every lookup misses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a file.
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let content = fs::read_to_string(path).map_err(|source| GeoError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse table content. Blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Result<Self, GeoError> {
        let mut table = Self::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 7 {
                return Err(GeoError::InvalidRow {
                    line: idx + 1,
                    reason: format!("expected 7 fields, got {}", fields.len()),
                });
            }
            let invalid = |what: &str| GeoError::InvalidRow {
                line: idx + 1,
                reason: format!("invalid {}", what),
            };
            let info = GeoInfo {
                country: fields[1].to_string(),
                cq_zone: fields[2].parse().map_err(|_| invalid("CQ zone"))?,
                itu_zone: fields[3].parse().map_err(|_| invalid("ITU zone"))?,
                continent: fields[4].to_ascii_uppercase(),
                latitude: fields[5].parse().map_err(|_| invalid("latitude"))?,
                longitude: fields[6].parse().map_err(|_| invalid("longitude"))?,
            };
            table.insert(fields[0], info);
        }
        Ok(table)
    }

    /// Add or replace a prefix.
    pub fn insert(&mut self, prefix: &str, info: GeoInfo) {
        let prefix = prefix.to_ascii_uppercase();
        self.longest_prefix = self.longest_prefix.max(prefix.len());
        self.entries.insert(prefix, info);
    }

    /// Number of prefixes in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CallsignLookup for PrefixTable {
    fn lookup(&self, callsign: &str) -> Option<GeoInfo> {
        let base = base_callsign(callsign);
        let max = self.longest_prefix.min(base.len());
        (1..=max)
            .rev()
            .find_map(|len| base.get(..len).and_then(|p| self.entries.get(p)))
            .cloned()
    }
}

/// Reduce a callsign to the part that determines its entity.
///
/// `EA8/DL1ABC` resolves to `EA8`, `W1AW/P` to `W1AW`, `DL1ABC/MM` to `DL1ABC`.
pub fn base_callsign(callsign: &str) -> String {
    let upper = callsign.trim().to_ascii_uppercase();
    let parts: Vec<&str> = upper.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        [first, second, ..] => {
            let designator = matches!(*second, "P" | "M" | "MM" | "AM" | "QRP" | "A")
                || second.chars().all(|c| c.is_ascii_digit());
            // Otherwise the shorter part is the operating-location prefix.
            if designator || first.len() <= second.len() {
                first.to_string()
            } else {
                second.to_string()
            }
        }
    }
}

/// Check a Maidenhead locator (4 or 6 characters).
pub fn is_valid_locator(locator: &str) -> bool {
    let b = locator.as_bytes();
    if b.len() != 4 && b.len() != 6 {
        return false;
    }
    let field = |c: u8| (b'A'..=b'R').contains(&c.to_ascii_uppercase());
    let square = |c: u8| c.is_ascii_digit();
    let sub = |c: u8| (b'A'..=b'X').contains(&c.to_ascii_uppercase());
    field(b[0])
        && field(b[1])
        && square(b[2])
        && square(b[3])
        && (b.len() == 4 || (sub(b[4]) && sub(b[5])))
}

/// Centre of a Maidenhead locator as `(lat, lon)` degrees.
pub fn locator_to_lat_lon(locator: &str) -> Option<(f64, f64)> {
    if !is_valid_locator(locator) {
        return None;
    }
    let b = locator.to_ascii_uppercase().into_bytes();
    let mut lon = (b[0] - b'A') as f64 * 20.0 - 180.0 + (b[2] - b'0') as f64 * 2.0;
    let mut lat = (b[1] - b'A') as f64 * 10.0 - 90.0 + (b[3] - b'0') as f64;
    if b.len() == 6 {
        lon += (b[4] - b'A') as f64 * (2.0 / 24.0) + 1.0 / 24.0;
        lat += (b[5] - b'A') as f64 * (1.0 / 24.0) + 0.5 / 24.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }
    Some((lat, lon))
}

/// Great-circle distance (km) and initial bearing (degrees) between two points.
pub fn distance_and_bearing(from: (f64, f64), to: (f64, f64)) -> (f64, f64) {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let distance = 2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt());

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let bearing = (y.atan2(x).to_degrees() + 360.0) % 360.0;

    (distance, bearing)
}

/// Fills in the enrichment fields of a spot.
#[derive(Clone)]
pub struct Enricher {
    lookup: Arc<dyn CallsignLookup>,
    receiver: Option<(f64, f64)>,
}

impl Enricher {
    /// Create an enricher. Without a receiver location, distance and bearing
    /// are left empty.
    pub fn new(lookup: Arc<dyn CallsignLookup>, receiver: Option<(f64, f64)>) -> Self {
        Self { lookup, receiver }
    }

    /// Enrich a spot in place.
    ///
    /// A valid locator on the spot is preferred over the entity centre for
    /// distance and bearing.
    pub fn enrich(&self, spot: &mut Spot) {
        let info = self.lookup.lookup(&spot.callsign);
        if let Some(ref info) = info {
            spot.geo.country = Some(info.country.clone());
            spot.geo.cq_zone = Some(info.cq_zone);
            spot.geo.itu_zone = Some(info.itu_zone);
            spot.geo.continent = Some(info.continent.clone());
        } else {
            debug!("No prefix match for {}", spot.callsign);
        }

        let Some(receiver) = self.receiver else {
            return;
        };
        let target = spot
            .locator
            .as_deref()
            .and_then(locator_to_lat_lon)
            .or_else(|| info.as_ref().map(|i| (i.latitude, i.longitude)));
        if let Some(target) = target {
            let (distance, bearing) = distance_and_bearing(receiver, target);
            spot.geo.distance_km = Some((distance * 10.0).round() / 10.0);
            spot.geo.bearing_deg = Some(bearing.round());
        }
    }
}
