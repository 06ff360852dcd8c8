//! Statistics tracking for the spot pipeline.
//!
//! Counters are plain atomics so producers and the hub can bump them without
//! contention. Distributions and per-band breakdowns sit behind `RwLock`s.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::spot::{Spot, SpotKind};

/// Thread-safe statistics collector for the whole pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    /// Spot lines from the skimmer that parsed and were accepted
    pub skimmer_spots: AtomicU64,

    /// Spot lines from the skimmer that failed to parse
    pub skimmer_parse_failures: AtomicU64,

    /// Spot lines outside the accepted frequency range
    pub skimmer_out_of_range: AtomicU64,

    /// Informational (non-spot) lines from the skimmer
    pub skimmer_info_lines: AtomicU64,

    /// Raw bytes read from the skimmer socket
    pub skimmer_bytes: AtomicU64,

    /// Successful skimmer logins
    pub skimmer_connects: AtomicU64,

    /// Decode cycles handed to the external decoder
    pub decode_cycles: AtomicU64,

    /// Decode cycles that failed (exit status, timeout, missing output)
    pub decode_failures: AtomicU64,

    /// Decoder output lines that could not be turned into a spot
    pub decode_lines_rejected: AtomicU64,

    /// Spots produced by local decoders
    pub decoded_spots: AtomicU64,

    /// Spots broadcast by the hub
    pub hub_broadcasts: AtomicU64,

    /// Spots suppressed as duplicates
    pub hub_duplicates: AtomicU64,

    /// Subscribers dropped after a failed write or missed keepalive
    pub hub_write_failures: AtomicU64,

    /// Reporting or logging sink failures
    pub sink_failures: AtomicU64,

    /// Histogram of SNR values (offset by 50 to keep negatives)
    snr_histogram: RwLock<Histogram<u64>>,

    /// Histogram of CW WPM values
    wpm_histogram: RwLock<Histogram<u64>>,

    /// Spots per band
    spots_by_band: RwLock<HashMap<String, u64>>,

    /// Spots per kind
    spots_by_kind: RwLock<HashMap<SpotKind, u64>>,

    /// When stats collection started
    start_time: Instant,
}

/// Offset applied to SNR before recording in the histogram.
const SNR_OFFSET: i32 = 50;

impl PipelineStats {
    /// Create a new statistics collector.
    pub fn new() -> Self {
        Self {
            skimmer_spots: AtomicU64::new(0),
            skimmer_parse_failures: AtomicU64::new(0),
            skimmer_out_of_range: AtomicU64::new(0),
            skimmer_info_lines: AtomicU64::new(0),
            skimmer_bytes: AtomicU64::new(0),
            skimmer_connects: AtomicU64::new(0),
            decode_cycles: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            decode_lines_rejected: AtomicU64::new(0),
            decoded_spots: AtomicU64::new(0),
            hub_broadcasts: AtomicU64::new(0),
            hub_duplicates: AtomicU64::new(0),
            hub_write_failures: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            // SNR histogram: -49 to +99 dB after offset
            snr_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 150, 2).expect("Failed to create SNR histogram"),
            ),
            // WPM histogram: 1 to 99 WPM
            wpm_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 100, 2).expect("Failed to create WPM histogram"),
            ),
            spots_by_band: RwLock::new(HashMap::new()),
            spots_by_kind: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one.
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spot that was handed to the listeners.
    pub fn record_spot(&self, kind: SpotKind, spot: &Spot) {
        let snr = (spot.snr_db + SNR_OFFSET).clamp(1, 149) as u64;
        if let Ok(mut hist) = self.snr_histogram.write() {
            let _ = hist.record(snr);
        }

        if let Some(wpm) = spot.wpm
            && let Ok(mut hist) = self.wpm_histogram.write()
        {
            let _ = hist.record((wpm as u64).clamp(1, 99));
        }

        if let Ok(mut map) = self.spots_by_band.write() {
            *map.entry(spot.band.clone()).or_insert(0) += 1;
        }

        if let Ok(mut map) = self.spots_by_kind.write() {
            *map.entry(kind).or_insert(0) += 1;
        }
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let snr_percentiles = self
            .snr_histogram
            .read()
            .ok()
            .filter(|h| h.len() > 0)
            .map(|h| {
                let shift = |v: u64| v as i64 - SNR_OFFSET as i64;
                HistogramPercentiles {
                    p50: shift(h.value_at_quantile(0.50)),
                    p90: shift(h.value_at_quantile(0.90)),
                    p99: shift(h.value_at_quantile(0.99)),
                    min: shift(h.min()),
                    max: shift(h.max()),
                    mean: h.mean() - SNR_OFFSET as f64,
                }
            });

        let wpm_percentiles = self
            .wpm_histogram
            .read()
            .ok()
            .filter(|h| h.len() > 0)
            .map(|h| HistogramPercentiles {
                p50: h.value_at_quantile(0.50) as i64,
                p90: h.value_at_quantile(0.90) as i64,
                p99: h.value_at_quantile(0.99) as i64,
                min: h.min() as i64,
                max: h.max() as i64,
                mean: h.mean(),
            });

        let spots_by_band = self
            .spots_by_band
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        let spots_by_kind = self
            .spots_by_kind
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            skimmer_spots: load(&self.skimmer_spots),
            skimmer_parse_failures: load(&self.skimmer_parse_failures),
            skimmer_out_of_range: load(&self.skimmer_out_of_range),
            skimmer_info_lines: load(&self.skimmer_info_lines),
            skimmer_bytes: load(&self.skimmer_bytes),
            skimmer_connects: load(&self.skimmer_connects),
            decode_cycles: load(&self.decode_cycles),
            decode_failures: load(&self.decode_failures),
            decode_lines_rejected: load(&self.decode_lines_rejected),
            decoded_spots: load(&self.decoded_spots),
            hub_broadcasts: load(&self.hub_broadcasts),
            hub_duplicates: load(&self.hub_duplicates),
            hub_write_failures: load(&self.hub_write_failures),
            sink_failures: load(&self.sink_failures),
            snr_percentiles,
            wpm_percentiles,
            spots_by_band,
            spots_by_kind,
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub skimmer_spots: u64,
    pub skimmer_parse_failures: u64,
    pub skimmer_out_of_range: u64,
    pub skimmer_info_lines: u64,
    pub skimmer_bytes: u64,
    pub skimmer_connects: u64,
    pub decode_cycles: u64,
    pub decode_failures: u64,
    pub decode_lines_rejected: u64,
    pub decoded_spots: u64,
    pub hub_broadcasts: u64,
    pub hub_duplicates: u64,
    pub hub_write_failures: u64,
    pub sink_failures: u64,
    pub snr_percentiles: Option<HistogramPercentiles>,
    pub wpm_percentiles: Option<HistogramPercentiles>,
    pub spots_by_band: HashMap<String, u64>,
    pub spots_by_kind: HashMap<String, u64>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(
            f,
            "Skimmer: {} spots, {} parse failures, {} out of range, {} connects",
            self.skimmer_spots,
            self.skimmer_parse_failures,
            self.skimmer_out_of_range,
            self.skimmer_connects
        )?;
        writeln!(
            f,
            "Decoders: {} cycles, {} failures, {} spots",
            self.decode_cycles, self.decode_failures, self.decoded_spots
        )?;
        writeln!(
            f,
            "Hub: {} broadcast, {} duplicates, {} dropped peers",
            self.hub_broadcasts, self.hub_duplicates, self.hub_write_failures
        )?;

        if let Some(ref p) = self.snr_percentiles {
            writeln!(
                f,
                "SNR (dB): min {} / p50 {} / p90 {} / max {}",
                p.min, p.p50, p.p90, p.max
            )?;
        }

        if !self.spots_by_band.is_empty() {
            let mut bands: Vec<_> = self.spots_by_band.iter().collect();
            bands.sort_by(|a, b| b.1.cmp(a.1));
            let line: Vec<String> = bands.iter().map(|(b, c)| format!("{}={}", b, c)).collect();
            writeln!(f, "Bands: {}", line.join(" "))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::Mode;
    use chrono::Utc;

    fn make_test_spot(snr: i32) -> Spot {
        let mut spot = Spot::new(Mode::Cw, "W1AW", 14_025_000, snr, Utc::now());
        spot.wpm = Some(22);
        spot
    }

    #[test]
    fn test_record_spot() {
        let stats = PipelineStats::new();
        stats.record_spot(SpotKind::CwSpot, &make_test_spot(15));

        let summary = stats.summary();
        assert_eq!(summary.spots_by_band.get("20m"), Some(&1));
        assert_eq!(summary.spots_by_kind.get("cw_spot"), Some(&1));
        assert_eq!(summary.wpm_percentiles.unwrap().p50, 22);
    }

    #[test]
    fn test_negative_snr_survives_offset() {
        let stats = PipelineStats::new();
        stats.record_spot(SpotKind::DigitalSpot, &make_test_spot(-20));

        let snr = stats.summary().snr_percentiles.unwrap();
        assert_eq!(snr.min, -20);
    }

    #[test]
    fn test_empty_summary_has_no_percentiles() {
        let summary = PipelineStats::new().summary();
        assert!(summary.snr_percentiles.is_none());
        assert!(summary.wpm_percentiles.is_none());
    }

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.decode_failures);
        PipelineStats::incr(&stats.decode_failures);
        PipelineStats::incr(&stats.hub_duplicates);

        let summary = stats.summary();
        assert_eq!(summary.decode_failures, 2);
        assert_eq!(summary.hub_duplicates, 1);
        assert!(summary.to_string().contains("1 duplicates"));
    }
}
