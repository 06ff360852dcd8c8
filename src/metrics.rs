//! Prometheus text rendering of pipeline and hub statistics.
//!
//! Served at `/metrics` by [`crate::server`].

use std::collections::HashMap;
use std::fmt::Write;

use crate::hub::Status;
use crate::stats::{HistogramPercentiles, StatsSummary};

/// Content type for the Prometheus text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn push_header(output: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
}

fn push_counter(output: &mut String, name: &str, help: &str, value: u64) {
    push_header(output, name, "counter", help);
    let _ = writeln!(output, "{} {}", name, value);
}

fn push_summary(output: &mut String, name: &str, help: &str, p: &HistogramPercentiles) {
    push_header(output, name, "summary", help);
    let _ = writeln!(output, "{}{{quantile=\"0.5\"}} {}", name, p.p50);
    let _ = writeln!(output, "{}{{quantile=\"0.9\"}} {}", name, p.p90);
    let _ = writeln!(output, "{}{{quantile=\"0.99\"}} {}", name, p.p99);
}

/// Format statistics as Prometheus text format.
pub fn format_prometheus_metrics(
    summary: &StatsSummary,
    status: &Status,
    throughput: &HashMap<String, f64>,
) -> String {
    let mut output = String::with_capacity(4096);

    push_header(
        &mut output,
        "spot_relay_uptime_seconds",
        "gauge",
        "Time since the relay started",
    );
    let _ = writeln!(output, "spot_relay_uptime_seconds {:.3}", summary.elapsed_secs);

    push_counter(
        &mut output,
        "spot_relay_skimmer_spots_total",
        "Spot lines accepted from the skimmer",
        summary.skimmer_spots,
    );
    push_counter(
        &mut output,
        "spot_relay_skimmer_parse_failures_total",
        "Skimmer spot lines that failed to parse",
        summary.skimmer_parse_failures,
    );
    push_counter(
        &mut output,
        "spot_relay_skimmer_out_of_range_total",
        "Skimmer spots outside the accepted frequency range",
        summary.skimmer_out_of_range,
    );
    push_counter(
        &mut output,
        "spot_relay_skimmer_info_lines_total",
        "Non-spot lines received from the skimmer",
        summary.skimmer_info_lines,
    );
    push_counter(
        &mut output,
        "spot_relay_skimmer_bytes_total",
        "Raw bytes read from the skimmer",
        summary.skimmer_bytes,
    );
    push_counter(
        &mut output,
        "spot_relay_skimmer_connects_total",
        "Successful skimmer logins",
        summary.skimmer_connects,
    );

    push_header(
        &mut output,
        "spot_relay_skimmer_connected",
        "gauge",
        "Whether the skimmer session is active",
    );
    let _ = writeln!(
        output,
        "spot_relay_skimmer_connected {}",
        u8::from(status.skimmer_connected)
    );

    push_counter(
        &mut output,
        "spot_relay_decode_cycles_total",
        "Cycles handed to an external decoder",
        summary.decode_cycles,
    );
    push_counter(
        &mut output,
        "spot_relay_decode_failures_total",
        "Decoder runs that failed or timed out",
        summary.decode_failures,
    );
    push_counter(
        &mut output,
        "spot_relay_decode_lines_rejected_total",
        "Decoder output lines that did not yield a spot",
        summary.decode_lines_rejected,
    );
    push_counter(
        &mut output,
        "spot_relay_decoded_spots_total",
        "Spots produced by local decoders",
        summary.decoded_spots,
    );

    push_counter(
        &mut output,
        "spot_relay_hub_broadcasts_total",
        "Events broadcast to subscribers",
        summary.hub_broadcasts,
    );
    push_counter(
        &mut output,
        "spot_relay_hub_duplicates_total",
        "Events suppressed as duplicates",
        summary.hub_duplicates,
    );
    push_counter(
        &mut output,
        "spot_relay_hub_write_failures_total",
        "Subscriber writes that failed or timed out",
        summary.hub_write_failures,
    );
    push_counter(
        &mut output,
        "spot_relay_sink_failures_total",
        "Spot log and reporting sink failures",
        summary.sink_failures,
    );

    push_header(
        &mut output,
        "spot_relay_subscribers",
        "gauge",
        "Connected subscribers",
    );
    let _ = writeln!(output, "spot_relay_subscribers {}", status.subscribers);

    if !throughput.is_empty() {
        push_header(
            &mut output,
            "spot_relay_subscriber_bytes_per_second",
            "gauge",
            "Outbound bytes per second by correlation id",
        );
        let mut ids: Vec<_> = throughput.iter().collect();
        ids.sort_by(|a, b| a.0.cmp(b.0));
        for (id, rate) in ids {
            let _ = writeln!(
                output,
                "spot_relay_subscriber_bytes_per_second{{id=\"{}\"}} {:.1}",
                escape_label(id),
                rate
            );
        }
    }

    push_header(
        &mut output,
        "spot_relay_spots_by_band_total",
        "counter",
        "Spots broken down by amateur band",
    );
    for (band, count) in &summary.spots_by_band {
        let _ = writeln!(
            output,
            "spot_relay_spots_by_band_total{{band=\"{}\"}} {}",
            band, count
        );
    }

    push_header(
        &mut output,
        "spot_relay_spots_by_kind_total",
        "counter",
        "Spots broken down by event kind",
    );
    for (kind, count) in &summary.spots_by_kind {
        let _ = writeln!(
            output,
            "spot_relay_spots_by_kind_total{{kind=\"{}\"}} {}",
            kind, count
        );
    }

    if let Some(ref snr) = summary.snr_percentiles {
        push_summary(&mut output, "spot_relay_snr_db", "SNR distribution in decibels", snr);
    }
    if let Some(ref wpm) = summary.wpm_percentiles {
        push_summary(&mut output, "spot_relay_wpm", "CW speed distribution", wpm);
    }

    output
}

/// Escape a Prometheus label value.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConnectionState;
    use crate::spot::{Mode, Spot, SpotKind};
    use crate::stats::PipelineStats;
    use chrono::Utc;

    fn idle_status() -> Status {
        Status {
            skimmer_connected: false,
            skimmer_state: ConnectionState::Disconnected,
            subscribers: 0,
            uptime_secs: 0,
            bands: Vec::new(),
        }
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let stats = PipelineStats::new();
        let output = format_prometheus_metrics(&stats.summary(), &idle_status(), &HashMap::new());

        assert!(output.contains("spot_relay_uptime_seconds"));
        assert!(output.contains("spot_relay_skimmer_parse_failures_total 0"));
        assert!(output.contains("spot_relay_skimmer_connected 0"));
        assert!(output.contains("spot_relay_subscribers 0"));
        assert!(!output.contains("spot_relay_snr_db"));
        assert!(!output.contains("bytes_per_second"));
    }

    #[test]
    fn test_format_prometheus_metrics_with_data() {
        let stats = PipelineStats::new();
        let mut spot = Spot::new(Mode::Cw, "W1AW", 14_025_000, 15, Utc::now());
        spot.wpm = Some(22);
        stats.record_spot(SpotKind::CwSpot, &spot);
        PipelineStats::incr(&stats.hub_broadcasts);

        let status = Status {
            skimmer_connected: true,
            skimmer_state: ConnectionState::Active,
            subscribers: 2,
            ..idle_status()
        };
        let throughput = HashMap::from([("tab\"1".to_string(), 512.0)]);
        let output = format_prometheus_metrics(&stats.summary(), &status, &throughput);

        assert!(output.contains("spot_relay_hub_broadcasts_total 1"));
        assert!(output.contains("spot_relay_spots_by_band_total{band=\"20m\"} 1"));
        assert!(output.contains("spot_relay_spots_by_kind_total{kind=\"cw_spot\"} 1"));
        assert!(output.contains("spot_relay_wpm{quantile=\"0.5\"} 22"));
        assert!(output.contains("spot_relay_skimmer_connected 1"));
        assert!(output.contains("spot_relay_subscribers 2"));
        assert!(output.contains("spot_relay_subscriber_bytes_per_second{id=\"tab\\\"1\"} 512.0"));
    }

    #[test]
    fn test_prometheus_format_validity() {
        let stats = PipelineStats::new();
        let output = format_prometheus_metrics(&stats.summary(), &idle_status(), &HashMap::new());

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert!(parts.len() >= 2, "Invalid metric line: {}", line);
        }
    }
}
