//! Parsing of batch decoder output into spots.
//!
//! FT8/FT4 lines follow the WSJT-X layout `HHMMSS SNR DT OFFSET ~ MESSAGE`
//! (FT4 decoders may print `+` instead of `~`). WSPR lines follow wsprd:
//! `HHMM SNR DT FREQ_MHZ DRIFT CALL [GRID] DBM`.

use chrono::{DateTime, Utc};

use super::BandConfig;
use crate::geo::is_valid_locator;
use crate::spot::{Mode, Spot};

/// Tokens that may sit between `CQ` and the caller's callsign.
const CQ_MODIFIERS: &[&str] = &[
    "DX", "POTA", "SOTA", "WWFF", "IOTA", "TEST", "NA", "SA", "EU", "AS", "AF", "OC", "JA", "FD",
    "RU", "WW",
];

/// Turn one decoder output line into a spot.
///
/// Returns `None` for lines that are not decodes or whose message carries no
/// usable callsign.
pub fn parse_decode_line(line: &str, band: &BandConfig, cycle_start: DateTime<Utc>) -> Option<Spot> {
    match band.mode {
        Mode::Ft8 | Mode::Ft4 => parse_ft_line(line, band, cycle_start),
        Mode::Wspr => parse_wspr_line(line, band, cycle_start),
        Mode::Cw | Mode::Rtty => None,
    }
}

fn is_time_token(token: &str, len: usize) -> bool {
    token.len() == len && token.bytes().all(|b| b.is_ascii_digit())
}

fn parse_ft_line(line: &str, band: &BandConfig, cycle_start: DateTime<Utc>) -> Option<Spot> {
    let mut fields = line.split_whitespace();
    let time = fields.next()?;
    if !is_time_token(time, 6) && !is_time_token(time, 4) {
        return None;
    }
    let snr: i32 = fields.next()?.parse().ok()?;
    let dt: f32 = fields.next()?.parse().ok()?;
    let offset_hz: f64 = fields.next()?.parse().ok()?;
    let marker = fields.next()?;
    if marker != "~" && marker != "+" {
        return None;
    }
    let message = fields.collect::<Vec<_>>().join(" ");
    if message.is_empty() || !offset_hz.is_finite() || offset_hz < 0.0 {
        return None;
    }

    let callsign = sender_callsign(&message)?;
    let frequency_hz = band.dial_frequency_hz + offset_hz.round() as u64;
    let mut spot = Spot::new(band.mode, callsign, frequency_hz, snr, cycle_start);
    fill_band(&mut spot, band);
    spot.locator = message_locator(&message);
    spot.dt_s = Some(dt);
    spot.message = Some(message);
    Some(spot)
}

fn parse_wspr_line(line: &str, band: &BandConfig, cycle_start: DateTime<Utc>) -> Option<Spot> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 7 && fields.len() != 8 {
        return None;
    }
    if !is_time_token(fields[0], 4) {
        return None;
    }
    let snr: i32 = fields[1].parse().ok()?;
    let dt: f32 = fields[2].parse().ok()?;
    let freq_mhz: f64 = fields[3].parse().ok()?;
    let drift: i32 = fields[4].parse().ok()?;
    let call = fields[5];
    if !is_callsign(call) {
        return None;
    }
    let (grid, dbm) = if fields.len() == 8 {
        (Some(fields[6]), fields[7])
    } else {
        (None, fields[6])
    };
    dbm.parse::<i32>().ok()?;
    if !freq_mhz.is_finite() || freq_mhz <= 0.0 {
        return None;
    }

    let mut spot = Spot::new(
        Mode::Wspr,
        call,
        (freq_mhz * 1_000_000.0).round() as u64,
        snr,
        cycle_start,
    );
    fill_band(&mut spot, band);
    spot.locator = grid.filter(|g| is_valid_locator(g)).map(str::to_string);
    spot.dt_s = Some(dt);
    spot.drift_hz = Some(drift);
    spot.message = Some(fields[5..].join(" "));
    Some(spot)
}

fn fill_band(spot: &mut Spot, band: &BandConfig) {
    if spot.band == "unknown" {
        spot.band = band.name.clone();
    }
}

/// Plausible amateur callsign: letters and digits with at least one of
/// each, optionally with `/` portable designators. Hashed `<...>` calls
/// are rejected.
pub fn is_callsign(token: &str) -> bool {
    if token.len() < 3 || token.len() > 13 {
        return false;
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '/')
    {
        return false;
    }
    token.chars().any(|c| c.is_ascii_uppercase()) && token.chars().any(|c| c.is_ascii_digit())
}

/// Callsign of the station that transmitted an FT8/FT4 message.
///
/// `CQ [modifier] CALL [GRID]` yields CALL. `TO FROM [GRID|report]` and
/// `DE FROM` yield FROM.
pub fn sender_callsign(message: &str) -> Option<String> {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let head = *tokens.first()?;

    let candidate = if matches!(head, "CQ" | "QRZ") {
        let mut rest = tokens[1..].iter().copied();
        let mut next = rest.next()?;
        if CQ_MODIFIERS.contains(&next) || is_cq_zone(next) {
            next = rest.next()?;
        }
        next
    } else {
        *tokens.get(1)?
    };

    is_callsign(candidate).then(|| candidate.to_string())
}

fn is_cq_zone(token: &str) -> bool {
    token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit())
}

/// Grid square carried by an FT8/FT4 message, if any.
///
/// Only the token following the sender is considered, and `RR73` is a
/// sign-off, not a grid.
pub fn message_locator(message: &str) -> Option<String> {
    let sender = sender_callsign(message)?;
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let pos = tokens.iter().rposition(|t| *t == sender)?;
    let grid = *tokens.get(pos + 1)?;
    (grid != "RR73" && grid.len() == 4 && is_valid_locator(grid)).then(|| grid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Regime;
    use chrono::TimeZone;
    use std::time::Duration;

    fn band(mode: Mode, dial: u64) -> BandConfig {
        BandConfig {
            name: "40m".to_string(),
            mode,
            dial_frequency_hz: dial,
            regime: Regime::Batch,
            command: "jt9".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    fn cycle() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 15).unwrap()
    }

    #[test]
    fn test_ft8_cq_line() {
        let spot = parse_decode_line(
            "120015 -12  0.3 1234 ~  CQ K1ABC FN42",
            &band(Mode::Ft8, 7_074_000),
            cycle(),
        )
        .unwrap();
        assert_eq!(spot.callsign, "K1ABC");
        assert_eq!(spot.frequency_hz, 7_075_234);
        assert_eq!(spot.band, "40m");
        assert_eq!(spot.snr_db, -12);
        assert_eq!(spot.locator.as_deref(), Some("FN42"));
        assert_eq!(spot.dt_s, Some(0.3));
        assert_eq!(spot.message.as_deref(), Some("CQ K1ABC FN42"));
        assert_eq!(spot.timestamp, cycle());
    }

    #[test]
    fn test_ft4_plus_marker() {
        let spot = parse_decode_line(
            "120007  3 -0.1  800 +  W1AW K1ABC -07",
            &band(Mode::Ft4, 14_080_000),
            cycle(),
        )
        .unwrap();
        assert_eq!(spot.callsign, "K1ABC");
        assert_eq!(spot.locator, None);
        assert_eq!(spot.mode, Mode::Ft4);
    }

    #[test]
    fn test_sender_callsign() {
        assert_eq!(sender_callsign("CQ K1ABC FN42").as_deref(), Some("K1ABC"));
        assert_eq!(sender_callsign("CQ DX JA1XYZ PM95").as_deref(), Some("JA1XYZ"));
        assert_eq!(sender_callsign("CQ POTA W1AW FN31").as_deref(), Some("W1AW"));
        assert_eq!(sender_callsign("W1AW K1ABC R-10").as_deref(), Some("K1ABC"));
        assert_eq!(sender_callsign("W1AW K1ABC/P RR73").as_deref(), Some("K1ABC/P"));
        assert_eq!(sender_callsign("CQ <...>"), None);
        assert_eq!(sender_callsign("W1AW <K1ABC> 73"), None);
        assert_eq!(sender_callsign("TNX 73"), None);
    }

    #[test]
    fn test_rr73_is_not_a_grid() {
        assert_eq!(message_locator("W1AW K1ABC RR73"), None);
        assert_eq!(message_locator("W1AW K1ABC EM73").as_deref(), Some("EM73"));
        assert_eq!(message_locator("W1AW K1ABC 73"), None);
    }

    #[test]
    fn test_wspr_line() {
        let spot = parse_decode_line(
            "1200  -21  0.3  14.097091  0  K1ABC FN42 37",
            &band(Mode::Wspr, 14_095_600),
            cycle(),
        )
        .unwrap();
        assert_eq!(spot.callsign, "K1ABC");
        assert_eq!(spot.frequency_hz, 14_097_091);
        assert_eq!(spot.band, "20m");
        assert_eq!(spot.drift_hz, Some(0));
        assert_eq!(spot.locator.as_deref(), Some("FN42"));

        let no_grid = parse_decode_line(
            "1200  -25  1.1  14.097100 -1  PJ4/K1ABC 23",
            &band(Mode::Wspr, 14_095_600),
            cycle(),
        )
        .unwrap();
        assert_eq!(no_grid.callsign, "PJ4/K1ABC");
        assert_eq!(no_grid.locator, None);
    }

    #[test]
    fn test_rejects_noise() {
        let ft8 = band(Mode::Ft8, 7_074_000);
        assert!(parse_decode_line("<DecodeFinished>   0   1        0", &ft8, cycle()).is_none());
        assert!(parse_decode_line("120015 -12 0.3 1234 ~", &ft8, cycle()).is_none());
        assert!(parse_decode_line("", &ft8, cycle()).is_none());
        let wspr = band(Mode::Wspr, 14_095_600);
        assert!(parse_decode_line("1200 -21 0.3 14.0970 0 <...> FN42 37", &wspr, cycle()).is_none());
    }
}
