//! Parser for skimmer spot lines.
//!
//! This module uses the `nom` parsing library to parse DX-cluster style spot
//! lines from a CW skimmer telnet feed. Parsing is strict: every positional
//! field must be present, SNR must be followed by `dB` and speed by `WPM`.
//!
//! # Spot Format
//!
//! ```text
//! DX de SPOTTER:  FREQ  CALLSIGN  [MODE]  SNR dB  WPM WPM  COMMENT  [TIMEZ]
//! ```
//!
//! Example:
//! ```text
//! DX de W1AW-#:   14025.0  K2ABC          15 dB  25 WPM  CQ            1234Z
//! ```

use chrono::{DateTime, Duration, NaiveTime, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, multispace1, space0, space1},
    combinator::{map_res, opt, recognize, value},
    sequence::terminated,
};
use thiserror::Error;

use crate::spot::{MAX_HF_FREQUENCY_HZ, Mode, Spot};

/// Errors that can occur during parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid spot format: {0}")]
    InvalidFormat(String),

    #[error("Frequency out of range: {0} Hz")]
    OutOfRange(u64),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Check if a character is valid in a callsign.
///
/// Valid callsign characters are alphanumeric plus `/` for portable designators
/// and `-`/`#` for suffixes like `-#` on skimmer spotters.
fn is_callsign_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || c == '-' || c == '#'
}

/// Parse the "DX de " prefix that starts every spot line.
fn parse_dx_de_prefix(input: &str) -> IResult<&str, ()> {
    value(
        (),
        (
            tag_no_case("DX"),
            multispace1,
            tag_no_case("de"),
            multispace1,
        ),
    )
    .parse(input)
}

/// Parse a callsign (spotter or DX station).
fn parse_callsign(input: &str) -> IResult<&str, &str> {
    take_while1(is_callsign_char).parse(input)
}

/// Parse the spotter callsign followed by a colon.
fn parse_spotter(input: &str) -> IResult<&str, &str> {
    terminated(parse_callsign, (char(':'), space0)).parse(input)
}

/// Parse a floating-point frequency in kHz.
fn parse_frequency(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse an optional mode token followed by whitespace.
fn parse_mode(input: &str) -> IResult<&str, Mode> {
    map_res(
        terminated(take_while1(|c: char| c.is_ascii_alphanumeric()), space1),
        |s: &str| Mode::from_token(s).ok_or("not a mode"),
    )
    .parse(input)
}

/// Parse the signal-to-noise ratio (e.g., "19 dB" or "-5 dB").
fn parse_snr(input: &str) -> IResult<&str, i32> {
    terminated(
        map_res(recognize((opt(char('-')), digit1)), |s: &str| {
            s.parse::<i32>()
        }),
        (space1, tag_no_case("dB")),
    )
    .parse(input)
}

/// Parse the CW speed in WPM (e.g., "18 WPM").
fn parse_wpm(input: &str) -> IResult<&str, u16> {
    terminated(
        map_res(digit1, |s: &str| s.parse::<u16>()),
        (space1, tag_no_case("WPM")),
    )
    .parse(input)
}

/// Parse a 4-digit UTC time token like "2259Z".
fn parse_time_token(token: &str) -> Option<NaiveTime> {
    let digits = token
        .strip_suffix('Z')
        .or_else(|| token.strip_suffix('z'))?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits[0..2].parse().ok()?;
    let min: u32 = digits[2..4].parse().ok()?;
    NaiveTime::from_hms_opt(hour, min, 0)
}

/// Split the trailing free text into comment and optional time.
fn split_comment(text: &str) -> (Option<String>, Option<NaiveTime>) {
    let text = text.trim();
    let (body, time) = match text.rsplit_once(char::is_whitespace) {
        Some((body, last)) => match parse_time_token(last) {
            Some(time) => (body.trim_end(), Some(time)),
            None => (text, None),
        },
        None => match parse_time_token(text) {
            Some(time) => ("", Some(time)),
            None => (text, None),
        },
    };
    let comment = (!body.is_empty()).then(|| body.split_whitespace().collect::<Vec<_>>().join(" "));
    (comment, time)
}

/// Remove the skimmer connection indicator (`-#`) from a spotter call.
///
/// Any `-N` instance number before it is part of the spotter identity and
/// is kept.
pub fn strip_spotter_suffix(spotter: &str) -> &str {
    spotter.strip_suffix("-#").unwrap_or(spotter)
}

/// Resolve an `HHMM` time to the most recent matching instant at or before
/// `now` (allowing a few minutes of clock skew).
fn resolve_time(time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now.date_naive().and_time(time).and_utc();
    if candidate > now + Duration::minutes(5) {
        candidate - Duration::days(1)
    } else {
        candidate
    }
}

/// Parse a complete skimmer spot line against the current time.
///
/// # Example
///
/// ```
/// use spot_relay::parser::parse_spot;
///
/// let line = "DX de W1AW-#:   14025.0  K2ABC          15 dB  25 WPM  CQ            1234Z";
/// let spot = parse_spot(line).unwrap();
/// assert_eq!(spot.callsign, "K2ABC");
/// assert_eq!(spot.frequency_hz, 14_025_000);
/// ```
pub fn parse_spot(input: &str) -> ParseResult<Spot> {
    parse_spot_at(input, Utc::now())
}

/// Parse a complete skimmer spot line, resolving its time against `now`.
pub fn parse_spot_at(input: &str, now: DateTime<Utc>) -> ParseResult<Spot> {
    let input = input.trim();

    type Fields<'a> = (&'a str, f64, &'a str, Option<Mode>, i32, u16, &'a str);
    let result: IResult<&str, Fields<'_>> = (|input| {
        let (input, _) = parse_dx_de_prefix(input)?;
        let (input, spotter) = parse_spotter(input)?;
        let (input, _) = space0(input)?;
        let (input, frequency_khz) = parse_frequency(input)?;
        let (input, _) = space1(input)?;
        let (input, dx_call) = parse_callsign(input)?;
        let (input, _) = space1(input)?;
        let (input, mode) = opt(parse_mode).parse(input)?;
        let (input, snr_db) = parse_snr(input)?;
        let (input, _) = space1(input)?;
        let (tail, wpm) = parse_wpm(input)?;
        Ok((
            "",
            (spotter, frequency_khz, dx_call, mode, snr_db, wpm, tail),
        ))
    })(input);

    let (spotter, frequency_khz, dx_call, mode, snr_db, wpm, tail) = match result {
        Ok((_, fields)) => fields,
        Err(e) => return Err(ParseError::InvalidFormat(format!("{:?}", e))),
    };

    // The tail must be empty or start with whitespace ("25 WPMX" is invalid).
    if !tail.is_empty() && !tail.starts_with(char::is_whitespace) {
        return Err(ParseError::InvalidFormat(format!(
            "unexpected text after WPM: {}",
            tail
        )));
    }

    let frequency_hz = (frequency_khz * 1000.0).round() as u64;
    if frequency_hz == 0 || frequency_hz > MAX_HF_FREQUENCY_HZ {
        return Err(ParseError::OutOfRange(frequency_hz));
    }

    let (comment, time) = split_comment(tail);
    let timestamp = time.map(|t| resolve_time(t, now)).unwrap_or(now);

    let mut spot = Spot::new(
        mode.unwrap_or(Mode::Cw),
        dx_call.to_ascii_uppercase(),
        frequency_hz,
        snr_db,
        timestamp,
    );
    spot.wpm = Some(wpm);
    spot.spotter = Some(strip_spotter_suffix(spotter).to_ascii_uppercase());
    spot.comment = comment;
    Ok(spot)
}

/// Check if a line looks like a spot (quick pre-filter).
///
/// This is a fast check to avoid running the full parser on non-spot lines.
#[inline]
pub fn looks_like_spot(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.len() > 6
        && trimmed
            .get(..6)
            .is_some_and(|p| p.eq_ignore_ascii_case("DX de "))
}
