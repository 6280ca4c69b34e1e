//! Eventstamp codec: the total-ordered string stamp every write carries.
//!
//! An eventstamp has the exact wire form `YYYY-MM-DDTHH:MM:SS.sssZ|CCCC|NNNN`:
//! an ISO-8601 UTC millisecond timestamp, a lowercase hex counter (4-8
//! digits, zero-padded to at least 4), and a lowercase hex nonce (exactly 4
//! digits). String ordering of the whole stamp equals logical ordering, so
//! [`Eventstamp::compare`] is a plain string compare and every `Eventstamp`
//! implements [`Ord`] directly.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, StarlingError};

/// Total grammar for an eventstamp: millisecond ISO-8601 timestamp, a
/// 4-8 digit lowercase hex counter, and a 4-digit lowercase hex nonce.
fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z\|[0-9a-f]{4,8}\|[0-9a-f]{4}$"
        )
        .expect("eventstamp pattern is a valid regex")
    })
}

/// A validated, total-ordered eventstamp string.
///
/// The inner string is guaranteed to match [`pattern`] for any `Eventstamp`
/// constructed through this module's public API ([`encode`], [`decode`]
/// round-trips, [`Eventstamp::parse`]). `PartialOrd`/`Ord` delegate to plain
/// string comparison, which is the ordering spec.md mandates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Eventstamp(String);

impl<'de> Deserialize<'de> for Eventstamp {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>
    {
        let s = String::deserialize(deserializer)?;
        Eventstamp::parse(s).map_err(D::Error::custom)
    }
}

impl Eventstamp {
    /// Parses and validates a raw string into an `Eventstamp`.
    ///
    /// # Errors
    ///
    /// Returns [`StarlingError::InvalidEventstamp`] if `s` does not match
    /// the total grammar.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if pattern().is_match(&s) {
            Ok(Self(s))
        } else {
            Err(StarlingError::InvalidEventstamp(s))
        }
    }

    /// Borrows the underlying wire string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes this stamp into its `(timestamp_ms, counter, nonce)` parts.
    ///
    /// Infallible: the string was already validated at construction.
    #[must_use]
    pub fn decode(&self) -> DecodedEventstamp {
        decode(&self.0).expect("Eventstamp always holds a validated string")
    }

    /// Returns the later of two stamps by string order. Used to bubble
    /// `latest` through merges (spec.md §4.4).
    #[must_use]
    pub fn max(a: &Self, b: &Self) -> Self {
        if a >= b { a.clone() } else { b.clone() }
    }
}

impl fmt::Display for Eventstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The earliest representable eventstamp: Unix epoch, zero counter, zero
/// nonce. Smaller than every eventstamp a real clock can produce.
pub fn min_eventstamp() -> Eventstamp {
    Eventstamp(encode(0, 0, "0000").expect("fixed-width zero encoding is always valid"))
}

/// The `(timestamp_ms, counter, nonce)` triple an eventstamp decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEventstamp {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Logical tie-break counter for events within the same millisecond.
    pub counter: u64,
    /// Random collision-avoidance nonce, exactly 4 hex digits.
    pub nonce: [u8; 4],
}

/// Formats `(timestamp_ms, counter, nonce)` into the wire string.
///
/// The counter is zero-padded to 4 hex digits, and never truncated if it
/// needs more than 4 (up to 8) digits to represent exactly.
///
/// # Errors
///
/// Returns [`StarlingError::InvalidEventstamp`] if `nonce` is not exactly 4
/// lowercase hex characters, or if `counter` does not fit in 8 hex digits.
pub fn encode(timestamp_ms: u64, counter: u64, nonce: &str) -> Result<String> {
    if nonce.len() != 4 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StarlingError::InvalidEventstamp(format!(
            "nonce must be exactly 4 hex digits, got {nonce:?}"
        )));
    }
    if counter > 0xFFFF_FFFF {
        return Err(StarlingError::InvalidEventstamp(format!(
            "counter {counter} does not fit in 8 hex digits"
        )));
    }
    let nonce = nonce.to_ascii_lowercase();
    let counter_width = hex_width(counter).max(4);
    let millis = timestamp_ms % 1000;
    let secs = timestamp_ms / 1000;
    let datetime = format_iso8601(secs, millis);
    Ok(format!(
        "{datetime}|{counter:0width$x}|{nonce}",
        width = counter_width
    ))
}

/// Number of hex digits needed to represent `n` without leading zeros
/// (minimum 1).
fn hex_width(n: u64) -> usize {
    if n == 0 {
        1
    } else {
        let mut n = n;
        let mut width = 0;
        while n > 0 {
            width += 1;
            n >>= 4;
        }
        width
    }
}

/// Renders `secs` (Unix seconds) + `millis` (0-999) as
/// `YYYY-MM-DDTHH:MM:SS.sssZ`, a fixed-width-24 ISO-8601 UTC string.
fn format_iso8601(secs: u64, millis: u64) -> String {
    let (y, mo, d, h, mi, s) = civil_from_unix(secs as i64);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{millis:03}Z")
}

/// Converts Unix seconds to civil `(year, month, day, hour, minute, second)`
/// in UTC, using Howard Hinnant's days-from-civil algorithm (proleptic
/// Gregorian, no leap seconds, the same assumption `chrono`/`time` make
/// for `SystemTime`-derived timestamps).
fn civil_from_unix(unix_secs: i64) -> (i64, u32, u32, u32, u32, u32) {
    let days = unix_secs.div_euclid(86_400);
    let rem = unix_secs.rem_euclid(86_400);
    let hour = (rem / 3600) as u32;
    let minute = ((rem % 3600) / 60) as u32;
    let second = (rem % 60) as u32;

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day, hour, minute, second)
}

/// Parses an eventstamp string into its decoded parts.
///
/// # Errors
///
/// Returns [`StarlingError::InvalidEventstamp`] if `s` does not match the
/// total grammar.
pub fn decode(s: &str) -> Result<DecodedEventstamp> {
    if !pattern().is_match(s) {
        return Err(StarlingError::InvalidEventstamp(s.to_string()));
    }
    let mut parts = s.split('|');
    let datetime = parts.next().expect("pattern guarantees 3 parts");
    let counter_hex = parts.next().expect("pattern guarantees 3 parts");
    let nonce_hex = parts.next().expect("pattern guarantees 3 parts");

    let timestamp_ms = parse_iso8601_millis(datetime)?;
    let counter = u64::from_str_radix(counter_hex, 16)
        .map_err(|_| StarlingError::InvalidEventstamp(s.to_string()))?;

    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(nonce_hex.as_bytes());

    Ok(DecodedEventstamp {
        timestamp_ms,
        counter,
        nonce,
    })
}

/// Parses `YYYY-MM-DDTHH:MM:SS.sssZ` (already regex-validated) to Unix
/// milliseconds.
fn parse_iso8601_millis(s: &str) -> Result<u64> {
    let invalid = || StarlingError::InvalidEventstamp(s.to_string());
    let year: i64 = s[0..4].parse().map_err(|_| invalid())?;
    let month: u32 = s[5..7].parse().map_err(|_| invalid())?;
    let day: u32 = s[8..10].parse().map_err(|_| invalid())?;
    let hour: i64 = s[11..13].parse().map_err(|_| invalid())?;
    let minute: i64 = s[14..16].parse().map_err(|_| invalid())?;
    let second: i64 = s[17..19].parse().map_err(|_| invalid())?;
    let millis: i64 = s[20..23].parse().map_err(|_| invalid())?;

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    let total_millis = secs * 1000 + millis;
    u64::try_from(total_millis).map_err(|_| invalid())
}

/// Inverse of [`civil_from_unix`]'s date half: civil date to days since the
/// Unix epoch (Howard Hinnant's days-from-civil).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = u64::from(if m > 2 { m - 3 } else { m + 9 });
    let doy = (153 * mp + 2) / 5 + u64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

/// Checks whether a raw string is a well-formed eventstamp.
#[must_use]
pub fn is_valid(s: &str) -> bool {
    pattern().is_match(s)
}

/// Generates a cryptographically random 4-hex-digit nonce.
///
/// Collision-resistant within a single millisecond: 65,536 possible values
/// drawn uniformly via the `rand` crate's OS-backed default RNG.
#[must_use]
pub fn generate_nonce() -> String {
    use rand::Rng;
    let n: u16 = rand::rng().random();
    format!("{n:04x}")
}

/// Compares two eventstamps. Equivalent to plain string compare, since
/// string ordering equals logical ordering for this grammar.
#[must_use]
pub fn compare(a: &Eventstamp, b: &Eventstamp) -> std::cmp::Ordering {
    a.cmp(b)
}
