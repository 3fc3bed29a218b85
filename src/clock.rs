//! Monotonic clock producing lexicographically ordered eventstamps.
//!
//! Each [`Store`](crate::store::Store) owns one [`Clock`], which hands out
//! [`Eventstamp`]s for every field written locally. String comparison of the
//! wire form equals temporal comparison, so eventstamps can be compared,
//! sorted, and persisted without any parsing step.
//!
//! # Wire format
//!
//! `<ISO-8601-ms-UTC>|<8-hex-counter>`, e.g. `2025-01-02T03:04:05.006Z|0000000f`.

use std::fmt;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

static WIRE_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z\|[0-9a-f]{8}$")
        .expect("eventstamp regex is valid")
});

/// An opaque, lexicographically ordered timestamp.
///
/// Two eventstamps produced by the same [`Clock`] instance are always
/// strictly increasing. Comparing the wire strings gives the same result as
/// comparing the (millis, counter) pair they were built from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eventstamp(String);

impl Eventstamp {
    /// Parses and validates a wire-form eventstamp string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEventstamp`] if `raw` does not match the
    /// canonical `<ISO-8601-ms-UTC>|<8-hex-counter>` form.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if WIRE_FORMAT.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::MalformedEventstamp {
                value: raw.to_string(),
            })
        }
    }

    /// Returns the wire-form string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_parts(millis: u64, counter: u32) -> Self {
        let secs = (millis / 1000) as i64;
        let nanos = ((millis % 1000) * 1_000_000) as u32;
        let dt = DateTime::<Utc>::from_timestamp(secs, nanos)
            .expect("millis-since-epoch always yields a valid timestamp");
        Self(format!(
            "{}|{counter:08x}",
            dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        ))
    }

    fn parts(&self) -> (u64, u32) {
        let (iso, hex) = self
            .0
            .split_once('|')
            .expect("constructed only through validated parts");
        let dt = DateTime::parse_from_rfc3339(iso)
            .expect("constructed only through validated parts")
            .with_timezone(&Utc);
        let millis = dt.timestamp_millis() as u64;
        let counter = u32::from_str_radix(hex, 16).expect("constructed only through validated parts");
        (millis, counter)
    }
}

impl fmt::Display for Eventstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstraction over the wall clock, for deterministic testing.
///
/// The default implementation ([`SystemTimeSource`]) delegates to
/// `std::time::SystemTime`. Tests substitute a [`FixedTimeSource`] driven by
/// an explicit sequence of millisecond readings.
pub trait TimeSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Default [`TimeSource`] backed by the real system clock.
#[derive(Debug, Clone, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64
    }
}

/// Monotonic eventstamp generator.
///
/// Holds `last_millis`/`last_counter` state: when wall-clock time advances
/// past `last_millis`, the counter resets to zero; otherwise it increments,
/// guaranteeing strictly increasing output even under clock stalls or
/// same-millisecond bursts. The counter saturates at `u32::MAX` rather than
/// wrapping, which would otherwise violate monotonicity.
pub struct Clock {
    last_millis: u64,
    last_counter: u32,
    time_source: Box<dyn TimeSource>,
}

impl Clock {
    /// Creates a clock backed by the real system time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_time_source(Box::new(SystemTimeSource))
    }

    /// Creates a clock backed by a custom [`TimeSource`] (primarily for tests).
    #[must_use]
    pub fn with_time_source(time_source: Box<dyn TimeSource>) -> Self {
        Self {
            last_millis: 0,
            last_counter: 0,
            time_source,
        }
    }

    /// Produces the next eventstamp.
    ///
    /// Strictly greater than every eventstamp previously returned by this
    /// instance, including any applied via [`Clock::forward`].
    pub fn now(&mut self) -> Eventstamp {
        let wall = self.time_source.now_millis();
        if wall > self.last_millis {
            self.last_millis = wall;
            self.last_counter = 0;
        } else {
            self.last_counter = self.last_counter.saturating_add(1);
        }
        Eventstamp::from_parts(self.last_millis, self.last_counter)
    }

    /// Advances internal state so future eventstamps sort above `es`, if `es`
    /// is strictly greater than the clock's current position.
    ///
    /// Used when ingesting a remote snapshot whose eventstamps may be ahead
    /// of the local wall clock, so subsequent local writes keep winning ties
    /// against already-observed remote state.
    pub fn forward(&mut self, es: &Eventstamp) {
        let (millis, counter) = es.parts();
        if millis > self.last_millis || (millis == self.last_millis && counter > self.last_counter) {
            self.last_millis = millis;
            self.last_counter = counter;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
