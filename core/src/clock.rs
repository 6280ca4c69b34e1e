//! Hybrid Logical Clock: produces monotonic [`Eventstamp`]s and fast-forwards
//! on observing remote state.
//!
//! Grounded on `topgun-core`'s `HLC`/`ClockSource` (`hlc.rs`): the
//! dependency-injected wall clock carries over unchanged, since it is the
//! seam that makes "never peeks at the wall clock outside `now`"
//! (spec.md §4.2) testable. The eventstamp grammar here has no `node_id`
//! segment, so there is nothing to inject at construction beyond the clock
//! source itself, and `forward` has no drift rejection, spec.md's contract
//! is exactly `now` / `latest` / `forward` / `from_eventstamp`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::eventstamp::{self, Eventstamp};

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a virtual
/// one. [`SystemClock`] is the default, delegating to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }
}

/// A Hybrid Logical Clock.
///
/// Generates monotonically increasing [`Eventstamp`]s by combining
/// wall-clock time with a logical counter and a random nonce. The clock is
/// only ever advanced by [`HLC::now`] (a local event) or [`HLC::forward`]
/// (observing a remote or persisted stamp), never by peeking at the wall
/// clock anywhere else.
pub struct HLC {
    last_millis: u64,
    last_counter: u64,
    last_nonce: String,
    clock_source: Box<dyn ClockSource>,
}

impl HLC {
    /// Creates a new HLC seeded at the epoch, using the given clock source.
    #[must_use]
    pub fn new(clock_source: Box<dyn ClockSource>) -> Self {
        Self {
            last_millis: 0,
            last_counter: 0,
            last_nonce: "0000".to_string(),
            clock_source,
        }
    }

    /// Creates an HLC backed by [`SystemClock`].
    #[must_use]
    pub fn with_system_clock() -> Self {
        Self::new(Box::new(SystemClock))
    }

    /// Seeds a new HLC's state from a previously persisted eventstamp, so
    /// that a restarted replica resumes strictly after its last known stamp.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StarlingError::InvalidEventstamp`] if `stamp`
    /// is malformed.
    pub fn from_eventstamp(stamp: &str, clock_source: Box<dyn ClockSource>) -> Result<Self> {
        let decoded = eventstamp::decode(stamp)?;
        Ok(Self {
            last_millis: decoded.timestamp_ms,
            last_counter: decoded.counter,
            last_nonce: hex_nonce(&decoded.nonce),
            clock_source,
        })
    }

    /// Generates a new, unique eventstamp for a local event.
    ///
    /// If the wall clock has advanced past the clock's logical time, the
    /// counter resets to 0; otherwise the counter increments. Always
    /// strictly greater, in eventstamp order, than any stamp this clock has
    /// previously produced or observed via [`HLC::forward`] (spec.md I5).
    pub fn now(&mut self) -> Eventstamp {
        let wall = self.clock_source.now();

        if wall > self.last_millis {
            self.last_millis = wall;
            self.last_counter = 0;
        } else {
            self.last_counter += 1;
        }
        self.last_nonce = eventstamp::generate_nonce();

        self.current_stamp()
    }

    /// Returns the clock's current state as an eventstamp, without
    /// advancing it.
    #[must_use]
    pub fn latest(&self) -> Eventstamp {
        self.current_stamp()
    }

    /// Fast-forwards the clock to `stamp` if `stamp` is strictly ahead of
    /// [`HLC::latest`]; otherwise a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StarlingError::InvalidEventstamp`] if `stamp`
    /// is malformed.
    pub fn forward(&mut self, stamp: &Eventstamp) -> Result<()> {
        if *stamp > self.latest() {
            let decoded = stamp.decode();
            self.last_millis = decoded.timestamp_ms;
            self.last_counter = decoded.counter;
            self.last_nonce = hex_nonce(&decoded.nonce);
        }
        Ok(())
    }

    fn current_stamp(&self) -> Eventstamp {
        let encoded = eventstamp::encode(self.last_millis, self.last_counter, &self.last_nonce)
            .expect("clock state is always encodable");
        Eventstamp::parse(encoded).expect("freshly encoded stamp is always valid")
    }
}

fn hex_nonce(nonce: &[u8; 4]) -> String {
    String::from_utf8(nonce.to_vec()).expect("nonce bytes are ascii hex digits")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    /// A deterministic clock source for testing. Time is controlled
    /// explicitly by the test via the returned `Arc<AtomicU64>`.
    struct FixedClock {
        time: Arc<AtomicU64>,
    }

    impl FixedClock {
        fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let time = Arc::new(AtomicU64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now(&self) -> u64 {
            self.time.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn now_strictly_increases_when_clock_unchanged() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        let t1 = hlc.now();
        let t2 = hlc.now();
        let t3 = hlc.now();

        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn now_resets_counter_when_wall_clock_advances() {
        let (clock, time) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        let t1 = hlc.now();
        assert_eq!(t1.decode().counter, 0);

        time.store(1_000_001, Ordering::Relaxed);
        let t2 = hlc.now();
        assert_eq!(t2.decode().timestamp_ms, 1_000_001);
        assert_eq!(t2.decode().counter, 0);
        assert!(t1 < t2);
    }

    #[test]
    fn now_100_calls_all_strictly_increasing() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        let mut stamps = Vec::new();
        for _ in 0..100 {
            stamps.push(hlc.now());
        }
        for i in 1..stamps.len() {
            assert!(stamps[i - 1] < stamps[i]);
        }
    }

    #[test]
    fn latest_does_not_advance_clock() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        hlc.now();
        let a = hlc.latest();
        let b = hlc.latest();
        assert_eq!(a, b);
    }

    #[test]
    fn forward_fast_forwards_when_remote_ahead() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        let remote = Eventstamp::parse(
            eventstamp::encode(2_000_000, 5, "00ab").unwrap()
        )
        .unwrap();
        hlc.forward(&remote).unwrap();

        let next = hlc.now();
        assert!(next > remote);
        assert_eq!(next.decode().timestamp_ms, 2_000_000);
    }

    #[test]
    fn forward_is_noop_when_remote_behind() {
        let (clock, _) = FixedClock::new(5_000_000);
        let mut hlc = HLC::new(Box::new(clock));
        hlc.now();
        let local_latest_before = hlc.latest();

        let remote = Eventstamp::parse(
            eventstamp::encode(1_000_000, 99, "ffff").unwrap()
        )
        .unwrap();
        hlc.forward(&remote).unwrap();

        assert_eq!(hlc.latest(), local_latest_before);
    }

    #[test]
    fn forward_rejects_invalid_stamp_string() {
        // forward() takes a validated Eventstamp, so invalid strings are
        // rejected at Eventstamp::parse, one layer below forward().
        assert!(Eventstamp::parse("garbage").is_err());
    }

    #[test]
    fn from_eventstamp_seeds_state() {
        let stamp = eventstamp::encode(42_000, 7, "1234").unwrap();
        let (clock, _) = FixedClock::new(0);
        let hlc = HLC::from_eventstamp(&stamp, Box::new(clock)).unwrap();
        let decoded = hlc.latest().decode();
        assert_eq!(decoded.timestamp_ms, 42_000);
        assert_eq!(decoded.counter, 7);
    }

    #[test]
    fn from_eventstamp_then_now_is_strictly_after() {
        let stamp = eventstamp::encode(42_000, 7, "1234").unwrap();
        let persisted = Eventstamp::parse(stamp.clone()).unwrap();
        let (clock, _) = FixedClock::new(42_000);
        let mut hlc = HLC::from_eventstamp(&stamp, Box::new(clock)).unwrap();

        let next = hlc.now();
        assert!(next > persisted);
    }

    #[test]
    fn from_eventstamp_rejects_invalid() {
        let (clock, _) = FixedClock::new(0);
        assert!(HLC::from_eventstamp("garbage", Box::new(clock)).is_err());
    }

    #[test]
    fn bidirectional_sync_strictly_orders_both_sides() {
        let (c1, _) = FixedClock::new(1_000_000);
        let (c2, _) = FixedClock::new(1_000_000);
        let mut hlc1 = HLC::new(Box::new(c1));
        let mut hlc2 = HLC::new(Box::new(c2));

        let msg1 = hlc1.now();
        hlc2.forward(&msg1).unwrap();
        let msg2 = hlc2.now();
        assert!(msg1 < msg2);

        hlc1.forward(&msg2).unwrap();
        let final1 = hlc1.now();
        assert!(msg2 < final1);
    }

    #[test]
    fn monotonic_under_interleaved_now_and_forward() {
        let (clock, time) = FixedClock::new(1_000_000);
        let mut hlc = HLC::new(Box::new(clock));

        let mut prev = hlc.now();
        for i in 0..50u64 {
            if i % 3 == 0 {
                time.store(1_000_000 + i, Ordering::Relaxed);
            }
            if i % 5 == 0 {
                let remote = Eventstamp::parse(
                    eventstamp::encode(1_000_000 + i / 2, i, "abcd").unwrap()
                )
                .unwrap();
                hlc.forward(&remote).unwrap();
            }
            let next = hlc.now();
            assert!(prev < next, "monotonicity violated at step {i}");
            prev = next;
        }
    }
}
