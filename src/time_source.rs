use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current second since epoch. The sole source of
/// non-determinism in the decision engine besides the jitter source.
///
/// Stubbable so tests can pin `now` and assert exact bucket keys.
pub trait TimeSource: Send + Sync {
    fn unix_now(&self) -> i64;
}

/// Production time source backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs() as i64
    }
}

/// Deterministic test doubles, exercised by both in-crate unit tests and
/// the black-box integration suite.
pub mod test_support {
    use super::TimeSource;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A time source that returns a fixed value, settable mid-test so a
    /// scenario can advance the clock between calls.
    pub struct FixedTimeSource(AtomicI64);

    impl FixedTimeSource {
        pub fn new(now: i64) -> Self {
            Self(AtomicI64::new(now))
        }

        pub fn set(&self, now: i64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl TimeSource for FixedTimeSource {
        fn unix_now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}
