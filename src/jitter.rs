/// Supplies non-negative pseudo-random integers used to randomize counter
/// expiry so that many keys sharing a window don't all expire at once.
/// Only consulted when `expiration_jitter_max_seconds > 0`.
pub trait JitterSource: Send + Sync {
    fn next(&self) -> i64;
}

/// Production jitter source backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandJitter;

impl JitterSource for RandJitter {
    fn next(&self) -> i64 {
        rand::random::<u32>() as i64
    }
}

/// Deterministic test doubles, exercised by both in-crate unit tests and
/// the black-box integration suite.
pub mod test_support {
    use super::JitterSource;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A jitter source that always returns the same value.
    pub struct FixedJitter(AtomicI64);

    impl FixedJitter {
        pub fn new(value: i64) -> Self {
            Self(AtomicI64::new(value))
        }
    }

    impl JitterSource for FixedJitter {
        fn next(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}
