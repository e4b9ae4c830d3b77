use std::time::Instant;

/// Injectable time source.
///
/// The route table's cleanup grace window is measured against this clock so
/// tests can steer time instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real, monotonic system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
