//! Monotonic tick source used by timed pollers and command timeout
//! supervision. The default source derives ticks from the monotonic clock;
//! a virtual source can be installed so time-driven behaviour can be tested
//! in simulated time.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use once_cell::sync::{Lazy, OnceCell};

/// Tick frequency; one tick is a microsecond.
pub const TICK_HZ: u64 = 1_000_000;

enum Source {
    Monotonic(Instant),
    Virtual(AtomicU64),
}

static SOURCE: OnceCell<Source> = OnceCell::new();
static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

fn source() -> &'static Source {
    SOURCE.get_or_init(|| Source::Monotonic(*MONOTONIC_BASE))
}

/// Return the tick frequency.
pub fn ticks_hz() -> u64 {
    TICK_HZ
}

/// Return the current tick count.
pub fn now() -> u64 {
    match source() {
        Source::Monotonic(base) => base.elapsed().as_micros() as u64,
        Source::Virtual(ticks) => ticks.load(Ordering::Acquire),
    }
}

/// Install the virtual clock. Must be called before the first tick is read;
/// returns false if the monotonic source is already active.
pub fn use_virtual_clock() -> bool {
    SOURCE.set(Source::Virtual(AtomicU64::new(0))).is_ok()
        || matches!(source(), Source::Virtual(_))
}

/// Advance the virtual clock. A no-op when the monotonic source is active.
pub fn advance_us(us: u64) {
    if let Source::Virtual(ticks) = source() {
        ticks.fetch_add(us, Ordering::AcqRel);
    }
}

/// Convert microseconds into ticks.
pub fn from_micros(us: u64) -> u64 {
    us * (TICK_HZ / 1_000_000)
}

#[cfg(test)]
mod tests {
    #[test]
    fn monotonic_ticks_advance() {
        let a = super::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = super::now();
        assert!(b > a);
    }
}
