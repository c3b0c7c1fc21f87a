// Process-relative monotonic clock.
//
// Engines stamp their activity in microseconds since process start; the
// work-stealing staleness check only ever compares these stamps.

use once_cell::sync::Lazy;
use std::time::Instant;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed since the first call site touched the clock.
pub fn now_micros() -> u64 {
    START.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }
}
