//! Randomization utilities

use rand::Rng;
use std::time::Duration;

/// Add up to 25% random jitter to a delay
pub fn jitter(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    base + Duration::from_millis(rng.gen_range(0..=spread))
}
