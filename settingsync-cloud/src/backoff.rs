//! Exponential retry backoff shared by the push and pull loops.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

pub const BASE_DELAY_MS: i64 = 1_000;
pub const MAX_DELAY_MS: i64 = 120_000;

/// Delay before the next attempt after `retry_count` consecutive failures,
/// without jitter.
pub fn base_delay_ms(retry_count: u32) -> i64 {
    let exp = retry_count.saturating_sub(1).min(7);
    (BASE_DELAY_MS << exp).min(MAX_DELAY_MS)
}

/// Base delay plus uniform jitter in `[0, delay / 4]`.
pub struct Backoff {
    rng: Mutex<StdRng>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn delay_ms(&self, retry_count: u32) -> i64 {
        let base = base_delay_ms(retry_count);
        let jitter_max = base / 4;
        let jitter = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..=jitter_max),
            Err(_) => 0,
        };
        base + jitter
    }
}
