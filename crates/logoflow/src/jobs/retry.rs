use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Backoff applied before a requeue nack while transport errors keep repeating.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter_pct: 0.20,
        }
    }
}

pub fn next_delay_ms(failures: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> u64 {
    let failures = failures.max(1);

    // exponent = failures - 1
    let exp = failures.saturating_sub(1);

    // 2^exp, saturating once the shift would overflow; the cap handles the rest.
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    if jitter_range <= 0.0 {
        return delay;
    }
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_ms as i64) as u64
}

/// Tracks consecutive requeues on one consumer connection.
///
/// Reset by any ack or drop, so a single healthy delivery ends the backoff.
pub struct RequeueBackoff {
    cfg: RetryConfig,
    consecutive: u32,
    rng: StdRng,
}

impl RequeueBackoff {
    pub fn new(cfg: RetryConfig) -> Self {
        Self {
            cfg,
            consecutive: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn on_requeue(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        Duration::from_millis(next_delay_ms(self.consecutive, &self.cfg, &mut self.rng))
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
