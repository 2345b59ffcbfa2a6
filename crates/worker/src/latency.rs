//! Artificial per-token latency
//!
//! Lets test-oriented strategies pace their output like a real model would.
//! Runs on the compute context, so sleeping here never stalls a stream's
//! dispatch.

use std::time::Duration;

/// Per-token delay applied by a strategy before it produces each token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyInjector {
    per_token: Duration,
}

impl LatencyInjector {
    pub fn new(per_token: Duration) -> Self {
        Self { per_token }
    }

    /// No delay
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.per_token.is_zero()
    }

    /// Block the calling thread for one token's worth of latency
    pub fn pause(&self) {
        if self.is_enabled() {
            std::thread::sleep(self.per_token);
        }
    }
}
