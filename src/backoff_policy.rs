// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Defines the backoff policy between retry attempts.

use std::time::Duration;

/// Computes how long to wait before the next attempt.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// The delay before attempt `attempt_count` (1-based).
    fn on_failure(&self, attempt_count: u32) -> Duration;
}

/// Truncated exponential backoff with full jitter.
///
/// # Example
/// ```
/// # use objectstream::backoff_policy::*;
/// # use std::time::Duration;
/// let policy = ExponentialBackoff::default();
/// assert!(policy.on_failure(1) <= Duration::from_secs(1));
/// ```
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    maximum_delay: Duration,
    scaling: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, maximum_delay: Duration, scaling: f64) -> Self {
        Self {
            initial_delay,
            maximum_delay,
            scaling: scaling.max(1.0),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn on_failure(&self, attempt_count: u32) -> Duration {
        use rand::Rng;
        let exp = attempt_count.saturating_sub(1).min(31);
        let cap = self
            .initial_delay
            .mul_f64(self.scaling.powi(exp as i32))
            .min(self.maximum_delay);
        rand::rng().random_range(Duration::ZERO..=cap)
    }
}
