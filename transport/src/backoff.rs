// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Reconnect backoff for outbound dials.
//!
//! tonic's `Endpoint` has no native reconnect backoff, so the dial policy is
//! hand-rolled: base 1 s, multiplier 1.6, jitter 0.2, max 10 s. Callers hold
//! a [`Backoff`] across attempts and reset it once a connection lands.

use std::time::Duration;

use rand::Rng;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MULTIPLIER: f64 = 1.6;
const JITTER: f64 = 0.2;
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Exponential backoff schedule with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt: `base * multiplier^attempt`, capped at
    /// the maximum, then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn next_delay(&mut self) -> Duration {
        let exponential = BASE_DELAY.as_secs_f64() * MULTIPLIER.powi(self.attempt as i32);
        let capped = exponential.min(MAX_DELAY.as_secs_f64());
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(capped * factor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial an endpoint, retrying under the backoff schedule. The final
/// attempt's error surfaces when `max_attempts` is exhausted.
pub async fn connect_with_backoff(
    endpoint: &Endpoint,
    max_attempts: u32,
) -> Result<Channel, tonic::transport::Error> {
    let mut backoff = Backoff::new();
    let mut attempt = 0u32;
    loop {
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts.max(1) {
                    return Err(e);
                }
                let delay = backoff.next_delay();
                debug!(uri = %endpoint.uri(), attempt, ?delay, "dial failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_geometrically_within_jitter_bounds() {
        let mut backoff = Backoff::new();
        let mut expected = BASE_DELAY.as_secs_f64();
        for _ in 0..4 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= expected * (1.0 - JITTER) - f64::EPSILON);
            assert!(delay <= expected * (1.0 + JITTER) + f64::EPSILON);
            expected *= MULTIPLIER;
        }
    }

    #[test]
    fn delay_is_capped_at_the_maximum() {
        let mut backoff = Backoff::new();
        for _ in 0..32 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay <= MAX_DELAY.as_secs_f64() * (1.0 + JITTER) + f64::EPSILON);
        }
    }

    #[test]
    fn reset_starts_the_schedule_over() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay().as_secs_f64();
        assert!(delay <= BASE_DELAY.as_secs_f64() * (1.0 + JITTER) + f64::EPSILON);
    }
}
