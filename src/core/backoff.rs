//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Exponential backoff with jitter, and the retry bookkeeping used by
//! the durable connection.

use std::time::Duration;

use rand::Rng;

/// `clamp(base * 2^attempt, max)`, scaled by a uniform jitter factor in
/// `[1 - jitter, 1 + jitter]` and floored at zero. `attempt` starts at
/// zero.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let base_millis = base.as_millis() as f64;
    let max_millis = max.as_millis() as f64;
    let exponential = base_millis * 2f64.powi(attempt.min(63) as i32);
    let clamped = exponential.min(max_millis);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((clamped * factor).max(0.0) as u64)
}

/// Attempt counting for a reconnection loop.
///
/// The owning actor does the actual timing: `next_delay` hands back the
/// delay to sleep (via `Actor::send_delayed`) along with a generation
/// token; `cancel` and `reset` invalidate outstanding timers by bumping
/// the generation, which the timer task checks through `is_current`
/// before acting. When the attempt budget is spent, `next_delay`
/// returns `None` and the owner reports permanent failure.
pub struct RetryScheduler {
    base: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
    attempt: u32,
    generation: u64,
}

impl RetryScheduler {
    pub fn new(base: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            jitter,
            max_attempts,
            attempt: 0,
            generation: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consumes one attempt. `None` means the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<(Duration, u64)> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = calculate_backoff(self.attempt, self.base, self.max, self.jitter);
        self.attempt += 1;
        Some((delay, self.generation))
    }

    /// Invalidates any scheduled timer without touching the counter.
    pub fn cancel(&mut self) {
        self.generation += 1;
    }

    /// Called on a successful connection: the counter goes back to zero
    /// and outstanding timers are invalidated.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.generation += 1;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}
