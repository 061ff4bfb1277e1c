// Copyright 2020 Joyent, Inc.

//! Per-connection admission control.
//!
//! Each session owns one [`TokenBucket`].  The bucket starts full, holds at
//! most `capacity` tokens and gains one token every `interval`.  Admission
//! that finds the bucket empty waits for the next token instead of rejecting
//! the message, so a fast client is slowed down rather than losing data.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq)]
pub enum LimiterError {
    #[error("admission wait cancelled")]
    Cancelled,
    #[error("admission would wait longer than {0:?}")]
    WaitBudgetExceeded(Duration),
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    interval: Duration,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// A full bucket.  A zero `interval` disables limiting entirely.
    pub fn new(capacity: u32, interval: Duration) -> TokenBucket {
        let capacity = f64::from(capacity.max(1));
        TokenBucket {
            capacity,
            interval,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last {
            return;
        }
        if self.interval == Duration::from_secs(0) {
            self.tokens = self.capacity;
        } else {
            let gained = now.duration_since(self.last).as_secs_f64()
                / self.interval.as_secs_f64();
            self.tokens = (self.tokens + gained).min(self.capacity);
        }
        self.last = now;
    }

    fn try_admit_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.interval == Duration::from_secs(0) {
            return true;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token exists, as of the last refill.  Never zero,
    /// so a waiter always lets the clock move.
    fn shortfall(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit * self.interval.as_secs_f64())
            .max(Duration::from_millis(1))
    }

    /// Take a token if one is available right now.
    pub fn try_admit(&mut self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Take a token, waiting for one if necessary.
    ///
    /// Fails without waiting if the next token is further away than what is
    /// left of `budget`, and fails with [`LimiterError::Cancelled`] if
    /// `cancel` fires while waiting.
    pub async fn admit(
        &mut self,
        cancel: &CancellationToken,
        budget: Duration,
    ) -> Result<(), LimiterError> {
        let deadline = Instant::now() + budget;

        loop {
            let now = Instant::now();
            if self.try_admit_at(now) {
                return Ok(());
            }

            let wait = self.shortfall();
            if now + wait > deadline {
                return Err(LimiterError::WaitBudgetExceeded(budget));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LimiterError::Cancelled),
                _ = sleep(wait) => (),
            }
        }
    }
}
