//! Leaky-bucket pacing for the video sender.

use std::time::{Duration, Instant};

/// Initial budget, in milliseconds of traffic at the target rate.
pub const INITIAL_LEVEL_MS: i64 = 5;
/// Largest burst the bucket may accumulate.
pub const MAX_LEVEL_MS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send now; the bucket has been debited.
    Send,
    /// Budget exhausted; retry after the delay.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct LeakyBucket {
    kbps: i64,
    level: i64,
    /// Accrued fraction of a byte, in units of 1/8000 byte.
    carry: i64,
    last_refill: Instant,
    mtu: usize,
}

impl LeakyBucket {
    pub fn new(kbps: i64, mtu: usize, now: Instant) -> Self {
        let mut bucket = Self {
            kbps,
            level: 0,
            carry: 0,
            last_refill: now,
            mtu,
        };
        bucket.level = INITIAL_LEVEL_MS * bucket.bytes_per_ms();
        bucket
    }

    /// Starts with an explicit budget instead of the default five milliseconds.
    pub fn with_level(kbps: i64, mtu: usize, level: i64, now: Instant) -> Self {
        Self {
            level,
            ..Self::new(kbps, mtu, now)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kbps > 0
    }

    pub fn kbps(&self) -> i64 {
        self.kbps
    }

    /// Applies a new rate; takes effect at the next admission.
    pub fn set_rate(&mut self, kbps: i64) {
        if kbps != self.kbps {
            self.kbps = kbps;
            self.carry = 0;
            self.level = self.level.min(self.max_level());
        }
    }

    pub fn bytes_per_ms(&self) -> i64 {
        self.kbps.max(0) * 1000 / 8 / 1000
    }

    pub fn level(&self) -> i64 {
        self.level
    }

    pub fn max_level(&self) -> i64 {
        MAX_LEVEL_MS * self.bytes_per_ms()
    }

    /// Credits the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as i64;
        self.last_refill = now;
        if !self.is_enabled() {
            return;
        }

        let accrued = elapsed_us.saturating_mul(self.kbps) + self.carry;
        self.carry = accrued % 8000;
        self.level = (self.level + accrued / 8000).min(self.max_level());
    }

    /// Delay to wait once the budget has run dry.
    pub fn backoff(&self) -> Duration {
        let per_ms = self.bytes_per_ms().max(1) as u64;
        Duration::from_millis(self.mtu as u64 / per_ms + 1)
    }

    /// Checks whether `len` bytes may go out now.
    pub fn admit(&mut self, len: usize, now: Instant) -> Admission {
        if !self.is_enabled() {
            return Admission::Send;
        }

        self.refill(now);
        if self.level > 0 {
            self.level -= len as i64;
            Admission::Send
        } else {
            Admission::Wait(self.backoff())
        }
    }

    /// Debits bytes already sent without checking the budget.
    pub fn consume(&mut self, len: usize) {
        self.level -= len as i64;
    }
}
