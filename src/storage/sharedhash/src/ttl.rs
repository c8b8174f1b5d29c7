// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Time-to-live handling.
//!
//! Expiration times are stored as absolute unix seconds so that every process
//! attached to a segment agrees on them. A stored value of zero means the entry
//! never expires.

use clocksource::coarse::UnixInstant;

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A source of wall clock time in whole seconds since the unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        UnixInstant::now()
            .duration_since(UnixInstant::EPOCH)
            .as_secs()
    }
}

/// A clock which only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(now: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(now)),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, duration: Duration) {
        let secs = duration.as_secs().min(u32::MAX as u64) as u32;
        let _ = self
            .now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                Some(now.saturating_add(secs))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Converts between relative ttls and stored expiration times.
#[derive(Clone)]
pub(crate) struct Expiry {
    clock: Arc<dyn Clock>,
}

impl Expiry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Expiration time for an entry written now with the given ttl. Partial
    /// seconds round up, so a non-zero ttl never expires immediately.
    pub fn deadline(&self, ttl: Duration) -> u32 {
        deadline(self.now(), ttl)
    }

    pub fn is_expired(&self, expire_at: u32) -> bool {
        is_expired(expire_at, self.now())
    }
}

pub(crate) fn deadline(now: u32, ttl: Duration) -> u32 {
    if ttl.is_zero() {
        return 0;
    }
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    let secs = secs.min(u32::MAX as u64) as u32;
    now.saturating_add(secs).max(1)
}

pub(crate) fn is_expired(expire_at: u32, now: u32) -> bool {
    expire_at != 0 && now >= expire_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines() {
        assert_eq!(deadline(100, Duration::ZERO), 0);
        assert_eq!(deadline(100, Duration::from_secs(5)), 105);
        assert_eq!(deadline(100, Duration::from_millis(1)), 101);
        assert_eq!(deadline(100, Duration::from_millis(1500)), 102);
        assert_eq!(deadline(u32::MAX - 1, Duration::from_secs(10)), u32::MAX);
        assert_eq!(deadline(0, Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn expiration() {
        assert!(!is_expired(0, u32::MAX));
        assert!(!is_expired(105, 104));
        assert!(is_expired(105, 105));
        assert!(is_expired(105, 200));
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(1000);
        let expiry = Expiry::new(Arc::new(clock.clone()));

        let expire_at = expiry.deadline(Duration::from_secs(10));
        assert_eq!(expire_at, 1010);
        assert!(!expiry.is_expired(expire_at));

        clock.advance(Duration::from_secs(9));
        assert!(!expiry.is_expired(expire_at));
        clock.advance(Duration::from_secs(1));
        assert!(expiry.is_expired(expire_at));

        clock.set(0);
        assert_eq!(expiry.now(), 0);
    }

    #[test]
    fn system_clock() {
        // some time after 2020-01-01
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
