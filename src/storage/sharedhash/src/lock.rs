// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Locks which arbitrate between processes.
//!
//! A [`RawLock`] lives inside the shared region and records the pid of its
//! owner, which lets a waiter take over a lock whose owner exited without
//! releasing it. This recovery is best effort: a recycled pid makes a dead
//! owner look alive, and a process which died halfway through a mutation may
//! leave the structure it guarded inconsistent.
//!
//! The table is guarded by a fixed number of lock stripes. A bucket scope
//! holds the one stripe covering that bucket, the table scope holds every
//! stripe, always taken in ascending order.

use crate::*;

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

// spin this many times before yielding the cpu
const SPIN_LIMIT: u32 = 64;
// yield this many times before sleeping between attempts
const YIELD_LIMIT: u32 = 256;
// check the owner for liveness every this many failed attempts
const LIVENESS_INTERVAL: u32 = 128;

const BACKOFF: Duration = Duration::from_micros(50);

/// A spin lock that is valid across processes. Zero means unlocked, any other
/// value is the pid of the owner.
#[repr(C, align(64))]
pub(crate) struct RawLock {
    owner: AtomicU32,
}

impl RawLock {
    fn try_lock(&self, pid: u32) -> bool {
        self.owner
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the lock is taken or the deadline passes.
    pub fn lock(&self, deadline: Instant) -> Result<()> {
        let pid = std::process::id();
        let mut attempts: u32 = 0;

        loop {
            if self.try_lock(pid) {
                return Ok(());
            }

            attempts = attempts.wrapping_add(1);

            if attempts % LIVENESS_INTERVAL == 0 && self.recover(pid) {
                return Ok(());
            }

            if attempts < SPIN_LIMIT {
                std::hint::spin_loop();
                continue;
            }

            if Instant::now() >= deadline {
                LOCK_TIMEOUT.increment();
                warn!(
                    "timed out waiting for lock held by pid {}",
                    self.owner.load(Ordering::Relaxed)
                );
                return Err(SharedHashError::Timeout);
            }

            if attempts < YIELD_LIMIT {
                std::thread::yield_now();
            } else {
                std::thread::sleep(BACKOFF);
            }
        }
    }

    /// Take over the lock if its owner no longer exists.
    fn recover(&self, pid: u32) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        if owner == 0 || owner == pid || is_alive(owner) {
            return false;
        }
        if self
            .owner
            .compare_exchange(owner, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            LOCK_RECOVER.increment();
            warn!("recovered lock held by exited process {}", owner);
            true
        } else {
            false
        }
    }

    pub fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// Takes the lock and returns a guard which releases it when dropped.
    pub fn acquire(&self, deadline: Instant) -> Result<RawLockGuard<'_>> {
        self.lock(deadline)?;
        Ok(RawLockGuard { lock: self })
    }

    #[cfg(test)]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }
}

pub(crate) struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

fn is_alive(pid: u32) -> bool {
    // an owner which is not a valid pid comes from a damaged lock word, a
    // negative value would address a process group instead
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    // signal zero performs the permission and existence checks only
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// The granularity at which an operation excludes others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every bucket, used by operations which walk the whole table.
    Table,
    /// A single bucket, used by operations on one key.
    Bucket(u64),
}

/// The stripe locks of one table.
pub(crate) struct Locks {
    region: Region,
    offset: u64,
    stripes: u64,
    timeout: Duration,
}

impl Locks {
    pub fn new(region: Region, offset: u64, stripes: u64, timeout: Duration) -> Result<Self> {
        let size = stripes
            .checked_mul(core::mem::size_of::<RawLock>() as u64)
            .ok_or(SharedHashError::CorruptLayout("too many lock stripes"))?;
        region.check(offset, size, core::mem::align_of::<RawLock>() as u64)?;

        Ok(Self {
            region,
            offset,
            stripes,
            timeout,
        })
    }

    fn stripe(&self, idx: u64) -> &RawLock {
        debug_assert!(idx < self.stripes);
        // SAFETY: the whole stripe array was bounds checked on creation
        unsafe {
            &*(self.region.base_ptr().add(
                (self.offset + idx * core::mem::size_of::<RawLock>() as u64) as usize,
            ) as *const RawLock)
        }
    }

    pub fn stripes(&self) -> u64 {
        self.stripes
    }

    /// Acquire the locks covering the scope within the lock timeout.
    pub fn acquire(&self, scope: Scope) -> Result<ScopeGuard<'_>> {
        let deadline = Instant::now() + self.timeout;

        let wanted = match scope {
            Scope::Table => 0..self.stripes,
            Scope::Bucket(bucket) => {
                let stripe = bucket & (self.stripes - 1);
                stripe..(stripe + 1)
            }
        };

        // on an early return the guard releases whatever was taken so far
        let mut guard = ScopeGuard {
            locks: self,
            held: wanted.start..wanted.start,
            scope,
        };
        for idx in wanted {
            self.stripe(idx).lock(deadline)?;
            guard.held.end = idx + 1;
        }

        Ok(guard)
    }
}

/// Proof that a scope is held. Releases the stripes in reverse order when
/// dropped.
pub struct ScopeGuard<'a> {
    locks: &'a Locks,
    held: Range<u64>,
    scope: Scope,
}

impl ScopeGuard<'_> {
    pub(crate) fn scope(&self) -> Scope {
        self.scope
    }

    /// Returns true if the guard excludes other operations on this bucket.
    pub(crate) fn covers(&self, bucket: u64) -> bool {
        match self.scope {
            Scope::Table => true,
            Scope::Bucket(b) => b & (self.locks.stripes - 1) == bucket & (self.locks.stripes - 1),
        }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        for idx in self.held.clone().rev() {
            self.locks.stripe(idx).unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datatier::{Datapool, Memory};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn locks(stripes: u64, timeout: Duration) -> (Memory, Locks) {
        let mut pool = Memory::create(4096).expect("failed to create pool");
        let region = unsafe { Region::new(pool.as_mut_ptr(), pool.len()) };
        let locks = Locks::new(region, 0, stripes, timeout).expect("failed to create locks");
        (pool, locks)
    }

    #[test]
    fn bucket_scope() {
        let (_pool, locks) = locks(4, Duration::from_millis(10));

        let guard = locks.acquire(Scope::Bucket(1)).expect("failed to lock");
        assert!(guard.covers(1));
        assert!(guard.covers(5));
        assert!(!guard.covers(2));
        assert_eq!(locks.stripe(1).owner(), std::process::id());

        // a different stripe is still available
        let other = locks.acquire(Scope::Bucket(2)).expect("failed to lock");
        drop(other);

        // the same stripe times out
        assert_eq!(
            locks.acquire(Scope::Bucket(5)).err(),
            Some(SharedHashError::Timeout)
        );

        drop(guard);
        assert_eq!(locks.stripe(1).owner(), 0);
        assert!(locks.acquire(Scope::Bucket(5)).is_ok());
    }

    #[test]
    fn table_scope() {
        let (_pool, locks) = locks(8, Duration::from_millis(10));

        let bucket = locks.acquire(Scope::Bucket(6)).expect("failed to lock");

        // the table scope cannot be taken while a bucket is held, and it
        // releases the stripes it took before giving up
        assert_eq!(
            locks.acquire(Scope::Table).err(),
            Some(SharedHashError::Timeout)
        );
        for idx in 0..8 {
            if idx != 6 {
                assert_eq!(locks.stripe(idx).owner(), 0);
            }
        }

        drop(bucket);
        let table = locks.acquire(Scope::Table).expect("failed to lock");
        assert_eq!(table.scope(), Scope::Table);
        assert!(locks.acquire(Scope::Bucket(0)).is_err());
        drop(table);
        assert!(locks.acquire(Scope::Bucket(0)).is_ok());
    }

    #[test]
    fn recover_from_exited_owner() {
        let (_pool, locks) = locks(1, Duration::from_secs(5));

        // reap a child so that its pid is known not to exist
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("failed to spawn");
        let dead = child.id();
        child.wait().expect("failed to wait");

        locks.stripe(0).owner.store(dead, Ordering::Relaxed);

        let guard = locks.acquire(Scope::Table).expect("failed to recover");
        assert_eq!(locks.stripe(0).owner(), std::process::id());
        drop(guard);
    }

    #[test]
    fn invalid_owner_is_not_recovered() {
        let (_pool, locks) = locks(1, Duration::from_millis(20));

        locks.stripe(0).owner.store(u32::MAX, Ordering::Relaxed);
        assert!(!locks.stripe(0).recover(std::process::id()));
        assert_eq!(
            locks.acquire(Scope::Table).err(),
            Some(SharedHashError::Timeout)
        );
        assert_eq!(locks.stripe(0).owner(), u32::MAX);
    }

    #[test]
    fn mutual_exclusion() {
        let (pool, locks) = locks(2, Duration::from_secs(5));
        let locks = Arc::new(locks);
        let inside = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = locks.acquire(Scope::Bucket(0)).expect("failed to lock");
                        assert!(!inside.swap(true, Ordering::AcqRel));
                        inside.store(false, Ordering::Release);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().expect("thread panicked");
        }
        drop(pool);
    }
}
