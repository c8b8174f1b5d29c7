// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The public interface to a shared store.

use crate::*;

use datatier::{Memory, SharedFile};

use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) enum Backing {
    Shared(SharedFile),
    Anonymous(Memory),
}

/// A handle to a named key-value store in shared memory.
///
/// Every operation is atomic with respect to every other process and thread
/// using the same store. Operations on a single key lock only the stripe which
/// covers its bucket, operations on the whole table lock every stripe.
///
/// Dropping the handle detaches from the store. The store itself remains
/// until it is destroyed.
pub struct Store {
    name: String,
    path: Option<PathBuf>,
    // NOTE: the table refers into the backing mapping and must be dropped
    // first, fields drop in declaration order
    table: Hashtable,
    expiry: Expiry,
    backing: Backing,
    timeout: Duration,
}

/// A snapshot of the counters which are shared by every attached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Linked entries, including expired entries which were not reclaimed
    /// yet. Use [`Store::size`] for an exact count of live entries.
    pub entries: u64,
    pub buckets: u64,
    pub lock_stripes: u64,
    pub heap_size: u64,
    /// Bytes of the heap in allocated blocks.
    pub heap_used: u64,
    /// Handles open on the store across all processes.
    pub attached: u64,
}

impl Store {
    pub(crate) fn new(
        name: String,
        path: Option<PathBuf>,
        table: Hashtable,
        expiry: Expiry,
        backing: Backing,
        timeout: Duration,
    ) -> Self {
        STORE_OPEN.increment();
        Self {
            name,
            path,
            table,
            expiry,
            backing,
            timeout,
        }
    }

    /// Open the named store with the default options, creating it if needed.
    pub fn open(name: &str) -> Result<Self> {
        Builder::default().open(name)
    }

    /// Returns a new [`Builder`] for configuring how the store is opened.
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file, if the store has one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if this handle created the store rather than attaching to
    /// an existing one.
    pub fn created(&self) -> bool {
        match &self.backing {
            Backing::Shared(file) => file.created(),
            Backing::Anonymous(_) => true,
        }
    }

    fn lock_key(&self, key: &[u8]) -> Result<ScopeGuard<'_>> {
        let bucket = self.table.bucket(self.table.hash(key));
        self.table.lock(Scope::Bucket(bucket))
    }

    /// Store a value under the key, replacing any existing value. A zero
    /// `ttl` means the entry never expires, otherwise it expires after the
    /// ttl rounded up to whole seconds.
    ///
    /// ```
    /// use sharedhash::Store;
    /// use std::time::Duration;
    ///
    /// let store = Store::builder().heap_size(64 * 1024).anonymous().unwrap();
    /// store.put(b"coffee", b"strong", Duration::from_secs(60)).unwrap();
    /// assert_eq!(store.get(b"coffee").unwrap(), Some(b"strong".to_vec()));
    /// ```
    pub fn put(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        STORE_PUT.increment();

        let expire_at = self.expiry.deadline(ttl);
        let guard = self.lock_key(key)?;

        let result = match self.table.lookup(&guard, key, self.expiry.now())? {
            Some(slot) => self.table.update(&guard, &slot, key, value, expire_at),
            None => self.table.insert(&guard, key, value, expire_at),
        };
        if result.is_err() {
            STORE_PUT_EX.increment();
        }
        result
    }

    /// Overwrite the value of a live entry. Fails with
    /// [`SharedHashError::NotFound`] if the key is absent or expired.
    pub fn replace(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        STORE_REPLACE.increment();

        let expire_at = self.expiry.deadline(ttl);
        let guard = self.lock_key(key)?;

        match self.table.lookup(&guard, key, self.expiry.now())? {
            Some(slot) => self.table.update(&guard, &slot, key, value, expire_at),
            None => {
                STORE_REPLACE_NOTFOUND.increment();
                Err(SharedHashError::NotFound)
            }
        }
    }

    /// Returns a copy of the value of a live entry.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        STORE_GET.increment();

        let guard = self.lock_key(key)?;
        match self.table.lookup(&guard, key, self.expiry.now())? {
            Some(slot) => self.table.value(&slot).map(Some),
            None => {
                STORE_GET_MISS.increment();
                Ok(None)
            }
        }
    }

    /// Returns true if the key has a live entry. An expired entry found along
    /// the way is reclaimed.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        STORE_EXISTS.increment();

        let guard = self.lock_key(key)?;
        Ok(self
            .table
            .lookup(&guard, key, self.expiry.now())?
            .is_some())
    }

    /// Remove the entry for the key. Returns true if a live entry was
    /// removed. Deleting an absent key is not an error.
    pub fn del(&self, key: &[u8]) -> Result<bool> {
        STORE_DEL.increment();

        let guard = self.lock_key(key)?;
        match self.table.lookup(&guard, key, self.expiry.now())? {
            Some(slot) => {
                self.table.unlink(&guard, &slot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns every live key. The whole table is locked while the keys are
    /// collected, so the result is a consistent snapshot. The order is
    /// unspecified.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.scan(|key| keys.push(key.to_vec()))?;
        Ok(keys)
    }

    /// Number of live entries.
    pub fn size(&self) -> Result<u64> {
        let mut size = 0;
        self.scan(|_| size += 1)?;
        Ok(size)
    }

    /// Reclaim every expired entry and return how many were reclaimed.
    pub fn sweep(&self) -> Result<u64> {
        let reclaimed = self.scan(|_| {})?;
        debug!("swept {} expired entries from {}", reclaimed, self.name);
        Ok(reclaimed)
    }

    fn scan<F: FnMut(&[u8])>(&self, visit: F) -> Result<u64> {
        STORE_SCAN.increment();

        let guard = self.table.lock(Scope::Table)?;
        self.table.scan(&guard, self.expiry.now(), visit)
    }

    pub fn stats(&self) -> Result<Stats> {
        let attached = match &self.backing {
            Backing::Shared(file) => file.attached(),
            Backing::Anonymous(_) => 1,
        };

        Ok(Stats {
            entries: self.table.entries()?,
            buckets: self.table.buckets(),
            lock_stripes: self.table.stripes(),
            heap_size: self.table.heap_size(),
            heap_used: self.table.heap_used()?,
            attached,
        })
    }

    /// Detach from the store. Equivalent to dropping the handle.
    pub fn close(self) {
        drop(self)
    }

    /// Detach from the store and remove it. Fails with
    /// [`SharedHashError::Busy`] when other handles are still attached, in
    /// which case the store is left in place. This handle is closed in either
    /// case.
    ///
    /// A process which opens the store at the same time either attaches
    /// before the removal, and the store stays, or creates a fresh store
    /// after it.
    pub fn destroy(self) -> Result<()> {
        let others = match (&self.backing, &self.path) {
            (Backing::Shared(file), Some(path)) => file.destroy(path, self.timeout)?,
            _ => 0,
        };
        let path = self.path.clone();
        let name = self.name.clone();

        drop(self);

        if others > 0 {
            warn!("not destroying store {}, {} other handles attached", name, others);
            return Err(SharedHashError::Busy(others));
        }

        if let Some(path) = path {
            SEGMENT_DESTROY.increment();
            info!("destroyed store {} at {}", name, path.display());
        }

        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        STORE_OPEN.decrement();
        debug!("detached from store {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn is_send_sync<T: Send + Sync>() {}

    #[test]
    fn store_is_send_sync() {
        is_send_sync::<Store>();
    }

    #[test]
    fn anonymous_store() {
        let store = Store::builder()
            .hash_power(4)
            .lock_power(2)
            .heap_size(64 * 1024)
            .anonymous()
            .expect("failed to create");

        assert_eq!(store.name(), "anonymous");
        assert!(store.path().is_none());
        assert!(store.created());

        store.put(b"a", b"1", Duration::ZERO).expect("put failed");
        let stats = store.stats().expect("no stats");
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.buckets, 16);
        assert_eq!(stats.lock_stripes, 4);
        assert_eq!(stats.heap_size, 64 * 1024);
        assert_eq!(stats.heap_used, 64);
        assert_eq!(stats.attached, 1);

        assert!(store.destroy().is_ok());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = TempDir::new().expect("failed to create tempdir");
        let builder = || {
            Store::builder()
                .dir(dir.path())
                .hash_power(4)
                .lock_power(2)
                .heap_size(64 * 1024)
                .lock_timeout(Duration::from_millis(20))
        };

        let holder = builder().open("held").expect("failed to create");
        let waiter = builder().open("held").expect("failed to attach");
        waiter.put(b"k", b"v", Duration::ZERO).expect("put failed");

        let guard = holder.table.lock(Scope::Table).expect("failed to lock");
        assert_eq!(
            waiter.put(b"k", b"w", Duration::ZERO),
            Err(SharedHashError::Timeout)
        );
        assert_eq!(waiter.get(b"k"), Err(SharedHashError::Timeout));
        assert_eq!(waiter.size(), Err(SharedHashError::Timeout));

        // the failed put left the value alone
        drop(guard);
        assert_eq!(waiter.get(b"k"), Ok(Some(b"v".to_vec())));
    }
}
