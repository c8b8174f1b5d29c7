// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A builder for configuring and opening a [`Store`].

use crate::store::Backing;
use crate::*;

use datatier::{Datapool, Memory, SharedFile};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// largest supported table has 2^32 buckets
const MAX_HASH_POWER: u8 = 32;

/// A builder that is used to open a [`Store`] instance.
///
/// The geometry options only take effect when the store is created. A process
/// which attaches to an existing store uses whatever geometry the creator
/// chose.
pub struct Builder {
    dir: Option<PathBuf>,
    hash_power: u8,
    heap_size: usize,
    lock_power: u8,
    lock_timeout: Duration,
    create: bool,
    clock: Arc<dyn Clock>,
}

// Defines the default parameters
impl Default for Builder {
    fn default() -> Self {
        Self {
            dir: None,
            hash_power: 16,
            heap_size: 64 * 1024 * 1024,
            lock_power: 6,
            lock_timeout: Duration::from_secs(5),
            create: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl Builder {
    /// Directory which holds the backing files. Defaults to `/dev/shm` when
    /// it exists, and the temporary directory otherwise.
    pub fn dir<T: AsRef<Path>>(mut self, dir: T) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Specify the hash power, which limits the size of the hash table to 2^N
    /// buckets. The table never grows, so this should be chosen with the
    /// expected number of keys in mind.
    ///
    /// ```
    /// use sharedhash::Builder;
    ///
    /// // 1M buckets
    /// let builder = Builder::default().hash_power(20);
    /// ```
    pub fn hash_power(mut self, hash_power: u8) -> Self {
        self.hash_power = hash_power;
        self
    }

    /// Size of the heap in bytes. Keys and values, together with a small per
    /// entry overhead, are allocated from the heap in power of two sized
    /// blocks.
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Sets the number of lock stripes to 2^N. Must not exceed the hash power.
    pub fn lock_power(mut self, lock_power: u8) -> Self {
        self.lock_power = lock_power;
        self
    }

    /// Bound on how long an operation waits for a lock before it fails with
    /// [`SharedHashError::Timeout`].
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Whether opening a missing store creates it. When false, opening a
    /// missing store fails with [`SharedHashError::NotFound`].
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Source of time used for expiration.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn geometry(&self) -> Result<Geometry> {
        if self.hash_power > MAX_HASH_POWER {
            return Err(SharedHashError::InvalidConfig("hash power is too large"));
        }
        if self.lock_power > self.hash_power {
            return Err(SharedHashError::InvalidConfig(
                "lock power must not exceed hash power",
            ));
        }
        Geometry::new(
            1 << self.hash_power,
            1 << self.lock_power,
            self.heap_size as u64,
        )
    }

    /// Path of the file which backs the named store.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => segment::path(dir, name),
            None => segment::path(&segment::default_dir(), name),
        }
    }

    /// Open the named store, creating it if it does not exist.
    ///
    /// The geometry is only validated when the store is created. Attaching to
    /// an existing store succeeds whatever geometry the builder holds.
    pub fn open(self, name: &str) -> Result<Store> {
        let path = self.path(name)?;
        let timeout = self.lock_timeout;
        let seed: u64 = rand::random();

        // an invalid geometry can still attach, it only prevents creation
        let geometry = self.geometry();
        let invalid = geometry.as_ref().err().copied();
        let create = self.create && invalid.is_none();
        let data_size = geometry.as_ref().map(|g| g.size() as usize).unwrap_or(0);

        let mut file = SharedFile::open(&path, data_size, VERSION, create, timeout, |data| {
            let geometry = geometry.map_err(std::io::Error::other)?;
            // SAFETY: the data region outlives the table, which is only
            // used for initialization
            let region = unsafe { Region::new(data.as_mut_ptr(), data.len()) };
            Hashtable::create(region, geometry, seed, timeout)
                .map(|_| ())
                .map_err(std::io::Error::other)
        })
        .map_err(|e| {
            SEGMENT_ATTACH_EX.increment();
            debug!("failed to open {}: {}", path.display(), e);
            match (SharedHashError::from(e), invalid) {
                (SharedHashError::NotFound, Some(invalid)) if self.create => invalid,
                (e, _) => e,
            }
        })?;

        // SAFETY: the mapping lives as long as the backing, which the store
        // keeps alive for as long as the table
        let region = unsafe { Region::new(file.as_mut_ptr(), file.len()) };
        let table = Hashtable::attach(region, timeout).map_err(|e| {
            SEGMENT_ATTACH_EX.increment();
            error!("segment {} has a corrupt table: {}", path.display(), e);
            e
        })?;

        if file.created() {
            SEGMENT_CREATE.increment();
            info!(
                "created store {} at {} with {} buckets and a {} byte heap",
                name,
                path.display(),
                table.buckets(),
                table.heap_size()
            );
        } else {
            SEGMENT_ATTACH.increment();
            info!(
                "attached store {} at {}, created at unix time {}",
                name,
                path.display(),
                file.time_unix_s()
            );
        }

        Ok(Store::new(
            name.to_string(),
            Some(path),
            table,
            Expiry::new(self.clock),
            Backing::Shared(file),
            timeout,
        ))
    }

    /// Create a store in anonymous memory. It is only visible to this process
    /// and disappears when dropped.
    pub fn anonymous(self) -> Result<Store> {
        let geometry = self.geometry()?;
        let mut pool = Memory::create(geometry.size() as usize)?;

        // SAFETY: the pool lives as long as the table, see above
        let region = unsafe { Region::new(pool.as_mut_ptr(), pool.len()) };
        let table = Hashtable::create(region, geometry, rand::random(), self.lock_timeout)?;

        Ok(Store::new(
            "anonymous".to_string(),
            None,
            table,
            Expiry::new(self.clock),
            Backing::Anonymous(pool),
            self.lock_timeout,
        ))
    }

    /// Remove the backing file of the named store without regard to other
    /// attachments. Processes which have the store open keep using the old
    /// segment, later opens create a fresh one. Use this to clean up after
    /// processes which exited without closing the store.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        SharedFile::remove(&path)?;
        SEGMENT_DESTROY.increment();
        info!("removed store {} at {}", name, path.display());
        Ok(())
    }
}
