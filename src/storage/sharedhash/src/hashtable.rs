// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The hash table which maps keys to entries in the heap.
//!
//! Collisions are resolved with separate chaining. Each bucket holds the
//! offset of the first entry in its chain, and each entry holds the offset of
//! the next. New keys are linked in at the head of the chain.
//!
//! Entry layout:
//! ```text
//! +------+------+-----------+---------+-----------+------+-----+-------+
//! | next | hash | expire_at | key_len | value_len | pad  | key | value |
//! | 8B   | 8B   | 4B        | 4B      | 4B        | 4B   | ... | ...   |
//! +------+------+-----------+---------+-----------+------+-----+-------+
//! ```
//!
//! The caller must hold a scope guard covering the bucket of every key it
//! passes in. This is checked in debug builds.

use crate::*;

use core::hash::Hasher;
use core::sync::atomic::Ordering;
use std::time::Duration;
use twox_hash::XxHash64;

const ENTRY_HEADER_SIZE: u64 = core::mem::size_of::<Entry>() as u64;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry {
    // must remain the first field, a chain link is the offset of either a
    // bucket head or of an entry
    next: u64,
    hash: u64,
    expire_at: u32,
    key_len: u32,
    value_len: u32,
    _pad: u32,
}

impl Entry {
    fn new(hash: u64, key: &[u8], value: &[u8], expire_at: u32) -> Result<Self> {
        let key_len = u32::try_from(key.len()).map_err(|_| SharedHashError::OutOfSpace)?;
        let value_len = u32::try_from(value.len()).map_err(|_| SharedHashError::OutOfSpace)?;
        Ok(Self {
            next: NIL,
            hash,
            expire_at,
            key_len,
            value_len,
            _pad: 0,
        })
    }

    /// Bytes needed to store the entry.
    fn size(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.key_len as u64 + self.value_len as u64
    }

    #[cfg(test)]
    pub fn expire_at(&self) -> u32 {
        self.expire_at
    }
}

/// An entry together with the link which points at it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    link: u64,
    offset: u64,
    entry: Entry,
}

impl Slot {
    #[cfg(test)]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

pub(crate) struct Hashtable {
    region: Region,
    seed: u64,
    buckets: u64,
    buckets_offset: u64,
    heap_size: u64,
    max_chain: u64,
    locks: Locks,
    slab: Slab,
}

impl Hashtable {
    /// Lay out a new table in a zeroed region. The region must not be visible
    /// to any other process yet.
    pub fn create(
        region: Region,
        geometry: Geometry,
        seed: u64,
        timeout: Duration,
    ) -> Result<Self> {
        geometry.init(&region, seed)?;
        let table = Self::new(region, geometry, seed, timeout)?;
        table.slab.init()?;

        debug!(
            "created table with {} buckets, {} lock stripes and a {} byte heap",
            geometry.buckets, geometry.stripes, geometry.heap_size
        );

        Ok(table)
    }

    /// Use a table which was previously created in this region.
    pub fn attach(region: Region, timeout: Duration) -> Result<Self> {
        let geometry = Geometry::load(&region)?;
        let seed = region.get::<TableHeader>(0)?.seed;
        Self::new(region, geometry, seed, timeout)
    }

    fn new(region: Region, geometry: Geometry, seed: u64, timeout: Duration) -> Result<Self> {
        region.check(geometry.buckets_offset, geometry.buckets * 8, 8)?;
        let locks = Locks::new(region, geometry.stripes_offset, geometry.stripes, timeout)?;
        let slab = Slab::new(region, &geometry, timeout);

        Ok(Self {
            region,
            seed,
            buckets: geometry.buckets,
            buckets_offset: geometry.buckets_offset,
            heap_size: geometry.heap_size,
            // every entry takes at least one minimum size block
            max_chain: geometry.heap_size / (1 << MIN_ORDER) + 1,
            locks,
            slab,
        })
    }

    fn header(&self) -> Result<&TableHeader> {
        self.region.get::<TableHeader>(0)
    }

    pub fn lock(&self, scope: Scope) -> Result<ScopeGuard<'_>> {
        self.locks.acquire(scope)
    }

    pub fn hash(&self, key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write(key);
        hasher.finish()
    }

    pub fn bucket(&self, hash: u64) -> u64 {
        hash & (self.buckets - 1)
    }

    // offset of the chain head for a bucket
    fn head(&self, bucket: u64) -> u64 {
        self.buckets_offset + bucket * 8
    }

    fn entry(&self, offset: u64) -> Result<Entry> {
        let entry: Entry = self.region.read(offset)?;
        self.region.check(offset, entry.size(), 1)?;
        Ok(entry)
    }

    fn key_bytes(&self, offset: u64, entry: &Entry) -> Result<&[u8]> {
        self.region
            .bytes(offset + ENTRY_HEADER_SIZE, entry.key_len as u64)
    }

    /// Walk the chain for `key` and return its entry, expired or not.
    pub fn find(&self, guard: &ScopeGuard, key: &[u8]) -> Result<Option<Slot>> {
        let hash = self.hash(key);
        let bucket = self.bucket(hash);
        debug_assert!(guard.covers(bucket));

        let mut link = self.head(bucket);
        let mut steps = 0;

        loop {
            let offset: u64 = self.region.read(link)?;
            if offset == NIL {
                return Ok(None);
            }

            steps += 1;
            if steps > self.max_chain {
                return Err(SharedHashError::CorruptLayout("hash chain does not terminate"));
            }

            let entry = self.entry(offset)?;
            if entry.hash == hash {
                if self.key_bytes(offset, &entry)? == key {
                    return Ok(Some(Slot {
                        link,
                        offset,
                        entry,
                    }));
                }
                HASH_TAG_COLLISION.increment();
            }

            link = offset;
        }
    }

    /// Like [`Hashtable::find`], but an expired entry is reclaimed and
    /// reported as absent.
    pub fn lookup(&self, guard: &ScopeGuard, key: &[u8], now: u32) -> Result<Option<Slot>> {
        HASH_LOOKUP.increment();

        match self.find(guard, key)? {
            Some(slot) if is_expired(slot.entry.expire_at, now) => {
                trace!("reclaiming expired entry at {}", slot.offset);
                ITEM_EXPIRE.increment();
                self.unlink(guard, &slot)?;
                Ok(None)
            }
            found => Ok(found),
        }
    }

    pub fn value(&self, slot: &Slot) -> Result<Vec<u8>> {
        let offset = slot.offset + ENTRY_HEADER_SIZE + slot.entry.key_len as u64;
        Ok(self
            .region
            .bytes(offset, slot.entry.value_len as u64)?
            .to_vec())
    }

    fn write(&self, offset: u64, entry: &Entry, key: &[u8], value: &[u8]) -> Result<()> {
        self.region.write(offset, *entry)?;
        self.region.copy_from(offset + ENTRY_HEADER_SIZE, key)?;
        self.region
            .copy_from(offset + ENTRY_HEADER_SIZE + key.len() as u64, value)
    }

    /// Link a new entry at the head of its chain. The key must not already be
    /// present.
    pub fn insert(
        &self,
        guard: &ScopeGuard,
        key: &[u8],
        value: &[u8],
        expire_at: u32,
    ) -> Result<()> {
        HASH_INSERT.increment();

        let hash = self.hash(key);
        let bucket = self.bucket(hash);
        debug_assert!(guard.covers(bucket));

        let head = self.head(bucket);
        let mut entry = Entry::new(hash, key, value, expire_at)?;
        entry.next = self.region.read(head)?;

        let offset = self.slab.allocate(entry.size())?;
        self.write(offset, &entry, key, value)?;
        self.region.write(head, offset)?;

        self.header()?.entries.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Overwrite the value and expiration of an existing entry. When the new
    /// contents do not fit the entry's block, a new block is allocated before
    /// the old one is released, so running out of space leaves the entry as
    /// it was.
    pub fn update(
        &self,
        guard: &ScopeGuard,
        slot: &Slot,
        key: &[u8],
        value: &[u8],
        expire_at: u32,
    ) -> Result<()> {
        debug_assert!(guard.covers(self.bucket(slot.entry.hash)));
        ITEM_REPLACE.increment();

        let mut entry = Entry::new(slot.entry.hash, key, value, expire_at)?;
        entry.next = slot.entry.next;

        if entry.size() <= self.slab.capacity(slot.offset)? {
            return self.write(slot.offset, &entry, key, value);
        }

        let offset = self.slab.allocate(entry.size())?;
        self.write(offset, &entry, key, value)?;
        self.region.write(slot.link, offset)?;
        self.slab.free(slot.offset, slot.entry.size())
    }

    /// Remove an entry from its chain and release its block.
    pub fn unlink(&self, guard: &ScopeGuard, slot: &Slot) -> Result<()> {
        debug_assert!(guard.covers(self.bucket(slot.entry.hash)));
        HASH_REMOVE.increment();

        self.region.write(slot.link, slot.entry.next)?;
        let _ = self
            .header()?
            .entries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });

        self.slab.free(slot.offset, slot.entry.size())
    }

    /// Visit the key of every live entry, reclaiming expired entries along
    /// the way. Returns the number of entries reclaimed. Requires the table
    /// scope.
    pub fn scan<F: FnMut(&[u8])>(&self, guard: &ScopeGuard, now: u32, mut visit: F) -> Result<u64> {
        debug_assert_eq!(guard.scope(), Scope::Table);

        let mut reclaimed = 0;

        for bucket in 0..self.buckets {
            let mut link = self.head(bucket);
            let mut steps = 0;

            loop {
                let offset: u64 = self.region.read(link)?;
                if offset == NIL {
                    break;
                }

                steps += 1;
                if steps > self.max_chain {
                    return Err(SharedHashError::CorruptLayout("hash chain does not terminate"));
                }

                let entry = self.entry(offset)?;
                if is_expired(entry.expire_at, now) {
                    ITEM_EXPIRE.increment();
                    // the link now points past the reclaimed entry
                    self.unlink(guard, &Slot { link, offset, entry })?;
                    reclaimed += 1;
                } else {
                    visit(self.key_bytes(offset, &entry)?);
                    link = offset;
                }
            }
        }

        Ok(reclaimed)
    }

    /// Linked entries, including expired ones not yet reclaimed.
    pub fn entries(&self) -> Result<u64> {
        Ok(self.header()?.entries.load(Ordering::Relaxed))
    }

    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    pub fn stripes(&self) -> u64 {
        self.locks.stripes()
    }

    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    pub fn heap_used(&self) -> Result<u64> {
        self.slab.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datatier::{Datapool, Memory};

    const TIMEOUT: Duration = Duration::from_millis(100);

    struct Fixture {
        _pool: Memory,
        table: Hashtable,
    }

    fn table(buckets: u64, heap_size: u64) -> Fixture {
        let geometry = Geometry::new(buckets, 1, heap_size).expect("invalid geometry");
        let mut pool = Memory::create(geometry.size() as usize).expect("failed to create pool");
        let region = unsafe { Region::new(pool.as_mut_ptr(), pool.len()) };
        let table = Hashtable::create(region, geometry, 0x5eed, TIMEOUT).expect("failed to create");
        Fixture {
            _pool: pool,
            table,
        }
    }

    fn get(table: &Hashtable, key: &[u8], now: u32) -> Option<Vec<u8>> {
        let guard = table.lock(Scope::Table).expect("failed to lock");
        table
            .lookup(&guard, key, now)
            .expect("lookup failed")
            .map(|slot| table.value(&slot).expect("failed to read value"))
    }

    #[test]
    fn insert_find_unlink() {
        let f = table(16, 64 * 1024);
        let table = &f.table;

        {
            let guard = table.lock(Scope::Table).expect("failed to lock");
            table.insert(&guard, b"coffee", b"strong", 0).expect("insert failed");
            table.insert(&guard, b"", b"", 0).expect("insert failed");
        }
        assert_eq!(table.entries(), Ok(2));
        assert_eq!(get(table, b"coffee", 0), Some(b"strong".to_vec()));
        assert_eq!(get(table, b"", 0), Some(Vec::new()));
        assert_eq!(get(table, b"tea", 0), None);

        let guard = table.lock(Scope::Table).expect("failed to lock");
        let slot = table
            .find(&guard, b"coffee")
            .expect("find failed")
            .expect("missing entry");
        table.unlink(&guard, &slot).expect("unlink failed");
        drop(guard);

        assert_eq!(get(table, b"coffee", 0), None);
        assert_eq!(table.entries(), Ok(1));
    }

    #[test]
    fn single_bucket_chain() {
        // every key shares one chain, removal from the middle must keep the
        // rest reachable
        let f = table(1, 64 * 1024);
        let table = &f.table;

        let guard = table.lock(Scope::Table).expect("failed to lock");
        for i in 0..32u32 {
            let key = format!("key{i}");
            table
                .insert(&guard, key.as_bytes(), &i.to_be_bytes(), 0)
                .expect("insert failed");
        }
        for i in (0..32u32).step_by(3) {
            let key = format!("key{i}");
            let slot = table
                .find(&guard, key.as_bytes())
                .expect("find failed")
                .expect("missing entry");
            table.unlink(&guard, &slot).expect("unlink failed");
        }
        drop(guard);

        for i in 0..32u32 {
            let key = format!("key{i}");
            let expected = if i % 3 == 0 {
                None
            } else {
                Some(i.to_be_bytes().to_vec())
            };
            assert_eq!(get(table, key.as_bytes(), 0), expected);
        }
    }

    #[test]
    fn update_in_place_and_relocate() {
        let f = table(16, 64 * 1024);
        let table = &f.table;

        let guard = table.lock(Scope::Table).expect("failed to lock");
        table.insert(&guard, b"k", b"v", 0).expect("insert failed");
        let used = table.heap_used().expect("failed to read usage");

        // a small value fits the existing block
        let slot = table.find(&guard, b"k").expect("find failed").expect("missing");
        table.update(&guard, &slot, b"k", b"w", 42).expect("update failed");
        assert_eq!(table.heap_used(), Ok(used));

        // a large value moves the entry to a larger block
        let large = vec![0xAB; 1000];
        let slot = table.find(&guard, b"k").expect("find failed").expect("missing");
        assert_eq!(slot.entry().expire_at(), 42);
        table.update(&guard, &slot, b"k", &large, 0).expect("update failed");
        assert_eq!(table.heap_used(), Ok(2048));
        drop(guard);

        assert_eq!(get(table, b"k", 100), Some(large));
        assert_eq!(table.entries(), Ok(1));
    }

    #[test]
    fn update_out_of_space() {
        let f = table(16, 4096);
        let table = &f.table;

        let guard = table.lock(Scope::Table).expect("failed to lock");
        table.insert(&guard, b"k", b"v", 0).expect("insert failed");
        let slot = table.find(&guard, b"k").expect("find failed").expect("missing");
        let huge = vec![0; 8192];
        assert_eq!(
            table.update(&guard, &slot, b"k", &huge, 0),
            Err(SharedHashError::OutOfSpace)
        );
        drop(guard);

        assert_eq!(get(table, b"k", 0), Some(b"v".to_vec()));
    }

    #[test]
    fn lazy_expiry_and_scan() {
        let f = table(16, 64 * 1024);
        let table = &f.table;

        let guard = table.lock(Scope::Table).expect("failed to lock");
        table.insert(&guard, b"forever", b"1", 0).expect("insert failed");
        table.insert(&guard, b"soon", b"2", 10).expect("insert failed");
        table.insert(&guard, b"later", b"3", 20).expect("insert failed");

        let mut keys = Vec::new();
        assert_eq!(table.scan(&guard, 5, |k| keys.push(k.to_vec())), Ok(0));
        keys.sort();
        assert_eq!(keys, vec![b"forever".to_vec(), b"later".to_vec(), b"soon".to_vec()]);

        // lookup reclaims the expired entry
        assert!(table.lookup(&guard, b"soon", 10).expect("lookup failed").is_none());
        assert_eq!(table.entries(), Ok(2));

        let mut keys = Vec::new();
        assert_eq!(table.scan(&guard, 20, |k| keys.push(k.to_vec())), Ok(1));
        assert_eq!(keys, vec![b"forever".to_vec()]);
        assert_eq!(table.entries(), Ok(1));
    }

    #[test]
    fn attach_sees_same_table() {
        let f = table(16, 64 * 1024);
        {
            let guard = f.table.lock(Scope::Table).expect("failed to lock");
            f.table.insert(&guard, b"k", b"v", 0).expect("insert failed");
        }

        let other = Hashtable::attach(f.table.region, TIMEOUT).expect("failed to attach");
        assert_eq!(other.hash(b"k"), f.table.hash(b"k"));
        assert_eq!(get(&other, b"k", 0), Some(b"v".to_vec()));
    }

    #[test]
    fn cycle_is_corruption() {
        let f = table(1, 64 * 1024);
        let table = &f.table;

        let guard = table.lock(Scope::Table).expect("failed to lock");
        table.insert(&guard, b"k", b"v", 0).expect("insert failed");
        let slot = table.find(&guard, b"k").expect("find failed").expect("missing");

        // point the entry back at itself
        table.region.write(slot.offset, slot.offset).expect("write failed");

        assert!(matches!(
            table.find(&guard, b"missing"),
            Err(SharedHashError::CorruptLayout(_))
        ));
        assert!(matches!(
            table.scan(&guard, 0, |_| {}),
            Err(SharedHashError::CorruptLayout(_))
        ));
    }
}
