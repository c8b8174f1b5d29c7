// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Layout of the data region shared by all attached processes.
//!
//! ```text
//! +--------------+----------------+----------------+-------------------+
//! | TableHeader  | stripe locks   | bucket heads   | heap              |
//! | (64B align)  | 64B each       | 8B each        | buddy allocated   |
//! +--------------+----------------+----------------+-------------------+
//! ```
//!
//! Every reference inside the region is a `u64` offset from the start of the
//! region. Offset zero is always the table header, so it doubles as the nil
//! offset for chain links and free lists.

use crate::*;

use core::sync::atomic::AtomicU64;

/// Offset which never refers to an entry or a block.
pub(crate) const NIL: u64 = 0;

const MAGIC: [u8; 8] = *b"SHRDHASH";

// alignment of every section in the region
const ALIGN: u64 = 64;

/// Number of free list heads, indexed by block order.
pub(crate) const ORDERS: usize = 64;

#[repr(C, align(64))]
pub(crate) struct TableHeader {
    magic: [u8; 8],
    version: u64,
    pub seed: u64,
    buckets: u64,
    stripes: u64,
    stripes_offset: u64,
    buckets_offset: u64,
    heap_offset: u64,
    heap_size: u64,
    /// Number of linked entries, including expired ones which have not been
    /// reclaimed yet.
    pub entries: AtomicU64,
    pub slab: SlabHeader,
}

#[repr(C, align(64))]
pub(crate) struct SlabHeader {
    pub lock: RawLock,
    /// Bytes handed out in blocks, including block headers.
    pub used: AtomicU64,
    pub free: [AtomicU64; ORDERS],
}

/// A view of the shared data region. All accesses are bounds and alignment
/// checked, since offsets are read back from memory which other processes
/// write to.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    base: *mut u8,
    len: u64,
}

// SAFETY: the region is only ever mutated while holding the shared locks
// which guard the addressed structure, or through atomics
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// # Safety
    ///
    /// `base` must point to `len` bytes which stay mapped for as long as this
    /// region or any copy of it is used.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len: len as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn check(&self, offset: u64, size: u64, align: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len && offset % align == 0 => Ok(()),
            _ => Err(SharedHashError::CorruptLayout("offset out of range")),
        }
    }

    fn ptr<T>(&self, offset: u64) -> Result<*mut T> {
        self.check(
            offset,
            core::mem::size_of::<T>() as u64,
            core::mem::align_of::<T>() as u64,
        )?;
        Ok(unsafe { self.base.add(offset as usize) as *mut T })
    }

    /// Borrow a structure which is only ever mutated through atomics.
    pub fn get<T>(&self, offset: u64) -> Result<&T> {
        self.ptr::<T>(offset).map(|p| unsafe { &*p })
    }

    pub fn read<T: Copy>(&self, offset: u64) -> Result<T> {
        self.ptr::<T>(offset).map(|p| unsafe { p.read() })
    }

    pub fn write<T: Copy>(&self, offset: u64, value: T) -> Result<()> {
        self.ptr::<T>(offset).map(|p| unsafe { p.write(value) })
    }

    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        self.check(offset, len, 1)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len as usize) })
    }

    pub fn copy_from(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check(offset, src.len() as u64, 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset as usize), src.len());
        }
        Ok(())
    }
}

/// Placement of each section of the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub buckets: u64,
    pub stripes: u64,
    pub stripes_offset: u64,
    pub buckets_offset: u64,
    pub heap_offset: u64,
    pub heap_size: u64,
}

impl Geometry {
    pub fn new(buckets: u64, stripes: u64, heap_size: u64) -> Result<Self> {
        if !buckets.is_power_of_two() {
            return Err(SharedHashError::InvalidConfig(
                "bucket count must be a power of two",
            ));
        }
        if !stripes.is_power_of_two() || stripes > buckets {
            return Err(SharedHashError::InvalidConfig(
                "lock stripes must be a power of two no larger than the bucket count",
            ));
        }
        if heap_size < MIN_HEAP_SIZE {
            return Err(SharedHashError::InvalidConfig("heap size is too small"));
        }

        let stripes_offset = align_up(core::mem::size_of::<TableHeader>() as u64);
        let buckets_offset = stripes
            .checked_mul(core::mem::size_of::<RawLock>() as u64)
            .and_then(|size| size.checked_add(stripes_offset))
            .map(align_up)
            .ok_or(SharedHashError::InvalidConfig("too many lock stripes"))?;
        let heap_offset = buckets
            .checked_mul(8)
            .and_then(|size| size.checked_add(buckets_offset))
            .map(align_up)
            .ok_or(SharedHashError::InvalidConfig("too many buckets"))?;
        heap_offset
            .checked_add(heap_size)
            .ok_or(SharedHashError::InvalidConfig("heap size is too large"))?;

        Ok(Self {
            buckets,
            stripes,
            stripes_offset,
            buckets_offset,
            heap_offset,
            heap_size,
        })
    }

    /// Total size of the data region.
    pub fn size(&self) -> u64 {
        self.heap_offset + self.heap_size
    }

    /// Writes a fresh table header into a zeroed region.
    pub fn init(&self, region: &Region, seed: u64) -> Result<()> {
        region.check(0, self.size(), ALIGN)?;

        // SAFETY: bounds were checked above and the region is not yet visible
        // to any other process, an all-zero header is valid
        let header = unsafe { &mut *(region.base as *mut TableHeader) };
        header.magic = MAGIC;
        header.version = VERSION;
        header.seed = seed;
        header.buckets = self.buckets;
        header.stripes = self.stripes;
        header.stripes_offset = self.stripes_offset;
        header.buckets_offset = self.buckets_offset;
        header.heap_offset = self.heap_offset;
        header.heap_size = self.heap_size;

        Ok(())
    }

    /// Validates the header of an existing region and returns its geometry.
    pub fn load(region: &Region) -> Result<Self> {
        let header = region.get::<TableHeader>(0)?;

        if header.magic != MAGIC {
            return Err(SharedHashError::CorruptLayout("table header not recognized"));
        }
        if header.version != VERSION {
            return Err(SharedHashError::CorruptLayout("table has incompatible version"));
        }

        let geometry = Self::new(header.buckets, header.stripes, header.heap_size)
            .map_err(|_| SharedHashError::CorruptLayout("invalid table geometry"))?;

        if geometry.stripes_offset != header.stripes_offset
            || geometry.buckets_offset != header.buckets_offset
            || geometry.heap_offset != header.heap_offset
        {
            return Err(SharedHashError::CorruptLayout("table offsets mismatch"));
        }
        if geometry.size() > region.len() {
            return Err(SharedHashError::CorruptLayout("table exceeds region"));
        }

        Ok(geometry)
    }
}

fn align_up(value: u64) -> u64 {
    value.div_ceil(ALIGN) * ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;
    use datatier::{Datapool, Memory};

    #[test]
    fn sizes() {
        assert_eq!(core::mem::size_of::<RawLock>(), 64);
        assert_eq!(core::mem::size_of::<TableHeader>() % 64, 0);
    }

    #[test]
    fn geometry() {
        let geometry = Geometry::new(16, 4, 64 * 1024).expect("invalid geometry");
        assert_eq!(geometry.stripes_offset % 64, 0);
        assert_eq!(geometry.buckets_offset, geometry.stripes_offset + 4 * 64);
        assert_eq!(geometry.heap_offset, geometry.buckets_offset + 16 * 8);
        assert_eq!(geometry.size(), geometry.heap_offset + 64 * 1024);

        assert!(Geometry::new(15, 4, 64 * 1024).is_err());
        assert!(Geometry::new(16, 32, 64 * 1024).is_err());
        assert!(Geometry::new(16, 3, 64 * 1024).is_err());
        assert!(Geometry::new(16, 4, 16).is_err());
    }

    #[test]
    fn region_bounds() {
        let mut buffer = vec![0u64; 8];
        let region = unsafe { Region::new(buffer.as_mut_ptr() as *mut u8, 64) };

        assert!(region.write::<u64>(56, 7).is_ok());
        assert_eq!(region.read::<u64>(56), Ok(7));
        assert!(region.read::<u64>(60).is_err());
        assert!(region.read::<u64>(4).is_err());
        assert!(region.bytes(60, 8).is_err());
        assert!(region.copy_from(u64::MAX, b"x").is_err());
    }

    #[test]
    fn load_rejects_foreign_data() {
        let geometry = Geometry::new(16, 4, 64 * 1024).expect("invalid geometry");
        let mut pool = Memory::create(geometry.size() as usize).expect("failed to create pool");
        let region = unsafe { Region::new(pool.as_mut_ptr(), pool.len()) };

        assert!(matches!(
            Geometry::load(&region),
            Err(SharedHashError::CorruptLayout(_))
        ));

        geometry.init(&region, 42).expect("failed to init");
        assert_eq!(Geometry::load(&region), Ok(geometry));
    }
}
