// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A buddy allocator for the heap section of the region.
//!
//! Blocks are powers of two in size, from `2^MIN_ORDER` bytes up to the
//! largest power of two which fits in the heap, and are aligned to their size
//! relative to the start of the heap. Each block begins with a small header
//! recording whether it is free and its order. Free blocks are kept on
//! doubly-linked lists, one per order, whose heads live in the table header.
//! Freeing a block merges it with its buddy for as long as the buddy is free
//! and of the same order.
//!
//! The allocator has its own lock. It is always the last lock taken by an
//! operation, and no other lock is taken while holding it.

use crate::*;

use core::sync::atomic::Ordering;
use std::time::Instant;

/// Smallest block is 64 bytes.
pub(crate) const MIN_ORDER: u32 = 6;

/// Smallest heap which can be configured.
pub(crate) const MIN_HEAP_SIZE: u64 = 4096;

const BLOCK_HEADER_SIZE: u64 = core::mem::size_of::<BlockHeader>() as u64;

const TAG_FREE: u32 = 0xF4EE_B10C;
const TAG_USED: u32 = 0x05ED_B10C;

// offsets of the free list links within a free block
const NEXT: u64 = 8;
const PREV: u64 = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct BlockHeader {
    tag: u32,
    order: u32,
}

pub(crate) struct Slab {
    region: Region,
    heap_offset: u64,
    heap_size: u64,
    max_order: u32,
    timeout: std::time::Duration,
}

impl Slab {
    pub fn new(region: Region, geometry: &Geometry, timeout: std::time::Duration) -> Self {
        Self {
            region,
            heap_offset: geometry.heap_offset,
            heap_size: geometry.heap_size,
            max_order: 63 - geometry.heap_size.leading_zeros(),
            timeout,
        }
    }

    fn header(&self) -> Result<&SlabHeader> {
        self.region
            .get::<TableHeader>(0)
            .map(|header| &header.slab)
    }

    /// Carve the whole heap into free blocks. Only valid on a freshly zeroed
    /// region which no other process can see yet.
    pub fn init(&self) -> Result<()> {
        let header = self.header()?;
        let mut offset = 0;
        for order in (MIN_ORDER..=self.max_order).rev() {
            while self.heap_size - offset >= block_size(order) {
                self.push(header, order, self.heap_offset + offset)?;
                offset += block_size(order);
            }
        }
        debug!(
            "carved {} of {} heap bytes into blocks, largest block is {} bytes",
            offset,
            self.heap_size,
            block_size(self.max_order)
        );
        Ok(())
    }

    /// Smallest order which holds `size` bytes of payload.
    fn order_for(&self, size: u64) -> Option<u32> {
        let size = size.checked_add(BLOCK_HEADER_SIZE)?.max(block_size(MIN_ORDER));
        let order = 64 - (size - 1).leading_zeros();
        if order > self.max_order {
            None
        } else {
            Some(order)
        }
    }

    /// Allocate a block with room for `size` bytes and return the offset of
    /// the usable space.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        SLAB_ALLOCATE.increment();

        let order = match self.order_for(size) {
            Some(order) => order,
            None => {
                SLAB_ALLOCATE_EX.increment();
                return Err(SharedHashError::OutOfSpace);
            }
        };

        let header = self.header()?;
        let _guard = header.slab_lock(self.timeout)?;

        let mut current = order;
        let block = loop {
            if current > self.max_order {
                SLAB_ALLOCATE_EX.increment();
                return Err(SharedHashError::OutOfSpace);
            }
            if let Some(block) = self.pop(header, current)? {
                break block;
            }
            current += 1;
        };

        // return the upper halves to the free lists until the block fits
        while current > order {
            current -= 1;
            self.push(header, current, block + block_size(current))?;
        }

        self.region.write(
            block,
            BlockHeader {
                tag: TAG_USED,
                order,
            },
        )?;
        header.used.fetch_add(block_size(order), Ordering::Relaxed);

        Ok(block + BLOCK_HEADER_SIZE)
    }

    /// Return a block to the heap. `size` is the number of bytes the caller
    /// stored in the block, and is checked against the block's capacity.
    pub fn free(&self, offset: u64, size: u64) -> Result<()> {
        SLAB_FREE.increment();

        let header = self.header()?;
        let _guard = header.slab_lock(self.timeout)?;

        let mut block = self.block(offset)?;
        let used: BlockHeader = self.region.read(block)?;
        if used.tag != TAG_USED || used.order > self.max_order {
            return Err(SharedHashError::CorruptLayout("free of unallocated block"));
        }
        if size + BLOCK_HEADER_SIZE > block_size(used.order) {
            return Err(SharedHashError::CorruptLayout("block size mismatch"));
        }

        header
            .used
            .fetch_sub(block_size(used.order), Ordering::Relaxed);

        let mut order = used.order;
        while order < self.max_order {
            let buddy = (block - self.heap_offset) ^ block_size(order);
            if buddy + block_size(order) > self.heap_size {
                break;
            }
            let buddy = buddy + self.heap_offset;
            let candidate: BlockHeader = self.region.read(buddy)?;
            if candidate.tag != TAG_FREE || candidate.order != order {
                break;
            }
            self.unlink(header, order, buddy)?;
            block = block.min(buddy);
            order += 1;
        }

        self.push(header, order, block)
    }

    /// Number of bytes which can be stored in the block at `offset`.
    pub fn capacity(&self, offset: u64) -> Result<u64> {
        let block = self.block(offset)?;
        let header: BlockHeader = self.region.read(block)?;
        if header.tag != TAG_USED || header.order > self.max_order {
            return Err(SharedHashError::CorruptLayout("block is not allocated"));
        }
        Ok(block_size(header.order) - BLOCK_HEADER_SIZE)
    }

    /// Bytes currently allocated, including block headers.
    pub fn used(&self) -> Result<u64> {
        Ok(self.header()?.used.load(Ordering::Relaxed))
    }

    // checks that an offset handed back by a caller can be a block payload
    fn block(&self, offset: u64) -> Result<u64> {
        match offset.checked_sub(self.heap_offset + BLOCK_HEADER_SIZE) {
            Some(relative)
                if relative % block_size(MIN_ORDER) == 0
                    && relative + block_size(MIN_ORDER) <= self.heap_size =>
            {
                Ok(offset - BLOCK_HEADER_SIZE)
            }
            _ => Err(SharedHashError::CorruptLayout("offset is not a block")),
        }
    }

    fn push(&self, header: &SlabHeader, order: u32, block: u64) -> Result<()> {
        let head = header.free[order as usize].load(Ordering::Relaxed);
        self.region.write(
            block,
            BlockHeader {
                tag: TAG_FREE,
                order,
            },
        )?;
        self.region.write(block + NEXT, head)?;
        self.region.write(block + PREV, NIL)?;
        if head != NIL {
            self.region.write(head + PREV, block)?;
        }
        header.free[order as usize].store(block, Ordering::Relaxed);
        Ok(())
    }

    fn pop(&self, header: &SlabHeader, order: u32) -> Result<Option<u64>> {
        let head = header.free[order as usize].load(Ordering::Relaxed);
        if head == NIL {
            return Ok(None);
        }
        self.unlink(header, order, head)?;
        Ok(Some(head))
    }

    fn unlink(&self, header: &SlabHeader, order: u32, block: u64) -> Result<()> {
        let next: u64 = self.region.read(block + NEXT)?;
        let prev: u64 = self.region.read(block + PREV)?;
        if prev == NIL {
            header.free[order as usize].store(next, Ordering::Relaxed);
        } else {
            self.region.write(prev + NEXT, next)?;
        }
        if next != NIL {
            self.region.write(next + PREV, prev)?;
        }
        Ok(())
    }
}

impl SlabHeader {
    fn slab_lock(&self, timeout: std::time::Duration) -> Result<RawLockGuard<'_>> {
        self.lock.acquire(Instant::now() + timeout)
    }
}

fn block_size(order: u32) -> u64 {
    1 << order
}

#[cfg(test)]
mod tests {
    use super::*;
    use datatier::{Datapool, Memory};
    use std::time::Duration;

    struct Fixture {
        _pool: Memory,
        slab: Slab,
    }

    fn slab(heap_size: u64) -> Fixture {
        let geometry = Geometry::new(1, 1, heap_size).expect("invalid geometry");
        let mut pool = Memory::create(geometry.size() as usize).expect("failed to create pool");
        let region = unsafe { Region::new(pool.as_mut_ptr(), pool.len()) };
        geometry.init(&region, 0).expect("failed to init");
        let slab = Slab::new(region, &geometry, Duration::from_secs(1));
        slab.init().expect("failed to init slab");
        Fixture { _pool: pool, slab }
    }

    #[test]
    fn order_sizing() {
        let f = slab(64 * 1024);
        assert_eq!(f.slab.order_for(0), Some(MIN_ORDER));
        assert_eq!(f.slab.order_for(56), Some(MIN_ORDER));
        assert_eq!(f.slab.order_for(57), Some(MIN_ORDER + 1));
        assert_eq!(f.slab.order_for(64 * 1024 - 8), Some(16));
        assert_eq!(f.slab.order_for(64 * 1024), None);
        assert_eq!(f.slab.order_for(u64::MAX), None);
    }

    #[test]
    fn allocate_and_coalesce() {
        let f = slab(64 * 1024);

        // the whole heap is a single block, so a full size request must fail
        // once anything else is allocated, and succeed again after freeing
        let small = f.slab.allocate(10).expect("failed to allocate");
        assert_eq!(f.slab.capacity(small), Ok(56));
        assert_eq!(f.slab.used(), Ok(64));
        assert_eq!(
            f.slab.allocate(64 * 1024 - 8),
            Err(SharedHashError::OutOfSpace)
        );

        f.slab.free(small, 10).expect("failed to free");
        assert_eq!(f.slab.used(), Ok(0));

        let large = f.slab.allocate(64 * 1024 - 8).expect("failed to allocate");
        assert_eq!(f.slab.capacity(large), Ok(64 * 1024 - 8));
        f.slab.free(large, 64 * 1024 - 8).expect("failed to free");
    }

    #[test]
    fn exhaust_and_refill() {
        let f = slab(4096);

        let mut blocks = Vec::new();
        while let Ok(offset) = f.slab.allocate(56) {
            blocks.push(offset);
        }
        assert_eq!(blocks.len(), 4096 / 64);
        assert_eq!(f.slab.used(), Ok(4096));

        // no two allocations overlap
        let mut sorted = blocks.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            assert!(pair[1] - pair[0] >= 64);
        }

        // free in an interleaved order, merging must restore the full heap
        for offset in blocks.iter().step_by(2) {
            f.slab.free(*offset, 56).expect("failed to free");
        }
        for offset in blocks.iter().skip(1).step_by(2) {
            f.slab.free(*offset, 56).expect("failed to free");
        }
        assert_eq!(f.slab.used(), Ok(0));
        assert!(f.slab.allocate(4096 - 8).is_ok());
    }

    #[test]
    fn uneven_heap() {
        // 4096 + 1024 + 64 bytes carve into three blocks
        let f = slab(4096 + 1024 + 64);

        assert!(f.slab.allocate(4096 - 8).is_ok());
        assert!(f.slab.allocate(1024 - 8).is_ok());
        assert!(f.slab.allocate(56).is_ok());
        assert_eq!(f.slab.allocate(0), Err(SharedHashError::OutOfSpace));
    }

    #[test]
    fn reject_bad_free() {
        let f = slab(4096);
        let offset = f.slab.allocate(56).expect("failed to allocate");

        assert!(matches!(
            f.slab.free(offset + 8, 8),
            Err(SharedHashError::CorruptLayout(_))
        ));
        assert!(matches!(
            f.slab.free(offset, 200),
            Err(SharedHashError::CorruptLayout(_))
        ));

        f.slab.free(offset, 56).expect("failed to free");
        assert!(matches!(
            f.slab.free(offset, 56),
            Err(SharedHashError::CorruptLayout(_))
        ));
    }
}
