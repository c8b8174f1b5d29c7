// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Byte storage pools which back a store's data region.
//!
//! A [`SharedFile`] is a file mapped with `MAP_SHARED` so that every process
//! which maps the same path observes the same bytes. The file starts with a
//! one page [`Header`] which is validated before any process trusts the data
//! region that follows it. A [`Memory`] pool is anonymous and private to the
//! process which created it.

#[macro_use]
extern crate log;

use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Error, ErrorKind};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use clocksource::coarse::UnixInstant;
use memmap2::{MmapMut, MmapOptions};

const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const MAGIC: [u8; 8] = *b"SHRDPOOL";

// NOTE: this must be incremented if there are breaking changes to the segment
// header format
const VERSION: u64 = 1;

mod memory;
mod shared_file;

pub use memory::Memory;
pub use shared_file::SharedFile;

/// The datapool trait defines the abstraction that each datapool implementation
/// should conform to.
#[allow(clippy::len_without_is_empty)]
pub trait Datapool: Send {
    /// Immutable borrow of the data within the datapool
    fn as_slice(&self) -> &[u8];

    /// Mutable borrow of the data within the datapool
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Performs any actions necessary to persist the data to the backing store.
    /// This may be a no-op for datapools which cannot persist data.
    fn flush(&mut self) -> Result<(), std::io::Error>;

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Raw pointer to the start of the data region. The pointer stays valid
    /// for as long as the datapool is alive.
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }
}

// NOTE: make sure this is a whole number of pages and that all fields which are
// accessed are properly aligned to avoid undefined behavior.
#[repr(C)]
pub struct Header {
    checksum: [u8; 32],
    magic: [u8; 8],
    version: u64,
    user_version: u64,
    data_size: u64,
    time_unix_s: u32,
    _reserved: u32,
    attached: AtomicU64,
    _pad: [u8; 4016],
}

impl Header {
    fn new(data_size: usize, user_version: u64) -> Self {
        let mut header = Self {
            checksum: [0; 32],
            magic: MAGIC,
            version: VERSION,
            user_version,
            data_size: data_size as u64,
            time_unix_s: UnixInstant::now()
                .duration_since(UnixInstant::EPOCH)
                .as_secs(),
            _reserved: 0,
            attached: AtomicU64::new(0),
            _pad: [0; 4016],
        };
        header.checksum = *header.hash().as_bytes();
        header
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts((self as *const Header) as *const u8, HEADER_SIZE) }
    }

    // only the immutable fields are covered, the attach counter changes
    // while the segment is live
    fn hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.magic);
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.user_version.to_le_bytes());
        hasher.update(&self.data_size.to_le_bytes());
        hasher.update(&self.time_unix_s.to_le_bytes());
        hasher.finalize()
    }

    fn check(&self, user_version: u64) -> Result<(), std::io::Error> {
        self.check_magic()?;
        self.check_version()?;
        if self.user_version != user_version {
            return Err(Error::new(ErrorKind::InvalidData, "user version mismatch"));
        }
        if self.checksum[0..32] != self.hash().as_bytes()[0..32] {
            return Err(Error::new(ErrorKind::InvalidData, "checksum mismatch"));
        }
        Ok(())
    }

    fn check_version(&self) -> Result<(), std::io::Error> {
        if self.version != VERSION {
            Err(Error::new(
                ErrorKind::InvalidData,
                "segment has incompatible version",
            ))
        } else {
            Ok(())
        }
    }

    fn check_magic(&self) -> Result<(), std::io::Error> {
        if self.magic[0..8] == MAGIC[0..8] {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidData, "header is not recognized"))
        }
    }

    pub fn user_version(&self) -> u64 {
        self.user_version
    }

    pub fn data_size(&self) -> usize {
        self.data_size as usize
    }

    /// Creation time of the segment in seconds since the unix epoch.
    pub fn time_unix_s(&self) -> u32 {
        self.time_unix_s
    }

    /// Number of live attachments across all processes.
    pub fn attached(&self) -> u64 {
        self.attached.load(Ordering::Acquire)
    }
}

/// Size of the backing file for a data region of `data_size` bytes, rounded
/// up to a whole number of pages.
fn total_size(data_size: usize) -> usize {
    let pages = (HEADER_SIZE + data_size).div_ceil(PAGE_SIZE);
    pages * PAGE_SIZE
}
