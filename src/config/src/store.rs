// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

// constants to define default values
const HASH_POWER: u8 = 16;
const HEAP_SIZE: usize = 64 * 1024 * 1024;
const LOCK_POWER: u8 = 6;
const LOCK_TIMEOUT: &str = "5s";
const CREATE: bool = true;

// helper functions
fn hash_power() -> u8 {
    HASH_POWER
}

fn heap_size() -> usize {
    HEAP_SIZE
}

fn lock_power() -> u8 {
    LOCK_POWER
}

fn lock_timeout() -> String {
    LOCK_TIMEOUT.to_string()
}

fn create() -> bool {
    CREATE
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Store {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dir: Option<String>,
    #[serde(default = "hash_power")]
    hash_power: u8,
    #[serde(default = "heap_size")]
    heap_size: usize,
    #[serde(default = "lock_power")]
    lock_power: u8,
    #[serde(default = "lock_timeout")]
    lock_timeout: String,
    #[serde(default = "create")]
    create: bool,
}

// implementation
impl Store {
    /// Directory holding the store files. When unset, the platform default is
    /// used.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref().map(Path::new)
    }

    pub fn set_dir(&mut self, dir: String) {
        self.dir = Some(dir);
    }

    /// The number of buckets in the table, expressed as a power of two. Only
    /// used when the store is created.
    pub fn hash_power(&self) -> u8 {
        self.hash_power
    }

    /// Bytes reserved for keys and values. Only used when the store is
    /// created.
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// The number of lock stripes, expressed as a power of two.
    pub fn lock_power(&self) -> u8 {
        self.lock_power
    }

    /// Bound on the time an operation waits for a lock.
    pub fn lock_timeout(&self) -> Result<Duration, humantime::DurationError> {
        self.lock_timeout
            .parse::<humantime::Duration>()
            .map(Into::into)
    }

    /// Whether opening a missing store creates it.
    pub fn create(&self) -> bool {
        self.create
    }

    pub fn set_create(&mut self, create: bool) {
        self.create = create;
    }
}

// trait definitions
pub trait StoreConfig {
    fn store(&self) -> &Store;

    fn store_mut(&mut self) -> &mut Store;
}

// trait implementations
impl Default for Store {
    fn default() -> Self {
        Self {
            dir: None,
            hash_power: hash_power(),
            heap_size: heap_size(),
            lock_power: lock_power(),
            lock_timeout: lock_timeout(),
            create: create(),
        }
    }
}
