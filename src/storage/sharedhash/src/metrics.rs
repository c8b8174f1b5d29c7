// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

// All metrics for the sharedhash crate. These are local to the process, the
// counts shared by every attached process are reported by `Store::stats()`.

use metriken::*;

// segment related
#[metric(name = "segment_create", description = "number of segments created by this process")]
pub static SEGMENT_CREATE: Counter = Counter::new();

#[metric(name = "segment_attach", description = "number of existing segments attached by this process")]
pub static SEGMENT_ATTACH: Counter = Counter::new();

#[metric(name = "segment_attach_ex", description = "number of exceptions while opening segments")]
pub static SEGMENT_ATTACH_EX: Counter = Counter::new();

#[metric(name = "segment_destroy", description = "number of segments destroyed by this process")]
pub static SEGMENT_DESTROY: Counter = Counter::new();

// slab allocator
#[metric(name = "slab_allocate", description = "number of block allocation attempts")]
pub static SLAB_ALLOCATE: Counter = Counter::new();

#[metric(name = "slab_allocate_ex", description = "number of block allocations which failed for lack of space")]
pub static SLAB_ALLOCATE_EX: Counter = Counter::new();

#[metric(name = "slab_free", description = "number of blocks returned to the heap")]
pub static SLAB_FREE: Counter = Counter::new();

// hash table
#[metric(name = "hash_lookup", description = "number of lookups in the hash table")]
pub static HASH_LOOKUP: Counter = Counter::new();

#[metric(name = "hash_insert", description = "number of inserts into the hash table")]
pub static HASH_INSERT: Counter = Counter::new();

#[metric(name = "hash_remove", description = "number of entries unlinked from the hash table")]
pub static HASH_REMOVE: Counter = Counter::new();

#[metric(name = "hash_tag_collision", description = "number of matching hashes with differing keys")]
pub static HASH_TAG_COLLISION: Counter = Counter::new();

// items
#[metric(name = "item_replace", description = "number of existing items overwritten")]
pub static ITEM_REPLACE: Counter = Counter::new();

#[metric(name = "item_expire", description = "number of expired items reclaimed")]
pub static ITEM_EXPIRE: Counter = Counter::new();

// locks
#[metric(name = "lock_timeout", description = "number of lock acquisitions which timed out")]
pub static LOCK_TIMEOUT: Counter = Counter::new();

#[metric(name = "lock_recover", description = "number of locks taken over from exited processes")]
pub static LOCK_RECOVER: Counter = Counter::new();

// store operations
#[metric(name = "store_get", description = "number of get operations")]
pub static STORE_GET: Counter = Counter::new();

#[metric(name = "store_get_miss", description = "number of get operations which found no live item")]
pub static STORE_GET_MISS: Counter = Counter::new();

#[metric(name = "store_put", description = "number of put operations")]
pub static STORE_PUT: Counter = Counter::new();

#[metric(name = "store_put_ex", description = "number of put operations which failed")]
pub static STORE_PUT_EX: Counter = Counter::new();

#[metric(name = "store_replace", description = "number of replace operations")]
pub static STORE_REPLACE: Counter = Counter::new();

#[metric(name = "store_replace_notfound", description = "number of replace operations on absent keys")]
pub static STORE_REPLACE_NOTFOUND: Counter = Counter::new();

#[metric(name = "store_del", description = "number of del operations")]
pub static STORE_DEL: Counter = Counter::new();

#[metric(name = "store_exists", description = "number of exists operations")]
pub static STORE_EXISTS: Counter = Counter::new();

#[metric(name = "store_scan", description = "number of whole table scans")]
pub static STORE_SCAN: Counter = Counter::new();

#[metric(name = "store_open", description = "current number of stores open in this process")]
pub static STORE_OPEN: Gauge = Gauge::new();
