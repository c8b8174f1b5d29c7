// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A named key-value store that lives in shared memory and can be used
//! concurrently by unrelated processes.
//!
//! Every process which opens a store with the same name maps the same
//! segment. All structure inside the segment is addressed by offsets from the
//! start of the data region, so the layout is valid no matter where each
//! process maps it. Keys and values are opaque byte sequences, and each entry
//! may carry a time-to-live after which it is treated as absent.
//!
//! Goals:
//! * safe concurrent mutation from many processes
//! * lazy expiration of items, with an explicit sweep
//! * predictable, fixed capacity chosen at creation
//!
//! Non-goals:
//! * durability beyond the lifetime of the segment
//! * multi-key transactions
//! * growing the table after creation
//!
//! ```no_run
//! use sharedhash::Store;
//! use std::time::Duration;
//!
//! let store = Store::open("cache").expect("failed to open store");
//! store.put(b"a", b"1", Duration::ZERO).expect("put failed");
//! assert_eq!(store.get(b"a").expect("get failed"), Some(b"1".to_vec()));
//! ```

// macro includes
#[macro_use]
extern crate log;

// NOTE: this represents the versioning of the internal data layout and must be
// incremented when breaking changes are made to the datastructures
const VERSION: u64 = 1;

// submodules
mod builder;
mod error;
mod hashtable;
mod layout;
mod lock;
mod metrics;
mod segment;
mod slab;
mod store;
mod ttl;


// publicly exported items from submodules
pub use builder::Builder;
pub use error::SharedHashError;
pub use store::{Stats, Store};
pub use ttl::{Clock, ManualClock, SystemClock};

// items from submodules which are imported for convenience to the crate level
pub(crate) use hashtable::*;
pub(crate) use layout::*;
pub(crate) use lock::*;
pub(crate) use metrics::*;
pub(crate) use slab::*;
pub(crate) use ttl::*;

pub(crate) type Result<T> = std::result::Result<T, SharedHashError>;

common::test_no_duplicates!();
