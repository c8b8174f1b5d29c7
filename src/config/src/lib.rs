// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Configuration sections shared by the sharedhash tools. Each section has a
//! matching trait which a top-level configuration implements to expose it.

mod debug;
mod store;

pub use debug::{Debug, DebugConfig};
pub use store::{Store, StoreConfig};
