// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Mapping from store names to backing files.

use crate::*;

use std::path::{Path, PathBuf};

const PREFIX: &str = "sharedhash.";

// longest name which leaves room for the prefix in a 255 byte file name
const MAX_NAME_LEN: usize = 200;

/// Checks that a store name maps to exactly one file within the directory.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(['/', '\0'])
    {
        return Err(SharedHashError::InvalidName);
    }
    Ok(())
}

/// Path of the file which backs the named store.
pub(crate) fn path(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.join(format!("{PREFIX}{name}")))
}

/// `/dev/shm` when the system has it, the temporary directory otherwise.
pub(crate) fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
