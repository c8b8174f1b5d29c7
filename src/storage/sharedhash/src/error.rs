// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
/// Possible errors returned by the store.
pub enum SharedHashError {
    #[error("not found")]
    NotFound,
    #[error("out of space")]
    OutOfSpace,
    #[error("corrupt layout: {0}")]
    CorruptLayout(&'static str),
    #[error("timed out waiting for lock")]
    Timeout,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid store name")]
    InvalidName,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("store is attached by {0} other handles")]
    Busy(u64),
    #[error("io error: {0:?}")]
    Io(ErrorKind),
}

impl From<std::io::Error> for SharedHashError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::InvalidData => Self::CorruptLayout("segment header"),
            kind => Self::Io(kind),
        }
    }
}
