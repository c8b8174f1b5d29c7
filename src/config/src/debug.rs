// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const LOG_LEVEL: &str = "info";

// helper functions
fn log_level() -> String {
    LOG_LEVEL.to_string()
}

// struct definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Debug {
    #[serde(default = "log_level")]
    log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_file: Option<String>,
}

// implementation
impl Debug {
    /// Log filter, either a level such as `debug` or a list of per-module
    /// directives such as `warn,sharedhash=trace`.
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn set_log_level(&mut self, level: String) {
        self.log_level = level;
    }

    /// File to append log lines to. Logs go to standard error when unset.
    pub fn log_file(&self) -> Option<&str> {
        self.log_file.as_deref().filter(|f| !f.is_empty())
    }
}

// trait definitions
pub trait DebugConfig {
    fn debug(&self) -> &Debug;
}

// trait implementations
impl Default for Debug {
    fn default() -> Self {
        Self {
            log_level: log_level(),
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let debug = Debug::default();
        assert_eq!(debug.log_level(), "info");
        assert_eq!(debug.log_file(), None);
    }

    #[test]
    fn empty_log_file_is_stderr() {
        let debug: Debug = toml::from_str(
            r#"
            log_level = "sharedhash=debug"
            log_file = ""
            "#,
        )
        .expect("failed to parse");
        assert_eq!(debug.log_level(), "sharedhash=debug");
        assert_eq!(debug.log_file(), None);
    }
}
