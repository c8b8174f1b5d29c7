// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use config::*;

use serde::{Deserialize, Serialize};

use std::io::Read;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config: Config = match toml::from_str(&content) {
            Ok(t) => t,
            Err(e) => {
                error!("{}", e);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("error parsing config: {e}"),
                ));
            }
        };

        config.lock_timeout()?;

        Ok(config)
    }

    /// The configured lock timeout, which was already validated on load.
    pub fn lock_timeout(&self) -> Result<Duration, std::io::Error> {
        self.store.lock_timeout().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("lock timeout is not valid: {e}"),
            )
        })
    }

    pub fn print(&self) {
        match toml::to_string_pretty(self) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to print config: {e}"),
        }
    }
}

impl DebugConfig for Config {
    fn debug(&self) -> &Debug {
        &self.debug
    }
}

impl StoreConfig for Config {
    fn store(&self) -> &Store {
        &self.store
    }

    fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }
}
