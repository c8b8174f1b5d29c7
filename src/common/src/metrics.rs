// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::*;

/// Creates a test that verifies that no two metrics have the same name.
#[macro_export]
#[rustfmt::skip]
macro_rules! test_no_duplicates {
    () => {
    };
}

pub use test_no_duplicates;

#[metric(name = "pid", description = "the process id")]
pub static PID: Gauge = Gauge::new();

pub fn init() {
    PID.set(std::process::id().into());
}

/// Names and current values of every counter and gauge registered in this
/// process, sorted by name.
pub fn snapshot() -> Vec<(String, i64)> {
    let mut values = Vec::new();

    for metric in &metriken::metrics() {
        match metric.value() {
            Some(Value::Counter(value)) => {
                values.push((metric.name().to_string(), value as i64));
            }
            Some(Value::Gauge(value)) => {
                values.push((metric.name().to_string(), value));
            }
            _ => continue,
        }
    }

    values.sort();
    values
}


test_no_duplicates!();
