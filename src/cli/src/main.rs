// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Command line access to named shared memory stores.
//!
//! Each invocation opens the store, performs one operation, and detaches.
//! Since the store lives in shared memory, the results are visible to every
//! other process using the same store.
//!
//! Exit status is 0 on success, 1 on error, and 2 when `get` finds no value
//! or `exists` finds no entry.

#[macro_use]
extern crate logger;

mod options;

use backtrace::Backtrace;
use clap::{value_parser, Arg, ArgMatches, Command};
use config::StoreConfig;
use options::Config;
use sharedhash::{Builder, SharedHashError, Store};

use std::error::Error;
use std::io::Write;
use std::time::Duration;

// exit status for a lookup which found nothing
const EXIT_MISS: i32 = 2;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{}", s);
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    let matches = cli().get_matches();

    // load config from file
    let mut config = if let Some(file) = matches.get_one::<String>("config") {
        match Config::load(file) {
            Ok(c) => c,
            Err(error) => {
                eprintln!("error loading config file: {file}\n{error}");
                std::process::exit(1);
            }
        }
    } else {
        Default::default()
    };

    if let Some(dir) = matches.get_one::<String>("dir") {
        config.store_mut().set_dir(dir.to_string());
    }

    if matches.get_flag("print-config") {
        config.print();
        std::process::exit(0);
    }

    // buffered log lines are flushed when the drain is dropped
    let drain = match logger::configure_logging(&config) {
        Ok(drain) => drain,
        Err(e) => {
            eprintln!("failed to configure logging: {e}");
            std::process::exit(1);
        }
    };

    common::metrics::init();

    let status = match matches.subcommand() {
        Some((command, args)) => match run(&config, command, args) {
            Ok(status) => status,
            Err(e) => {
                error!("{} failed: {}", command, e);
                eprintln!("error: {e}");
                1
            }
        },
        None => {
            eprintln!("no command given, see --help");
            1
        }
    };

    drop(drain);
    std::process::exit(status);
}

fn cli() -> Command {
    let name = || {
        Arg::new("NAME")
            .help("Name of the store")
            .required(true)
    };
    let key = || Arg::new("KEY").help("Key of the entry").required(true);
    let value = || Arg::new("VALUE").help("Value to store").required(true);
    let ttl = || {
        Arg::new("ttl")
            .long("ttl")
            .help("Seconds until the entry expires, zero means never")
            .value_parser(value_parser!(u64))
            .default_value("0")
    };

    Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Reads and writes named key-value stores which live in shared \
            memory. Any number of processes may use the same store at the \
            same time.",
        )
        .arg(
            Arg::new("config")
                .help("Configuration file")
                .long("config")
                .short('c')
                .global(true),
        )
        .arg(
            Arg::new("dir")
                .help("Directory which holds the stores, overrides the config")
                .long("dir")
                .short('d')
                .global(true),
        )
        .arg(
            Arg::new("print-config")
                .help("List all options in config")
                .long("print-config")
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("put")
                .about("Store a value, replacing any existing value")
                .arg(name())
                .arg(key())
                .arg(value())
                .arg(ttl()),
        )
        .subcommand(
            Command::new("replace")
                .about("Replace the value of an existing entry")
                .arg(name())
                .arg(key())
                .arg(value())
                .arg(ttl()),
        )
        .subcommand(
            Command::new("get")
                .about("Print the value of an entry")
                .arg(name())
                .arg(key()),
        )
        .subcommand(
            Command::new("exists")
                .about("Check whether an entry exists")
                .arg(name())
                .arg(key()),
        )
        .subcommand(
            Command::new("del")
                .about("Remove an entry")
                .arg(name())
                .arg(key()),
        )
        .subcommand(
            Command::new("keys")
                .about("List every key, one per line")
                .arg(name()),
        )
        .subcommand(
            Command::new("size")
                .about("Print the number of entries")
                .arg(name()),
        )
        .subcommand(
            Command::new("sweep")
                .about("Reclaim expired entries")
                .arg(name()),
        )
        .subcommand(
            Command::new("stats")
                .about("Print store and process statistics")
                .arg(name()),
        )
        .subcommand(
            Command::new("rm")
                .about("Remove a store")
                .arg(name())
                .arg(
                    Arg::new("force")
                        .help("Remove even if other processes are attached")
                        .long("force")
                        .short('f')
                        .action(clap::ArgAction::SetTrue),
                ),
        )
}

/// Builder for the configured store. Only writes create a missing store.
fn builder(config: &Config, create: bool) -> Result<Builder, std::io::Error> {
    let store = config.store();

    let mut builder = Builder::default()
        .hash_power(store.hash_power())
        .heap_size(store.heap_size())
        .lock_power(store.lock_power())
        .lock_timeout(config.lock_timeout()?)
        .create(create && store.create());

    if let Some(dir) = store.dir() {
        builder = builder.dir(dir);
    }

    Ok(builder)
}

fn open(config: &Config, args: &ArgMatches, create: bool) -> Result<Store, Box<dyn Error>> {
    let name = arg(args, "NAME");
    match builder(config, create)?.open(name) {
        Ok(store) => Ok(store),
        Err(SharedHashError::NotFound) => Err(format!("store {name} does not exist").into()),
        Err(e) => Err(e.into()),
    }
}

fn arg<'a>(args: &'a ArgMatches, id: &str) -> &'a str {
    // required arguments are enforced by clap
    args.get_one::<String>(id).map(|s| s.as_str()).unwrap_or_default()
}

fn ttl(args: &ArgMatches) -> Duration {
    Duration::from_secs(args.get_one::<u64>("ttl").copied().unwrap_or(0))
}

/// Run one command and return the exit status.
fn run(config: &Config, command: &str, args: &ArgMatches) -> Result<i32, Box<dyn Error>> {
    let mut stdout = std::io::stdout().lock();

    match command {
        "put" => {
            let store = open(config, args, true)?;
            store.put(arg(args, "KEY").as_bytes(), arg(args, "VALUE").as_bytes(), ttl(args))?;
        }
        "replace" => {
            let store = open(config, args, false)?;
            store.replace(arg(args, "KEY").as_bytes(), arg(args, "VALUE").as_bytes(), ttl(args))?;
        }
        "get" => {
            let store = open(config, args, false)?;
            match store.get(arg(args, "KEY").as_bytes())? {
                Some(value) => {
                    stdout.write_all(&value)?;
                    stdout.write_all(b"\n")?;
                }
                None => return Ok(EXIT_MISS),
            }
        }
        "exists" => {
            let store = open(config, args, false)?;
            let exists = store.exists(arg(args, "KEY").as_bytes())?;
            writeln!(stdout, "{exists}")?;
            if !exists {
                return Ok(EXIT_MISS);
            }
        }
        "del" => {
            let store = open(config, args, false)?;
            let removed = store.del(arg(args, "KEY").as_bytes())?;
            writeln!(stdout, "{removed}")?;
        }
        "keys" => {
            let store = open(config, args, false)?;
            let mut keys = store.keys()?;
            keys.sort();
            for key in keys {
                stdout.write_all(&key)?;
                stdout.write_all(b"\n")?;
            }
        }
        "size" => {
            let store = open(config, args, false)?;
            writeln!(stdout, "{}", store.size()?)?;
        }
        "sweep" => {
            let store = open(config, args, false)?;
            writeln!(stdout, "{}", store.sweep()?)?;
        }
        "stats" => {
            let store = open(config, args, false)?;
            let stats = store.stats()?;
            writeln!(stdout, "{:<31} {}", "entries", stats.entries)?;
            writeln!(stdout, "{:<31} {}", "buckets", stats.buckets)?;
            writeln!(stdout, "{:<31} {}", "lock_stripes", stats.lock_stripes)?;
            writeln!(stdout, "{:<31} {}", "heap_size", stats.heap_size)?;
            writeln!(stdout, "{:<31} {}", "heap_used", stats.heap_used)?;
            writeln!(stdout, "{:<31} {}", "attached", stats.attached)?;
            writeln!(stdout)?;
            for (name, value) in common::metrics::snapshot() {
                writeln!(stdout, "{:<31} {}", name, value)?;
            }
        }
        "rm" => {
            let name = arg(args, "NAME");
            if args.get_flag("force") {
                builder(config, false)?.remove(name)?;
            } else {
                open(config, args, false)?.destroy()?;
            }
        }
        _ => return Err(format!("unknown command {command}").into()),
    }

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        cli().debug_assert();
    }

    #[test]
    fn parse_put() {
        let matches = cli()
            .try_get_matches_from(["sharedhash", "--dir", "/tmp", "put", "cache", "k", "v", "--ttl", "5"])
            .expect("failed to parse");
        assert_eq!(matches.get_one::<String>("dir").map(|s| s.as_str()), Some("/tmp"));

        let (command, args) = matches.subcommand().expect("no subcommand");
        assert_eq!(command, "put");
        assert_eq!(arg(args, "NAME"), "cache");
        assert_eq!(arg(args, "VALUE"), "v");
        assert_eq!(ttl(args), Duration::from_secs(5));
    }

    #[test]
    fn reject_bad_ttl() {
        assert!(cli()
            .try_get_matches_from(["sharedhash", "put", "cache", "k", "v", "--ttl", "soon"])
            .is_err());
    }
}
