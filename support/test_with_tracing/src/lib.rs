// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test attribute that routes `tracing` output of the test body to the test
//! harness' captured output.
//!
//! Driver code logs register programming, doorbell writes and completions at
//! `debug` and `trace` level, so a failing test prints the device
//! conversation that led up to it.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// The level used when `RUST_LOG` is unset or cannot be parsed.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

fn targets() -> Targets {
    match std::env::var("RUST_LOG") {
        Ok(var) => var.parse().unwrap_or_else(|err| {
            eprintln!("ignoring invalid RUST_LOG {var:?}: {err}");
            Targets::new().with_default(DEFAULT_LEVEL)
        }),
        Err(_) => Targets::new().with_default(DEFAULT_LEVEL),
    }
}

#[doc(hidden)]
/// Initializes `tracing` for tests. Safe to call any number of times.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let fmt = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .log_internal_errors(true)
            .with_test_writer();
        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(fmt.with_filter(LevelFilter::TRACE))
            .with(targets())
            .try_init();
    });
}
