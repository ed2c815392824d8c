// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Log subscriber setup.
//!
//! Precedence: `RUST_LOG`, then `FL_LOG_LEVEL`, then the `-v` count.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable naming the platform log level.
pub const FL_LOG_LEVEL: &str = "FL_LOG_LEVEL";

/// Map a platform level name to a tracing directive.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" | "fatal" => Some("error"),
        _ => None,
    }
}

fn verbosity_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Pick the filter directive from the environment and verbosity.
fn filter_for(rust_log: Option<String>, fl_level: Option<String>, verbosity: u8) -> EnvFilter {
    if let Some(filter) = rust_log.and_then(|v| EnvFilter::try_new(v).ok()) {
        return filter;
    }
    let directive = fl_level
        .as_deref()
        .and_then(level_directive)
        .unwrap_or_else(|| verbosity_directive(verbosity));
    EnvFilter::new(directive)
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let filter = filter_for(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        std::env::var(FL_LOG_LEVEL).ok(),
        verbosity,
    );
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("log subscriber already installed");
    }
}
