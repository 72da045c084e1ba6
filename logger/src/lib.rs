//! Global `tracing` configuration for remit services and their tests.
//!
//! This crate owns the subscriber wiring and nothing else, so every binary
//! and test harness in the workspace logs the same way.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Installs the global logger for a service binary.
///
/// Events and spans print to stdout in the compact single-line format at
/// INFO and above. Set `RUST_LOG` (tracing `Targets` syntax, e.g.
/// `remit=debug,common=trace`) to change the filtering per module.
///
/// Panics if a global subscriber is already installed; call this once,
/// early in `main`.
pub fn init() {
    try_init(Level::INFO).expect("Another global logger is already set");
}

/// Installs the global logger for tests.
///
/// Quieter than [`init`] (WARN by default, `RUST_LOG` still wins), and
/// tolerant of racing: whichever test thread gets here first installs the
/// subscriber, later callers are no-ops.
pub fn init_for_testing() {
    let _ = try_init(Level::WARN);
}

/// Installs a compact stdout logger with the given default level. Returns
/// an `Err` if a global subscriber is already in place.
pub fn try_init(default_level: Level) -> Result<(), TryInitError> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_filter(targets_from_env(default_level));

    tracing_subscriber::registry().with(stdout_log).try_init()
}

fn targets_from_env(default_level: Level) -> Targets {
    parse_targets(std::env::var("RUST_LOG").ok().as_deref(), default_level)
}

/// `RUST_LOG` parsed as a [`Targets`] filter. An unset or unparseable
/// directive falls back to `default_level` across the board rather than
/// silencing everything.
fn parse_targets(directive: Option<&str>, default_level: Level) -> Targets {
    let fallback = || Targets::new().with_default(default_level);
    let Some(directive) = directive else {
        return fallback();
    };
    match Targets::from_str(directive) {
        Ok(targets) => targets,
        Err(err) => {
            // No subscriber is up yet, so report the bad directive the only
            // way we can.
            eprintln!("Ignoring unparseable RUST_LOG ({err})");
            fallback()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn directives_override_the_default() {
        let targets = parse_targets(Some("remit=debug"), Level::INFO);
        assert!(targets.would_enable("remit", &Level::DEBUG));
        assert!(!targets.would_enable("hyper", &Level::DEBUG));
    }

    #[test]
    fn unset_and_bad_directives_fall_back() {
        let targets = parse_targets(None, Level::INFO);
        assert!(targets.would_enable("remit", &Level::INFO));
        assert!(!targets.would_enable("remit", &Level::DEBUG));

        let targets = parse_targets(Some("remit=notalevel"), Level::WARN);
        assert!(targets.would_enable("remit", &Level::WARN));
        assert!(!targets.would_enable("remit", &Level::INFO));
    }
}
