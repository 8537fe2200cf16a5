//! Tracing setup shared by the rdsr binaries.
//!
//! Log lines go to stderr so command output on stdout stays machine-readable.
//! `RUST_LOG` always wins over the level chosen here.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging at INFO
pub fn init() {
    init_with_level("info")
}

/// Initialize logging with a specific default level
/// (`error`, `warn`, `info`, `debug`, `trace` or any `EnvFilter` directive)
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

/// Map `-q` / `-v` counts to a default level
pub fn level_for_verbosity(quiet: bool, verbose: u8) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    }
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for_verbosity(false, 0), "warn");
        assert_eq!(level_for_verbosity(false, 1), "info");
        assert_eq!(level_for_verbosity(false, 5), "trace");
        assert_eq!(level_for_verbosity(true, 3), "error");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
        tracing::debug!("logging initialized twice without panicking");
    }
}
