//! Logging setup
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the embedding process. `init_tracing` is the stock setup: fmt output,
//! filtered by `RUST_LOG` or the given default directive.

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "splitlab=info";

/// Install a global fmt subscriber.
///
/// # Errors
///
/// Returns `Error::Config` for an unparsable directive and `Error::Other` if a
/// global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| Error::Config(format!("invalid log directive '{default_directive}': {e}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already installed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // The first call may race with other tests; only the second is asserted.
        let _ = init_tracing(DEFAULT_DIRECTIVE);
        assert!(init_tracing(DEFAULT_DIRECTIVE).is_err());
    }
}
