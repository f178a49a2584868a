//! Process-wide tracing subscriber for binaries and examples.
//!
//! Library code only emits events through `tracing`; installing a subscriber
//! is left to the embedding program. `init_tracing` is the convenience
//! default.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `cubist=debug`.
pub const LOG_ENV: &str = "CUBIST_LOG";

/// Install a `fmt` subscriber filtered by `CUBIST_LOG`, then `RUST_LOG`,
/// then `info`. Returns false when a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init_tracing();
        assert!(!init_tracing());
    }
}
