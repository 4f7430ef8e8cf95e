use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Spider and client logs at debug, HTTP plumbing quiet.
pub const DEFAULT_FILTER: &str = concat!(
    "info,",
    env!("CARGO_CRATE_NAME"),
    "=debug,reqwest=warn,hyper=warn,hyper_util=warn"
);

/// Installs the global fmt subscriber, writing to stderr so command output on
/// stdout stays machine-readable.
///
/// `default_filter` applies when `RUST_LOG` is unset; see [`DEFAULT_FILTER`].
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow::anyhow!("invalid log filter {default_filter:?}: {e}"))?;

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_targets_this_crate() {
        assert!(DEFAULT_FILTER.contains("stadia_spider=debug"));
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
