//! Logging setup shared by the `murmur` binary and embedding hosts.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber, writing to stderr so logs never mix with chat output.
///
/// `RUST_LOG` wins over `default_filter`. A second call is ignored, which lets
/// tests and hosts that already installed a subscriber call this freely.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (json, plain) = if log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
