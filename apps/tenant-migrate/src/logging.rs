//! Subscriber setup. Logs go to stderr so stdout stays machine-readable.

use tenant_migrate::LogFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG` wins; otherwise `-v` raises this crate's level (info, debug,
/// trace) and everything else stays at `default_level`.
pub fn init(format: LogFormat, verbose: u8, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive(verbose, default_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}

fn directive(verbose: u8, default_level: &str) -> String {
    let ours = match verbose {
        0 => return default_level.to_owned(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("{default_level},tenant_migrate={ours}")
}
