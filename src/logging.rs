use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the console subscriber. `RUST_LOG` wins over the default directive.
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "metric_intake=debug"
    } else {
        "metric_intake=info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // try_init so repeated calls (tests, embedding) don't panic
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
