use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Structured logging to stdout. The level comes from the configuration
/// document's `log-level`; INFO when it is absent.
pub fn init_stdout(max_level: Option<Level>) {
    let max_level = max_level.unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    max_level,
                )),
        )
        .init();
}
