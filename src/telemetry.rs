//! Tracing subscriber setup.
//!
//! Logs go to stderr so that phase summaries printed on stdout stay machine-readable.
//! Verbosity follows `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    name: Option<String>,
    version: Option<String>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Installs the global subscriber. Later calls are ignored.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registered = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init();
        if registered.is_ok() {
            tracing::debug!(
                name = self.name.as_deref().unwrap_or("walletfleet"),
                version = self.version.as_deref().unwrap_or("unknown"),
                "tracing initialized"
            );
        }
        self
    }
}
