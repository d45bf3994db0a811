//! Shutdown on SIGINT / SIGTERM.

use tokio_util::sync::CancellationToken;

/// Cancels its token when the process receives an interrupt or termination signal.
pub struct SigDown {
    cancellation_token: CancellationToken,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let terminate = sigterm.recv();
            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt, shutting down"),
                _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
                _ = token.cancelled() => {}
            }
            token.cancel();
        });

        Ok(Self { cancellation_token })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}
