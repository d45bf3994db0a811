//! Phase-completion notifications.
//!
//! Notifications are fire-and-forget: [`Notifier::send`] never fails from the caller's point
//! of view. Delivery problems are retried a bounded number of times and then logged.

use serde::Serialize;
use std::time::Duration;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Upper bound on the delay between delivery attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(6);

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str);
}

/// Drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, message: &str) {
        tracing::debug!(%message, "notifications disabled");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API returned status {0}")]
    Status(u16),
}

impl NotifyError {
    fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Http(_) => true,
            NotifyError::Status(status) => *status == 429 || *status == 418 || *status >= 500,
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    max_attempts: u32,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Points the notifier at a different Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn try_send(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .client
            .post(url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
                disable_web_page_preview: true,
            })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }

    /// Sends `text`, retrying transient failures.
    pub async fn deliver(&self, text: &str) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_send(text).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts && e.is_retryable() => {
                    let delay = backoff(attempt);
                    // The URL carries the bot token, so only the error kind is logged.
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %redact(&e),
                        "Telegram delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) {
        if let Err(e) = self.deliver(message).await {
            tracing::error!(error = %redact(&e), "Telegram notification dropped");
        }
    }
}

/// `1.5^(attempt-1)` seconds, capped.
fn backoff(attempt: u32) -> Duration {
    let secs = 1.5f64.powi(attempt.saturating_sub(1).min(16) as i32);
    Duration::from_secs_f64(secs).min(MAX_BACKOFF)
}

fn redact(e: &NotifyError) -> String {
    match e {
        NotifyError::Http(inner) if inner.is_timeout() => "request timed out".to_string(),
        NotifyError::Http(inner) if inner.is_connect() => "connection failed".to_string(),
        NotifyError::Http(_) => "request failed".to_string(),
        NotifyError::Status(status) => format!("status {status}"),
    }
}
