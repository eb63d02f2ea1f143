use std::time::Duration;

use async_trait::async_trait;
use drover_core::{HandlerError, TaskHandler};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    #[serde(default)]
    subject: String,
}

/// `send_email`: pretends to talk to a mail server.
pub struct SendEmailHandler {
    latency: Duration,
}

impl SendEmailHandler {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl TaskHandler for SendEmailHandler {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), HandlerError> {
        let p: EmailPayload = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::new(format!("json decode: {e}")))?;
        if p.to.trim().is_empty() {
            return Err(HandlerError::new("recipient is required"));
        }

        // shutdown 中でも送信は最後までやる。ログだけ残す
        if cancel.is_cancelled() {
            info!(to = %p.to, "finishing send during shutdown");
        }
        tokio::time::sleep(self.latency).await;
        info!(to = %p.to, subject = %p.subject, "email sent");
        Ok(())
    }
}

/// `echo`: logs the payload as text.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, _cancel: &CancellationToken, payload: &[u8]) -> Result<(), HandlerError> {
        info!(payload = %String::from_utf8_lossy(payload), "echo");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_email_requires_a_recipient() {
        let h = SendEmailHandler::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        h.handle(&cancel, br#"{"to":"ops@example.com","subject":"hi"}"#)
            .await
            .unwrap();
        assert!(h.handle(&cancel, br#"{"to":" "}"#).await.is_err());
        assert!(h.handle(&cancel, b"not json").await.is_err());
    }
}
