use async_trait::async_trait;
use tracing::warn;

use super::{AlertMessage, Notifier};
use crate::error::DispatchError;

/// Writes the alert into the structured log. Used when email is disabled.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DispatchError> {
        warn!(
            target: "alert",
            source = %message.source_id,
            subject = %message.subject,
            evidence = message.attachment.as_ref().map(|a| a.filename.as_str()).unwrap_or("-"),
            "{}",
            message.body.replace('\n', " | ")
        );
        Ok(())
    }
}
