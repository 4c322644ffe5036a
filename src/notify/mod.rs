//! Notification sinks.
//!
//! A sink receives a fully composed `AlertMessage` and either delivers it or
//! returns a `DispatchError`. Sinks never retry; the dispatcher logs the
//! failure and moves on.

mod email;
mod log_sink;

pub use email::EmailNotifier;
pub use log_sink::LogNotifier;

use async_trait::async_trait;

use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One alert, ready to send. Each dispatch task owns its own copy.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub source_id: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &AlertMessage) -> Result<(), DispatchError>;
}
