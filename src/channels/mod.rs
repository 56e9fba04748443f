//! Messaging transport: webhook in, HTTP send out.

pub mod http;
pub mod webhook;

pub use http::HttpTransport;
pub use webhook::webhook_routes;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Outbound side of the messaging provider.
///
/// `send` delivers one message immediately; pacing is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, contact_id: &str, text: &str) -> Result<(), ChannelError>;
}
