use async_trait::async_trait;
use relay_core::config::ChannelEntryConfig;

use crate::error::ChannelError;
use crate::types::{ChannelHealth, InboundMessage, MediaAttachment, OutboundMessage};

/// Capability interface every channel adapter implements (§4.6). The
/// framework calls only through this trait — no downcasting, no adapter-
/// specific branches anywhere in `ChannelManager`.
///
/// Every hook except `on_start`, `check_health`, `send_text`, and
/// `send_media` has a no-op default: most adapters only care about a few of
/// these, and forcing every implementor to restate the rest would just be
/// noise.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`), unique within a
    /// `ChannelManager`.
    fn id(&self) -> &str;

    /// One-time setup before the first `on_start`. Called once, ever.
    async fn on_init(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Establish (or re-establish) the connection to the external service.
    async fn on_start(&self, config: &ChannelEntryConfig) -> Result<(), ChannelError>;

    /// Called once the adapter is confirmed ready to receive traffic.
    async fn on_ready(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Gracefully close the connection.
    async fn on_stop(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Release any resources held for good, ahead of the adapter being
    /// dropped. Distinct from `on_stop`: a stopped channel can be started
    /// again, a destroyed one cannot.
    async fn on_destroy(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Normalize and optionally filter or enrich an inbound update. Returning
    /// `None` drops the message (spam, filtered senders, platform noise)
    /// before it ever reaches the Channel Manager.
    async fn on_message_received(&self, inbound: InboundMessage) -> Option<InboundMessage> {
        Some(inbound)
    }

    /// Notified after a message this adapter sent was delivered.
    async fn on_message_sent(&self, _msg: &OutboundMessage) {}

    /// Notified of an error raised by this adapter's own operations.
    async fn on_error(&self, _err: &ChannelError) {}

    /// Notified that the underlying transport dropped. The Channel Manager
    /// moves this channel to `DEGRADED` and drives the reconnect backoff;
    /// the adapter doesn't reconnect itself.
    async fn on_connection_lost(&self) {}

    /// Self-check used by the `health` RPC category and by the manager's
    /// `list_status`.
    async fn check_health(&self) -> ChannelHealth;

    /// Send plain text to `msg.chat_id`.
    async fn send_text(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;

    /// Deliver a generated file, forwarded from `AGENT_FILE_GENERATED`.
    async fn send_media(&self, chat_id: &str, file: &MediaAttachment) -> Result<(), ChannelError>;
}
