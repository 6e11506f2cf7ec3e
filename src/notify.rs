//! Outbound notification seam.

use async_trait::async_trait;
use tracing::info;

use crate::frame::NudgeTier;

/// Delivers messages to a user over some channel.
///
/// A failed send is logged by the caller and never fails the originating
/// loop invocation.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one message. Returns whether delivery succeeded.
    async fn send(&self, user_id: &str, channel: &str, message: &str, tier: NudgeTier) -> bool;
}

/// Notifier that only logs. The default until an embedder wires a channel.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, user_id: &str, channel: &str, message: &str, tier: NudgeTier) -> bool {
        info!(user_id, channel, %tier, message, "notification");
        true
    }
}
