use {
    async_trait::async_trait,
    chatrelay_common::types::{MediaKind, MediaMessage},
};

use crate::Result;

/// Identifier the gateway assigned to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Delivery {
    pub delivered_id: String,
}

/// Send messages and presence signals to a chat on behalf of an account.
///
/// `account_id` is the sending session; `recipient_id` the addressed chat.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Mark the chat's pending messages as read.
    async fn mark_seen(&self, account_id: &str, recipient_id: &str) -> Result<()>;

    /// Toggle the "typing…" indicator.
    async fn set_typing(&self, account_id: &str, recipient_id: &str, on: bool) -> Result<()>;

    async fn send_text(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Delivery>;

    async fn send_media(
        &self,
        account_id: &str,
        recipient_id: &str,
        kind: MediaKind,
        media: &MediaMessage,
    ) -> Result<Delivery>;
}
