//! Transport seam between the engine and a messaging platform

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use relayman_types::{AuthMethod, Message, MessageId};
use std::sync::Arc;

/// Stream of messages read from a channel
pub type MessageStream<'a> = BoxStream<'a, Result<Message, TransportError>>;

/// A connection to the messaging platform
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward one message from `source` to `dest`
    async fn forward(
        &self,
        source: &str,
        dest: &str,
        message_id: MessageId,
    ) -> Result<(), TransportError>;

    /// Finite, ascending enumeration of the channel's backlog.
    /// With `after`, only messages with a strictly greater id are yielded.
    fn enumerate_messages(&self, channel: &str, after: Option<MessageId>) -> MessageStream<'_>;

    /// Unbounded stream of new channel messages in arrival order.
    /// With `after`, messages newer than that id that are still retrievable
    /// are yielded first.
    fn follow_messages(&self, channel: &str, after: Option<MessageId>) -> MessageStream<'_>;

    /// Whether the connection can currently be used
    async fn is_ready(&self) -> bool;
}

/// Live transport handles, one per connection class
#[derive(Clone, Default)]
pub struct Connections {
    user_account: Option<Arc<dyn Transport>>,
    bot_account: Option<Arc<dyn Transport>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_account(mut self, transport: Arc<dyn Transport>) -> Self {
        self.user_account = Some(transport);
        self
    }

    pub fn with_bot_account(mut self, transport: Arc<dyn Transport>) -> Self {
        self.bot_account = Some(transport);
        self
    }

    pub fn get(&self, auth_method: AuthMethod) -> Option<Arc<dyn Transport>> {
        match auth_method {
            AuthMethod::UserAccount => self.user_account.clone(),
            AuthMethod::BotAccount => self.bot_account.clone(),
        }
    }

    /// A class with no configured handle is never ready
    pub async fn is_connection_ready(&self, auth_method: AuthMethod) -> bool {
        match self.get(auth_method) {
            Some(transport) => transport.is_ready().await,
            None => false,
        }
    }
}
