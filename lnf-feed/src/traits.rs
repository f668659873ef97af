use crate::types::{FeedMessage, MessageId, User};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Unique feed identifier, used in logs.
    fn feed_id(&self) -> &str;

    /// The account this client posts as.
    async fn whoami(&self) -> Result<User>;

    async fn lookup_user(&self, screen_name: &str) -> Result<User>;

    /// Fetch a single message by id. `Ok(None)` when it no longer exists.
    async fn lookup_message(&self, id: &MessageId) -> Result<Option<FeedMessage>>;

    /// Post `body`, threaded under `reply_to` when given. Returns the id of the new
    /// message once the platform has acknowledged it.
    async fn post(&self, body: &str, reply_to: Option<&MessageId>) -> Result<MessageId>;

    /// Start streaming messages matching `track`. Push to tx for each inbound message.
    /// Reconnects are the adapter's concern; the stream never ends on its own.
    async fn start(&self, track: &str, tx: mpsc::Sender<FeedMessage>) -> Result<()>;
}
