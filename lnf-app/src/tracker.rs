//! Reply-chain correlation: which command is waiting on a reply to which message.
//!
//! The index maps an outstanding `last_message_id` to the command's root id. It is a
//! cache over the store; a miss always falls through to the store before a message
//! is treated as the start of a new negotiation.

use crate::model::{Command, CommandStatus, StepGuard};
use crate::store::{Result, Store};
use dashmap::DashMap;
use lnf_feed::{MessageId, UserId};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct ReplyChainTracker {
    store: Arc<Store>,
    index: DashMap<MessageId, MessageId>,
    locks: DashMap<MessageId, Arc<Mutex<()>>>,
}

impl ReplyChainTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            index: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Load every live command into the index.
    pub async fn warm(&self) -> Result<usize> {
        let live = self.store.list_live().await?;
        for command in &live {
            self.index
                .insert(command.last_message_id.clone(), command.message_id.clone());
        }
        Ok(live.len())
    }

    pub async fn find_by_reply_target(&self, in_reply_to: &MessageId) -> Result<Option<Command>> {
        let cached_root = self.index.get(in_reply_to).map(|e| e.value().clone());
        if let Some(root) = cached_root {
            match self.store.get_command(&root).await? {
                Some(command)
                    if !command.status.is_terminal() && command.last_message_id == *in_reply_to =>
                {
                    return Ok(Some(command));
                }
                _ => {
                    self.index.remove(in_reply_to);
                }
            }
        }

        let found = self.store.get_by_reply_target(in_reply_to).await?;
        if let Some(command) = &found {
            self.index
                .insert(command.last_message_id.clone(), command.message_id.clone());
        }
        Ok(found)
    }

    /// Serialize work on one command. Different commands proceed in parallel.
    pub async fn lock(&self, root: &MessageId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(root.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Compare-and-set a status transition and move the index entry along with it.
    pub async fn commit(
        &self,
        command: &Command,
        guard: &StepGuard,
        new_last_message_id: &MessageId,
        new_status: CommandStatus,
    ) -> Result<Option<Command>> {
        let updated = self
            .store
            .update_status(&command.message_id, guard, new_last_message_id, new_status)
            .await?;
        if let Some(updated) = &updated {
            self.advance(&guard.last_message_id, updated);
        }
        Ok(updated)
    }

    /// Like [`ReplyChainTracker::commit`], also recording the counterpart's bot.
    pub async fn commit_bot(
        &self,
        command: &Command,
        guard: &StepGuard,
        new_last_message_id: &MessageId,
        bot_id: &UserId,
        new_status: CommandStatus,
    ) -> Result<Option<Command>> {
        let updated = self
            .store
            .update_bot(
                &command.message_id,
                guard,
                new_last_message_id,
                bot_id,
                new_status,
            )
            .await?;
        if let Some(updated) = &updated {
            self.advance(&guard.last_message_id, updated);
        }
        Ok(updated)
    }

    /// Drop a command that will never be resumed again.
    pub fn forget(&self, command: &Command) {
        self.index.remove(&command.last_message_id);
        self.locks.remove(&command.message_id);
    }

    fn advance(&self, previous_last: &MessageId, updated: &Command) {
        self.index.remove(previous_last);
        if updated.status.is_terminal() {
            self.forget(updated);
        } else {
            self.index
                .insert(updated.last_message_id.clone(), updated.message_id.clone());
        }
    }

    #[cfg(test)]
    pub fn indexed(&self, last_message_id: &MessageId) -> Option<MessageId> {
        self.index.get(last_message_id).map(|e| e.value().clone())
    }
}
