//! Maps a classified message's counterparts to stored identities and records the
//! command.

use crate::error::{NegotiationError, Result};
use crate::model::{CommandKind, CommandView, NewCommand};
use crate::store::Store;
use lnf_feed::{MessageId, User};

/// Record a new command and return it joined with its peer.
///
/// `Ok(None)` when the root message was already recorded (a re-delivery).
#[tracing::instrument(level = "debug", skip_all, fields(%kind, %message_id))]
pub async fn record_new_command(
    store: &Store,
    kind: CommandKind,
    message_id: &MessageId,
    creator: &User,
    peer: Option<&User>,
    bot: Option<&User>,
) -> Result<Option<CommandView>> {
    let (peer_id, bot_id, known_peer) = match (peer, bot) {
        (_, Some(bot)) => (
            None,
            Some(bot.id.clone()),
            store.get_peer_by_bot_uid(&bot.id).await?,
        ),
        (Some(peer), None) => {
            let record = match store.get_peer_by_uid(&peer.id).await? {
                Some(existing) => existing,
                None => {
                    tracing::info!(peer = %peer.screen_name, "first sighting of peer");
                    store.create_peer(&peer.id, &peer.screen_name).await?
                }
            };
            (Some(peer.id.clone()), record.bot_uid.clone(), Some(record))
        }
        (None, None) => {
            return Err(NegotiationError::MissingCounterpart {
                command: message_id.clone(),
                missing: "peer or bot",
            });
        }
    };

    let created = store
        .create_command(NewCommand {
            message_id: message_id.clone(),
            kind,
            creator_id: creator.id.clone(),
            peer_id,
            bot_id,
        })
        .await?;

    Ok(created.map(|command| CommandView {
        command,
        peer: known_peer,
    }))
}
