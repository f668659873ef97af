//! Decides whether an inbound message opens a new negotiation.

use crate::context::Identities;
use crate::model::CommandKind;
use lnf_feed::{FeedMessage, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: CommandKind,
    /// Counterpart named by the owner; set for owner-issued kinds.
    pub peer: Option<User>,
    /// Counterpart bot that asked us something; set for bot-issued kinds.
    pub bot: Option<User>,
}

/// Only the owner may originate node-control intents. Anyone else can only be a
/// counterpart's bot asking for our node info or an invoice.
pub fn classify(ids: &Identities, message: &FeedMessage) -> Option<Classified> {
    if message.is_reshare {
        return None;
    }
    let text = message.text.trim();
    if text.is_empty() {
        return None;
    }
    let text = text.to_uppercase();

    if message.author.id == ids.owner.id {
        let kind = first_keyword(&text, &CommandKind::HUMAN)?;
        let peer = message
            .mentions
            .iter()
            .find(|u| u.id != ids.me.id)
            .cloned();
        Some(Classified {
            kind,
            peer,
            bot: None,
        })
    } else {
        let kind = first_keyword(&text, &CommandKind::BOT)?;
        Some(Classified {
            kind,
            peer: None,
            bot: Some(message.author.clone()),
        })
    }
}

fn first_keyword(text: &str, kinds: &[CommandKind]) -> Option<CommandKind> {
    kinds.iter().copied().find(|k| text.contains(k.keyword()))
}
