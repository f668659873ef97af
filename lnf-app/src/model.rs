//! Negotiation records: commands and the peers they run against.

use chrono::{DateTime, Utc};
use lnf_feed::{MessageId, UserId};
use lnf_rpc::NodeAddress;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    Connect,
    Pay,
    FundChannel,
    GetInfo,
    GetInvoice,
}

impl CommandKind {
    /// Intents only the owner may originate, in match priority order.
    pub const HUMAN: [CommandKind; 3] = [Self::Connect, Self::Pay, Self::FundChannel];
    /// Requests any counterpart bot may send us, in match priority order.
    pub const BOT: [CommandKind; 2] = [Self::GetInfo, Self::GetInvoice];

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Pay => "PAY",
            Self::FundChannel => "FUNDCHANNEL",
            Self::GetInfo => "GETINFO",
            Self::GetInvoice => "GETINVOICE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::HUMAN
            .into_iter()
            .chain(Self::BOT)
            .find(|k| k.keyword() == s)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    New,
    BotReq,
    BotAck,
    DataReq,
    DataAck,
    Complete,
    /// Given up on by the stale-negotiation sweep.
    Failed,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 7] = [
        Self::New,
        Self::BotReq,
        Self::BotAck,
        Self::DataReq,
        Self::DataAck,
        Self::Complete,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::BotReq => "bot-req",
            Self::BotAck => "bot-ack",
            Self::DataReq => "data-req",
            Self::DataAck => "data-ack",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    /// Root of the reply chain; primary key.
    pub message_id: MessageId,
    /// The message we are waiting on a reply to.
    pub last_message_id: MessageId,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub creator_id: UserId,
    pub peer_id: Option<UserId>,
    pub bot_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// The position a transition must start from.
    pub fn guard(&self) -> StepGuard {
        StepGuard {
            last_message_id: self.last_message_id.clone(),
            status: self.status,
        }
    }

    pub fn is_expected_replier(&self, uid: &UserId) -> bool {
        self.peer_id.as_ref() == Some(uid) || self.bot_id.as_ref() == Some(uid)
    }
}

/// Compare-and-set precondition for a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGuard {
    pub last_message_id: MessageId,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub uid: UserId,
    pub screen_name: String,
    pub bot_uid: Option<UserId>,
    pub bot_screen_name: Option<String>,
    pub node: Option<NodeAddress>,
    pub created_at: DateTime<Utc>,
}

impl Peer {
    pub fn handle(&self) -> String {
        format!("@{}", self.screen_name)
    }

    pub fn bot_handle(&self) -> Option<String> {
        self.bot_screen_name.as_deref().map(|name| format!("@{name}"))
    }
}

/// A command joined with its counterpart peer, when one is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandView {
    pub command: Command,
    pub peer: Option<Peer>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub message_id: MessageId,
    pub kind: CommandKind,
    pub creator_id: UserId,
    pub peer_id: Option<UserId>,
    pub bot_id: Option<UserId>,
}
