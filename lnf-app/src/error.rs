use crate::model::{CommandKind, CommandStatus};
use crate::store::StoreError;
use lnf_feed::{MessageId, UserId};
use lnf_parse::ParseError;
use lnf_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{replier} may not continue command {command}")]
    UnauthorizedReplier { command: MessageId, replier: UserId },

    #[error("command {command} has no {missing}")]
    MissingCounterpart {
        command: MessageId,
        missing: &'static str,
    },

    #[error("no {kind} handler for status {status}")]
    InvalidTransition {
        kind: CommandKind,
        status: CommandStatus,
    },

    #[error("root message {0} of the negotiation is no longer available")]
    RootMessageMissing(MessageId),

    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Extraction(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, NegotiationError>;
