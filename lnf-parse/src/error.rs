use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no payment amount in message")]
    MissingAmount,

    #[error("invalid payment amount: {0}")]
    InvalidAmount(String),

    #[error("no node uri in message")]
    MissingNodeUri,

    #[error("node uri has no host: {0}")]
    MissingHost(String),

    #[error("invalid node port: {0}")]
    InvalidPort(String),

    #[error("no payment request in message")]
    MissingPaymentRequest,
}
