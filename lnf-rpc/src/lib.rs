//! Lightning node RPC for lnfeed.
//!
//! The negotiation core only sees the `NodeRpc` trait; `ClnRestClient` talks to a
//! Core Lightning node through its REST plugin.

mod client;
mod cln;
mod error;
mod types;

pub use client::NodeRpc;
pub use cln::ClnRestClient;
pub use error::{Result, RpcError};
pub use types::{DecodedPayment, NodeAddress, NodeBinding, NodeInfo};
