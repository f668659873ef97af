use crate::error::Result;
use crate::types::{DecodedPayment, NodeAddress, NodeInfo};
use async_trait::async_trait;

/// Node operations the negotiation engine can trigger.
///
/// `connect`, `pay` and `fund_channel` return a short human-readable summary that is
/// posted back to the feed as-is.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// `pubkey@host:port` of the local node.
    async fn get_uri(&self) -> Result<String> {
        Ok(self.get_info().await?.uri())
    }

    async fn get_info(&self) -> Result<NodeInfo>;

    /// Create an invoice and return its BOLT11 payment request.
    async fn get_invoice(&self, amount_sat: u64, label: &str, description: &str)
    -> Result<String>;

    async fn connect(&self, node: &NodeAddress) -> Result<String>;

    async fn pay(&self, bolt11: &str) -> Result<String>;

    async fn decode_pay(&self, bolt11: &str) -> Result<DecodedPayment>;

    async fn fund_channel(&self, pubkey: &str) -> Result<String>;
}
