use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of a Lightning node: `pubkey@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub pubkey: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(pubkey: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            pubkey: pubkey.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "{}@[{}]:{}", self.pubkey, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.pubkey, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBinding {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub blockheight: Option<u64>,
    #[serde(default)]
    pub num_peers: Option<u64>,
    /// Announced addresses.
    #[serde(default)]
    pub address: Vec<NodeBinding>,
    /// Local bindings, used when nothing is announced.
    #[serde(default)]
    pub binding: Vec<NodeBinding>,
}

impl NodeInfo {
    /// Connection string other nodes can dial. Falls back to the bare node id when
    /// the node neither announces nor binds a reachable address.
    pub fn uri(&self) -> String {
        let reachable = self
            .address
            .iter()
            .chain(self.binding.iter())
            .find_map(|b| match (b.address.as_deref(), b.port) {
                (Some(address), Some(port)) if !address.trim().is_empty() => {
                    Some(NodeAddress::new(self.id.clone(), address.trim(), port))
                }
                _ => None,
            });
        match reachable {
            Some(node) => node.to_string(),
            None => self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedPayment {
    #[serde(default)]
    pub amount_msat: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub payment_hash: Option<String>,
    #[serde(default)]
    pub expiry: Option<u64>,
}
