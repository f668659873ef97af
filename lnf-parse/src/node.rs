use crate::error::{ParseError, Result};
use regex::Regex;
use std::sync::LazyLock;

pub const DEFAULT_LIGHTNING_PORT: u16 = 9735;

/// Parts of a `pubkey@host[:port]` node uri.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUri {
    pub pubkey: String,
    pub host: String,
    pub port: u16,
}

static NODE_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(?P<pubkey>0[23][0-9a-fA-F]{64})
        (?:@(?P<host>\[[0-9a-fA-F:.]+\]|[A-Za-z0-9][A-Za-z0-9.\-]*)
            (?::(?P<port>[0-9]+))?
        )?",
    )
    .expect("static node uri regex")
});

/// First `pubkey[@host[:port]]` token in `text`.
pub fn extract_uri(text: &str) -> Result<String> {
    NODE_URI_RE
        .find(text)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .ok_or(ParseError::MissingNodeUri)
}

/// Split a node uri into its parts. The port defaults to 9735.
pub fn extract_node_info(uri: &str) -> Result<NodeUri> {
    let caps = NODE_URI_RE
        .captures(uri)
        .ok_or(ParseError::MissingNodeUri)?;
    let pubkey = caps["pubkey"].to_ascii_lowercase();
    let host = caps
        .name("host")
        .map(|m| {
            m.as_str()
                .trim_end_matches('.')
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string()
        })
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::MissingHost(uri.trim().to_string()))?;
    let port = match caps.name("port") {
        Some(m) => m
            .as_str()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ParseError::InvalidPort(m.as_str().to_string()))?,
        None => DEFAULT_LIGHTNING_PORT,
    };
    Ok(NodeUri { pubkey, host, port })
}

/// Node public key from a uri or a bare key.
pub fn extract_pubkey(text: &str) -> Result<String> {
    NODE_URI_RE
        .captures(text)
        .map(|c| c["pubkey"].to_ascii_lowercase())
        .ok_or(ParseError::MissingNodeUri)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &str = "02a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

    #[test]
    fn uri_with_host_and_port_is_split() {
        let reply = format!("@lnfeedbot {PUBKEY}@203.0.113.5:19735");
        let uri = extract_uri(&reply).expect("uri");
        assert_eq!(uri, format!("{PUBKEY}@203.0.113.5:19735"));

        let node = extract_node_info(&uri).expect("node");
        assert_eq!(node.pubkey, PUBKEY);
        assert_eq!(node.host, "203.0.113.5");
        assert_eq!(node.port, 19735);
    }

    #[test]
    fn missing_port_defaults_and_sentence_period_is_dropped() {
        let uri = extract_uri(&format!("my node is {PUBKEY}@node.example.com.")).expect("uri");
        let node = extract_node_info(&uri).expect("node");
        assert_eq!(node.host, "node.example.com");
        assert_eq!(node.port, DEFAULT_LIGHTNING_PORT);
    }

    #[test]
    fn bracketed_ipv6_host_is_unwrapped() {
        let node = extract_node_info(&format!("{PUBKEY}@[2001:db8::1]:9736")).expect("node");
        assert_eq!(node.host, "2001:db8::1");
        assert_eq!(node.port, 9736);
    }

    #[test]
    fn bare_pubkey_has_no_host_but_still_yields_a_key() {
        let upper = PUBKEY.to_ascii_uppercase();
        assert_eq!(extract_pubkey(&format!("id: {upper}")).expect("pubkey"), PUBKEY);
        assert!(matches!(
            extract_node_info(PUBKEY),
            Err(ParseError::MissingHost(_))
        ));
    }

    #[test]
    fn invalid_port_and_missing_uri_are_errors() {
        assert!(matches!(
            extract_node_info(&format!("{PUBKEY}@host:70000")),
            Err(ParseError::InvalidPort(_))
        ));
        assert_eq!(extract_uri("nothing here"), Err(ParseError::MissingNodeUri));
    }
}
