//! Free-text extraction for lnfeed.
//!
//! Pulls amounts, descriptions, node URIs and payment requests out of short feed
//! messages. Extraction never looks at message metadata, only the body text.

mod error;
mod node;
mod payment;

pub use error::{ParseError, Result};
pub use node::{DEFAULT_LIGHTNING_PORT, NodeUri, extract_node_info, extract_pubkey, extract_uri};
pub use payment::{DEFAULT_DESCRIPTION, PaymentTerms, extract_payment, extract_payment_request};
