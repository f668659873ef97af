//! Feed transport for lnfeed.
//!
//! Adapters are pure I/O: they convert platform statuses to/from lnfeed
//! `FeedMessage` values and post threaded replies.

mod http;
mod traits;
mod types;

pub use http::HttpFeedAdapter;
pub use traits::FeedClient;
pub use types::{FeedMessage, MessageId, User, UserId};
