//! Process-scoped state, built once at startup and passed to every component.

use crate::store::Store;
use crate::tracker::ReplyChainTracker;
use lnf_feed::{FeedClient, User};
use lnf_rpc::NodeRpc;
use std::sync::Arc;

/// Who we are on the feed, and who we take orders from.
#[derive(Debug, Clone)]
pub struct Identities {
    pub me: User,
    pub owner: User,
}

pub struct AppContext {
    pub identities: Identities,
    pub feed: Arc<dyn FeedClient>,
    pub rpc: Arc<dyn NodeRpc>,
    pub store: Arc<Store>,
    pub tracker: Arc<ReplyChainTracker>,
}

impl AppContext {
    pub fn new(
        identities: Identities,
        feed: Arc<dyn FeedClient>,
        rpc: Arc<dyn NodeRpc>,
        store: Arc<Store>,
    ) -> Self {
        let tracker = Arc::new(ReplyChainTracker::new(Arc::clone(&store)));
        Self {
            identities,
            feed,
            rpc,
            store,
            tracker,
        }
    }
}
