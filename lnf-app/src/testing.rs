//! In-memory feed and node doubles for negotiation tests.

use crate::classifier::classify;
use crate::context::{AppContext, Identities};
use crate::model::{Command, CommandView};
use crate::negotiation::Negotiator;
use crate::resolver::record_new_command;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use lnf_feed::{FeedClient, FeedMessage, MessageId, User};
use lnf_rpc::{DecodedPayment, NodeAddress, NodeBinding, NodeInfo, NodeRpc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const PEER_PUBKEY: &str = "02a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
pub const OUR_PUBKEY: &str = "03ffeeddccbbaa99887766554433221100ffeeddccbbaa998877665544332211aa";
pub const OUR_URI: &str =
    "03ffeeddccbbaa99887766554433221100ffeeddccbbaa998877665544332211aa@203.0.113.1:9735";
pub const FAKE_INVOICE: &str = "lnbc21u1pjfakeinvoicexyz";

pub fn user(id: &str, screen_name: &str) -> User {
    User::new(id, screen_name)
}

pub fn identities() -> Identities {
    Identities {
        me: user("1", "lnfeedbot"),
        owner: user("10", "owner"),
    }
}

pub fn message(id: &str, author: &User, text: &str) -> FeedMessage {
    FeedMessage {
        id: id.into(),
        author: author.clone(),
        text: text.to_string(),
        in_reply_to: None,
        mentions: Vec::new(),
        is_reshare: false,
        received_at: Utc::now(),
    }
}

pub trait MessageBuilder {
    fn mentioning(self, users: &[&User]) -> Self;
    fn replying_to(self, target: &MessageId) -> Self;
}

impl MessageBuilder for FeedMessage {
    fn mentioning(mut self, users: &[&User]) -> Self {
        self.mentions = users.iter().map(|u| (*u).clone()).collect();
        self
    }

    fn replying_to(mut self, target: &MessageId) -> Self {
        self.in_reply_to = Some(target.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub id: MessageId,
    pub body: String,
    pub reply_to: Option<MessageId>,
}

pub struct FakeFeed {
    me: User,
    next_id: AtomicU64,
    fail_posts: AtomicBool,
    posts: Mutex<Vec<Posted>>,
    messages: Mutex<HashMap<MessageId, FeedMessage>>,
    inbound: Mutex<Vec<FeedMessage>>,
}

impl FakeFeed {
    pub fn new(me: User) -> Self {
        Self {
            me,
            next_id: AtomicU64::new(9000),
            fail_posts: AtomicBool::new(false),
            posts: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Vec::new()),
        }
    }

    /// Make `message` visible to `lookup_message`.
    pub fn publish(&self, message: FeedMessage) {
        self.messages
            .lock()
            .expect("messages lock")
            .insert(message.id.clone(), message);
    }

    /// Deliver `message` through the stream once `start` is called.
    pub fn queue_inbound(&self, message: FeedMessage) {
        self.inbound.lock().expect("inbound lock").push(message);
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn posts(&self) -> Vec<Posted> {
        self.posts.lock().expect("posts lock").clone()
    }

    pub fn last_post(&self) -> Posted {
        self.posts().pop().expect("at least one post")
    }
}

#[async_trait]
impl FeedClient for FakeFeed {
    fn feed_id(&self) -> &str {
        "fake"
    }

    async fn whoami(&self) -> anyhow::Result<User> {
        Ok(self.me.clone())
    }

    async fn lookup_user(&self, screen_name: &str) -> anyhow::Result<User> {
        Ok(User::new(format!("uid-{screen_name}"), screen_name))
    }

    async fn lookup_message(&self, id: &MessageId) -> anyhow::Result<Option<FeedMessage>> {
        Ok(self.messages.lock().expect("messages lock").get(id).cloned())
    }

    async fn post(&self, body: &str, reply_to: Option<&MessageId>) -> anyhow::Result<MessageId> {
        if self.fail_posts.load(Ordering::SeqCst) {
            anyhow::bail!("post rejected: 503 Service Unavailable");
        }
        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        let mut posted = message(id.as_str(), &self.me, body);
        posted.in_reply_to = reply_to.cloned();
        self.publish(posted);
        self.posts.lock().expect("posts lock").push(Posted {
            id: id.clone(),
            body: body.to_string(),
            reply_to: reply_to.cloned(),
        });
        Ok(id)
    }

    async fn start(&self, _track: &str, tx: mpsc::Sender<FeedMessage>) -> anyhow::Result<()> {
        let queued = std::mem::take(&mut *self.inbound.lock().expect("inbound lock"));
        for message in queued {
            tx.send(message).await?;
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRpc {
    calls: Mutex<Vec<String>>,
}

impl FakeRpc {
    /// Action calls in order. `getinfo` is not recorded.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl NodeRpc for FakeRpc {
    async fn get_info(&self) -> lnf_rpc::Result<NodeInfo> {
        Ok(NodeInfo {
            id: OUR_PUBKEY.to_string(),
            alias: Some("lnfeed-test".to_string()),
            network: Some("regtest".to_string()),
            blockheight: Some(100),
            num_peers: Some(0),
            address: vec![NodeBinding {
                kind: "ipv4".to_string(),
                address: Some("203.0.113.1".to_string()),
                port: Some(9735),
            }],
            binding: Vec::new(),
        })
    }

    async fn get_invoice(
        &self,
        amount_sat: u64,
        label: &str,
        description: &str,
    ) -> lnf_rpc::Result<String> {
        self.record(format!("invoice {amount_sat} {label} {description}"));
        Ok(FAKE_INVOICE.to_string())
    }

    async fn connect(&self, node: &NodeAddress) -> lnf_rpc::Result<String> {
        self.record(format!("connect {node}"));
        Ok(format!("Connected to {}", node.pubkey))
    }

    async fn pay(&self, bolt11: &str) -> lnf_rpc::Result<String> {
        self.record(format!("pay {bolt11}"));
        Ok("Payment complete 1500 sat, preimage 00".to_string())
    }

    async fn decode_pay(&self, bolt11: &str) -> lnf_rpc::Result<DecodedPayment> {
        self.record(format!("decodepay {bolt11}"));
        Ok(DecodedPayment {
            amount_msat: Some(1_500_000),
            description: Some("for the pizza".to_string()),
            payee: Some(PEER_PUBKEY.to_string()),
            payment_hash: None,
            expiry: Some(3600),
        })
    }

    async fn fund_channel(&self, pubkey: &str) -> lnf_rpc::Result<String> {
        self.record(format!("fundchannel {pubkey}"));
        Ok(format!("Funded channel with {pubkey}"))
    }
}

pub struct Harness {
    pub ids: Identities,
    pub ctx: Arc<AppContext>,
    pub feed: Arc<FakeFeed>,
    pub rpc: Arc<FakeRpc>,
    pub negotiator: Negotiator,
}

impl Harness {
    /// Classify and record `root` the way the watch loop would.
    pub async fn record(&self, root: &FeedMessage) -> CommandView {
        let classified = classify(&self.ids, root).expect("root is a command");
        record_new_command(
            &self.ctx.store,
            classified.kind,
            &root.id,
            &root.author,
            classified.peer.as_ref(),
            classified.bot.as_ref(),
        )
        .await
        .expect("record")
        .expect("new command")
    }

    pub async fn command(&self, id: &str) -> Command {
        self.ctx
            .store
            .get_command(&id.into())
            .await
            .expect("lookup")
            .expect("command exists")
    }
}

pub async fn harness() -> Harness {
    let ids = identities();
    let feed = Arc::new(FakeFeed::new(ids.me.clone()));
    let rpc = Arc::new(FakeRpc::default());
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let ctx = Arc::new(AppContext::new(
        ids.clone(),
        Arc::clone(&feed) as Arc<dyn FeedClient>,
        Arc::clone(&rpc) as Arc<dyn NodeRpc>,
        store,
    ));
    Harness {
        ids,
        negotiator: Negotiator::new(Arc::clone(&ctx)),
        ctx,
        feed,
        rpc,
    }
}
