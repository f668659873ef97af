//! SQLite-backed command and peer records.
//!
//! Every status transition is a compare-and-set on the command's
//! (`last_message_id`, `status`) pair, so a duplicate or concurrent reply can never
//! advance the same step twice.

use crate::model::{
    Command, CommandKind, CommandStatus, CommandView, NewCommand, Peer, StepGuard,
};
use chrono::{DateTime, SecondsFormat, Utc};
use lnf_feed::{MessageId, UserId};
use lnf_rpc::NodeAddress;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown command kind in store: {0}")]
    UnknownCommandKind(String),

    #[error("unknown command status in store: {0}")]
    UnknownStatus(String),

    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("store worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS peers (
    uid TEXT PRIMARY KEY,
    screen_name TEXT NOT NULL,
    bot_uid TEXT,
    bot_screen_name TEXT,
    node_pubkey TEXT,
    node_host TEXT,
    node_port INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS peers_bot_uid ON peers (bot_uid);

CREATE TABLE IF NOT EXISTS commands (
    message_id TEXT PRIMARY KEY,
    last_message_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    creator_id TEXT NOT NULL,
    peer_id TEXT,
    bot_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS commands_last_message_id ON commands (last_message_id);
"#;

const COMMAND_COLUMNS: &str = "message_id, last_message_id, kind, status, creator_id, peer_id, bot_id, created_at, updated_at";
const PEER_COLUMNS: &str =
    "uid, screen_name, bot_uid, bot_screen_name, node_pubkey, node_host, node_port, created_at";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))??;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Worker(format!("store connection poisoned: {e}")))?;
            f(&*guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// Insert a new command. `Ok(None)` when a command already exists for this root
    /// message, which happens when the transport re-delivers it.
    pub async fn create_command(&self, new: NewCommand) -> Result<Option<Command>> {
        self.with_conn(move |conn| {
            let now = timestamp(Utc::now());
            let inserted = conn.execute(
                r#"
INSERT OR IGNORE INTO commands
    (message_id, last_message_id, kind, status, creator_id, peer_id, bot_id, created_at, updated_at)
VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
"#,
                params![
                    new.message_id.as_str(),
                    new.kind.keyword(),
                    CommandStatus::New.as_str(),
                    new.creator_id.as_str(),
                    new.peer_id.as_deref(),
                    new.bot_id.as_deref(),
                    now,
                ],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            query_command(conn, "message_id = ?1", new.message_id.as_str())
        })
        .await
    }

    pub async fn get_command(&self, message_id: &MessageId) -> Result<Option<Command>> {
        let id = message_id.clone();
        self.with_conn(move |conn| query_command(conn, "message_id = ?1", id.as_str()))
            .await
    }

    /// The live command waiting on a reply to `reply_target`.
    pub async fn get_by_reply_target(&self, reply_target: &MessageId) -> Result<Option<Command>> {
        let id = reply_target.clone();
        self.with_conn(move |conn| {
            query_command(
                conn,
                "last_message_id = ?1 AND status NOT IN ('complete', 'failed')",
                id.as_str(),
            )
        })
        .await
    }

    /// Advance a command. Returns the updated command, or `None` when `guard` no longer
    /// matches the stored state.
    pub async fn update_status(
        &self,
        message_id: &MessageId,
        guard: &StepGuard,
        new_last_message_id: &MessageId,
        new_status: CommandStatus,
    ) -> Result<Option<Command>> {
        let id = message_id.clone();
        let guard = guard.clone();
        let new_last = new_last_message_id.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                r#"
UPDATE commands
   SET last_message_id = ?1,
       status = ?2,
       updated_at = ?3
 WHERE message_id = ?4
   AND last_message_id = ?5
   AND status = ?6
"#,
                params![
                    new_last.as_str(),
                    new_status.as_str(),
                    timestamp(Utc::now()),
                    id.as_str(),
                    guard.last_message_id.as_str(),
                    guard.status.as_str(),
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            query_command(conn, "message_id = ?1", id.as_str())
        })
        .await
    }

    /// Like [`Store::update_status`], also recording the counterpart's bot.
    pub async fn update_bot(
        &self,
        message_id: &MessageId,
        guard: &StepGuard,
        new_last_message_id: &MessageId,
        bot_id: &UserId,
        new_status: CommandStatus,
    ) -> Result<Option<Command>> {
        let id = message_id.clone();
        let guard = guard.clone();
        let new_last = new_last_message_id.clone();
        let bot_id = bot_id.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                r#"
UPDATE commands
   SET last_message_id = ?1,
       bot_id = ?2,
       status = ?3,
       updated_at = ?4
 WHERE message_id = ?5
   AND last_message_id = ?6
   AND status = ?7
"#,
                params![
                    new_last.as_str(),
                    bot_id.as_str(),
                    new_status.as_str(),
                    timestamp(Utc::now()),
                    id.as_str(),
                    guard.last_message_id.as_str(),
                    guard.status.as_str(),
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            query_command(conn, "message_id = ?1", id.as_str())
        })
        .await
    }

    /// The command joined with its peer: by `peer_id` when set, else by the peer
    /// whose linked bot is the command's `bot_id`.
    pub async fn get_full(&self, message_id: &MessageId) -> Result<Option<CommandView>> {
        let id = message_id.clone();
        self.with_conn(move |conn| {
            let Some(command) = query_command(conn, "message_id = ?1", id.as_str())? else {
                return Ok(None);
            };
            let peer = match (&command.peer_id, &command.bot_id) {
                (Some(peer_id), _) => query_peer(conn, "uid = ?1", peer_id.as_str())?,
                (None, Some(bot_id)) => query_peer(conn, "bot_uid = ?1", bot_id.as_str())?,
                (None, None) => None,
            };
            Ok(Some(CommandView { command, peer }))
        })
        .await
    }

    /// Most recently updated commands first.
    pub async fn list_commands(&self, limit: usize) -> Result<Vec<Command>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMAND_COLUMNS} FROM commands ORDER BY updated_at DESC, message_id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], CommandRow::from_row)?;
            let mut out: Vec<Command> = Vec::new();
            for row in rows {
                out.push(Command::try_from(row?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Commands still waiting on a reply, used to warm the reply-chain index.
    pub async fn list_live(&self) -> Result<Vec<Command>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMAND_COLUMNS} FROM commands WHERE status NOT IN ('complete', 'failed')"
            ))?;
            let rows = stmt.query_map([], CommandRow::from_row)?;
            let mut out: Vec<Command> = Vec::new();
            for row in rows {
                out.push(Command::try_from(row?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Mark unfinished commands untouched since `cutoff` as failed and return them.
    /// A `new` command whose first post never went out counts as unfinished.
    pub async fn fail_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Command>> {
        self.with_conn(move |conn| {
            let cutoff = timestamp(cutoff);
            let tx = conn.unchecked_transaction()?;
            let stale: Vec<Command> = {
                let mut stmt = tx.prepare(&format!(
                    r#"
SELECT {COMMAND_COLUMNS}
  FROM commands
 WHERE status IN ('new', 'bot-req', 'bot-ack', 'data-req', 'data-ack')
   AND updated_at < ?1
"#
                ))?;
                let rows = stmt.query_map(params![cutoff], CommandRow::from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(Command::try_from(row?)?);
                }
                out
            };
            let now = timestamp(Utc::now());
            let mut failed = Vec::with_capacity(stale.len());
            for mut command in stale {
                tx.execute(
                    r#"
UPDATE commands
   SET status = 'failed',
       updated_at = ?1
 WHERE message_id = ?2
   AND status = ?3
"#,
                    params![now, command.message_id.as_str(), command.status.as_str()],
                )?;
                command.status = CommandStatus::Failed;
                failed.push(command);
            }
            tx.commit()?;
            Ok(failed)
        })
        .await
    }

    pub async fn get_peer_by_uid(&self, uid: &UserId) -> Result<Option<Peer>> {
        let uid = uid.clone();
        self.with_conn(move |conn| query_peer(conn, "uid = ?1", uid.as_str()))
            .await
    }

    pub async fn get_peer_by_bot_uid(&self, bot_uid: &UserId) -> Result<Option<Peer>> {
        let bot_uid = bot_uid.clone();
        self.with_conn(move |conn| query_peer(conn, "bot_uid = ?1", bot_uid.as_str()))
            .await
    }

    /// Create a peer on first sighting. An existing record is returned unchanged.
    pub async fn create_peer(&self, uid: &UserId, screen_name: &str) -> Result<Peer> {
        let uid = uid.clone();
        let screen_name = screen_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO peers (uid, screen_name, created_at) VALUES (?1, ?2, ?3)",
                params![uid.as_str(), screen_name, timestamp(Utc::now())],
            )?;
            query_peer(conn, "uid = ?1", uid.as_str())?.ok_or_else(|| StoreError::Corrupt {
                table: "peers",
                detail: format!("peer {uid} missing after insert"),
            })
        })
        .await
    }

    pub async fn link_bot(
        &self,
        peer_uid: &UserId,
        bot_uid: &UserId,
        bot_screen_name: &str,
    ) -> Result<bool> {
        let peer_uid = peer_uid.clone();
        let bot_uid = bot_uid.clone();
        let bot_screen_name = bot_screen_name.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE peers SET bot_uid = ?1, bot_screen_name = ?2 WHERE uid = ?3",
                params![bot_uid.as_str(), bot_screen_name, peer_uid.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    pub async fn set_node(&self, peer_uid: &UserId, node: &NodeAddress) -> Result<bool> {
        let peer_uid = peer_uid.clone();
        let node = node.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE peers SET node_pubkey = ?1, node_host = ?2, node_port = ?3 WHERE uid = ?4",
                params![node.pubkey, node.host, node.port, peer_uid.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn query_command(conn: &Connection, predicate: &str, arg: &str) -> Result<Option<Command>> {
    let row = conn
        .query_row(
            &format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE {predicate} LIMIT 1"),
            params![arg],
            CommandRow::from_row,
        )
        .optional()?;
    row.map(Command::try_from).transpose()
}

fn query_peer(conn: &Connection, predicate: &str, arg: &str) -> Result<Option<Peer>> {
    let row = conn
        .query_row(
            &format!("SELECT {PEER_COLUMNS} FROM peers WHERE {predicate} LIMIT 1"),
            params![arg],
            PeerRow::from_row,
        )
        .optional()?;
    row.map(Peer::try_from).transpose()
}

struct CommandRow {
    message_id: String,
    last_message_id: String,
    kind: String,
    status: String,
    creator_id: String,
    peer_id: Option<String>,
    bot_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CommandRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            last_message_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            creator_id: row.get(4)?,
            peer_id: row.get(5)?,
            bot_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

impl TryFrom<CommandRow> for Command {
    type Error = StoreError;

    fn try_from(row: CommandRow) -> Result<Self> {
        Ok(Command {
            kind: row
                .kind
                .parse::<CommandKind>()
                .map_err(StoreError::UnknownCommandKind)?,
            status: row
                .status
                .parse::<CommandStatus>()
                .map_err(StoreError::UnknownStatus)?,
            created_at: parse_timestamp("commands", &row.created_at)?,
            updated_at: parse_timestamp("commands", &row.updated_at)?,
            message_id: row.message_id.into(),
            last_message_id: row.last_message_id.into(),
            creator_id: row.creator_id.into(),
            peer_id: row.peer_id.map(UserId::from),
            bot_id: row.bot_id.map(UserId::from),
        })
    }
}

struct PeerRow {
    uid: String,
    screen_name: String,
    bot_uid: Option<String>,
    bot_screen_name: Option<String>,
    node_pubkey: Option<String>,
    node_host: Option<String>,
    node_port: Option<i64>,
    created_at: String,
}

impl PeerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(0)?,
            screen_name: row.get(1)?,
            bot_uid: row.get(2)?,
            bot_screen_name: row.get(3)?,
            node_pubkey: row.get(4)?,
            node_host: row.get(5)?,
            node_port: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<PeerRow> for Peer {
    type Error = StoreError;

    fn try_from(row: PeerRow) -> Result<Self> {
        let node = match (row.node_pubkey, row.node_host, row.node_port) {
            (Some(pubkey), Some(host), Some(port)) => {
                let port = u16::try_from(port).map_err(|_| StoreError::Corrupt {
                    table: "peers",
                    detail: format!("node port out of range: {port}"),
                })?;
                Some(NodeAddress { pubkey, host, port })
            }
            _ => None,
        };
        Ok(Peer {
            created_at: parse_timestamp("peers", &row.created_at)?,
            uid: row.uid.into(),
            screen_name: row.screen_name,
            bot_uid: row.bot_uid.map(UserId::from),
            bot_screen_name: row.bot_screen_name,
            node,
        })
    }
}
