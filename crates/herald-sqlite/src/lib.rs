//! SQLite implementation of the persistence ports.
//!
//! One connection behind a mutex. Statements run on the blocking pool, so a busy
//! database file never stalls the runtime and callers' timeouts still fire.
//! Counter increments, interaction upserts and claims are single statements, so
//! they stay atomic even if several processes share the database file.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_core::{
    domain::Platform,
    generation::types::Role,
    store::{
        merge_metadata,
        port::{ConversationStore, InteractionStore, UsageStore},
        types::{
            Conversation, ConversationMessage, Interaction, InteractionKind, NewInteraction,
            ProcessedMark, UsageKey,
        },
    },
    Error, Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_counters (
    platform TEXT NOT NULL,
    op TEXT NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (platform, op, day)
);

CREATE TABLE IF NOT EXISTS interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    external_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    author_id TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    response_sent INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT,
    claimed_at TEXT,
    UNIQUE (platform, external_id)
);

CREATE INDEX IF NOT EXISTS idx_interactions_sent
    ON interactions (platform, response_sent, processed_at);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations (id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
";

const INTERACTION_COLUMNS: &str = "id, platform, external_id, kind, author_id, processed, \
     response_sent, metadata, created_at, updated_at, processed_at, claimed_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Ledger("sqlite connection lock poisoned".to_string()))?;
            f(&*guard)
        })
        .await
        .map_err(|e| Error::Ledger(format!("sqlite task failed: {e}")))?
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Ledger(format!("sqlite: {e}"))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Ledger(format!("bad timestamp {s:?}: {e}")))
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn usage(&self, key: UsageKey) -> Result<u64> {
        self.run(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM usage_counters WHERE platform = ?1 AND op = ?2 AND day = ?3",
                    params![key.platform.as_str(), key.op.as_str(), key.day.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(count.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn increment(&self, key: UsageKey, n: u64) -> Result<u64> {
        self.run(move |conn| {
            let count: i64 = conn
                .query_row(
                    "INSERT INTO usage_counters (platform, op, day, count) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (platform, op, day) DO UPDATE SET count = count + excluded.count
                     RETURNING count",
                    params![
                        key.platform.as_str(),
                        key.op.as_str(),
                        key.day.to_string(),
                        n as i64
                    ],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

struct InteractionRow {
    id: i64,
    platform: String,
    external_id: String,
    kind: String,
    author_id: String,
    processed: bool,
    response_sent: bool,
    metadata: String,
    created_at: String,
    updated_at: String,
    processed_at: Option<String>,
    claimed_at: Option<String>,
}

impl InteractionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            platform: row.get(1)?,
            external_id: row.get(2)?,
            kind: row.get(3)?,
            author_id: row.get(4)?,
            processed: row.get(5)?,
            response_sent: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            processed_at: row.get(10)?,
            claimed_at: row.get(11)?,
        })
    }

    fn into_interaction(self) -> Result<Interaction> {
        Ok(Interaction {
            id: self.id as u64,
            platform: Platform::parse(&self.platform)
                .ok_or_else(|| Error::Ledger(format!("unknown platform {}", self.platform)))?,
            external_id: self.external_id,
            kind: InteractionKind::parse(&self.kind)
                .ok_or_else(|| Error::Ledger(format!("unknown interaction kind {}", self.kind)))?,
            author_id: self.author_id,
            processed: self.processed,
            response_sent: self.response_sent,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            processed_at: self.processed_at.as_deref().map(parse_ts).transpose()?,
            claimed_at: self.claimed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn interaction_exists(conn: &Connection, platform: Platform, external_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM interactions WHERE platform = ?1 AND external_id = ?2)",
        params![platform.as_str(), external_id],
        |row| row.get(0),
    )
    .map_err(db_err)
}

#[async_trait]
impl InteractionStore for SqliteStore {
    async fn get(&self, platform: Platform, external_id: &str) -> Result<Option<Interaction>> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {INTERACTION_COLUMNS} FROM interactions
                         WHERE platform = ?1 AND external_id = ?2"
                    ),
                    params![platform.as_str(), external_id],
                    InteractionRow::from_row,
                )
                .optional()
                .map_err(db_err)?;
            row.map(InteractionRow::into_interaction).transpose()
        })
        .await
    }

    async fn upsert(&self, new: NewInteraction) -> Result<u64> {
        self.run(move |conn| {
            let id: i64 = conn
                .query_row(
                    "INSERT INTO interactions
                        (platform, external_id, kind, author_id, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT (platform, external_id) DO UPDATE SET
                        metadata = json_patch(metadata, excluded.metadata),
                        updated_at = excluded.updated_at
                     RETURNING id",
                    params![
                        new.platform.as_str(),
                        new.external_id,
                        new.kind.as_str(),
                        new.author_id,
                        new.metadata.to_string(),
                        ts(new.at)
                    ],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(id as u64)
        })
        .await
    }

    async fn claim(
        &self,
        platform: Platform,
        external_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE interactions SET claimed_at = ?1
                     WHERE platform = ?2 AND external_id = ?3 AND processed = 0
                       AND (claimed_at IS NULL OR claimed_at < ?4)",
                    params![ts(at), platform.as_str(), external_id, ts(stale_before)],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, platform: Platform, external_id: &str) -> Result<()> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE interactions SET claimed_at = NULL
                 WHERE platform = ?1 AND external_id = ?2 AND processed = 0",
                params![platform.as_str(), external_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn mark_processed(
        &self,
        platform: Platform,
        external_id: &str,
        mark: ProcessedMark,
    ) -> Result<bool> {
        let mut patch = mark.metadata.clone();
        if let Some(conv) = &mark.conversation_id {
            merge_metadata(&mut patch, &serde_json::json!({ "conversation_id": conv }));
        }
        let external_id = external_id.to_string();

        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE interactions SET
                        processed = 1,
                        response_sent = ?1,
                        processed_at = ?2,
                        updated_at = ?2,
                        claimed_at = NULL,
                        metadata = json_patch(metadata, ?3)
                     WHERE platform = ?4 AND external_id = ?5 AND processed = 0",
                    params![
                        mark.response_sent,
                        ts(mark.at),
                        patch.to_string(),
                        platform.as_str(),
                        external_id
                    ],
                )
                .map_err(db_err)?;
            if changed > 0 {
                return Ok(true);
            }
            if interaction_exists(conn, platform, &external_id)? {
                Ok(false)
            } else {
                Err(Error::Ledger(format!(
                    "no interaction {platform}:{external_id} to mark"
                )))
            }
        })
        .await
    }

    async fn count_responses_since(&self, platform: Platform, since: DateTime<Utc>) -> Result<u64> {
        self.run(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM interactions
                     WHERE platform = ?1 AND response_sent = 1 AND processed_at >= ?2",
                    params![platform.as_str(), ts(since)],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(n.max(0) as u64)
        })
        .await
    }
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let head: Option<(String, String, String)> = conn
        .query_row(
            "SELECT platform, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((platform, created_at, updated_at)) = head else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT role, content, metadata, created_at FROM conversation_messages
             WHERE conversation_id = ?1 ORDER BY id",
        )
        .map_err(db_err)?;
    let raw = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    let mut messages = Vec::with_capacity(raw.len());
    for (role, content, metadata, at) in raw {
        messages.push(ConversationMessage {
            role: Role::parse(&role)
                .ok_or_else(|| Error::Ledger(format!("unknown role {role}")))?,
            content,
            metadata: serde_json::from_str(&metadata)?,
            created_at: parse_ts(&at)?,
        });
    }

    Ok(Some(Conversation {
        id: id.to_string(),
        platform: Platform::parse(&platform)
            .ok_or_else(|| Error::Ledger(format!("unknown platform {platform}")))?,
        messages,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    }))
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_or_create(
        &self,
        platform: Platform,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversation> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, platform, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id, platform.as_str(), ts(at)],
            )
            .map_err(db_err)?;
            load_conversation(conn, &id)?
                .ok_or_else(|| Error::Ledger(format!("conversation {id} vanished")))
        })
        .await
    }

    async fn append(&self, id: &str, message: ConversationMessage) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let at = ts(message.created_at);
            let touched = conn
                .execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![at, id],
                )
                .map_err(db_err)?;
            if touched == 0 {
                return Err(Error::Ledger(format!("no conversation {id}")));
            }
            conn.execute(
                "INSERT INTO conversation_messages (conversation_id, role, content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    message.role.as_str(),
                    message.content,
                    message.metadata.to_string(),
                    at
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.run(move |conn| load_conversation(conn, &id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use herald_core::domain::OpKind;
    use serde_json::json;
    use std::sync::Arc;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, h, m, 0).unwrap()
    }

    fn new_interaction(id: &str, metadata: serde_json::Value) -> NewInteraction {
        NewInteraction {
            platform: Platform::Twitter,
            external_id: id.to_string(),
            kind: InteractionKind::TargetPost,
            author_id: "7".to_string(),
            metadata,
            at: t(9, 0),
        }
    }

    fn mark(sent: bool, at: DateTime<Utc>) -> ProcessedMark {
        ProcessedMark {
            response_sent: sent,
            conversation_id: None,
            metadata: json!({}),
            at,
        }
    }

    #[tokio::test]
    async fn increments_accumulate_per_day() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let key = UsageKey {
            platform: Platform::Twitter,
            op: OpKind::Write,
            day: t(0, 0).date_naive(),
        };
        assert_eq!(store.usage(key).await.unwrap(), 0);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.increment(key, 1).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.increment(key, 2).await.unwrap(), 22);

        let tomorrow = UsageKey {
            day: key.day.succ_opt().unwrap(),
            ..key
        };
        assert_eq!(store.usage(tomorrow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn held_connection_does_not_stall_the_runtime() {
        let store = SqliteStore::in_memory().unwrap();
        let key = UsageKey {
            platform: Platform::Twitter,
            op: OpKind::Read,
            day: t(0, 0).date_naive(),
        };

        let guard = store.conn.lock().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), store.usage(key)).await;
        assert!(waited.is_err(), "timeout fires while the connection is busy");
        drop(guard);

        assert_eq!(store.usage(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_merges_metadata_and_never_clears_processed() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store
            .upsert(new_interaction("p1", json!({ "batch": 2 })))
            .await
            .unwrap();
        assert!(store
            .mark_processed(
                Platform::Twitter,
                "p1",
                ProcessedMark {
                    response_sent: true,
                    conversation_id: Some("twitter:p1".into()),
                    metadata: json!({ "reply_id": "r9" }),
                    at: t(9, 30),
                },
            )
            .await
            .unwrap());

        let b = store
            .upsert(new_interaction("p1", json!({ "seen_again": true })))
            .await
            .unwrap();
        assert_eq!(a, b);

        let row = store.get(Platform::Twitter, "p1").await.unwrap().unwrap();
        assert!(row.processed && row.response_sent);
        assert_eq!(row.processed_at, Some(t(9, 30)));
        assert_eq!(row.metadata["batch"], 2);
        assert_eq!(row.metadata["reply_id"], "r9");
        assert_eq!(row.metadata["conversation_id"], "twitter:p1");
        assert_eq!(row.metadata["seen_again"], true);
    }

    #[tokio::test]
    async fn mark_flips_once_and_unknown_rows_error() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert(new_interaction("p2", json!({})))
            .await
            .unwrap();
        assert!(store
            .mark_processed(Platform::Twitter, "p2", mark(false, t(10, 0)))
            .await
            .unwrap());
        assert!(!store
            .mark_processed(Platform::Twitter, "p2", mark(true, t(10, 1)))
            .await
            .unwrap());
        let row = store.get(Platform::Twitter, "p2").await.unwrap().unwrap();
        assert!(!row.response_sent);

        assert!(store
            .mark_processed(Platform::Twitter, "ghost", mark(true, t(10, 0)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_cleared_by_marking() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(!store
            .claim(Platform::Twitter, "q1", t(11, 0), t(10, 45))
            .await
            .unwrap());
        store.upsert(new_interaction("q1", json!({}))).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim(Platform::Twitter, "q1", t(11, 0), t(10, 45)),
            store.claim(Platform::Twitter, "q1", t(11, 0), t(10, 45)),
        );
        assert_eq!([a.unwrap(), b.unwrap()].iter().filter(|w| **w).count(), 1);

        let row = store.get(Platform::Twitter, "q1").await.unwrap().unwrap();
        assert_eq!(row.claimed_at, Some(t(11, 0)));

        // Stale lease is taken over; release clears it.
        assert!(store
            .claim(Platform::Twitter, "q1", t(11, 20), t(11, 5))
            .await
            .unwrap());
        store.release(Platform::Twitter, "q1").await.unwrap();
        assert!(store
            .claim(Platform::Twitter, "q1", t(11, 21), t(11, 6))
            .await
            .unwrap());

        store
            .mark_processed(Platform::Twitter, "q1", mark(true, t(11, 22)))
            .await
            .unwrap();
        let row = store.get(Platform::Twitter, "q1").await.unwrap().unwrap();
        assert_eq!(row.claimed_at, None);
        assert!(!store
            .claim(Platform::Twitter, "q1", t(12, 0), t(12, 0))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn counts_recent_responses() {
        let store = SqliteStore::in_memory().unwrap();
        for (id, sent, at) in [("a", true, t(8, 0)), ("b", true, t(9, 15)), ("c", false, t(9, 20))] {
            store.upsert(new_interaction(id, json!({}))).await.unwrap();
            store
                .mark_processed(Platform::Twitter, id, mark(sent, at))
                .await
                .unwrap();
        }
        assert_eq!(
            store
                .count_responses_since(Platform::Twitter, t(9, 0))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn conversations_keep_message_order() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = store
            .get_or_create(Platform::Twitter, "twitter:c1", t(7, 0))
            .await
            .unwrap();
        assert!(conv.messages.is_empty());

        for (i, role) in [Role::User, Role::Assistant, Role::User].into_iter().enumerate() {
            store
                .append(
                    "twitter:c1",
                    ConversationMessage {
                        role,
                        content: format!("m{i}"),
                        metadata: json!({ "i": i }),
                        created_at: t(7, i as u32 + 1),
                    },
                )
                .await
                .unwrap();
        }
        // Existing conversations are returned, not recreated.
        let again = store
            .get_or_create(Platform::Twitter, "twitter:c1", t(8, 0))
            .await
            .unwrap();
        assert_eq!(again.created_at, t(7, 0));
        assert_eq!(again.updated_at, t(7, 3));
        let contents: Vec<_> = again.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2"]);
        assert_eq!(again.messages[1].role, Role::Assistant);

        assert!(store.load("missing").await.unwrap().is_none());
    }
}
