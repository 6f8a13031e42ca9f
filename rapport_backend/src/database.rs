use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::session::{Turn, UserSession};
use crate::store::{SessionStore, SessionUpdate};

/// SQLite-backed session store.
///
/// rusqlite is blocking, so every trait call hops onto the blocking pool
/// with a clone of the shared connection handle.
#[derive(Clone)]
pub struct SessionDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SessionDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS user_sessions (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                memory TEXT NOT NULL DEFAULT '',
                history_json TEXT NOT NULL DEFAULT '[]',
                nickname TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Startup nickname warm-up scans only named rows
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_user_sessions_nickname ON user_sessions(nickname) WHERE nickname <> ''",
            [],
        )?;

        Ok(())
    }

    pub fn get_session(&self, user_id: &str) -> Result<Option<UserSession>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT user_id, display_name, memory, history_json, nickname, created_at, updated_at
                 FROM user_sessions WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, display_name, memory, history_json, nickname, created_at, updated_at)) =
            row
        else {
            return Ok(None);
        };

        let history: Vec<Turn> = serde_json::from_str(&history_json)
            .with_context(|| format!("Corrupt history for session {}", user_id))?;

        Ok(Some(UserSession {
            user_id,
            display_name,
            memory,
            history,
            nickname,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        }))
    }

    pub fn insert_session(&self, session: &UserSession) -> Result<bool> {
        let history_json = serde_json::to_string(&session.history)?;
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_sessions
             (user_id, display_name, memory, history_json, nickname, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.user_id,
                session.display_name,
                session.memory,
                history_json,
                session.nickname,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn update_session(&self, update: &SessionUpdate) -> Result<()> {
        let history_json = serde_json::to_string(&update.history)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE user_sessions
             SET display_name = ?2, memory = ?3, history_json = ?4, nickname = ?5, updated_at = ?6
             WHERE user_id = ?1",
            params![
                update.user_id,
                update.display_name,
                update.memory,
                history_json,
                update.nickname,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("No session stored for {}", update.user_id);
        }
        Ok(())
    }

    pub fn named_sessions(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, nickname FROM user_sessions WHERE nickname <> '' ORDER BY user_id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SessionDatabase) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(db))
            .await
            .context("Database task panicked")?
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl SessionStore for SessionDatabase {
    async fn get(&self, user_id: &str) -> Result<Option<UserSession>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_session(&user_id)).await
    }

    async fn insert(&self, session: &UserSession) -> Result<bool> {
        let session = session.clone();
        self.blocking(move |db| db.insert_session(&session)).await
    }

    async fn update(&self, update: &SessionUpdate) -> Result<()> {
        let update = update.clone();
        self.blocking(move |db| db.update_session(&update)).await
    }

    async fn list_nicknames(&self) -> Result<Vec<(String, String)>> {
        self.blocking(|db| db.named_sessions()).await
    }
}
