//! Session persistence.
//!
//! [`SessionStore`] is the record-store collaborator (`get` / `insert` /
//! `update`). [`SessionRepository`] layers the load-or-create and save
//! contract the orchestrator uses on top of any store, with a bounded
//! timeout on every call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::session::{Turn, UserSession};

/// Fields written back at the end of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub user_id: String,
    pub display_name: String,
    pub memory: String,
    pub history: Vec<Turn>,
    pub nickname: String,
}

impl From<&UserSession> for SessionUpdate {
    fn from(session: &UserSession) -> Self {
        Self {
            user_id: session.user_id.clone(),
            display_name: session.display_name.clone(),
            memory: session.memory.clone(),
            history: session.history.clone(),
            nickname: session.nickname.clone(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserSession>>;

    /// Insert a fresh record. Returns false (and leaves the stored record
    /// untouched) when one already exists for the same user.
    async fn insert(&self, session: &UserSession) -> Result<bool>;

    /// Overwrite memory, history, nickname and display name of an existing record.
    async fn update(&self, update: &SessionUpdate) -> Result<()>;

    /// Every `(user_id, nickname)` pair with a non-empty nickname.
    async fn list_nicknames(&self) -> Result<Vec<(String, String)>>;
}

pub struct SessionRepository {
    store: Arc<dyn SessionStore>,
    timeout: Duration,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn SessionStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Read the user's session, creating an empty one on first contact.
    ///
    /// Concurrent first contacts converge on whichever insert won: the
    /// record is always re-read after inserting.
    pub async fn load(&self, user_id: &str, display_name_hint: &str) -> Result<UserSession> {
        let store = self.store.clone();
        let mut session = bounded(self.timeout, "session load", async move {
            if let Some(existing) = store.get(user_id).await? {
                return Ok(existing);
            }

            let fresh = UserSession::new(user_id, display_name_hint);
            if store.insert(&fresh).await? {
                tracing::info!("Created session for {}", user_id);
            }
            store
                .get(user_id)
                .await?
                .with_context(|| format!("session {} missing right after insert", user_id))
        })
        .await?;

        if !display_name_hint.trim().is_empty() {
            session.display_name = display_name_hint.trim().to_string();
        }
        Ok(session)
    }

    pub async fn save(&self, session: &UserSession) -> Result<()> {
        let update = SessionUpdate::from(session);
        let store = self.store.clone();
        bounded(self.timeout, "session save", async move {
            store.update(&update).await
        })
        .await
    }

    /// The persisted nickname for one user, without creating a record.
    pub async fn nickname_of(&self, user_id: &str) -> Result<Option<String>> {
        let store = self.store.clone();
        let session = bounded(self.timeout, "nickname lookup", async move {
            store.get(user_id).await
        })
        .await?;
        Ok(session.and_then(|s| s.nickname().map(str::to_string)))
    }

    pub async fn nicknames(&self) -> Result<Vec<(String, String)>> {
        let store = self.store.clone();
        bounded(self.timeout, "nickname listing", async move {
            store.list_nicknames().await
        })
        .await
    }
}

async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.with_context(|| format!("{} failed", what)),
        Err(_) => anyhow::bail!("{} timed out after {:?}", what, timeout),
    }
}

/// Process-local store, used by tests and as a fallback when the database
/// cannot be opened.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, UserSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserSession>> {
        Ok(self.sessions.read().await.get(user_id).cloned())
    }

    async fn insert(&self, session: &UserSession) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.user_id) {
            return Ok(false);
        }
        sessions.insert(session.user_id.clone(), session.clone());
        Ok(true)
    }

    async fn update(&self, update: &SessionUpdate) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&update.user_id)
            .with_context(|| format!("no session stored for {}", update.user_id))?;
        session.display_name = update.display_name.clone();
        session.memory = update.memory.clone();
        session.history = update.history.clone();
        session.nickname = update.nickname.clone();
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn list_nicknames(&self) -> Result<Vec<(String, String)>> {
        let sessions = self.sessions.read().await;
        let mut pairs: Vec<(String, String)> = sessions
            .values()
            .filter(|s| !s.nickname.trim().is_empty())
            .map(|s| (s.user_id.clone(), s.nickname.clone()))
            .collect();
        pairs.sort();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowStore;

    #[async_trait]
    impl SessionStore for SlowStore {
        async fn get(&self, _user_id: &str) -> Result<Option<UserSession>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn insert(&self, _session: &UserSession) -> Result<bool> {
            Ok(true)
        }

        async fn update(&self, _update: &SessionUpdate) -> Result<()> {
            Ok(())
        }

        async fn list_nicknames(&self) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    /// Reports a miss on the first read, as if another task inserted in between.
    struct RacingStore {
        inner: InMemorySessionStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for RacingStore {
        async fn get(&self, user_id: &str) -> Result<Option<UserSession>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            self.inner.get(user_id).await
        }

        async fn insert(&self, session: &UserSession) -> Result<bool> {
            self.inner.insert(session).await
        }

        async fn update(&self, update: &SessionUpdate) -> Result<()> {
            self.inner.update(update).await
        }

        async fn list_nicknames(&self) -> Result<Vec<(String, String)>> {
            self.inner.list_nicknames().await
        }
    }

    #[tokio::test]
    async fn load_creates_on_miss_then_reads_back() {
        let repo = SessionRepository::new(
            Arc::new(InMemorySessionStore::new()),
            Duration::from_secs(1),
        );
        let first = repo.load("telegram:7", "Ann").await.unwrap();
        assert_eq!(first.display_name, "Ann");
        assert!(first.history.is_empty());

        let mut changed = first.clone();
        changed.record_exchange("hi", "hello", 30);
        repo.save(&changed).await.unwrap();

        let again = repo.load("telegram:7", "Annie").await.unwrap();
        assert_eq!(again.history.len(), 2);
        assert_eq!(again.display_name, "Annie");
    }

    #[tokio::test]
    async fn load_returns_the_record_that_won_the_insert() {
        let inner = InMemorySessionStore::new();
        let mut winner = UserSession::new("discord:1", "Winner");
        winner.remember("already here", 4000);
        inner.insert(&winner).await.unwrap();

        let repo = SessionRepository::new(
            Arc::new(RacingStore {
                inner,
                reads: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
        );
        let loaded = repo.load("discord:1", "").await.unwrap();
        assert_eq!(loaded.memory, "already here");
        assert_eq!(loaded.display_name, "Winner");
    }

    #[tokio::test]
    async fn save_without_record_is_an_error() {
        let repo = SessionRepository::new(
            Arc::new(InMemorySessionStore::new()),
            Duration::from_secs(1),
        );
        let orphan = UserSession::new("ghost", "Ghost");
        assert!(repo.save(&orphan).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let repo = SessionRepository::new(Arc::new(SlowStore), Duration::from_millis(50));
        let err = repo.load("u", "U").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn nicknames_only_lists_named_sessions() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut named = UserSession::new("a", "A");
        named.nickname = "Buddy".to_string();
        store.insert(&named).await.unwrap();
        store.insert(&UserSession::new("b", "B")).await.unwrap();

        let repo = SessionRepository::new(store, Duration::from_secs(1));
        assert_eq!(
            repo.nicknames().await.unwrap(),
            vec![("a".to_string(), "Buddy".to_string())]
        );
    }

    #[tokio::test]
    async fn nickname_lookup_never_creates_a_record() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut named = UserSession::new("a", "A");
        named.nickname = "Buddy".to_string();
        store.insert(&named).await.unwrap();

        let repo = SessionRepository::new(store.clone(), Duration::from_secs(1));
        assert_eq!(repo.nickname_of("a").await.unwrap().as_deref(), Some("Buddy"));
        assert_eq!(repo.nickname_of("stranger").await.unwrap(), None);
        assert!(store.get("stranger").await.unwrap().is_none());
    }
}
