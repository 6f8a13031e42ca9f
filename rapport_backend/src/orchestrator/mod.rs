//! The per-message request/response cycle.
//!
//! `received → gated → session loaded → prompt built → tools maybe invoked →
//! completion requested → directives parsed → session mutated → persisted → replied`
//!
//! Everything from session load to persistence runs under the sender's
//! [`UserLocks`] entry. A failed completion ends the cycle before any state
//! is touched.

pub mod locks;


use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use flume::Sender;

use crate::config::AgentConfig;
use crate::directives::parse_reply;
use crate::gate::{self, MentionCheck};
use crate::llm_client::{CompletionClient, CompletionRequest};
use crate::prompt::{
    append_context_block, build_messages, build_system_prompt, PromptContext, SelfIdentity,
};
use crate::session::UserSession;
use crate::store::{SessionRepository, SessionStore};
use crate::tools::{truncate_chars, ToolDispatcher};

use self::locks::UserLocks;

pub const FAILURE_REPLY: &str =
    "ขออภัย ตอนนี้ยังตอบไม่ได้ ลองใหม่อีกครั้งนะ / Sorry, I couldn't come up with a reply just now. Please try again in a moment.";

/// Sent when the model emitted only directives and no visible text.
pub const ACKNOWLEDGEMENT_REPLY: &str = "👍";

/// One message as delivered by a channel adapter.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    /// Platform-scoped key, e.g. `telegram:12345`.
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    /// Platform-native admin status as judged by the adapter.
    pub is_admin: bool,
    pub is_group: bool,
    pub structured_mention: bool,
    pub identity: Option<SelfIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Replied(String),
    /// Not addressed to the agent; nothing was read or written.
    Ignored,
    /// The completion failed; carries the apology to show instead.
    Failed(String),
}

impl CycleOutcome {
    /// Text an adapter should send back, if any.
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            CycleOutcome::Replied(text) | CycleOutcome::Failed(text) => Some(text),
            CycleOutcome::Ignored => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Replied(_) => "replied",
            CycleOutcome::Ignored => "ignored",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    CycleFinished {
        user_id: String,
        outcome: CycleOutcome,
    },
    PersistenceFailed {
        user_id: String,
        error: String,
    },
}

/// Process-wide `user_id → nickname` index so the mention gate rarely waits
/// on the store. A user without an entry has never been looked up; an entry
/// of `None` means "looked up, no nickname". Cycles write it only while
/// holding that user's lock, and only with values that were actually
/// persisted.
#[derive(Default)]
pub struct NicknameCache {
    entries: RwLock<HashMap<String, Option<String>>>,
}

impl NicknameCache {
    /// `None` when this user has not been seen yet.
    pub fn lookup(&self, user_id: &str) -> Option<Option<String>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned()
    }

    fn set(&self, user_id: &str, nickname: Option<&str>) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.to_string(), nickname.map(str::to_string));
    }

    /// Record a value read outside the user's lock. Anything already cached
    /// came from a cycle and wins.
    fn set_if_unseen(&self, user_id: &str, nickname: Option<String>) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(user_id.to_string())
            .or_insert(nickname)
            .clone()
    }

    fn fill(&self, pairs: Vec<(String, String)>) -> usize {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (user_id, nickname) in pairs {
            entries.entry(user_id).or_insert(Some(nickname));
        }
        entries.values().filter(|nickname| nickname.is_some()).count()
    }
}

struct CycleSettings {
    agent_name: String,
    admin_ids: HashSet<String>,
    model: String,
    max_output_tokens: u32,
    temperature: f32,
    history_cap: usize,
    prompt_window: usize,
    memory_max_chars: usize,
    completion_timeout: Duration,
}

pub struct Orchestrator {
    settings: CycleSettings,
    sessions: SessionRepository,
    completion: Arc<dyn CompletionClient>,
    tools: ToolDispatcher,
    locks: UserLocks,
    nicknames: NicknameCache,
    event_tx: Option<Sender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn SessionStore>,
        completion: Arc<dyn CompletionClient>,
        tools: ToolDispatcher,
    ) -> Self {
        let settings = CycleSettings {
            agent_name: config.agent_name.clone(),
            admin_ids: config.admin_ids.iter().cloned().collect(),
            model: config.llm_model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            history_cap: config.history_cap,
            prompt_window: config.prompt_window,
            memory_max_chars: config.memory_max_chars,
            completion_timeout: config.completion_timeout(),
        };

        Self {
            settings,
            sessions: SessionRepository::new(store, config.store_timeout()),
            completion,
            tools,
            locks: UserLocks::new(),
            nicknames: NicknameCache::default(),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.settings.agent_name
    }

    /// Load every persisted nickname into the gate's cache.
    pub async fn warm_nickname_cache(&self) -> Result<usize> {
        let pairs = self.sessions.nicknames().await?;
        let count = self.nicknames.fill(pairs);
        tracing::info!("Nickname cache warmed with {} entries", count);
        Ok(count)
    }

    fn emit(&self, event: OrchestratorEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropped {:?}", event);
            }
            Err(flume::TrySendError::Disconnected(event)) => {
                tracing::debug!("No event listener, dropped {:?}", event);
            }
        }
    }

    /// Run one full cycle for an inbound message.
    pub async fn handle(&self, message: InboundMessage) -> CycleOutcome {
        let cycle_id = uuid::Uuid::new_v4();
        let outcome = self.run(&message, cycle_id).await;
        tracing::info!(
            "Cycle {} for {} finished: {}",
            cycle_id,
            message.user_id,
            outcome.label()
        );
        self.emit(OrchestratorEvent::CycleFinished {
            user_id: message.user_id.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run(&self, message: &InboundMessage, cycle_id: uuid::Uuid) -> CycleOutcome {
        let text = message.text.trim();
        if text.is_empty() {
            return CycleOutcome::Ignored;
        }

        if !self.addressed(message, text, cycle_id).await {
            tracing::debug!(
                "Cycle {}: group message from {} not addressed to us",
                cycle_id,
                message.user_id
            );
            return CycleOutcome::Ignored;
        }

        tracing::debug!(
            "Cycle {}: {} says {:?}",
            cycle_id,
            message.user_id,
            truncate_chars(text, 120)
        );

        let _user_lock = self.locks.lock(&message.user_id).await;
        self.locked_cycle(message, text, cycle_id).await
    }

    async fn addressed(
        &self,
        message: &InboundMessage,
        text: &str,
        cycle_id: uuid::Uuid,
    ) -> bool {
        let handle = message
            .identity
            .as_ref()
            .map(|identity| identity.handle.as_str())
            .unwrap_or("");
        let check = |nickname: Option<&str>| {
            gate::should_process(&MentionCheck {
                text,
                is_group: message.is_group,
                structured_mention: message.structured_mention,
                handle,
                display_name: &self.settings.agent_name,
                nickname,
            })
        };

        match self.nicknames.lookup(&message.user_id) {
            Some(cached) => check(cached.as_deref()),
            None => {
                check(None)
                    || check(
                        self.first_sight_nickname(&message.user_id, cycle_id)
                            .await
                            .as_deref(),
                    )
            }
        }
    }

    /// One store read the first time a user shows up in a shared channel.
    /// A failed read leaves the user unseen so the next message retries.
    async fn first_sight_nickname(
        &self,
        user_id: &str,
        cycle_id: uuid::Uuid,
    ) -> Option<String> {
        match self.sessions.nickname_of(user_id).await {
            Ok(nickname) => self.nicknames.set_if_unseen(user_id, nickname),
            Err(e) => {
                tracing::warn!(
                    "Cycle {}: nickname lookup for {} failed: {:#}",
                    cycle_id,
                    user_id,
                    e
                );
                None
            }
        }
    }

    async fn locked_cycle(
        &self,
        message: &InboundMessage,
        text: &str,
        cycle_id: uuid::Uuid,
    ) -> CycleOutcome {
        let settings = &self.settings;

        let (mut session, persistent) = match self
            .sessions
            .load(&message.user_id, &message.display_name)
            .await
        {
            Ok(session) => {
                self.nicknames.set(&session.user_id, session.nickname());
                (session, true)
            }
            Err(e) => {
                // Saving over a record we could not read would wipe it.
                tracing::error!(
                    "Cycle {}: session store unavailable for {}, answering without persistence: {:#}",
                    cycle_id,
                    message.user_id,
                    e
                );
                self.emit(OrchestratorEvent::PersistenceFailed {
                    user_id: message.user_id.clone(),
                    error: format!("{:#}", e),
                });
                (
                    UserSession::new(message.user_id.as_str(), message.display_name.as_str()),
                    false,
                )
            }
        };

        let is_admin = message.is_admin || settings.admin_ids.contains(&message.user_id);
        let memory = session.memory_paragraph();
        let mut system_prompt = build_system_prompt(&PromptContext {
            agent_name: &settings.agent_name,
            is_admin,
            nickname: session.nickname(),
            identity: message.identity.as_ref(),
            user_display_name: &session.display_name,
            memory_paragraph: &memory,
        });

        if let Some(search_block) = self.tools.augment(text).await {
            append_context_block(&mut system_prompt, &search_block);
        }

        let request = CompletionRequest {
            model: settings.model.clone(),
            messages: build_messages(
                &system_prompt,
                &session.history,
                settings.prompt_window,
                text,
            ),
            max_tokens: settings.max_output_tokens,
            temperature: settings.temperature,
        };

        let raw = match tokio::time::timeout(
            settings.completion_timeout,
            self.completion.complete(&request),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!("Cycle {}: completion failed: {:#}", cycle_id, e);
                return CycleOutcome::Failed(FAILURE_REPLY.to_string());
            }
            Err(_) => {
                tracing::warn!(
                    "Cycle {}: completion timed out after {:?}",
                    cycle_id,
                    settings.completion_timeout
                );
                return CycleOutcome::Failed(FAILURE_REPLY.to_string());
            }
        };

        let parsed = parse_reply(&raw);
        let reply = if parsed.visible_text.is_empty() {
            ACKNOWLEDGEMENT_REPLY.to_string()
        } else {
            parsed.visible_text.clone()
        };

        if let Some(nickname) = parsed.nickname.as_deref() {
            if session.rename_agent(nickname, &settings.agent_name) {
                tracing::info!(
                    "Cycle {}: {} renamed the agent to {:?}",
                    cycle_id,
                    message.user_id,
                    session.nickname()
                );
            }
        }
        if let Some(observation) = parsed.memory.as_deref() {
            if session.remember(observation, settings.memory_max_chars) {
                tracing::debug!("Cycle {}: memory updated for {}", cycle_id, message.user_id);
            }
        }
        session.record_exchange(text, &reply, settings.history_cap);

        if persistent {
            match self.sessions.save(&session).await {
                Ok(()) => self.nicknames.set(&session.user_id, session.nickname()),
                Err(e) => {
                    tracing::error!(
                        "Cycle {}: failed to persist session for {}: {:#}",
                        cycle_id,
                        message.user_id,
                        e
                    );
                    self.emit(OrchestratorEvent::PersistenceFailed {
                        user_id: message.user_id.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        CycleOutcome::Replied(reply)
    }
}
