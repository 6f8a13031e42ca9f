use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::AgentConfig;
use crate::database::SessionDatabase;
use crate::llm_client::{CompletionClient, LlmClient};
use crate::orchestrator::{Orchestrator, OrchestratorEvent};
use crate::store::{InMemorySessionStore, SessionStore};
use crate::tools::web_search::WebSearchClient;
use crate::tools::{KeywordTrigger, SearchProvider, ToolDispatcher};

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub orchestrator: Arc<Orchestrator>,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Option<Sender<OrchestratorEvent>>,
    store: Option<Arc<dyn SessionStore>>,
    completion: Option<Arc<dyn CompletionClient>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            event_tx: None,
            store: None,
            completion: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Use this store instead of opening `database_path`.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this completion client instead of the configured HTTP endpoint.
    pub fn with_completion_client(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub async fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config),
        };

        let completion = match self.completion {
            Some(completion) => completion,
            None => Arc::new(build_llm_client(&config)?),
        };

        let tools = build_tools(&config)?;

        let mut orchestrator = Orchestrator::new(&config, store, completion, tools);
        if let Some(event_tx) = self.event_tx {
            orchestrator = orchestrator.with_events(event_tx);
        }

        // Users missing from a cold cache are looked up on first sight.
        if let Err(e) = orchestrator.warm_nickname_cache().await {
            tracing::warn!("Failed to warm nickname cache: {:#}", e);
        }

        tracing::info!(
            "Backend ready as {:?} (model: {}, search: {})",
            config.agent_name,
            config.llm_model,
            if config.search.is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(BackendRuntime {
            config,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

impl BackendRuntime {
    pub async fn bootstrap(
        config: AgentConfig,
        event_tx: Option<Sender<OrchestratorEvent>>,
    ) -> Result<Self> {
        let mut builder = BackendRuntimeBuilder::new(config);
        if let Some(event_tx) = event_tx {
            builder = builder.with_events(event_tx);
        }
        builder.build().await
    }
}

fn open_store(config: &AgentConfig) -> Arc<dyn SessionStore> {
    match SessionDatabase::new(&config.database_path) {
        Ok(db) => {
            tracing::info!("Session database: {}", config.database_path);
            Arc::new(db)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to open session database {:?}: {:#}; sessions will not survive a restart",
                config.database_path,
                e
            );
            Arc::new(InMemorySessionStore::new())
        }
    }
}

fn build_llm_client(config: &AgentConfig) -> Result<LlmClient> {
    let api_key = config
        .llm_api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .context("llm_api_key is not configured (set LLM_API_KEY or GROQ_API_KEY)")?;
    LlmClient::new(
        config.llm_api_url.clone(),
        api_key,
        config.completion_timeout(),
    )
}

fn build_tools(config: &AgentConfig) -> Result<ToolDispatcher> {
    let search = &config.search;
    let Some(api_key) = search.api_key.clone().filter(|_| search.is_enabled()) else {
        tracing::info!("Web search disabled (no search api_key)");
        return Ok(ToolDispatcher::disabled());
    };

    let provider: Arc<dyn SearchProvider> = Arc::new(
        WebSearchClient::new(
            search.api_url.clone(),
            api_key,
            search.max_results,
            config.search_timeout(),
        )
        .context("Failed to build web search client")?,
    );
    tracing::info!("Web search enabled: {}", search.api_url);

    Ok(ToolDispatcher::new(
        Arc::new(KeywordTrigger::with_defaults(search.keywords.iter())),
        Some(provider),
        config.search_timeout(),
        search.snippet_chars,
    ))
}
