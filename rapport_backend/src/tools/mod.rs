//! Pre-completion tool use.
//!
//! Before a request is sent, the [`ToolDispatcher`] decides from the inbound
//! text alone whether to run a web search, and renders the outcome as a
//! prompt block. Search failures never abort a cycle; they become a visible
//! notice in the prompt instead.

pub mod web_search;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SNIPPET_CHARS: usize = 300;

/// English and Thai phrases that suggest the user wants fresh information.
pub const DEFAULT_TRIGGER_KEYWORDS: &[&str] = &[
    "search",
    "look up",
    "google",
    "latest",
    "news",
    "today",
    "right now",
    "current",
    "ค้นหา",
    "หาข้อมูล",
    "ล่าสุด",
    "ตอนนี้",
    "ข่าว",
    "วันนี้",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub content: String,
}

/// The result of running the search collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Results(Vec<SearchHit>),
    /// Timeout, transport or decoding failure.
    Failed(String),
}

/// Decides from raw inbound text whether a search should run.
pub trait TriggerPredicate: Send + Sync {
    fn should_search(&self, text: &str) -> bool;
}

impl<F> TriggerPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn should_search(&self, text: &str) -> bool {
        self(text)
    }
}

/// Case-insensitive substring match against a phrase list.
#[derive(Debug, Clone)]
pub struct KeywordTrigger {
    keywords: Vec<String>,
}

impl KeywordTrigger {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// The built-in phrase list plus any extras.
    pub fn with_defaults<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut trigger = Self::new(DEFAULT_TRIGGER_KEYWORDS);
        trigger.keywords.extend(Self::new(extra).keywords);
        trigger
    }
}

impl TriggerPredicate for KeywordTrigger {
    fn should_search(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

/// The external search collaborator.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

pub struct ToolDispatcher {
    trigger: Arc<dyn TriggerPredicate>,
    provider: Option<Arc<dyn SearchProvider>>,
    timeout: Duration,
    snippet_chars: usize,
}

impl ToolDispatcher {
    pub fn new(
        trigger: Arc<dyn TriggerPredicate>,
        provider: Option<Arc<dyn SearchProvider>>,
        timeout: Duration,
        snippet_chars: usize,
    ) -> Self {
        Self {
            trigger,
            provider,
            timeout,
            snippet_chars,
        }
    }

    /// A dispatcher that never searches.
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(|_: &str| false),
            None,
            Duration::from_secs(1),
            DEFAULT_SNIPPET_CHARS,
        )
    }

    /// Run the search if the text calls for one. `None` means no search was
    /// attempted; otherwise the rendered block to append to the prompt.
    pub async fn augment(&self, text: &str) -> Option<String> {
        let provider = self.provider.as_ref()?;
        if !self.trigger.should_search(text) {
            return None;
        }

        tracing::debug!("Search triggered for: {}", truncate_chars(text, 80));
        let outcome = match tokio::time::timeout(self.timeout, provider.search(text)).await {
            Ok(Ok(hits)) => SearchOutcome::Results(hits),
            Ok(Err(e)) => {
                tracing::warn!("Search failed: {:#}", e);
                SearchOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!("Search timed out after {:?}", self.timeout);
                SearchOutcome::Failed(format!("timed out after {:?}", self.timeout))
            }
        };

        Some(render_search_block(&outcome, self.snippet_chars))
    }
}

pub fn render_search_block(outcome: &SearchOutcome, snippet_chars: usize) -> String {
    let mut block = String::from("## Web Search Results\n\n");
    match outcome {
        SearchOutcome::Results(hits) if !hits.is_empty() => {
            for (index, hit) in hits.iter().enumerate() {
                block.push_str(&format!(
                    "{}. {}\n   {}\n",
                    index + 1,
                    hit.title.trim(),
                    truncate_chars(hit.content.trim(), snippet_chars)
                ));
            }
            block.push_str(
                "\nGround your answer only in these results. If they do not answer the \
                 question, say so instead of guessing.",
            );
        }
        SearchOutcome::Results(_) => {
            block.push_str(
                "The search returned no results. Tell the user nothing was found and do not \
                 make up any findings.",
            );
        }
        SearchOutcome::Failed(reason) => {
            block.push_str(&format!(
                "The search failed ({}). Tell the user the search could not be completed and \
                 do not make up any findings.",
                reason
            ));
        }
    }
    block
}

pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        hits: Vec<SearchHit>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for FixedProvider {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.clone())
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl SearchProvider for BrokenProvider {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
            anyhow::bail!("connection refused")
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl SearchProvider for HangingProvider {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn dispatcher(provider: Arc<dyn SearchProvider>) -> ToolDispatcher {
        ToolDispatcher::new(
            Arc::new(KeywordTrigger::with_defaults(Vec::<String>::new())),
            Some(provider),
            Duration::from_millis(100),
            DEFAULT_SNIPPET_CHARS,
        )
    }

    #[test]
    fn keyword_trigger_is_case_insensitive_in_both_languages() {
        let trigger = KeywordTrigger::with_defaults(["weather"]);
        assert!(trigger.should_search("What's the LATEST on the match?"));
        assert!(trigger.should_search("ช่วยค้นหาร้านอาหารให้หน่อย"));
        assert!(trigger.should_search("Weather in Bangkok?"));
        assert!(!trigger.should_search("tell me a joke"));
    }

    #[test]
    fn closures_work_as_triggers() {
        let trigger: Arc<dyn TriggerPredicate> = Arc::new(|text: &str| text.ends_with('?'));
        assert!(trigger.should_search("why?"));
        assert!(!trigger.should_search("because."));
    }

    #[test]
    fn snippets_are_capped() {
        let outcome = SearchOutcome::Results(vec![SearchHit {
            title: "Long".to_string(),
            content: "x".repeat(1000),
        }]);
        let block = render_search_block(&outcome, 300);
        assert!(block.contains(&format!("{}...", "x".repeat(300))));
        assert!(!block.contains(&"x".repeat(301)));
        assert!(block.contains("Ground your answer only in these results"));
    }

    #[test]
    fn empty_results_forbid_fabrication() {
        let block = render_search_block(&SearchOutcome::Results(Vec::new()), 300);
        assert!(block.contains("no results"));
        assert!(block.contains("do not make up"));
    }

    #[tokio::test]
    async fn untriggered_text_skips_the_provider() {
        let provider = Arc::new(FixedProvider {
            hits: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let tools = dispatcher(provider.clone());
        assert_eq!(tools.augment("hello there").await, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn triggered_text_renders_results() {
        let provider = Arc::new(FixedProvider {
            hits: vec![SearchHit {
                title: "Bangkok weather".to_string(),
                content: "Sunny, 34C".to_string(),
            }],
            calls: AtomicUsize::new(0),
        });
        let tools = dispatcher(provider.clone());
        let block = tools.augment("latest weather in Bangkok").await.unwrap();
        assert!(block.contains("1. Bangkok weather"));
        assert!(block.contains("Sunny, 34C"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_errors_degrade_to_a_notice() {
        let block = dispatcher(Arc::new(BrokenProvider))
            .augment("search for rust news")
            .await
            .unwrap();
        assert!(block.contains("The search failed"));
        assert!(block.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_timeouts_degrade_to_a_notice() {
        let block = dispatcher(Arc::new(HangingProvider))
            .augment("news today")
            .await
            .unwrap();
        assert!(block.contains("timed out"));
    }

    #[tokio::test]
    async fn disabled_dispatcher_never_searches() {
        assert_eq!(ToolDispatcher::disabled().augment("search now").await, None);
    }
}
