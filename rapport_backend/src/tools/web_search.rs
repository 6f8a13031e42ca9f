//! Tavily-compatible web search client.
//!
//! Posts `{api_key, query, max_results}` and reads `{results: [{title, content}]}`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::http_client::build_http_client;

use super::{SearchHit, SearchProvider};

pub const DEFAULT_SEARCH_API_URL: &str = "https://api.tavily.com/search";

pub struct WebSearchClient {
    api_url: String,
    api_key: String,
    max_results: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl WebSearchClient {
    pub fn new(
        api_url: String,
        api_key: String,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_url,
            api_key,
            max_results,
            client: build_http_client(Some(timeout))?,
        })
    }
}

#[async_trait]
impl SearchProvider for WebSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let request = SearchRequest {
            api_key: &self.api_key,
            query,
            max_results: self.max_results,
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Search API returned error {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(into_hits(parsed, self.max_results))
    }
}

fn into_hits(response: SearchResponse, max_results: usize) -> Vec<SearchHit> {
    response
        .results
        .into_iter()
        .filter(|r| !r.title.trim().is_empty() || !r.content.trim().is_empty())
        .take(max_results)
        .map(|r| SearchHit {
            title: r.title,
            content: r.content,
        })
        .collect()
}
