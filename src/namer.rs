// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Replaceable text generation for names and summaries.
//!
//! A [`Namer`] is asked for short branch names, commit message suggestions,
//! and pull request summaries. It may always answer `None`; every caller
//! has a deterministic fallback, so the coordinator never depends on it.

use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default model for naming requests.
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Longest slug produced by [`slugify`].
const MAX_SLUG_LEN: usize = 48;

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

/// Short-name and summary generator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Namer: Send + Sync {
    /// A short name for the task described by `prompt`.
    async fn name(&self, prompt: &str) -> Option<String>;

    /// A prose summary of `commit_log` in the context of `prompt`.
    async fn summarize(&self, prompt: &str, commit_log: &str) -> Option<String>;
}

/// Namer that is always unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNamer;

#[async_trait]
impl Namer for NoopNamer {
    async fn name(&self, _prompt: &str) -> Option<String> {
        None
    }

    async fn summarize(&self, _prompt: &str, _commit_log: &str) -> Option<String> {
        None
    }
}

/// Error type for building the HTTP namer.
#[derive(Debug, thiserror::Error)]
pub enum NamerError {
    #[error("Missing API key: set {0}")]
    MissingApiKey(&'static str),

    #[error("HTTP client error: {0}")]
    Client(String),
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Namer backed by the Anthropic Messages API.
pub struct HttpNamer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl HttpNamer {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NamerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NamerError::Client(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env(model: Option<&str>, base_url: Option<&str>, timeout: Duration) -> Result<Self, NamerError> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| NamerError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        Self::new(
            key,
            model.unwrap_or(DEFAULT_MODEL),
            base_url.unwrap_or(DEFAULT_BASE_URL),
            timeout,
        )
    }

    async fn complete(&self, system: &str, user: String, max_tokens: u32) -> Option<String> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: vec![RequestMessage {
                role: "user",
                content: user,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("namer.request", start.elapsed());

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("Namer request failed with status {}", r.status());
                return None;
            }
            Err(e) => {
                warn!("Namer unavailable: {}", e);
                return None;
            }
        };

        let body: MessagesResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Namer response unreadable: {}", e);
                return None;
            }
        };

        let text: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        let text = text.trim().to_string();
        debug!(chars = text.len(), "Namer answered");
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl Namer for HttpNamer {
    async fn name(&self, prompt: &str) -> Option<String> {
        self.complete(
            "Reply with a 2-5 word name for the task, lowercase, no punctuation. Reply with the name only.",
            prompt.to_string(),
            32,
        )
        .await
        .map(|s| s.lines().next().unwrap_or_default().trim().to_string())
        .filter(|s| !s.is_empty())
    }

    async fn summarize(&self, prompt: &str, commit_log: &str) -> Option<String> {
        self.complete(
            "Summarize the combined changes for a pull request description in 2-4 sentences. Plain prose, no headings.",
            format!("Task: {}\n\nCommits:\n{}", prompt, commit_log),
            300,
        )
        .await
    }
}

/// Lowercase, dash-separated slug safe for ref names.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let slug = NON_SLUG.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    let mut out: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Target branch used when nothing better is available.
pub fn fallback_target_branch(token: &str) -> String {
    format!("fork-join/{}", token)
}

/// Commit message suggested to an agent that did not supply one.
pub fn fallback_commit_message(agent_id: &str, changed: usize) -> String {
    format!(
        "chore({}): update {} file{}",
        agent_id,
        changed,
        if changed == 1 { "" } else { "s" }
    )
}

/// Pull request title when the namer gives nothing.
pub fn fallback_pr_title(target_branch: &str, merged: usize) -> String {
    format!(
        "Merge {} agent branch{} into {}",
        merged,
        if merged == 1 { "" } else { "es" },
        target_branch
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth Login!"), "add-oauth-login");
        assert_eq!(slugify("  --Fix   the_bug #42-- "), "fix-the-bug-42");
        assert_eq!(slugify("!!!"), "");
        let long = slugify(&"word ".repeat(40));
        assert!(long.len() <= MAX_SLUG_LEN);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(fallback_commit_message("a1", 1), "chore(a1): update 1 file");
        assert_eq!(fallback_commit_message("a1", 3), "chore(a1): update 3 files");
        assert_eq!(fallback_target_branch("abcd1234"), "fork-join/abcd1234");
        assert_eq!(fallback_pr_title("feature/x", 1), "Merge 1 agent branch into feature/x");
        assert_eq!(fallback_pr_title("feature/x", 5), "Merge 5 agent branches into feature/x");
    }

    #[tokio::test]
    async fn test_noop_namer() {
        let namer = NoopNamer;
        assert_eq!(namer.name("anything").await, None);
        assert_eq!(namer.summarize("task", "log").await, None);
    }

    #[tokio::test]
    async fn test_http_namer_unreachable_is_unavailable() {
        // Port 9 (discard) on localhost is not serving HTTP.
        let namer = HttpNamer::new("key", DEFAULT_MODEL, "http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert_eq!(namer.name("task").await, None);
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{"content":[{"type":"text","text":"oauth login"},{"type":"tool_use"}]}"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.content[0].text.as_deref(), Some("oauth login"));
        assert_eq!(parsed.content[1].text, None);
    }
}
