//! Summarizer capability: folds old turns into the running summary.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::SummarizerConfig;
use crate::error::SummarizerError;
use crate::types::{Role, Turn};

const SUMMARY_SYSTEM_PROMPT: &str = "You maintain the long-term memory of a chat assistant. \
Merge the previous summary and the new conversation lines into ONE paragraph of at most 200 tokens. \
Keep key facts, names and named entities, user preferences and any open questions. \
Write in the language of the conversation. No lists, no markdown, no preamble.";

/// Turns a batch of old turns plus the previous summary into a new summary.
///
/// May be slow or fail; the caller bounds it with a timeout and degrades on error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        previous_summary: &str,
        old_turns: &[Turn],
    ) -> Result<String, SummarizerError>;
}

/// Render turns as `User: ...` / `Assistant: ...` lines.
pub fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(previous_summary: &str, old_turns: &[Turn]) -> String {
    let previous = if previous_summary.trim().is_empty() {
        "(none)"
    } else {
        previous_summary.trim()
    };
    format!(
        "PREVIOUS SUMMARY:\n{}\n\nNEW LINES:\n{}\n\nNEW SUMMARY:",
        previous,
        render_transcript(old_turns)
    )
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Summarizer backed by an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Clone)]
pub struct LlmSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl LlmSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        previous_summary: &str,
        old_turns: &[Turn],
    ) -> Result<String, SummarizerError> {
        debug!(
            "Summarizing {} turns (previous summary: {} chars)",
            old_turns.len(),
            previous_summary.len()
        );

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SUMMARY_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(previous_summary, old_turns),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizerError::Api { status, body });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(SummarizerError::EmptyResponse)
    }
}
