//! Reasoning providers backed by chat models.
//!
//! [`ChatClient`] speaks to Ollama (`/api/chat`) or OpenAI
//! (`/v1/chat/completions`) and always asks for a JSON object back.
//! [`ChatReasoner`] builds the field and question prompts on top of it.
//! The offline [`HeuristicReasoner`] is used when the provider is
//! `heuristic`.
//!
//! A model that replies with something other than the requested JSON is
//! treated as a transient provider failure, so the task is retried.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use casesheet_core::error::PipelineError;
use casesheet_core::heuristic::HeuristicReasoner;
use casesheet_core::models::FieldKey;
use casesheet_core::providers::{Answer, ContextChunk, FieldAnswer, Reasoner};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::{Config, ReasoningPurpose};
use crate::http::{build_client, JsonEndpoint};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatProvider {
    Ollama,
    OpenAI,
}

/// A JSON-mode chat completion client.
pub struct ChatClient {
    provider: ChatProvider,
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl ChatClient {
    /// Client for `purpose`, honouring `[reasoning.<purpose>]` overrides.
    pub fn for_purpose(config: &Config, purpose: ReasoningPurpose) -> Result<Self> {
        let (provider, model) = config.reasoning.resolve(purpose);
        let model = model.ok_or_else(|| {
            anyhow!(
                "reasoning.model required for {} with provider '{}'",
                purpose.as_str(),
                provider
            )
        })?;
        let client = build_client(config.reasoning.timeout_secs)?;
        let max_retries = config.reasoning.max_retries;

        match provider.as_str() {
            "ollama" => Ok(Self {
                provider: ChatProvider::Ollama,
                client,
                model,
                url: config
                    .reasoning
                    .url
                    .clone()
                    .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
                api_key: None,
                max_retries,
            }),
            "openai" => {
                let api_key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                Ok(Self {
                    provider: ChatProvider::OpenAI,
                    client,
                    model,
                    url: config
                        .reasoning
                        .url
                        .clone()
                        .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
                    api_key: Some(api_key),
                    max_retries,
                })
            }
            other => bail!("{} is not a chat provider", other),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one system and one user message and decode the JSON reply.
    pub async fn complete_json<T: DeserializeOwned>(&self, system: &str, user: &str) -> Result<T> {
        let messages = serde_json::json!([
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ]);
        let (url, body) = match self.provider {
            ChatProvider::Ollama => (
                format!("{}/api/chat", self.url.trim_end_matches('/')),
                serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": false,
                    "format": "json",
                    "options": {"temperature": 0},
                }),
            ),
            ChatProvider::OpenAI => (
                self.url.clone(),
                serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": 0,
                    "response_format": {"type": "json_object"},
                }),
            ),
        };
        let endpoint = JsonEndpoint {
            client: &self.client,
            service: match self.provider {
                ChatProvider::Ollama => "Ollama",
                ChatProvider::OpenAI => "OpenAI",
            },
            url,
            bearer: self.api_key.as_deref(),
            max_retries: self.max_retries,
        };
        let response = endpoint.post(&body).await?;
        let content = match self.provider {
            ChatProvider::Ollama => response.pointer("/message/content"),
            ChatProvider::OpenAI => response.pointer("/choices/0/message/content"),
        }
        .and_then(|c| c.as_str())
        .ok_or_else(|| PipelineError::TransientProvider("chat response has no content".into()))?;
        parse_reply(content)
    }
}

/// Decode a model reply, tolerating a Markdown code fence around it.
pub fn parse_reply<T: DeserializeOwned>(content: &str) -> Result<T> {
    let body = CODE_FENCE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content);
    serde_json::from_str(body.trim()).map_err(|e| {
        PipelineError::TransientProvider(format!("model reply is not the requested JSON: {}", e))
            .into()
    })
}

fn render_context(context: &[ContextChunk]) -> String {
    context
        .iter()
        .map(|c| format!("[{}] (page {})\n{}", c.chunk_id, c.page, c.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

const EXTRACT_SYSTEM: &str = "You read excerpts of labor-case documents and extract one field. \
Reply with a JSON object {\"value\": string or null, \"chunk_id\": string or null}. \
Use null for value when the excerpts do not state it; never guess. \
chunk_id must be the id in brackets of the single excerpt the value was read from. \
Dates are YYYY-MM-DD. Amounts are plain numbers with an optional currency code.";

const ANSWER_SYSTEM: &str = "You answer questions about a labor case using only the excerpts given. \
Reply with a JSON object {\"answer\": string, \"citations\": [chunk ids]}. \
Cite the bracketed ids of every excerpt the answer relies on. \
If the excerpts do not answer the question, say so and cite nothing.";

#[derive(Debug, Deserialize)]
struct AnswerReply {
    answer: String,
    #[serde(default)]
    citations: Vec<String>,
}

/// [`Reasoner`] over a chat model.
pub struct ChatReasoner {
    client: ChatClient,
}

impl ChatReasoner {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reasoner for ChatReasoner {
    fn name(&self) -> &str {
        self.client.model()
    }

    async fn extract_field(&self, field: FieldKey, context: &[ContextChunk]) -> Result<FieldAnswer> {
        if context.is_empty() {
            return Ok(FieldAnswer::missing());
        }
        let user = format!(
            "Field: {} ({})\n\nExcerpts:\n\n{}",
            field,
            field.description(),
            render_context(context)
        );
        let mut answer: FieldAnswer = self.client.complete_json(EXTRACT_SYSTEM, &user).await?;
        if answer.value.as_deref().is_some_and(|v| v.trim().is_empty()) {
            answer.value = None;
        }
        Ok(answer)
    }

    async fn answer(&self, question: &str, context: &[ContextChunk]) -> Result<Answer> {
        let user = format!(
            "Question: {}\n\nExcerpts:\n\n{}",
            question,
            render_context(context)
        );
        let reply: AnswerReply = self.client.complete_json(ANSWER_SYSTEM, &user).await?;
        Ok(Answer {
            text: reply.answer,
            cited_chunk_ids: reply.citations,
        })
    }
}

/// Create the [`Reasoner`] configured for `purpose`.
pub fn create_reasoner(config: &Config, purpose: ReasoningPurpose) -> Result<Box<dyn Reasoner>> {
    let (provider, _) = config.reasoning.resolve(purpose);
    match provider.as_str() {
        "heuristic" => Ok(Box::new(HeuristicReasoner {
            currency: config.extraction.currency.clone(),
        })),
        "ollama" | "openai" => Ok(Box::new(ChatReasoner::new(ChatClient::for_purpose(
            config, purpose,
        )?))),
        other => bail!("Unknown reasoning provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_plain() {
        let answer: FieldAnswer =
            parse_reply(r#"{"value": "2021-03-01", "chunk_id": "c1"}"#).unwrap();
        assert_eq!(answer.value.as_deref(), Some("2021-03-01"));
        assert_eq!(answer.chunk_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_parse_reply_fenced() {
        let reply = "```json\n{\"value\": null, \"chunk_id\": null}\n```";
        let answer: FieldAnswer = parse_reply(reply).unwrap();
        assert_eq!(answer, FieldAnswer::missing());
    }

    #[test]
    fn test_parse_reply_garbage_is_transient() {
        let err = parse_reply::<FieldAnswer>("I think it was March").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::TransientProvider(_))
        ));
    }

    #[test]
    fn test_render_context_tags_chunks() {
        let rendered = render_context(&[ContextChunk {
            chunk_id: "abc".into(),
            page: 2,
            text: " Salario diario: $450.00 ".into(),
        }]);
        assert_eq!(rendered, "[abc] (page 2)\nSalario diario: $450.00");
    }
}
