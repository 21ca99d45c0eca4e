//! Minimal OpenAI-compatible chat-completions client.
//!
//! One templated prompt in, one completion out. The analyzer and the
//! progress summarizer are the only callers; both treat failures as
//! best-effort at the worker level.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Completion response contained no choices")]
    EmptyResponse,
}

/// One completion call: a single user message at a fixed temperature.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    /// Ask the API for a JSON object response (prompts that specify a
    /// structured output contract).
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// Model the server reports having used.
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct CompletionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl CompletionClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn complete(&self, req: &CompletionRequest) -> Result<Completion, CompletionError> {
        let mut body = json!({
            "model": req.model,
            "messages": [{"role": "user", "content": req.prompt}],
            "temperature": req.temperature,
        });
        if req.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(CompletionError::EmptyResponse)?;

        Ok(Completion {
            content,
            model: parsed.model.unwrap_or_else(|| req.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_response_parsing() {
        let json = r###"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "## Report"}}
            ]
        }"###;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.model.as_deref(), Some("gpt-4o-mini-2024-07-18"));
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("## Report")
        );
    }

    #[test]
    fn test_empty_choices_detected() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(parsed.choices.is_empty());
    }
}
