//! OpenAI-compatible chat-completions backend over blocking HTTP.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SummarizerConfig;
use crate::error::{RegistryError, Result};

use super::SummaryBackend;

/// Calls `POST {endpoint}/chat/completions`.
///
/// Works with hosted APIs and with local servers (Ollama, llama.cpp,
/// vLLM) that expose the same route.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpBackend {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    pub fn from_config(cfg: &SummarizerConfig) -> Self {
        Self::new(cfg.endpoint.clone(), cfg.model.clone(), cfg.api_key.clone())
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

impl SummaryBackend for HttpBackend {
    fn generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let url = self.url();
        debug!(url = %url, model = %self.model, "Requesting summary");

        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
            stream: false,
        };

        let mut request = agent.post(&url).set("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = request.send_json(&body).map_err(|e| match e {
            ureq::Error::Status(code, resp) => {
                let text = resp.into_string().unwrap_or_default();
                RegistryError::Summarization(format!("HTTP {code}: {}", text.trim()))
            }
            ureq::Error::Transport(t) => RegistryError::Summarization(t.to_string()),
        })?;

        let parsed: ChatResponse = response
            .into_json()
            .map_err(|e| RegistryError::Summarization(format!("invalid response body: {e}")))?;

        extract_content(parsed)
    }
}

fn extract_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| RegistryError::Summarization("response has no choices".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_endpoint() {
        let b = HttpBackend::new("http://localhost:11434/v1/", "m", None);
        assert_eq!(b.url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_extract_content() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"A request for a permit."}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(parsed).unwrap(), "A request for a permit.");
    }

    #[test]
    fn test_extract_content_without_choices() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            extract_content(parsed),
            Err(RegistryError::Summarization(_))
        ));
    }

    #[test]
    fn test_request_serialization() {
        let body = ChatRequest {
            model: "llama3.2",
            messages: [ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.2,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_unreachable_endpoint_is_summarization_error() {
        // Port 9 (discard) on localhost is almost never listening
        let b = HttpBackend::new("http://127.0.0.1:9", "m", None);
        let err = b.generate("hello", Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, RegistryError::Summarization(_)));
    }
}
