use crate::http::build_client;
use crate::processor::{AttributeQuery, Classifier};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::warn;

const SYSTEM_PROMPT_ATTRIBUTE: &str = "You are a fashion product data specialist. \
You receive product photos and must select the correct value for one product attribute. \
Answer as JSON: {\"response\": \"<identifier>\"} using exactly one identifier from the allowed set. \
If no value can be determined, answer {\"response\": \"None\"}.";

const SYSTEM_PROMPT_COLOUR: &str = "You are a fashion product data specialist. \
You receive product photos and must determine the product's colour. \
Answer as JSON: {\"response\": [\"<colour>\", ...]} listing the dominant colours first.";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    pub max_attempts: u32,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            max_completion_tokens: std::env::var("LLM_MAX_COMPLETION_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            max_attempts: std::env::var("LLM_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("rate limited after {0} attempts")]
    RateLimited(u32),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// One vision chat completion. Rate-limit responses are retried here with
    /// exponential backoff and jitter; callers do not retry.
    pub async fn complete(
        &self,
        system: &str,
        prompt: &str,
        images: &[String],
    ) -> Result<String, LlmError> {
        let mut content = vec![ContentPart::Text {
            text: prompt.to_string(),
        }];
        for data_url in images {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: data_url.clone(),
                },
            });
        }

        let body = ChatRequest {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_completion_tokens,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(system.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(content),
                },
            ],
        };

        let base = self.config.base_url.trim_end_matches('/');
        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let mut request = self.http.post(format!("{base}/chat/completions")).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|err| LlmError::Http(err.to_string()))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.config.max_attempts {
                    return Err(LlmError::RateLimited(attempt));
                }
                let backoff = rate_limit_backoff(attempt);
                warn!(
                    target: "attrib.llm",
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "rate limited, backing off"
                );
                sleep(backoff).await;
                continue;
            }
            if !response.status().is_success() {
                return Err(LlmError::Http(format!("HTTP {}", response.status())));
            }
            break response;
        };

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("missing choices".into()))?;

        Ok(extract_response_field(&content))
    }
}

#[async_trait]
impl Classifier for LlmClient {
    async fn resolve_attribute(&self, query: &AttributeQuery) -> Result<String, LlmError> {
        let is_colour = query.attribute_id == "farbe";
        let system = if is_colour {
            SYSTEM_PROMPT_COLOUR
        } else {
            SYSTEM_PROMPT_ATTRIBUTE
        };
        let prompt = if is_colour {
            build_colour_prompt(query)
        } else {
            build_attribute_prompt(query)
        };
        self.complete(system, &prompt, &query.images).await
    }
}

fn rate_limit_backoff(attempt: u32) -> Duration {
    let exp = (250u64 << attempt.min(6)).min(30_000);
    let jitter = rand::rng().random_range(0..250);
    Duration::from_millis(exp + jitter)
}

/// Classifier responses are JSON objects `{"response": ...}`. A list value
/// (colour) is joined; content that is not valid JSON is returned verbatim.
fn extract_response_field(content: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return content.to_string();
    };
    match value.get("response") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
        None => content.to_string(),
    }
}

fn build_attribute_prompt(query: &AttributeQuery) -> String {
    let mut prompt = format!("Attribute: {}\n", query.attribute_id);
    if let Some(description) = &query.description {
        let _ = writeln!(prompt, "Definition: {description}");
    }
    if let Some(orientation) = &query.orientation {
        let _ = writeln!(prompt, "Where to look: {orientation}");
    }
    let _ = writeln!(prompt, "Product category: {}", query.product_category);
    let _ = writeln!(prompt, "Target group: {}", query.target_group);
    match &query.candidates {
        Some(candidates) => {
            prompt.push_str("Allowed values (identifier: label):\n");
            for (identifier, label) in candidates {
                let _ = writeln!(prompt, "- {identifier}: {label}");
            }
        }
        None => prompt.push_str("Answer free-form.\n"),
    }
    prompt
}

fn build_colour_prompt(query: &AttributeQuery) -> String {
    let mut prompt = format!(
        "Determine the dominant colour(s) of the product shown.\nTarget group: {}\n",
        query.target_group
    );
    if let Some(supplier_colour) = &query.supplier_colour {
        let _ = writeln!(prompt, "Supplier colour id: {supplier_colour}");
    }
    prompt
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    max_completion_tokens: u32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base_url: String, max_attempts: u32) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: None,
            model: "test-model".into(),
            temperature: 0.0,
            max_completion_tokens: 50,
            max_attempts,
        }
    }

    #[test]
    fn extracts_string_response() {
        assert_eq!(
            extract_response_field(r#"{"response": "v-ausschnitt"}"#),
            "v-ausschnitt"
        );
    }

    #[test]
    fn joins_list_response() {
        assert_eq!(
            extract_response_field(r#"{"response": ["schwarz", "grau"]}"#),
            "schwarz, grau"
        );
    }

    #[test]
    fn falls_back_to_raw_content() {
        assert_eq!(extract_response_field("not json at all"), "not json at all");
    }

    #[test]
    fn attribute_prompt_lists_candidates() {
        let query = AttributeQuery {
            attribute_id: "kragenform".into(),
            description: Some("Form des Kragens".into()),
            orientation: Some("oberer Bildbereich".into()),
            product_category: "D-Hosen".into(),
            target_group: "Damen".into(),
            supplier_colour: None,
            candidates: Some(vec![("v".into(), "V-Ausschnitt".into())]),
            images: vec![],
        };
        let prompt = build_attribute_prompt(&query);
        assert!(prompt.contains("Attribute: kragenform"));
        assert!(prompt.contains("- v: V-Ausschnitt"));
        assert!(!prompt.contains("free-form"));
    }

    #[test]
    fn free_form_prompt_omits_candidates() {
        let query = AttributeQuery {
            attribute_id: "farbHex".into(),
            description: None,
            orientation: None,
            product_category: "D-Hosen".into(),
            target_group: "Damen".into(),
            supplier_colour: None,
            candidates: None,
            images: vec![],
        };
        let prompt = build_attribute_prompt(&query);
        assert!(prompt.contains("Answer free-form."));
        assert!(!prompt.contains("Allowed values"));
    }

    #[tokio::test]
    async fn completes_and_parses_response_object() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"{\"response\": \"v\"}"}}]}"#,
            )
            .create_async()
            .await;
        let client = LlmClient::new(test_config(server.url(), 2));
        let out = client.complete("sys", "prompt", &[]).await.expect("complete");
        assert_eq!(out, "v");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_rate_limits_then_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;
        let client = LlmClient::new(test_config(server.url(), 2));
        let err = client
            .complete("sys", "prompt", &[])
            .await
            .expect_err("must fail");
        assert!(matches!(err, LlmError::RateLimited(2)));
        mock.assert_async().await;
    }
}
