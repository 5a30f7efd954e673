//! Adapter for OpenAI-compatible `/chat/completions` endpoints.
//!
//! One HTTP attempt per call; retries live in [`super::ProviderGateway`].
//! Replies that cannot hold a judgement (refusals, empty or truncated text)
//! come back as errors so the comparator can repair them.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{CallContext, ProviderError};
use super::types::{ChatRequest, ChatResponse};

/// Name reported in usage records.
pub const PROVIDER_NAME: &str = "chat_completions";

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Judge replies are a few kilobytes of JSON; anything near this is runaway output.
const MAX_BODY_BYTES: usize = 256 * 1024;

const REFUSAL_OPENERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i won't",
    "i'm unable",
    "i am unable",
    "sorry, i",
];

#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl ChatCompletionsAdapter {
    /// Reads `CRITIC_LLM_API_KEY`, `CRITIC_LLM_BASE_URL` and `CRITIC_LLM_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("CRITIC_LLM_API_KEY")
            .map_err(|_| ProviderError::config("CRITIC_LLM_API_KEY not set"))?;
        let base_url =
            std::env::var("CRITIC_LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout = std::env::var("CRITIC_LLM_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);
        Self::with_config(&api_key, &base_url, timeout)
    }

    pub fn with_config(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }

    /// Send one judge request.
    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let mut context = CallContext::new(req.attribution.caller);

        let mut response = self
            .client
            .post(&self.endpoint)
            .json(&WireRequest::from(req))
            .send()
            .await?;

        let status = response.status();
        context.request_id = header_str(response.headers(), "x-request-id").map(str::to_string);
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = header_str(response.headers(), "retry-after")
                .and_then(|s| s.trim().parse().ok())
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            return Err(ProviderError::RateLimited {
                retry_after,
                context,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(ProviderError::unusable(
                    format!("body exceeds {MAX_BODY_BYTES} bytes"),
                    context,
                ));
            }
            body.extend_from_slice(&chunk);
        }

        let parsed = serde_json::from_slice::<WireResponse>(&body);
        if !status.is_success() {
            let error = parsed.ok().and_then(|r| r.error);
            let message = error
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| status.to_string());
            context.provider_code = error.and_then(|e| e.code).map(|code| match code {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
                context,
            });
        }

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return Err(ProviderError::unusable(format!("body is not JSON: {e}"), context)),
        };
        if let Some(error) = parsed.error {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: error.message.unwrap_or_default(),
                context,
            });
        }
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::unusable("no choices", context));
        };

        let content = choice.message.content.unwrap_or_default();
        match choice.finish_reason.as_deref() {
            Some("length") => {
                return Err(ProviderError::unusable(
                    format!("reply cut at max_tokens ({:?})", req.max_tokens),
                    context,
                ));
            }
            Some("content_filter") => {
                return Err(ProviderError::Refused {
                    message: "content filter".into(),
                    context,
                });
            }
            _ => {}
        }
        if content.trim().is_empty() {
            return Err(ProviderError::unusable("empty content", context));
        }
        if looks_like_refusal(&content) {
            return Err(ProviderError::Refused {
                message: content,
                context,
            });
        }

        let usage = parsed.usage.unwrap_or_default();
        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            latency: started.elapsed(),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Prose opening with a refusal. JSON replies are never treated as refusals.
fn looks_like_refusal(content: &str) -> bool {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with("```") {
        return false;
    }
    let first_line = trimmed.lines().next().unwrap_or_default().to_lowercase();
    REFUSAL_OPENERS.iter().any(|p| first_line.starts_with(p))
}

// Wire format

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatRequest> for WireRequest<'a> {
    fn from(req: &'a ChatRequest) -> Self {
        Self {
            model: req.model.model_id(),
            messages: req
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: WireReply,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireReply {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}
