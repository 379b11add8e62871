use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::retry::{RetryPolicy, is_rate_limited, retry_after};
use super::{
    GenerationConfig, Message, MessagePart, MessageRole, Provider, ProviderFuture,
    ProviderResponse, ProviderUsage, format_error_parts,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    messages: Vec<Message>,
    generation: Option<GenerationConfig>,
    retry: RetryPolicy,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            messages: Vec::new(),
            generation: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Request body for `generateContent`. All user parts travel in a single
    /// turn so the numbered texts stay next to their crops.
    fn request_body(&self) -> Value {
        let (system_inputs, user_inputs): (Vec<&Message>, Vec<&Message>) = self
            .messages
            .iter()
            .partition(|message| message.role == MessageRole::System);

        let system_instruction = system_inputs
            .into_iter()
            .flat_map(|message| message.parts.iter())
            .filter_map(|part| match part {
                MessagePart::Text(text) => Some(text.as_str()),
                MessagePart::Data(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let parts = user_inputs
            .into_iter()
            .flat_map(|message| message.parts.iter())
            .map(|part| match part {
                MessagePart::Text(text) => json!({"text": text}),
                MessagePart::Data(data) => json!({
                    "inline_data": {
                        "mime_type": data.mime,
                        "data": BASE64.encode(&data.bytes)
                    }
                }),
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "contents": [{"role": "user", "parts": parts}],
        });
        if !system_instruction.trim().is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_instruction}]});
        }
        if let Some(generation) = self.generation {
            body["generationConfig"] = json!({
                "temperature": generation.temperature,
                "maxOutputTokens": generation.max_output_tokens
            });
        }
        body
    }
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_data(mut self, data: crate::data::DataAttachment) -> Self {
        self.messages.push(Message::user_data(data));
        self
    }

    fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = Some(generation);
        self
    }

    fn generate(self) -> ProviderFuture {
        Box::pin(async move {
            let client = reqwest::Client::new();
            let url = format!("{}/{}:generateContent", BASE_URL, self.model);
            let body = self.request_body();

            let mut attempt = 0usize;
            let mut delay = self.retry.base_delay;
            loop {
                attempt += 1;
                let response = client
                    .post(&url)
                    .header("x-goog-api-key", self.key.clone())
                    .json(&body)
                    .send()
                    .await
                    .with_context(|| "failed to reach Gemini")?;

                let status = response.status();
                let retry_after: Option<Duration> = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    debug!("Gemini responded ({} bytes)", text.len());
                    return extract_text_response(&text, &self.model);
                }
                if is_rate_limited(status, &text) && self.retry.should_retry(attempt) {
                    delay = self.retry.wait("Gemini", attempt, delay, retry_after).await;
                    continue;
                }
                return Err(anyhow!(
                    "Gemini API error ({}): {}",
                    status,
                    extract_gemini_error(&text).unwrap_or(text)
                ));
            }
        })
    }
}

fn extract_text_response(
    text: &str,
    fallback_model: &str,
) -> Result<ProviderResponse, anyhow::Error> {
    let payload: GeminiResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let candidate = payload
        .candidates
        .first()
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;
    let content = candidate.content.as_ref().ok_or_else(|| {
        anyhow!(
            "Gemini candidate has no content (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )
    })?;

    let output = content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    let model = payload
        .model_version
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage_metadata.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    Ok(ProviderResponse {
        text: output.trim().to_string(),
        model,
        usage,
    })
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(
        error.message,
        error.status,
        error.code.map(|value| value.to_string()),
    ))
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
