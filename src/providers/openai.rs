use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::retry::{RetryPolicy, is_rate_limited, retry_after};
use super::{
    GenerationConfig, Message, MessagePart, MessageRole, Provider, ProviderFuture,
    ProviderResponse, ProviderUsage, format_error_parts,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    messages: Vec<Message>,
    generation: Option<GenerationConfig>,
    retry: RetryPolicy,
}

impl OpenAI {
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
}

impl Provider for OpenAI {
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
            if self.messages.iter().any(Message::has_data) {
                let body = responses_body(&self);
                post_with_retry(&self, "responses", &body, extract_responses_text).await
            } else {
                let body = chat_completions_body(&self)?;
                post_with_retry(&self, "chat/completions", &body, extract_chat_text).await
            }
        })
    }
}

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn message_text(message: &Message) -> Result<String> {
    let mut parts = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text(text) => parts.push(text.as_str()),
            MessagePart::Data(_) => {
                return Err(anyhow!("binary data cannot be sent via chat completions"));
            }
        }
    }
    Ok(parts.join("\n\n"))
}

fn chat_completions_body(provider: &OpenAI) -> Result<Value> {
    let messages = provider
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
            };
            Ok(json!({"role": role, "content": message_text(message)?}))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut body = json!({
        "model": provider.model,
        "messages": messages,
    });
    if let Some(generation) = provider.generation {
        body["temperature"] = json!(generation.temperature);
        body["max_tokens"] = json!(generation.max_output_tokens);
    }
    Ok(body)
}

/// Responses API body: every user part goes into one input turn, images as
/// data URLs.
fn responses_body(provider: &OpenAI) -> Value {
    let system = provider
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            MessagePart::Data(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let content = provider
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::User)
        .flat_map(|message| message.parts.iter())
        .map(|part| match part {
            MessagePart::Text(text) => json!({"type": "input_text", "text": text}),
            MessagePart::Data(data) => {
                let url = format!("data:{};base64,{}", data.mime, BASE64.encode(&data.bytes));
                json!({"type": "input_image", "image_url": url})
            }
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": provider.model,
        "input": [{"role": "user", "content": content}],
    });
    if !system.trim().is_empty() {
        body["instructions"] = json!(system);
    }
    if let Some(generation) = provider.generation {
        body["temperature"] = json!(generation.temperature);
        body["max_output_tokens"] = json!(generation.max_output_tokens);
    }
    body
}

async fn post_with_retry(
    provider: &OpenAI,
    endpoint: &str,
    body: &Value,
    extract: fn(&str, &str) -> Result<ProviderResponse>,
) -> Result<ProviderResponse> {
    let client = reqwest::Client::new();
    let url = format!("{}/{}", base_url(), endpoint);

    let mut attempt = 0usize;
    let mut delay = provider.retry.base_delay;
    loop {
        attempt += 1;
        let response = client
            .post(&url)
            .bearer_auth(provider.key.clone())
            .json(body)
            .send()
            .await
            .with_context(|| "failed to reach OpenAI")?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            debug!("OpenAI {} responded ({} bytes)", endpoint, text.len());
            return extract(&text, &provider.model);
        }
        if is_rate_limited(status, &text) && provider.retry.should_retry(attempt) {
            delay = provider.retry.wait("OpenAI", attempt, delay, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "OpenAI API error ({}): {}",
            status,
            extract_openai_error(&text).unwrap_or(text)
        ));
    }
}

fn extract_chat_text(text: &str, fallback_model: &str) -> Result<ProviderResponse> {
    let payload: ChatResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let content = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| anyhow!("no message content returned from OpenAI"))?;

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse {
        text: content.trim().to_string(),
        model,
        usage,
    })
}

fn extract_responses_text(text: &str, fallback_model: &str) -> Result<ProviderResponse> {
    let payload: ResponseApiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let chunks = payload
        .output
        .iter()
        .filter_map(|item| match item {
            ResponseOutputItem::Message { content } => Some(content),
            ResponseOutputItem::Other => None,
        })
        .flatten()
        .filter_map(|content| match content {
            ResponseContent::OutputText { text } => Some(text.as_str()),
            ResponseContent::Other => None,
        })
        .collect::<Vec<_>>();
    if chunks.is_empty() {
        return Err(anyhow!("no output text returned from OpenAI"));
    }

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse {
        text: chunks.join("").trim().to_string(),
        model,
        usage,
    })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, error.code))
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseApiResponse {
    model: Option<String>,
    #[serde(default)]
    output: Vec<ResponseOutputItem>,
    usage: Option<ResponseApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseOutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<ResponseContent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContent {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataAttachment;
    use insta::assert_json_snapshot;

    #[test]
    fn openai_extract_chat_text_snapshot() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_chat_response.json"
        ));
        let response = extract_chat_text(payload, "gpt-4o-mini").unwrap();
        assert_json_snapshot!(response);
    }

    #[test]
    fn openai_extract_responses_text_snapshot() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_responses_response.json"
        ));
        let response = extract_responses_text(payload, "gpt-4o-mini").unwrap();
        assert_json_snapshot!(response);
    }

    #[test]
    fn null_content_is_an_error() {
        let payload = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert!(extract_chat_text(payload, "gpt-4o-mini").is_err());
    }

    #[test]
    fn images_go_through_the_responses_body() {
        let provider = OpenAI::new("sk")
            .append_system_input("rules".to_string())
            .append_user_input("Full page for context:".to_string())
            .append_user_data(DataAttachment {
                bytes: vec![0xff],
                mime: "image/png".to_string(),
                name: None,
            })
            .with_generation(GenerationConfig {
                temperature: 0.5,
                max_output_tokens: 2000,
            });
        let body = responses_body(&provider);
        assert_eq!(body["instructions"], "rules");
        let content = body["input"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "input_text");
        assert_eq!(content[1]["image_url"], "data:image/png;base64,/w==");
        assert_eq!(body["max_output_tokens"], 2000);
        assert!(chat_completions_body(&provider).is_err());
    }
}
