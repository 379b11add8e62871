use anyhow::{Result, anyhow};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

use crate::data::DataAttachment;

mod gemini;
mod offline;
mod openai;
mod retry;

pub use gemini::Gemini;
pub use offline::{OFFLINE_KEY, Offline};
pub use openai::OpenAI;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => openai::DEFAULT_MODEL,
            ProviderKind::Gemini => gemini::DEFAULT_MODEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

/// Sampling parameters for one oracle call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResponse {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    Data(DataAttachment),
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user_data(data: DataAttachment) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Data(data)],
        }
    }

    pub fn has_data(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, MessagePart::Data(_)))
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;

/// A translation oracle. Requests are assembled builder-style on a clone of
/// the configured provider and consumed by `generate`.
pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn append_user_data(self, data: DataAttachment) -> Self;
    fn with_generation(self, generation: GenerationConfig) -> Self;
    fn generate(self) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Gemini(Gemini),
    Offline(Offline),
}

impl ProviderImpl {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderImpl::OpenAI(_) => ProviderKind::OpenAI.as_str(),
            ProviderImpl::Gemini(_) => ProviderKind::Gemini.as_str(),
            ProviderImpl::Offline(_) => "offline",
        }
    }
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_system_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_system_input(input))
            }
            ProviderImpl::Offline(provider) => {
                ProviderImpl::Offline(provider.append_system_input(input))
            }
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_user_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_user_input(input))
            }
            ProviderImpl::Offline(provider) => {
                ProviderImpl::Offline(provider.append_user_input(input))
            }
        }
    }

    fn append_user_data(self, data: DataAttachment) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.append_user_data(data)),
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.append_user_data(data)),
            ProviderImpl::Offline(provider) => {
                ProviderImpl::Offline(provider.append_user_data(data))
            }
        }
    }

    fn with_generation(self, generation: GenerationConfig) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.with_generation(generation))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.with_generation(generation))
            }
            ProviderImpl::Offline(provider) => {
                ProviderImpl::Offline(provider.with_generation(generation))
            }
        }
    }

    fn generate(self) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.generate(),
            ProviderImpl::Gemini(provider) => provider.generate(),
            ProviderImpl::Offline(provider) => provider.generate(),
        }
    }
}

/// Builds the adapter for `provider`; the reserved key `TEST` selects the
/// offline oracle instead of a network one.
pub fn build_provider(provider: ProviderKind, key: String, model: String) -> ProviderImpl {
    if key == OFFLINE_KEY {
        return ProviderImpl::Offline(Offline::new());
    }
    match provider {
        ProviderKind::OpenAI => ProviderImpl::OpenAI(OpenAI::new(key).with_model(model)),
        ProviderKind::Gemini => ProviderImpl::Gemini(Gemini::new(key).with_model(model)),
    }
}

pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    match model_arg {
        Some(model) => parse_model_arg(model),
        None => default_provider_selection(override_key),
    }
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key {
        return Ok(key.to_string());
    }

    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Gemini => get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY")),
    }
    .ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

fn default_provider_selection(override_key: Option<&str>) -> Result<ProviderSelection> {
    if get_env("GEMINI_API_KEY").is_some() || get_env("GOOGLE_API_KEY").is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: None,
        });
    }

    if get_env("OPENAI_API_KEY").is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::OpenAI,
            requested_model: None,
        });
    }

    if override_key.is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: None,
        });
    }

    Err(anyhow!(
        "no API keys found (checked GEMINI_API_KEY/GOOGLE_API_KEY, OPENAI_API_KEY)"
    ))
}

pub fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }

    if let Some(provider) = provider_from_name(&raw.to_lowercase()) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider_part, model_part)) = raw.split_once(':')
        && let Some(provider) = provider_from_name(&provider_part.to_lowercase())
    {
        let model = model_part.trim();
        return Ok(ProviderSelection {
            provider,
            requested_model: (!model.is_empty()).then(|| model.to_string()),
        });
    }

    if raw.starts_with("gemini-") {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: Some(raw.to_string()),
        });
    }
    if raw.starts_with("gpt-") || raw.starts_with("o1") || raw.starts_with("o3") {
        return Ok(ProviderSelection {
            provider: ProviderKind::OpenAI,
            requested_model: Some(raw.to_string()),
        });
    }

    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (gemini:, openai:)",
        raw
    ))
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" => Some(ProviderKind::OpenAI),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Joins the non-empty pieces of an API error body into one line.
pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let non_blank = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
    let parts = [
        non_blank(message),
        non_blank(kind).map(|kind| format!("type: {}", kind)),
        non_blank(code).map(|code| format!("code: {}", code)),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_argument_forms() {
        let selection = parse_model_arg("gemini").unwrap();
        assert_eq!(selection.provider, ProviderKind::Gemini);
        assert!(selection.requested_model.is_none());

        let selection = parse_model_arg("openai:gpt-4o").unwrap();
        assert_eq!(selection.provider, ProviderKind::OpenAI);
        assert_eq!(selection.requested_model.as_deref(), Some("gpt-4o"));

        let selection = parse_model_arg("google:").unwrap();
        assert_eq!(selection.provider, ProviderKind::Gemini);
        assert!(selection.requested_model.is_none());

        let selection = parse_model_arg("gemini-2.5-pro").unwrap();
        assert_eq!(selection.provider, ProviderKind::Gemini);
        assert_eq!(selection.requested_model.as_deref(), Some("gemini-2.5-pro"));

        assert!(parse_model_arg("  ").is_err());
        assert!(parse_model_arg("llama3").is_err());
    }

    #[test]
    fn explicit_key_wins() {
        assert_eq!(resolve_key(ProviderKind::OpenAI, Some("abc")).unwrap(), "abc");
    }

    #[test]
    fn test_key_builds_offline_provider() {
        let provider = build_provider(
            ProviderKind::Gemini,
            OFFLINE_KEY.to_string(),
            String::new(),
        );
        assert_eq!(provider.name(), "offline");
        let provider = build_provider(ProviderKind::OpenAI, "sk-1".to_string(), String::new());
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn error_parts_skip_blanks() {
        assert_eq!(
            format_error_parts(Some("bad".into()), Some(" ".into()), Some("400".into())),
            "bad | code: 400"
        );
        assert_eq!(format_error_parts(None, None, None), "unknown error");
    }
}
