use anyhow::Result;
use tracing::debug;

use crate::providers::{GenerationConfig, MessagePart, Provider, ProviderResponse};

/// Sends one assembled request to the configured oracle.
#[derive(Debug, Clone)]
pub struct Translator<P: Provider + Clone> {
    provider: P,
}

impl<P: Provider + Clone> Translator<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Text and image parts are appended in order, after the system prompt.
    pub async fn generate(
        &self,
        system_prompt: String,
        parts: Vec<MessagePart>,
        generation: GenerationConfig,
    ) -> Result<ProviderResponse> {
        let mut provider = self
            .provider
            .clone()
            .append_system_input(system_prompt)
            .with_generation(generation);
        let part_count = parts.len();
        for part in parts {
            provider = match part {
                MessagePart::Text(text) => provider.append_user_input(text),
                MessagePart::Data(data) => provider.append_user_data(data),
            };
        }
        debug!(
            "calling oracle with {} parts (temperature={}, max_output_tokens={})",
            part_count, generation.temperature, generation.max_output_tokens
        );
        let response = provider.generate().await?;
        if let Some(usage) = &response.usage {
            debug!(
                "oracle usage: prompt={:?} completion={:?} total={:?}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }
        Ok(response)
    }
}
