use std::collections::BTreeSet;

use super::{
    GenerationConfig, Message, MessagePart, MessageRole, Provider, ProviderFuture,
    ProviderResponse,
};

/// API key that selects the offline oracle.
pub const OFFLINE_KEY: &str = "TEST";
const OFFLINE_TRANSLATION: &str = "Test Translation";

/// Answers without a network call: one `[k] Test Translation` line per
/// distinct index numbered in the request, or a bare translation when nothing
/// is numbered.
#[derive(Debug, Clone, Default)]
pub struct Offline {
    messages: Vec<Message>,
}

impl Offline {
    pub fn new() -> Self {
        Self::default()
    }

    fn numbered_inputs(&self) -> BTreeSet<u32> {
        self.messages
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .flat_map(|message| message.parts.iter())
            .filter_map(|part| match part {
                MessagePart::Text(text) => leading_index(text),
                MessagePart::Data(_) => None,
            })
            .collect()
    }
}

fn leading_index(text: &str) -> Option<u32> {
    let rest = text.trim_start().strip_prefix('[')?;
    let (digits, _) = rest.split_once(']')?;
    digits.parse().ok()
}

impl Provider for Offline {
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

    fn with_generation(self, _generation: GenerationConfig) -> Self {
        self
    }

    fn generate(self) -> ProviderFuture {
        Box::pin(async move {
            let indices = self.numbered_inputs();
            let text = if indices.is_empty() {
                OFFLINE_TRANSLATION.to_string()
            } else {
                indices
                    .iter()
                    .map(|index| format!("[{}] {}", index, OFFLINE_TRANSLATION))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(ProviderResponse {
                text,
                model: Some("offline".to_string()),
                usage: None,
            })
        })
    }
}
