//! Bridges rig's `CompletionModel` to our [`LlmProvider`] trait.

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role};

/// Wraps any rig completion model as an [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    default_max_tokens: u64,
    default_temperature: Option<f64>,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            default_max_tokens: 1024,
            default_temperature: None,
        }
    }

    /// Used when a request does not set its own limits.
    pub fn with_defaults(mut self, max_tokens: u64, temperature: f64) -> Self {
        self.default_max_tokens = max_tokens;
        self.default_temperature = Some(temperature);
        self
    }
}

/// A request reshaped for rig: preamble, prior turns, final user prompt.
#[derive(Debug, PartialEq)]
struct Prepared {
    preamble: Option<String>,
    history: Vec<ChatMessage>,
    prompt: String,
}

/// System messages become the preamble. The conversation must end with a
/// user message and may not open with the assistant.
fn prepare(messages: &[ChatMessage]) -> Option<Prepared> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let mut history: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .skip_while(|m| m.role == Role::Assistant)
        .cloned()
        .collect();

    let prompt = match history.pop() {
        Some(last) if last.role == Role::User => last.content,
        _ => return None,
    };

    Some(Prepared {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt,
    })
}

fn to_rig(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::User | Role::System => Message::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let Prepared {
            preamble,
            history,
            prompt,
        } = prepare(&request.messages).ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "request must end with a user message".to_string(),
        })?;

        let max_tokens = request
            .max_tokens
            .map(u64::from)
            .unwrap_or(self.default_max_tokens);
        let temperature = request.temperature.map(f64::from).or(self.default_temperature);

        let mut builder = self
            .model
            .completion_request(Message::user(prompt))
            .messages(history.iter().map(to_rig).collect())
            .max_tokens(max_tokens);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = temperature {
            builder = builder.temperature(temperature);
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text content in reply".to_string(),
            });
        }

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}
