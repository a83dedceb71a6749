//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's preamble, history, and prompt.
///
/// System messages are joined into the preamble; the final user message is
/// the prompt and everything before it is history.
fn split_messages(
    messages: Vec<ChatMessage>,
) -> Result<(Option<String>, Vec<Message>, Message), String> {
    let mut preamble: Vec<String> = Vec::new();
    let mut turns: Vec<ChatMessage> = Vec::new();
    for message in messages {
        match message.role {
            Role::System => preamble.push(message.content),
            _ => turns.push(message),
        }
    }

    let prompt = match turns.pop() {
        Some(last) if last.role == Role::User => Message::user(last.content),
        Some(_) => return Err("last message must be from the user".into()),
        None => return Err("request has no user message".into()),
    };

    let history = turns
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::assistant(m.content),
            _ => Message::user(m.content),
        })
        .collect();

    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
    Ok((preamble, history, prompt))
}

/// Map a rig failure onto our error type by its message.
fn classify_error(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401")
        || lower.contains("authentication")
        || lower.contains("invalid x-api-key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("json") || lower.contains("deserializ") {
        LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) =
            split_messages(request.messages).map_err(|reason| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason,
            })?;

        let mut builder = self.model.completion_request(prompt);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if !history.is_empty() {
            builder = builder.messages(history);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(&self.model_name, e.to_string()))?;

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
                reason: "response contained no text".into(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_joins_system_and_takes_last_user() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::system("rules"),
            ChatMessage::system("more rules"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("rules\n\nmore rules"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn split_requires_trailing_user_message() {
        assert!(split_messages(vec![ChatMessage::system("rules")]).is_err());
        assert!(
            split_messages(vec![ChatMessage::user("q"), ChatMessage::assistant("a")]).is_err()
        );
    }

    #[test]
    fn classify_rate_limit_and_auth() {
        assert!(matches!(
            classify_error("m", "HTTP 429 Too Many Requests".into()),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_error("m", "401 authentication_error".into()),
            LlmError::AuthFailed { .. }
        ));
        assert!(classify_error("m", "connection reset".into()).is_transient());
    }
}
