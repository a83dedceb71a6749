//! Lead extraction: one email in, one `LeadSignal` out.
//!
//! The LLM decides whether the email is a sales opportunity and pulls out
//! contact fields. Missing contact fields fall back to the sender.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::crm::LeadSignal;
use crate::error::ExtractionError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mailbox::MailMessage;
use crate::mailbox::text::truncate_chars;

/// Body characters sent to the model.
pub const MAX_BODY_CHARS: usize = 2000;

const EXTRACTION_TEMPERATURE: f32 = 0.0;
const EXTRACTION_MAX_TOKENS: u32 = 600;

/// Turns one email into a structured signal.
#[async_trait]
pub trait SignalExtractor: Send + Sync {
    /// `Ok(None)` when the email has nothing to analyze.
    async fn analyze(&self, message: &MailMessage) -> Result<Option<LeadSignal>, ExtractionError>;
}

/// LLM-backed extractor.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SignalExtractor for LlmExtractor {
    async fn analyze(&self, message: &MailMessage) -> Result<Option<LeadSignal>, ExtractionError> {
        if message.body_text.trim().is_empty() && message.subject.trim().is_empty() {
            debug!(message_id = %message.id, "Empty message, nothing to extract");
            return Ok(None);
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extraction_system_prompt()),
            ChatMessage::user(build_extraction_user_prompt(message)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;

        let extracted = parse_extraction_response(&response.content).map_err(|e| {
            warn!(
                message_id = %message.id,
                raw_response = %response.content,
                error = %e,
                "Failed to parse extraction response"
            );
            ExtractionError::Parse(e)
        })?;

        Ok(Some(extracted.into_signal(message)))
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_extraction_system_prompt() -> String {
    "You are a CRM assistant. Decide whether the email below describes a sales opportunity \
     and extract its contact details.\n\n\
     A sales opportunity is:\n\
     - A potential business deal or project\n\
     - A request for proposal or quote\n\
     - A product inquiry with commercial intent\n\
     - A service request that could lead to revenue\n\
     - A partnership discussion with business potential\n\n\
     It is NOT:\n\
     - A general inquiry without clear commercial intent\n\
     - A support request\n\
     - Administrative communication\n\
     - A social or networking email\n\n\
     Respond with ONLY a JSON object:\n\
     {\"is_opportunity\": true, \"title\": \"...\", \"summary\": \"...\", \"action_item\": \"...\", \
     \"deadline\": \"...\", \"contact_name\": \"...\", \"contact_company\": \"...\", \
     \"contact_email\": \"...\", \"phone\": \"...\"}\n\n\
     Rules:\n\
     - The contact is the external customer, not our own staff\n\
     - Summary is one or two sentences\n\
     - Use an empty string for anything the email does not state\n\
     - Still fill summary and contact fields when is_opportunity is false"
        .to_string()
}

fn build_extraction_user_prompt(message: &MailMessage) -> String {
    let mut prompt = String::with_capacity(MAX_BODY_CHARS + 256);
    prompt.push_str(&format!("Subject: {}\n", message.subject));
    prompt.push_str(&format!("Sender: {}", message.sender));
    if let Some(ref name) = message.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    prompt.push_str(&format!(
        "Body:\n{}",
        truncate_chars(&message.body_text, MAX_BODY_CHARS)
    ));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ExtractionResponse {
    is_opportunity: bool,
    title: Option<String>,
    summary: Option<String>,
    action_item: Option<String>,
    deadline: Option<String>,
    contact_name: Option<String>,
    contact_company: Option<String>,
    contact_email: Option<String>,
    phone: Option<String>,
}

impl ExtractionResponse {
    /// Fill defaults from the message and build the signal.
    fn into_signal(self, message: &MailMessage) -> LeadSignal {
        let contact_email = clean(self.contact_email).unwrap_or_else(|| message.sender.clone());
        let contact_name = clean(self.contact_name)
            .or_else(|| message.sender_name.clone())
            .unwrap_or_else(|| {
                contact_email
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        let title = clean(self.title).unwrap_or_else(|| message.subject.trim().to_string());

        LeadSignal {
            message_id: message.id.clone(),
            is_opportunity: self.is_opportunity,
            contact_name,
            contact_company: clean(self.contact_company).unwrap_or_default(),
            contact_email,
            phone: clean(self.phone).unwrap_or_default(),
            title,
            summary: clean(self.summary).unwrap_or_default(),
            action_item: clean(self.action_item),
            deadline: clean(self.deadline),
            conversation_id: message.conversation_id.clone(),
            sender_email: message.sender.clone(),
            received_at: message.received_at,
        }
    }
}

/// Treat blanks and placeholder values as absent.
fn clean(value: Option<String>) -> Option<String> {
    let value = value?.trim().to_string();
    match value.to_lowercase().as_str() {
        "" | "n/a" | "na" | "none" | "null" | "unknown" => None,
        _ => Some(value),
    }
}

fn parse_extraction_response(raw: &str) -> Result<ExtractionResponse, String> {
    let json_str = extract_json_object(raw);
    serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct MockExtractionLlm {
        response: Result<String, ()>,
        last_prompt: Mutex<Option<String>>,
    }

    impl MockExtractionLlm {
        fn replying(text: &str) -> Self {
            Self {
                response: Ok(text.into()),
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockExtractionLlm {
        fn model_name(&self) -> &str {
            "mock-extraction"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            *self.last_prompt.lock().unwrap() =
                request.messages.last().map(|m| m.content.clone());
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "503".into(),
                }),
            }
        }
    }

    fn message(body: &str) -> MailMessage {
        MailMessage {
            id: "m1".into(),
            conversation_id: "T1".into(),
            sender: "bob@globex.com".into(),
            sender_name: Some("Bob Smith".into()),
            subject: "Widget order".into(),
            received_at: Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap(),
            body_text: body.into(),
        }
    }

    // ── Prompt construction tests ───────────────────────────────────

    #[test]
    fn user_prompt_truncates_body() {
        let long = "~".repeat(5000);
        let prompt = build_extraction_user_prompt(&message(&long));
        assert!(prompt.contains("Sender: bob@globex.com (Bob Smith)"));
        assert_eq!(prompt.matches('~').count(), MAX_BODY_CHARS);
    }

    // ── Response parsing tests ──────────────────────────────────────

    #[test]
    fn parses_markdown_wrapped_json() {
        let raw = "Here you go:\n```json\n{\"is_opportunity\": true, \"title\": \"RFQ\"}\n```";
        let parsed = parse_extraction_response(raw).unwrap();
        assert!(parsed.is_opportunity);
        assert_eq!(parsed.title.as_deref(), Some("RFQ"));
    }

    #[test]
    fn parses_json_with_surrounding_prose() {
        let raw = "Sure. {\"is_opportunity\": false, \"summary\": null} Hope that helps";
        let parsed = parse_extraction_response(raw).unwrap();
        assert!(!parsed.is_opportunity);
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_extraction_response("I cannot help with that").is_err());
    }

    #[test]
    fn placeholders_are_cleaned() {
        assert_eq!(clean(Some(" N/A ".into())), None);
        assert_eq!(clean(Some("  Globex ".into())).as_deref(), Some("Globex"));
    }

    // ── Extractor tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn defaults_contact_fields_from_sender() {
        let llm = Arc::new(MockExtractionLlm::replying(
            r#"{"is_opportunity": true, "summary": "Wants 500 widgets", "contact_email": "", "contact_name": "N/A", "contact_company": "Globex", "action_item": "Send quote"}"#,
        ));
        let extractor = LlmExtractor::new(llm.clone());
        let signal = extractor
            .analyze(&message("Can you quote 500 widgets?"))
            .await
            .unwrap()
            .unwrap();

        assert!(signal.is_opportunity);
        assert_eq!(signal.contact_email, "bob@globex.com");
        assert_eq!(signal.contact_name, "Bob Smith");
        assert_eq!(signal.contact_company, "Globex");
        assert_eq!(signal.title, "Widget order");
        assert_eq!(signal.action_item.as_deref(), Some("Send quote"));
        assert!(signal.deadline.is_none());
        assert_eq!(signal.conversation_id, "T1");
        assert_eq!(signal.sender_email, "bob@globex.com");
        assert!(
            llm.last_prompt
                .lock()
                .unwrap()
                .as_deref()
                .unwrap()
                .contains("Can you quote 500 widgets?")
        );
    }

    #[tokio::test]
    async fn empty_message_is_skipped_without_llm_call() {
        let llm = Arc::new(MockExtractionLlm::replying("{}"));
        let extractor = LlmExtractor::new(llm.clone());
        let mut empty = message("   ");
        empty.subject = String::new();
        assert!(extractor.analyze(&empty).await.unwrap().is_none());
        assert!(llm.last_prompt.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn llm_outage_is_transient() {
        let llm = Arc::new(MockExtractionLlm {
            response: Err(()),
            last_prompt: Mutex::new(None),
        });
        let err = LlmExtractor::new(llm)
            .analyze(&message("hello"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unparseable_response_is_parse_error() {
        let llm = Arc::new(MockExtractionLlm::replying("no json here"));
        let err = LlmExtractor::new(llm)
            .analyze(&message("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Parse(_)));
        assert!(!err.is_transient());
    }
}
