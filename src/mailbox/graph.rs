//! Microsoft Graph mailbox adapter.
//!
//! Lists `/me/mailFolders/{folder}/messages` newer than a boundary, oldest
//! first, following `@odata.nextLink` until the listing is exhausted or the
//! page cap is hit. A capped listing reports where the next run resumes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;
use crate::error::MailboxError;
use crate::mailbox::text::{html_to_text, strip_quoted_text};
use crate::mailbox::types::{FetchBatch, MailMessage, Mailbox};

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

const SELECT_FIELDS: &str = "id,conversationId,subject,from,receivedDateTime,body";

/// Upper bound on pages per fetch, against a server that never stops paging.
const MAX_PAGES: usize = 200;

// ── API response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    received_date_time: DateTime<Utc>,
    #[serde(default)]
    body: Option<ItemBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: String,
}

impl GraphMessage {
    /// Reduce to a `MailMessage`. Messages without a sender or thread are dropped.
    fn into_mail_message(self) -> Option<MailMessage> {
        let Some(sender) = self
            .from
            .as_ref()
            .and_then(|r| r.email_address.address.as_deref())
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
        else {
            warn!(message_id = %self.id, "Skipping message without sender address");
            return None;
        };
        let Some(conversation_id) = self.conversation_id.filter(|c| !c.is_empty()) else {
            warn!(message_id = %self.id, "Skipping message without conversation id");
            return None;
        };

        let sender_name = self
            .from
            .and_then(|r| r.email_address.name)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let body_text = match self.body {
            Some(body) => {
                let is_html = body
                    .content_type
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case("html"));
                let text = if is_html {
                    match html_to_text(&body.content) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(
                                message_id = %self.id,
                                error = %e,
                                "HTML body did not render, using raw markup"
                            );
                            body.content
                        }
                    }
                } else {
                    body.content
                };
                strip_quoted_text(&text)
            }
            None => String::new(),
        };

        Some(MailMessage {
            id: self.id,
            conversation_id,
            sender,
            sender_name,
            subject: self.subject.unwrap_or_default(),
            received_at: self.received_date_time,
            body_text,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Graph mail folder reader.
pub struct GraphMailbox {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
    folder: String,
    page_size: u32,
}

impl GraphMailbox {
    pub fn new(credentials: Arc<dyn CredentialProvider>, folder: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            base_url: GRAPH_BASE_URL.to_string(),
            folder: folder.into(),
            page_size: 50,
        }
    }

    /// Point at a different Graph endpoint (sovereign clouds, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn first_page_url(&self, since: DateTime<Utc>) -> Result<reqwest::Url, MailboxError> {
        let filter = format!(
            "receivedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let top = self.page_size.to_string();
        reqwest::Url::parse_with_params(
            &format!("{}/me/mailFolders/{}/messages", self.base_url, self.folder),
            &[
                ("$filter", filter.as_str()),
                ("$orderby", "receivedDateTime asc"),
                ("$select", SELECT_FIELDS),
                ("$top", top.as_str()),
            ],
        )
        .map_err(|e| MailboxError::InvalidResponse(format!("bad mailbox URL: {e}")))
    }

    async fn fetch_page(&self, url: &str, token: &str) -> Result<MessagePage, MailboxError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Prefer", "outlook.body-content-type=\"html\"")
            .send()
            .await
            .map_err(|e| MailboxError::Transient(e.to_string()))?;

        let status = resp.status();
        if let Some(err) = classify_status(status) {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body = %body, "Graph request failed");
            return Err(err);
        }

        resp.json::<MessagePage>()
            .await
            .map_err(|e| MailboxError::InvalidResponse(e.to_string()))
    }
}

/// Map a non-success HTTP status to an error, or `None` on success.
fn classify_status(status: reqwest::StatusCode) -> Option<MailboxError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        401 | 403 => MailboxError::Auth {
            status: status.as_u16(),
        },
        408 | 429 => MailboxError::Transient(format!("HTTP {status}")),
        s if s >= 500 => MailboxError::Transient(format!("HTTP {status}")),
        _ => MailboxError::InvalidResponse(format!("HTTP {status}")),
    })
}

/// Convert, drop excluded IDs, and order oldest first.
fn collect_messages(
    raw: Vec<GraphMessage>,
    excluded: &HashSet<String>,
) -> Vec<MailMessage> {
    let mut messages: Vec<MailMessage> = raw
        .into_iter()
        .filter(|m| !excluded.contains(&m.id))
        .filter_map(GraphMessage::into_mail_message)
        .collect();
    messages.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));
    messages
}

#[async_trait]
impl Mailbox for GraphMailbox {
    async fn fetch_since(
        &self,
        since: DateTime<Utc>,
        excluded: &HashSet<String>,
    ) -> Result<FetchBatch, MailboxError> {
        let token = self.credentials.access_token().await?;
        let mut next = Some(self.first_page_url(since)?.to_string());
        let mut raw = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                next = Some(url);
                break;
            }
            let page = self.fetch_page(&url, token.expose_secret()).await?;
            pages += 1;
            debug!(page = pages, count = page.value.len(), "Fetched Graph page");
            raw.extend(page.value);
            next = page.next_link;
        }

        let resume_from = next
            .is_some()
            .then(|| last_received(&raw).unwrap_or(since));
        if let Some(resume) = resume_from {
            warn!(
                pages = MAX_PAGES,
                resume_from = %resume.to_rfc3339(),
                "Stopped paging; the rest is fetched by the next run"
            );
        }

        let fetched = raw.len();
        let messages = collect_messages(raw, excluded);
        info!(
            since = %since.to_rfc3339(),
            fetched,
            new = messages.len(),
            "Mailbox fetch complete"
        );
        Ok(FetchBatch {
            messages,
            resume_from,
        })
    }
}

/// Latest receive time in a raw listing.
fn last_received(raw: &[GraphMessage]) -> Option<DateTime<Utc>> {
    raw.iter().map(|m| m.received_date_time).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use chrono::TimeZone;
    use secrecy::SecretString;

    const PAGE: &str = r#"{
        "@odata.context": "https://graph.microsoft.com/v1.0/$metadata#users('me')/messages",
        "value": [
            {
                "id": "AAMk-2",
                "conversationId": "T9",
                "subject": "RE: Widgets",
                "from": { "emailAddress": { "name": "Bob Smith", "address": "Bob@Globex.com" } },
                "receivedDateTime": "2025-04-02T10:00:00Z",
                "body": { "contentType": "html", "content": "<p>Can we get a quote?</p><p>On Mon Jane wrote:</p><p>old</p>" }
            },
            {
                "id": "AAMk-1",
                "conversationId": "T1",
                "subject": "Widgets",
                "from": { "emailAddress": { "name": "Jane", "address": "jane@globex.com" } },
                "receivedDateTime": "2025-04-01T09:00:00Z",
                "body": { "contentType": "text", "content": "Need 500 widgets" }
            },
            {
                "id": "AAMk-3",
                "conversationId": "T3",
                "receivedDateTime": "2025-04-03T09:00:00Z"
            }
        ],
        "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/messages?$skip=3"
    }"#;

    #[test]
    fn parses_page_and_next_link() {
        let page: MessagePage = serde_json::from_str(PAGE).unwrap();
        assert_eq!(page.value.len(), 3);
        assert_eq!(
            page.next_link.as_deref(),
            Some("https://graph.microsoft.com/v1.0/me/messages?$skip=3")
        );
    }

    #[test]
    fn collect_converts_sorts_and_excludes() {
        let page: MessagePage = serde_json::from_str(PAGE).unwrap();
        let messages = collect_messages(page.value, &HashSet::new());

        // AAMk-3 has no sender and is dropped.
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "AAMk-1");
        assert_eq!(messages[1].id, "AAMk-2");
        assert_eq!(messages[1].sender, "bob@globex.com");
        assert_eq!(messages[1].sender_name.as_deref(), Some("Bob Smith"));
        assert_eq!(messages[1].body_text, "Can we get a quote?");
        assert_eq!(messages[0].body_text, "Need 500 widgets");

        let page: MessagePage = serde_json::from_str(PAGE).unwrap();
        let excluded: HashSet<String> = ["AAMk-1".to_string()].into();
        let messages = collect_messages(page.value, &excluded);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "AAMk-2");
    }

    #[test]
    fn last_received_covers_dropped_messages() {
        let page: MessagePage = serde_json::from_str(PAGE).unwrap();
        // AAMk-3 is dropped on conversion but was still listed, so the
        // resume point must include it.
        assert_eq!(
            last_received(&page.value),
            Some(Utc.with_ymd_and_hms(2025, 4, 3, 9, 0, 0).unwrap())
        );
        assert_eq!(last_received(&[]), None);
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(MailboxError::Auth { status: 401 })
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(MailboxError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(MailboxError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            Some(MailboxError::InvalidResponse(_))
        ));
    }

    #[test]
    fn first_page_url_carries_filter_and_order() {
        let mailbox = GraphMailbox::new(
            Arc::new(StaticTokenProvider::new(SecretString::from("t"))),
            "inbox",
        )
        .with_base_url("https://graph.example/v1.0/");
        let since = Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap();
        let url = mailbox.first_page_url(since).unwrap();

        assert!(url.as_str().starts_with("https://graph.example/v1.0/me/mailFolders/inbox/messages?"));
        let params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(params.contains(&(
            "$filter".to_string(),
            "receivedDateTime ge 2025-04-01T08:00:00Z".to_string()
        )));
        assert!(params.contains(&("$orderby".to_string(), "receivedDateTime asc".to_string())));
    }
}
