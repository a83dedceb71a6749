//! Mailbox message type and fetch trait.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;

/// One fetched email, already reduced to plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Mailbox-native message ID. Stable across fetches.
    pub id: String,
    /// Thread identifier. Stable for every message in a thread.
    pub conversation_id: String,
    /// Sender address, lower-cased.
    pub sender: String,
    /// Sender display name, if the mailbox reports one.
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    pub received_at: DateTime<Utc>,
    /// Body as plain text, quoted history removed.
    pub body_text: String,
}

/// Result of one mailbox listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub messages: Vec<MailMessage>,
    /// Set when the listing stopped early. Everything received before this
    /// instant was listed; later mail was not.
    pub resume_from: Option<DateTime<Utc>>,
}

/// A mailbox that can list messages newer than a boundary.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Messages received at or after `since`, minus `excluded` IDs.
    async fn fetch_since(
        &self,
        since: DateTime<Utc>,
        excluded: &HashSet<String>,
    ) -> Result<FetchBatch, MailboxError>;
}
