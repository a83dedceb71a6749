//! Sender screening, evaluated before extraction.
//!
//! Short-circuits mail that can never be a lead:
//! - noreply/no-reply senders
//! - mailer-daemon/postmaster bounces
//! - marketing/newsletter sender domains
//! - the organization's own (internal) domains
//! - auto-reply and delivery-failure subjects
//!
//! A screened message is marked processed and never reaches the LLM.

use regex::Regex;
use tracing::debug;

use crate::mailbox::MailMessage;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
}

/// A single screening rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct ScreenRule {
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Pre-extraction screening rules.
pub struct ScreeningRules {
    rules: Vec<ScreenRule>,
    /// Lower-cased domains; subdomains match too.
    internal_domains: Vec<String>,
}

impl ScreeningRules {
    /// Default sender and subject rules plus the given internal domains.
    pub fn default_rules(internal_domains: &[String]) -> Self {
        let defaults: [(&str, RuleField, &str); 5] = [
            (r"(?i)^no[\-_.]?reply@", RuleField::Sender, "noreply sender"),
            (
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                "automated mail system",
            ),
            (
                r"(?i)@(marketing|newsletter|news|promo|campaign)\.",
                RuleField::Sender,
                "marketing/newsletter sender",
            ),
            (
                r"(?i)^(automatic reply|auto[\- ]?reply|out of (the )?office)\b",
                RuleField::Subject,
                "auto-reply",
            ),
            (
                r"(?i)^(undeliverable|delivery status notification|mail delivery failed)\b",
                RuleField::Subject,
                "delivery failure notice",
            ),
        ];
        let rules = defaults
            .into_iter()
            .filter_map(|(pattern, field, reason)| {
                Regex::new(pattern).ok().map(|regex| ScreenRule {
                    regex,
                    field,
                    reason: reason.into(),
                })
            })
            .collect();

        Self {
            rules,
            internal_domains: normalize_domains(internal_domains),
        }
    }

    /// No rules at all (for testing).
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            internal_domains: Vec::new(),
        }
    }

    /// Returns the reason a message is screened out, or `None` to keep it.
    pub fn evaluate(&self, message: &MailMessage) -> Option<String> {
        let sender = message.sender.trim().to_lowercase();

        if let Some((_, domain)) = sender.rsplit_once('@')
            && self
                .internal_domains
                .iter()
                .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
        {
            debug!(sender = %sender, "Internal sender screened out");
            return Some(format!("internal sender ({domain})"));
        }

        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Sender => sender.as_str(),
                RuleField::Subject => message.subject.as_str(),
            };
            if rule.regex.is_match(value) {
                debug!(
                    sender = %sender,
                    reason = %rule.reason,
                    "Screening rule matched"
                );
                return Some(rule.reason.clone());
            }
        }
        None
    }
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().trim_start_matches('@').to_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}
