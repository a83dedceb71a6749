//! Identity resolver. Finds the existing opportunity an email belongs to.
//!
//! Rules, first match wins:
//! 1. **Thread**: the email's conversation is the opportunity's originating
//!    thread, or a thread already linked to it through an earlier interaction.
//! 2. **Identity**: same normalized contact email, or same normalized company
//!    *and* the sender's domain equals the opportunity contact's domain.
//! 3. **No match**: the caller creates a new opportunity.
//!
//! Rule 2 is a string heuristic. Two companies sharing a normalized name and
//! a mail domain will be merged, and a contact who switches domains will be
//! split. No stronger identity key exists in the source data.

use std::collections::HashSet;

use tracing::warn;

use crate::crm::model::{LeadSignal, Opportunity};
use crate::crm::snapshot::{LedgerSnapshot, compare_opportunity_ids};

/// Consumer mail providers. A shared domain here says nothing about the company.
pub const DEFAULT_FREEMAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "msn.com",
    "yahoo.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
];

/// Company values the extractor emits when it does not know the company.
const COMPANY_PLACEHOLDERS: &[&str] = &["na", "n a", "none", "unknown", "null"];

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Domains never used for company-domain matching.
    pub freemail_domains: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            freemail_domains: DEFAULT_FREEMAIL_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

/// Which rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// Originating thread of the opportunity.
    Thread,
    /// Thread linked to the opportunity by an earlier interaction.
    LinkedThread,
    /// Same contact email.
    ContactEmail,
    /// Same company, sender on the contact's domain.
    CompanyDomain,
}

impl MatchRule {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::LinkedThread => "linked_thread",
            Self::ContactEmail => "contact_email",
            Self::CompanyDomain => "company_domain",
        }
    }
}

/// Several opportunities matched equally; the tie-break picked one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub chosen: String,
    pub candidates: Vec<String>,
}

/// Outcome of resolving one signal.
#[derive(Debug, Clone)]
pub enum Resolution<'a> {
    Matched {
        opportunity: &'a Opportunity,
        rule: MatchRule,
        ambiguity: Option<AmbiguousMatch>,
    },
    NoMatch,
}

impl<'a> Resolution<'a> {
    pub fn opportunity(&self) -> Option<&'a Opportunity> {
        match self {
            Self::Matched { opportunity, .. } => Some(opportunity),
            Self::NoMatch => None,
        }
    }

    pub fn ambiguity(&self) -> Option<&AmbiguousMatch> {
        match self {
            Self::Matched { ambiguity, .. } => ambiguity.as_ref(),
            Self::NoMatch => None,
        }
    }
}

/// Normalized email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedEmail {
    pub local: String,
    pub domain: String,
}

/// Lower-case and validate an email address.
///
/// Accepts `mailto:` prefixes and `<...>` wrapping. Returns `None` for
/// anything that is not `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Option<NormalizedEmail> {
    let mut s = raw.trim().to_lowercase();
    if let Some(rest) = s.strip_prefix("mailto:") {
        s = rest.to_string();
    }
    let s = s.trim_start_matches('<').trim_end_matches('>').trim();

    let (local, domain) = s.split_once('@')?;
    let domain = domain.trim_end_matches('.');
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || s.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(NormalizedEmail {
        local: local.to_string(),
        domain: domain.to_string(),
    })
}

/// Lower-case, strip punctuation, collapse whitespace.
///
/// Returns `None` for empty values and extractor placeholders like `N/A`.
pub fn normalize_company(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() || c == '/' || c == '-' {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    let normalized = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || COMPANY_PLACEHOLDERS.contains(&normalized.as_str()) {
        None
    } else {
        Some(normalized)
    }
}

/// Resolves lead signals against the ledger snapshot.
pub struct IdentityResolver {
    freemail: HashSet<String>,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            freemail: config
                .freemail_domains
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Find the opportunity this signal belongs to.
    pub fn resolve<'a>(&self, signal: &LeadSignal, snapshot: &'a LedgerSnapshot) -> Resolution<'a> {
        if let Some(resolution) = self.thread_match(signal, snapshot) {
            return resolution;
        }
        if let Some(resolution) = self.identity_match(signal, snapshot) {
            return resolution;
        }
        Resolution::NoMatch
    }

    fn thread_match<'a>(
        &self,
        signal: &LeadSignal,
        snapshot: &'a LedgerSnapshot,
    ) -> Option<Resolution<'a>> {
        let thread = signal.conversation_id.trim();
        if thread.is_empty() {
            return None;
        }

        let originating: Vec<&Opportunity> = snapshot
            .opportunities()
            .iter()
            .filter(|o| o.conversation_id == thread)
            .collect();
        if !originating.is_empty() {
            return Some(pick(signal, originating, MatchRule::Thread));
        }

        let linked_ids: HashSet<&str> = snapshot
            .interactions()
            .iter()
            .filter(|i| i.conversation_id == thread)
            .map(|i| i.opportunity_id.as_str())
            .collect();
        let linked: Vec<&Opportunity> = linked_ids
            .into_iter()
            .filter_map(|id| snapshot.get(id))
            .collect();
        if !linked.is_empty() {
            return Some(pick(signal, linked, MatchRule::LinkedThread));
        }
        None
    }

    fn identity_match<'a>(
        &self,
        signal: &LeadSignal,
        snapshot: &'a LedgerSnapshot,
    ) -> Option<Resolution<'a>> {
        let contact = normalize_email(&signal.contact_email);
        let company = normalize_company(&signal.contact_company);
        let sender_domain = normalize_email(&signal.sender_email)
            .map(|e| e.domain)
            .filter(|d| !self.freemail.contains(d));

        // Each branch is gated only by its own fields.
        if contact.is_none() && (company.is_none() || sender_domain.is_none()) {
            return None;
        }

        let mut by_email = Vec::new();
        let mut by_company = Vec::new();
        for opportunity in snapshot.opportunities() {
            let opp_email = normalize_email(&opportunity.contact_email);
            if let (Some(c), Some(o)) = (&contact, &opp_email)
                && c == o
            {
                by_email.push(opportunity);
                continue;
            }
            if let (Some(company), Some(domain), Some(o)) = (&company, &sender_domain, &opp_email)
                && &o.domain == domain
                && normalize_company(&opportunity.contact_company).as_ref() == Some(company)
            {
                by_company.push(opportunity);
            }
        }

        if by_email.is_empty() && by_company.is_empty() {
            return None;
        }

        let email_ids: HashSet<&str> = by_email
            .iter()
            .map(|o| o.opportunity_id.as_str())
            .collect();
        let candidates: Vec<&Opportunity> = by_email.into_iter().chain(by_company).collect();
        let Resolution::Matched {
            opportunity,
            ambiguity,
            ..
        } = pick(signal, candidates, MatchRule::ContactEmail)
        else {
            return None;
        };
        let rule = if email_ids.contains(opportunity.opportunity_id.as_str()) {
            MatchRule::ContactEmail
        } else {
            MatchRule::CompanyDomain
        };
        Some(Resolution::Matched {
            opportunity,
            rule,
            ambiguity,
        })
    }
}

/// Pick the most recently created candidate, ties broken by highest ID.
fn pick<'a>(
    signal: &LeadSignal,
    mut candidates: Vec<&'a Opportunity>,
    rule: MatchRule,
) -> Resolution<'a> {
    candidates.sort_by(|a, b| {
        b.date_created
            .cmp(&a.date_created)
            .then_with(|| compare_opportunity_ids(&b.opportunity_id, &a.opportunity_id))
    });
    let Some(&chosen) = candidates.first() else {
        return Resolution::NoMatch;
    };

    let ambiguity = (candidates.len() > 1).then(|| {
        let ids: Vec<String> = candidates
            .iter()
            .map(|o| o.opportunity_id.clone())
            .collect();
        warn!(
            message_id = %signal.message_id,
            chosen = %chosen.opportunity_id,
            candidates = ?ids,
            rule = rule.label(),
            "Ambiguous opportunity match, picked most recent"
        );
        AmbiguousMatch {
            chosen: chosen.opportunity_id.clone(),
            candidates: ids,
        }
    });

    Resolution::Matched {
        opportunity: chosen,
        rule,
        ambiguity,
    }
}
