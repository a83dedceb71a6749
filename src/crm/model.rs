//! CRM data model: lead signals, ledger rows, and the deltas between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured result of analyzing one email.
///
/// Produced by the extractor, consumed by the resolver and reconciler,
/// and dropped once the email has been reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSignal {
    /// Mailbox-native ID of the source email.
    pub message_id: String,
    /// Whether the email describes a sales opportunity.
    pub is_opportunity: bool,
    pub contact_name: String,
    pub contact_company: String,
    pub contact_email: String,
    pub phone: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Thread the email belongs to.
    pub conversation_id: String,
    pub sender_email: String,
    pub received_at: DateTime<Utc>,
}

/// Lifecycle of an opportunity.
///
/// `New → In Progress → Closed`. Automated reconciliation only ever moves
/// forward and never sets `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityStatus {
    #[serde(rename = "New")]
    New,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Closed")]
    Closed,
}

impl OpportunityStatus {
    /// Status after a follow-up interaction is appended.
    ///
    /// `New` advances to `In Progress`; everything else is unchanged.
    pub fn after_follow_up(self) -> Self {
        match self {
            Self::New => Self::InProgress,
            other => other,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::InProgress => 1,
            Self::Closed => 2,
        }
    }

    /// Check if moving to `target` keeps the status monotonic.
    pub fn can_transition_to(&self, target: OpportunityStatus) -> bool {
        target.rank() >= self.rank()
    }
}

impl std::fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::InProgress => "In Progress",
            Self::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OpportunityStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(Self::New),
            "In Progress" => Ok(Self::InProgress),
            "Closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown opportunity status: {}", s)),
        }
    }
}

/// What kind of interaction was logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionType {
    /// First email of a newly created opportunity.
    #[serde(rename = "New Lead")]
    NewLead,
    /// A later sales-relevant email linked to an existing opportunity.
    #[serde(rename = "Follow-up")]
    FollowUp,
    /// A non-lead email that belongs to an existing opportunity.
    #[serde(rename = "General Communication")]
    GeneralCommunication,
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewLead => write!(f, "New Lead"),
            Self::FollowUp => write!(f, "Follow-up"),
            Self::GeneralCommunication => write!(f, "General Communication"),
        }
    }
}

impl std::str::FromStr for InteractionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New Lead" => Ok(Self::NewLead),
            "Follow-up" => Ok(Self::FollowUp),
            "General Communication" => Ok(Self::GeneralCommunication),
            _ => Err(format!("Unknown interaction type: {}", s)),
        }
    }
}

/// A sales lead. Created once, updated by follow-ups, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub opportunity_id: String,
    pub contact_name: String,
    pub contact_company: String,
    pub contact_email: String,
    pub phone: String,
    pub title: String,
    pub status: OpportunityStatus,
    /// Immutable once set.
    pub date_created: DateTime<Utc>,
    /// The originating thread.
    pub conversation_id: String,
    /// Latest rollup.
    pub summary: String,
}

/// One logged email against an opportunity. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub opportunity_id: String,
    pub interaction_date: DateTime<Utc>,
    /// Opportunity status at the moment the interaction was logged.
    pub status: OpportunityStatus,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub sender: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Thread of the source email.
    pub conversation_id: String,
    /// Mailbox-native ID of the source email. Unique across the table.
    pub source_message_id: String,
}

/// How the opportunity row changes in a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum OpportunityChange {
    Insert(Opportunity),
    Update(Opportunity),
}

impl OpportunityChange {
    pub fn opportunity(&self) -> &Opportunity {
        match self {
            Self::Insert(o) | Self::Update(o) => o,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(_))
    }
}

/// Changes produced by reconciling one email. Applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDelta {
    pub opportunity: OpportunityChange,
    pub interaction: Interaction,
}

impl LedgerDelta {
    pub fn opportunity_id(&self) -> &str {
        &self.opportunity.opportunity().opportunity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_up_advances_new_only() {
        assert_eq!(
            OpportunityStatus::New.after_follow_up(),
            OpportunityStatus::InProgress
        );
        assert_eq!(
            OpportunityStatus::InProgress.after_follow_up(),
            OpportunityStatus::InProgress
        );
        assert_eq!(
            OpportunityStatus::Closed.after_follow_up(),
            OpportunityStatus::Closed
        );
    }

    #[test]
    fn closed_cannot_move_back() {
        assert!(!OpportunityStatus::Closed.can_transition_to(OpportunityStatus::New));
        assert!(!OpportunityStatus::Closed.can_transition_to(OpportunityStatus::InProgress));
        assert!(!OpportunityStatus::InProgress.can_transition_to(OpportunityStatus::New));
        assert!(OpportunityStatus::New.can_transition_to(OpportunityStatus::Closed));
    }

    #[test]
    fn status_display_roundtrip() {
        for status in [
            OpportunityStatus::New,
            OpportunityStatus::InProgress,
            OpportunityStatus::Closed,
        ] {
            let parsed: OpportunityStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("Won".parse::<OpportunityStatus>().is_err());
    }

    #[test]
    fn interaction_type_serializes_as_ledger_labels() {
        let json = serde_json::to_value(InteractionType::FollowUp).unwrap();
        assert_eq!(json, "Follow-up");
        let json = serde_json::to_value(OpportunityStatus::InProgress).unwrap();
        assert_eq!(json, "In Progress");
    }

    #[test]
    fn interaction_serializes_type_field() {
        let interaction = Interaction {
            opportunity_id: "OPP-1".into(),
            interaction_date: Utc::now(),
            status: OpportunityStatus::New,
            interaction_type: InteractionType::NewLead,
            sender: "jane@globex.com".into(),
            summary: "Wants a quote".into(),
            action_item: None,
            deadline: None,
            conversation_id: "T1".into(),
            source_message_id: "m1".into(),
        };
        let json = serde_json::to_value(&interaction).unwrap();
        assert_eq!(json["type"], "New Lead");
        assert_eq!(json["opportunityId"], "OPP-1");
        assert!(json.get("actionItem").is_none());
    }
}
