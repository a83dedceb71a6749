//! In-memory view of the two ledger tables for the duration of one run.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::crm::model::{Interaction, LedgerDelta, Opportunity, OpportunityChange};
use crate::error::ReconcileError;

/// Prefix of allocated opportunity IDs.
pub const OPPORTUNITY_ID_PREFIX: &str = "OPP-";

/// Snapshot of the ledger, read once at run start and kept current by
/// applying each persisted delta.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    opportunities: Vec<Opportunity>,
    interactions: Vec<Interaction>,
    by_id: HashMap<String, usize>,
    message_ids: HashSet<String>,
}

impl LedgerSnapshot {
    pub fn new(opportunities: Vec<Opportunity>, interactions: Vec<Interaction>) -> Self {
        let by_id = opportunities
            .iter()
            .enumerate()
            .map(|(i, o)| (o.opportunity_id.clone(), i))
            .collect();
        let message_ids = interactions
            .iter()
            .map(|i| i.source_message_id.clone())
            .collect();
        Self {
            opportunities,
            interactions,
            by_id,
            message_ids,
        }
    }

    pub fn opportunities(&self) -> &[Opportunity] {
        &self.opportunities
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn get(&self, opportunity_id: &str) -> Option<&Opportunity> {
        self.by_id.get(opportunity_id).map(|&i| &self.opportunities[i])
    }

    /// Whether an interaction sourced from this email is already logged.
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.message_ids.contains(message_id)
    }

    /// Allocate the next `OPP-<n>` ID. Never collides with an existing ID.
    ///
    /// Only `OPP-` IDs count towards the sequence. If the highest one is
    /// already `u64::MAX`, the search restarts at 1 and takes the first gap.
    pub fn next_opportunity_id(&self) -> String {
        let max = self
            .opportunities
            .iter()
            .filter_map(|o| opportunity_number(&o.opportunity_id))
            .max()
            .unwrap_or(0);
        let mut n = max.checked_add(1).unwrap_or(1);
        loop {
            let candidate = format!("{OPPORTUNITY_ID_PREFIX}{n}");
            if !self.by_id.contains_key(&candidate) {
                return candidate;
            }
            n = n.checked_add(1).unwrap_or(1);
        }
    }

    /// Check a delta against the ledger invariants without applying it.
    pub fn validate(&self, delta: &LedgerDelta) -> Result<(), ReconcileError> {
        let opportunity = delta.opportunity.opportunity();

        if delta.interaction.opportunity_id != opportunity.opportunity_id {
            return Err(ReconcileError::LedgerConsistency(format!(
                "interaction references {} but delta carries opportunity {}",
                delta.interaction.opportunity_id, opportunity.opportunity_id
            )));
        }

        if self.contains_message(&delta.interaction.source_message_id) {
            return Err(ReconcileError::LedgerConsistency(format!(
                "message {} is already logged",
                delta.interaction.source_message_id
            )));
        }

        match &delta.opportunity {
            OpportunityChange::Insert(new) => {
                if self.by_id.contains_key(&new.opportunity_id) {
                    return Err(ReconcileError::LedgerConsistency(format!(
                        "opportunity {} already exists",
                        new.opportunity_id
                    )));
                }
            }
            OpportunityChange::Update(updated) => {
                let Some(existing) = self.get(&updated.opportunity_id) else {
                    return Err(ReconcileError::LedgerConsistency(format!(
                        "update references unknown opportunity {}",
                        updated.opportunity_id
                    )));
                };
                if existing.date_created != updated.date_created {
                    return Err(ReconcileError::LedgerConsistency(format!(
                        "dateCreated of {} is immutable",
                        updated.opportunity_id
                    )));
                }
                if existing.conversation_id != updated.conversation_id {
                    return Err(ReconcileError::LedgerConsistency(format!(
                        "originating thread of {} is immutable",
                        updated.opportunity_id
                    )));
                }
                if !existing.status.can_transition_to(updated.status) {
                    return Err(ReconcileError::LedgerConsistency(format!(
                        "status of {} cannot move from {} to {}",
                        updated.opportunity_id, existing.status, updated.status
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and apply a delta.
    pub fn apply(&mut self, delta: &LedgerDelta) -> Result<(), ReconcileError> {
        self.validate(delta)?;
        match &delta.opportunity {
            OpportunityChange::Insert(new) => {
                self.by_id
                    .insert(new.opportunity_id.clone(), self.opportunities.len());
                self.opportunities.push(new.clone());
            }
            OpportunityChange::Update(updated) => {
                if let Some(&i) = self.by_id.get(&updated.opportunity_id) {
                    self.opportunities[i] = updated.clone();
                }
            }
        }
        self.message_ids
            .insert(delta.interaction.source_message_id.clone());
        self.interactions.push(delta.interaction.clone());
        Ok(())
    }

    /// Interactions whose opportunity does not exist.
    pub fn orphaned_interactions(&self) -> Vec<&Interaction> {
        self.interactions
            .iter()
            .filter(|i| !self.by_id.contains_key(&i.opportunity_id))
            .collect()
    }
}

/// The `n` of an `OPP-<n>` ID.
fn opportunity_number(id: &str) -> Option<u64> {
    id.strip_prefix(OPPORTUNITY_ID_PREFIX)?.parse().ok()
}

/// Order opportunity IDs numerically when both are `OPP-<n>`.
///
/// `OPP-10` sorts after `OPP-9`; anything else falls back to string order.
pub fn compare_opportunity_ids(a: &str, b: &str) -> Ordering {
    match (opportunity_number(a), opportunity_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::model::{InteractionType, OpportunityStatus};
    use chrono::{TimeZone, Utc};

    fn opp(id: &str) -> Opportunity {
        Opportunity {
            opportunity_id: id.into(),
            contact_name: "Jane".into(),
            contact_company: "Globex".into(),
            contact_email: "jane@globex.com".into(),
            phone: String::new(),
            title: "Widgets".into(),
            status: OpportunityStatus::New,
            date_created: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            conversation_id: "T1".into(),
            summary: "Wants widgets".into(),
        }
    }

    fn interaction(opp_id: &str, msg: &str) -> Interaction {
        Interaction {
            opportunity_id: opp_id.into(),
            interaction_date: Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap(),
            status: OpportunityStatus::InProgress,
            interaction_type: InteractionType::FollowUp,
            sender: "bob@globex.com".into(),
            summary: "Asked for pricing".into(),
            action_item: None,
            deadline: None,
            conversation_id: "T9".into(),
            source_message_id: msg.into(),
        }
    }

    #[test]
    fn next_id_is_monotonic() {
        let snapshot = LedgerSnapshot::new(vec![opp("OPP-1"), opp("OPP-7")], vec![]);
        assert_eq!(snapshot.next_opportunity_id(), "OPP-8");
        assert_eq!(LedgerSnapshot::default().next_opportunity_id(), "OPP-1");
    }

    #[test]
    fn next_id_ignores_foreign_ids() {
        let snapshot = LedgerSnapshot::new(vec![opp("3f2a-legacy"), opp("OPP-2")], vec![]);
        assert_eq!(snapshot.next_opportunity_id(), "OPP-3");

        // Legacy IDs whose last segment happens to be numeric.
        let snapshot = LedgerSnapshot::new(
            vec![opp("9c1e7d2a-0b4f-4e6a-8d3c-000000000500"), opp("LEAD-900"), opp("OPP-4")],
            vec![],
        );
        assert_eq!(snapshot.next_opportunity_id(), "OPP-5");
    }

    #[test]
    fn next_id_at_u64_max_takes_first_gap() {
        let top = format!("OPP-{}", u64::MAX);
        let snapshot = LedgerSnapshot::new(vec![opp("OPP-1"), opp(&top)], vec![]);
        assert_eq!(snapshot.next_opportunity_id(), "OPP-2");
    }

    #[test]
    fn id_ordering_is_numeric() {
        assert_eq!(compare_opportunity_ids("OPP-10", "OPP-9"), Ordering::Greater);
        assert_eq!(compare_opportunity_ids("OPP-2", "OPP-2"), Ordering::Equal);
        assert_eq!(compare_opportunity_ids("abc", "abd"), Ordering::Less);
        // A numeric tail without the prefix is not an opportunity number.
        assert_eq!(compare_opportunity_ids("LEAD-900", "OPP-3"), Ordering::Less);
    }

    #[test]
    fn apply_insert_then_follow_up() {
        let mut snapshot = LedgerSnapshot::default();
        let created = opp("OPP-1");
        snapshot
            .apply(&LedgerDelta {
                opportunity: OpportunityChange::Insert(created.clone()),
                interaction: interaction("OPP-1", "m1"),
            })
            .unwrap();

        let mut updated = created.clone();
        updated.status = OpportunityStatus::InProgress;
        updated.summary = "Asked for pricing".into();
        snapshot
            .apply(&LedgerDelta {
                opportunity: OpportunityChange::Update(updated),
                interaction: interaction("OPP-1", "m2"),
            })
            .unwrap();

        assert_eq!(snapshot.opportunities().len(), 1);
        assert_eq!(snapshot.interactions().len(), 2);
        assert_eq!(
            snapshot.get("OPP-1").unwrap().status,
            OpportunityStatus::InProgress
        );
        assert!(snapshot.contains_message("m2"));
        assert!(snapshot.orphaned_interactions().is_empty());
    }

    #[test]
    fn update_of_unknown_opportunity_is_rejected() {
        let mut snapshot = LedgerSnapshot::default();
        let err = snapshot
            .apply(&LedgerDelta {
                opportunity: OpportunityChange::Update(opp("OPP-4")),
                interaction: interaction("OPP-4", "m1"),
            })
            .unwrap_err();
        assert!(matches!(err, ReconcileError::LedgerConsistency(_)));
        assert!(snapshot.interactions().is_empty());
    }

    #[test]
    fn date_created_is_immutable() {
        let mut snapshot = LedgerSnapshot::new(vec![opp("OPP-1")], vec![]);
        let mut updated = opp("OPP-1");
        updated.date_created = Utc::now();
        let err = snapshot
            .apply(&LedgerDelta {
                opportunity: OpportunityChange::Update(updated),
                interaction: interaction("OPP-1", "m1"),
            })
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn closed_status_cannot_be_reopened() {
        let mut closed = opp("OPP-1");
        closed.status = OpportunityStatus::Closed;
        let snapshot = LedgerSnapshot::new(vec![closed.clone()], vec![]);
        let mut reopened = closed;
        reopened.status = OpportunityStatus::InProgress;
        let result = snapshot.validate(&LedgerDelta {
            opportunity: OpportunityChange::Update(reopened),
            interaction: interaction("OPP-1", "m1"),
        });
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_message_is_rejected() {
        let snapshot = LedgerSnapshot::new(vec![opp("OPP-1")], vec![interaction("OPP-1", "m1")]);
        let result = snapshot.validate(&LedgerDelta {
            opportunity: OpportunityChange::Update(opp("OPP-1")),
            interaction: interaction("OPP-1", "m1"),
        });
        assert!(result.is_err());
    }

    #[test]
    fn orphans_are_reported() {
        let snapshot = LedgerSnapshot::new(vec![opp("OPP-1")], vec![interaction("OPP-2", "m1")]);
        assert_eq!(snapshot.orphaned_interactions().len(), 1);
    }
}
