//! Ledger reconciler. Turns a resolved signal into a ledger delta.
//!
//! Pure: reads the snapshot, never writes it. The same signal against the
//! same snapshot always yields the same delta.

use crate::crm::model::{
    Interaction, InteractionType, LeadSignal, LedgerDelta, Opportunity, OpportunityChange,
    OpportunityStatus,
};
use crate::crm::resolver::normalize_email;
use crate::crm::snapshot::LedgerSnapshot;
use crate::error::ReconcileError;

/// Interaction summaries are capped at this many characters.
pub const MAX_INTERACTION_SUMMARY_CHARS: usize = 500;

/// Build the delta for one signal.
///
/// - No match: insert a new `New` opportunity plus a `New Lead` interaction.
/// - Match: update the opportunity (latest summary, status progression) and
///   append a `Follow-up` interaction, or a `General Communication` one when
///   the email is not itself a lead.
pub fn reconcile(
    signal: &LeadSignal,
    matched: Option<&Opportunity>,
    snapshot: &LedgerSnapshot,
) -> Result<LedgerDelta, ReconcileError> {
    require(signal, !signal.message_id.trim().is_empty(), "missing message id")?;
    require(
        signal,
        !signal.conversation_id.trim().is_empty(),
        "missing conversation id",
    )?;

    let delta = match matched {
        None => create(signal, snapshot)?,
        Some(matched) => append(signal, matched, snapshot)?,
    };
    snapshot.validate(&delta)?;
    Ok(delta)
}

fn create(signal: &LeadSignal, snapshot: &LedgerSnapshot) -> Result<LedgerDelta, ReconcileError> {
    require(
        signal,
        signal.is_opportunity,
        "not an opportunity and no existing match",
    )?;
    require(
        signal,
        normalize_email(&signal.contact_email).is_some(),
        "contact email is empty or malformed",
    )?;
    require(
        signal,
        !signal.contact_name.trim().is_empty(),
        "contact name is empty",
    )?;

    let opportunity = Opportunity {
        opportunity_id: snapshot.next_opportunity_id(),
        contact_name: signal.contact_name.trim().to_string(),
        contact_company: signal.contact_company.trim().to_string(),
        contact_email: signal.contact_email.trim().to_string(),
        phone: signal.phone.trim().to_string(),
        title: signal.title.trim().to_string(),
        status: OpportunityStatus::New,
        date_created: signal.received_at,
        conversation_id: signal.conversation_id.clone(),
        summary: signal.summary.clone(),
    };
    let interaction = interaction_for(
        signal,
        &opportunity.opportunity_id,
        opportunity.status,
        InteractionType::NewLead,
    );
    Ok(LedgerDelta {
        opportunity: OpportunityChange::Insert(opportunity),
        interaction,
    })
}

fn append(
    signal: &LeadSignal,
    matched: &Opportunity,
    snapshot: &LedgerSnapshot,
) -> Result<LedgerDelta, ReconcileError> {
    // The snapshot is authoritative; the caller's copy may be stale.
    let Some(current) = snapshot.get(&matched.opportunity_id) else {
        return Err(ReconcileError::LedgerConsistency(format!(
            "matched opportunity {} is not in the ledger",
            matched.opportunity_id
        )));
    };

    let mut updated = current.clone();
    let interaction_type = if signal.is_opportunity {
        updated.status = current.status.after_follow_up();
        if !signal.summary.trim().is_empty() {
            updated.summary = signal.summary.clone();
        }
        InteractionType::FollowUp
    } else {
        InteractionType::GeneralCommunication
    };

    backfill(&mut updated.contact_name, &signal.contact_name);
    backfill(&mut updated.phone, &signal.phone);
    backfill(&mut updated.title, &signal.title);

    let interaction = interaction_for(
        signal,
        &updated.opportunity_id,
        updated.status,
        interaction_type,
    );
    Ok(LedgerDelta {
        opportunity: OpportunityChange::Update(updated),
        interaction,
    })
}

fn interaction_for(
    signal: &LeadSignal,
    opportunity_id: &str,
    status: OpportunityStatus,
    interaction_type: InteractionType,
) -> Interaction {
    Interaction {
        opportunity_id: opportunity_id.to_string(),
        interaction_date: signal.received_at,
        status,
        interaction_type,
        sender: signal.sender_email.clone(),
        summary: signal
            .summary
            .chars()
            .take(MAX_INTERACTION_SUMMARY_CHARS)
            .collect(),
        action_item: signal.action_item.clone(),
        deadline: signal.deadline.clone(),
        conversation_id: signal.conversation_id.clone(),
        source_message_id: signal.message_id.clone(),
    }
}

/// Fill an empty field; never overwrite known contact data.
fn backfill(field: &mut String, value: &str) {
    if field.trim().is_empty() && !value.trim().is_empty() {
        *field = value.trim().to_string();
    }
}

fn require(signal: &LeadSignal, ok: bool, reason: &str) -> Result<(), ReconcileError> {
    if ok {
        Ok(())
    } else {
        Err(ReconcileError::Validation {
            message_id: signal.message_id.clone(),
            reason: reason.to_string(),
        })
    }
}
