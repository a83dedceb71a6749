//! Lead pipeline: one batch run from mailbox to ledger.
//!
//! Flow:
//! 1. Run-state boundary → mailbox fetch, oldest first
//! 2. Screening rules (fast, no LLM) → may short-circuit
//! 3. Extraction → `LeadSignal`
//! 4. Identity resolution → reconcile → persist → update snapshot
//! 5. Commit the new boundary, only if nothing aborted the run
//!
//! Messages are handled strictly one at a time. Per-message failures are
//! isolated; ledger-store or run-state failures abort without committing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::crm::{IdentityResolver, LedgerSnapshot, OpportunityChange, Resolution, reconcile};
use crate::error::{DatabaseError, PipelineError};
use crate::mailbox::{MailMessage, Mailbox};
use crate::pipeline::extractor::SignalExtractor;
use crate::pipeline::rules::ScreeningRules;
use crate::pipeline::types::{MessageOutcome, RunSummary};
use crate::run_state::{RunBoundary, RunStateTracker};
use crate::store::LedgerStore;

/// Batch processor wiring the collaborators together.
pub struct LeadPipeline {
    mailbox: Arc<dyn Mailbox>,
    extractor: Arc<dyn SignalExtractor>,
    store: Arc<dyn LedgerStore>,
    tracker: RunStateTracker,
    resolver: IdentityResolver,
    rules: ScreeningRules,
}

impl LeadPipeline {
    /// Create a pipeline with default resolver settings and no screening.
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        extractor: Arc<dyn SignalExtractor>,
        store: Arc<dyn LedgerStore>,
        tracker: RunStateTracker,
    ) -> Self {
        Self {
            mailbox,
            extractor,
            store,
            tracker,
            resolver: IdentityResolver::new(Default::default()),
            rules: ScreeningRules::empty(),
        }
    }

    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_rules(mut self, rules: ScreeningRules) -> Self {
        self.rules = rules;
        self
    }

    /// Run one batch starting now.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        self.run_once(Utc::now()).await
    }

    /// Run one batch as if it started at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        let boundary = self.tracker.begin_run(now).await?;
        let mut snapshot = self.store.read_all().await?;
        let orphans = snapshot.orphaned_interactions().len();
        if orphans > 0 {
            warn!(orphans, "Ledger has interactions without an opportunity");
        }

        let batch = self
            .mailbox
            .fetch_since(boundary.since, &boundary.excluded_ids)
            .await?;
        let resume_from = batch.resume_from;
        let mut messages = batch.messages;
        order_batch(&mut messages, &boundary);

        let mut summary = RunSummary {
            fetched: messages.len(),
            ..Default::default()
        };
        info!(count = messages.len(), "Processing message batch");

        let mut processed: Vec<(String, DateTime<Utc>)> = Vec::with_capacity(messages.len());
        let mut earliest_failure: Option<DateTime<Utc>> = None;

        for message in &messages {
            let outcome = self.process_message(message, &mut snapshot).await?;
            summary.record(&outcome);
            if outcome.is_settled() {
                processed.push((message.id.clone(), message.received_at));
            } else {
                earliest_failure = Some(
                    earliest_failure.map_or(message.received_at, |t| t.min(message.received_at)),
                );
            }
        }

        let mut new_boundary = self.next_boundary(&boundary, earliest_failure);
        if let Some(resume) = resume_from
            && resume < new_boundary
        {
            warn!(
                resume_from = %resume.to_rfc3339(),
                "Mailbox listing was cut short, committing the last listed message time"
            );
            new_boundary = resume;
        }
        self.tracker.commit_run(new_boundary, processed).await?;
        summary.committed_boundary = Some(new_boundary);

        info!(summary = %summary, "Run complete");
        Ok(summary)
    }

    /// The run's start, pulled back to the earliest retryable failure so it
    /// is refetched. Failures past the retention window are given up.
    fn next_boundary(
        &self,
        boundary: &RunBoundary,
        earliest_failure: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let Some(failed_at) = earliest_failure else {
            return boundary.started_at;
        };
        let horizon = boundary.started_at - self.tracker.config().retention;
        if failed_at < horizon {
            warn!(
                received_at = %failed_at.to_rfc3339(),
                "Failed message is older than the retention window and will not be retried"
            );
            return boundary.started_at;
        }
        failed_at.min(boundary.started_at)
    }

    /// Take one message through screening, extraction, and reconciliation.
    ///
    /// Only ledger-store outages are returned as `Err`; everything else is an
    /// outcome.
    async fn process_message(
        &self,
        message: &MailMessage,
        snapshot: &mut LedgerSnapshot,
    ) -> Result<MessageOutcome, PipelineError> {
        if let Some(reason) = self.rules.evaluate(message) {
            debug!(message_id = %message.id, reason = %reason, "Message screened");
            return Ok(MessageOutcome::Screened { reason });
        }

        if snapshot.contains_message(&message.id) {
            debug!(message_id = %message.id, "Interaction already logged, skipping");
            return Ok(MessageOutcome::AlreadyLogged);
        }

        let signal = match self.extractor.analyze(message).await {
            Ok(Some(signal)) => signal,
            Ok(None) => return Ok(MessageOutcome::NotALead),
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    transient = e.is_transient(),
                    error = %e,
                    "Extraction failed"
                );
                return Ok(MessageOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        let (delta, rule, ambiguous) = {
            let resolution = self.resolver.resolve(&signal, snapshot);
            let (matched, rule, ambiguous) = match &resolution {
                Resolution::Matched {
                    opportunity,
                    rule,
                    ambiguity,
                } => (Some(*opportunity), Some(*rule), ambiguity.is_some()),
                Resolution::NoMatch => (None, None, false),
            };

            if matched.is_none() && !signal.is_opportunity {
                debug!(message_id = %message.id, "Not a lead and no known opportunity");
                return Ok(MessageOutcome::NotALead);
            }

            match reconcile(&signal, matched, snapshot) {
                Ok(delta) => (delta, rule, ambiguous),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Reconcile rejected signal");
                    return Ok(MessageOutcome::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        };

        match self.store.apply_delta(&delta).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(reason)) => {
                error!(message_id = %message.id, reason = %reason, "Ledger rejected delta");
                return Ok(MessageOutcome::Failed { reason });
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Ledger store unavailable, aborting run");
                return Err(e.into());
            }
        }

        if let Err(e) = snapshot.apply(&delta) {
            error!(message_id = %message.id, error = %e, "Snapshot diverged from ledger");
            return Ok(MessageOutcome::Failed {
                reason: e.to_string(),
            });
        }

        let opportunity_id = delta.opportunity_id().to_string();
        let outcome = match (&delta.opportunity, rule) {
            (OpportunityChange::Insert(_), _) => MessageOutcome::Created { opportunity_id },
            (OpportunityChange::Update(_), Some(rule)) if signal.is_opportunity => {
                MessageOutcome::FollowUp {
                    opportunity_id,
                    rule,
                    ambiguous,
                }
            }
            (OpportunityChange::Update(_), _) => MessageOutcome::GeneralCommunication {
                opportunity_id,
                ambiguous,
            },
        };
        info!(
            message_id = %message.id,
            opportunity_id = %delta.opportunity_id(),
            rule = rule.map(|r| r.label()).unwrap_or("new"),
            kind = %delta.interaction.interaction_type,
            "Message reconciled"
        );
        Ok(outcome)
    }
}

/// Oldest first, ties by ID; drop excluded and duplicate IDs.
fn order_batch(messages: &mut Vec<MailMessage>, boundary: &RunBoundary) {
    messages.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut seen = HashSet::new();
    messages.retain(|m| !boundary.excluded_ids.contains(&m.id) && seen.insert(m.id.clone()));
}
