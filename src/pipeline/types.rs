//! Per-message outcomes and the run summary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crm::MatchRule;

/// What happened to one fetched message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// A new opportunity was opened.
    Created { opportunity_id: String },
    /// A lead email was linked to an existing opportunity.
    FollowUp {
        opportunity_id: String,
        rule: MatchRule,
        ambiguous: bool,
    },
    /// A non-lead email was logged against an existing opportunity.
    GeneralCommunication {
        opportunity_id: String,
        ambiguous: bool,
    },
    /// Analyzed; not a lead and not part of any known opportunity.
    NotALead,
    /// Screened out before extraction.
    Screened { reason: String },
    /// Its interaction is already in the ledger.
    AlreadyLogged,
    /// Left unprocessed; refetched by a later run.
    Failed { reason: String },
}

impl MessageOutcome {
    /// Whether the message should join the processed-ID set.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub new_opportunities: usize,
    pub follow_ups: usize,
    pub general_communications: usize,
    pub not_leads: usize,
    /// Screened or already logged.
    pub skipped: usize,
    pub errored: usize,
    /// Resolutions that had more than one candidate.
    pub ambiguous: usize,
    /// Boundary committed for the next run.
    pub committed_boundary: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Created { .. } => self.new_opportunities += 1,
            MessageOutcome::FollowUp { ambiguous, .. } => {
                self.follow_ups += 1;
                self.ambiguous += usize::from(*ambiguous);
            }
            MessageOutcome::GeneralCommunication { ambiguous, .. } => {
                self.general_communications += 1;
                self.ambiguous += usize::from(*ambiguous);
            }
            MessageOutcome::NotALead => self.not_leads += 1,
            MessageOutcome::Screened { .. } | MessageOutcome::AlreadyLogged => self.skipped += 1,
            MessageOutcome::Failed { .. } => self.errored += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {}, new opportunities {}, follow-ups {}, general {}, not leads {}, skipped {}, errored {}",
            self.fetched,
            self.new_opportunities,
            self.follow_ups,
            self.general_communications,
            self.not_leads,
            self.skipped,
            self.errored
        )?;
        if self.ambiguous > 0 {
            write!(f, " ({} ambiguous)", self.ambiguous)?;
        }
        Ok(())
    }
}
