//! Opportunity correlation and ledger consistency.
//!
//! Every analyzed email flows through:
//! 1. `IdentityResolver::resolve()`: which opportunity, if any
//! 2. `reconciler::reconcile()`: the delta to persist
//! 3. `LedgerSnapshot::apply()`: keep the in-run view current

pub mod model;
pub mod reconciler;
pub mod resolver;
pub mod snapshot;

pub use model::{
    Interaction, InteractionType, LeadSignal, LedgerDelta, Opportunity, OpportunityChange,
    OpportunityStatus,
};
pub use reconciler::reconcile;
pub use resolver::{AmbiguousMatch, IdentityResolver, MatchRule, Resolution, ResolverConfig};
pub use snapshot::LedgerSnapshot;
