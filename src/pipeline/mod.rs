//! Batch message pipeline.
//!
//! Every fetched email flows through:
//! 1. `ScreeningRules::evaluate()`: fast sender screening (no LLM)
//! 2. `SignalExtractor::analyze()`: LLM extraction into a `LeadSignal`
//! 3. `IdentityResolver` and `reconcile()`: the delta to persist
//! 4. `LedgerStore::apply_delta()`: one transaction per email
//!
//! `LeadPipeline` drives one run and commits the run state at the end.

pub mod extractor;
pub mod processor;
pub mod rules;
pub mod types;

pub use extractor::{LlmExtractor, SignalExtractor};
pub use processor::LeadPipeline;
pub use rules::ScreeningRules;
pub use types::{MessageOutcome, RunSummary};
