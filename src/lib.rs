//! Lead Ledger: email-to-CRM opportunity correlation.

pub mod auth;
pub mod config;
pub mod crm;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod run_state;
pub mod store;
