//! Mailbox access through the Microsoft Graph API.

pub mod graph;
pub mod text;
pub mod types;

pub use graph::GraphMailbox;
pub use types::{FetchBatch, MailMessage, Mailbox};
