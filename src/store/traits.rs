//! `LedgerStore` trait over the two linked ledger tables.

use async_trait::async_trait;

use crate::crm::{LedgerDelta, LedgerSnapshot};
use crate::error::DatabaseError;

/// Backend-agnostic ledger persistence.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read every opportunity and interaction, in insertion order.
    async fn read_all(&self) -> Result<LedgerSnapshot, DatabaseError>;

    /// Persist one delta. Both rows are written or neither is.
    async fn apply_delta(&self, delta: &LedgerDelta) -> Result<(), DatabaseError>;
}
