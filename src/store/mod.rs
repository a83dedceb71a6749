//! Persistence layer for the opportunity and interaction tables.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::LedgerStore;
