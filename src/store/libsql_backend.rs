//! libSQL backend for `LedgerStore`.
//!
//! Supports local file and in-memory databases. Each delta is written in
//! one transaction so an opportunity and its interaction land together.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tracing::{debug, info, warn};

use crate::crm::{
    Interaction, InteractionType, LedgerDelta, LedgerSnapshot, Opportunity, OpportunityChange,
    OpportunityStatus,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::LedgerStore;

/// libSQL ledger backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;
        info!(path = %path.display(), "Ledger database opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Classify a libsql failure. Constraint violations are not retryable.
fn query_error(context: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("constraint failed") {
        DatabaseError::Constraint(format!("{context}: {message}"))
    } else {
        DatabaseError::Query(format!("{context}: {message}"))
    }
}

/// Map a libsql Row to an Opportunity. Column order matches OPPORTUNITY_COLUMNS.
fn row_to_opportunity(row: &libsql::Row) -> Result<Opportunity, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("opportunity row: {e}"));
    let status_str: String = row.get(6).map_err(read)?;
    let created_str: String = row.get(7).map_err(read)?;

    Ok(Opportunity {
        opportunity_id: row.get(0).map_err(read)?,
        contact_name: row.get(1).map_err(read)?,
        contact_company: row.get(2).map_err(read)?,
        contact_email: row.get(3).map_err(read)?,
        phone: row.get(4).map_err(read)?,
        title: row.get(5).map_err(read)?,
        status: status_str.parse().map_err(DatabaseError::Query)?,
        date_created: parse_datetime(&created_str),
        conversation_id: row.get(8).map_err(read)?,
        summary: row.get(9).map_err(read)?,
    })
}

/// Map a libsql Row to an Interaction. Column order matches INTERACTION_COLUMNS.
fn row_to_interaction(row: &libsql::Row) -> Result<Interaction, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("interaction row: {e}"));
    let date_str: String = row.get(1).map_err(read)?;
    let status_str: String = row.get(2).map_err(read)?;
    let type_str: String = row.get(3).map_err(read)?;

    Ok(Interaction {
        opportunity_id: row.get(0).map_err(read)?,
        interaction_date: parse_datetime(&date_str),
        status: status_str
            .parse::<OpportunityStatus>()
            .map_err(DatabaseError::Query)?,
        interaction_type: type_str
            .parse::<InteractionType>()
            .map_err(DatabaseError::Query)?,
        sender: row.get(4).map_err(read)?,
        summary: row.get(5).map_err(read)?,
        action_item: row.get::<String>(6).ok(),
        deadline: row.get::<String>(7).ok(),
        conversation_id: row.get(8).map_err(read)?,
        source_message_id: row.get(9).map_err(read)?,
    })
}

async fn insert_opportunity(tx: &Transaction, opp: &Opportunity) -> Result<(), DatabaseError> {
    tx.execute(
        "INSERT INTO opportunities (opportunity_id, contact_name, contact_company, contact_email, phone, title, status, date_created, conversation_id, summary, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            opp.opportunity_id.as_str(),
            opp.contact_name.as_str(),
            opp.contact_company.as_str(),
            opp.contact_email.as_str(),
            opp.phone.as_str(),
            opp.title.as_str(),
            opp.status.to_string(),
            opp.date_created.to_rfc3339(),
            opp.conversation_id.as_str(),
            opp.summary.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| query_error("insert_opportunity", e))?;
    Ok(())
}

/// Update the mutable columns. `date_created` and `conversation_id` are never written.
async fn update_opportunity(tx: &Transaction, opp: &Opportunity) -> Result<(), DatabaseError> {
    let changed = tx
        .execute(
            "UPDATE opportunities
             SET contact_name = ?1, phone = ?2, title = ?3, status = ?4, summary = ?5, updated_at = ?6
             WHERE opportunity_id = ?7",
            params![
                opp.contact_name.as_str(),
                opp.phone.as_str(),
                opp.title.as_str(),
                opp.status.to_string(),
                opp.summary.as_str(),
                Utc::now().to_rfc3339(),
                opp.opportunity_id.as_str(),
            ],
        )
        .await
        .map_err(|e| query_error("update_opportunity", e))?;

    if changed != 1 {
        return Err(DatabaseError::Constraint(format!(
            "update_opportunity: {} not found",
            opp.opportunity_id
        )));
    }
    Ok(())
}

async fn insert_interaction(tx: &Transaction, i: &Interaction) -> Result<(), DatabaseError> {
    tx.execute(
        "INSERT INTO interactions (opportunity_id, interaction_date, status, interaction_type, sender, summary, action_item, deadline, conversation_id, source_message_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            i.opportunity_id.as_str(),
            i.interaction_date.to_rfc3339(),
            i.status.to_string(),
            i.interaction_type.to_string(),
            i.sender.as_str(),
            i.summary.as_str(),
            opt_text(i.action_item.as_deref()),
            opt_text(i.deadline.as_deref()),
            i.conversation_id.as_str(),
            i.source_message_id.as_str(),
        ],
    )
    .await
    .map_err(|e| query_error("insert_interaction", e))?;
    Ok(())
}

async fn write_delta(tx: &Transaction, delta: &LedgerDelta) -> Result<(), DatabaseError> {
    match &delta.opportunity {
        OpportunityChange::Insert(opp) => insert_opportunity(tx, opp).await?,
        OpportunityChange::Update(opp) => update_opportunity(tx, opp).await?,
    }
    insert_interaction(tx, &delta.interaction).await
}

// ── Trait implementation ────────────────────────────────────────────

const OPPORTUNITY_COLUMNS: &str = "opportunity_id, contact_name, contact_company, contact_email, phone, title, status, date_created, conversation_id, summary";

const INTERACTION_COLUMNS: &str = "opportunity_id, interaction_date, status, interaction_type, sender, summary, action_item, deadline, conversation_id, source_message_id";

#[async_trait]
impl LedgerStore for LibSqlLedger {
    async fn read_all(&self) -> Result<LedgerSnapshot, DatabaseError> {
        let conn = self.conn();

        let mut rows = conn
            .query(
                &format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities ORDER BY rowid"),
                (),
            )
            .await
            .map_err(|e| query_error("read_all opportunities", e))?;
        let mut opportunities = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error("read_all opportunities", e))?
        {
            opportunities.push(row_to_opportunity(&row)?);
        }

        let mut rows = conn
            .query(
                &format!("SELECT {INTERACTION_COLUMNS} FROM interactions ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| query_error("read_all interactions", e))?;
        let mut interactions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error("read_all interactions", e))?
        {
            interactions.push(row_to_interaction(&row)?);
        }

        debug!(
            opportunities = opportunities.len(),
            interactions = interactions.len(),
            "Ledger loaded"
        );
        Ok(LedgerSnapshot::new(opportunities, interactions))
    }

    async fn apply_delta(&self, delta: &LedgerDelta) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| query_error("begin transaction", e))?;

        if let Err(e) = write_delta(&tx, delta).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| query_error("commit transaction", e))?;
        debug!(
            opportunity_id = %delta.opportunity_id(),
            message_id = %delta.interaction.source_message_id,
            insert = delta.opportunity.is_insert(),
            "Ledger delta applied"
        );
        Ok(())
    }
}
