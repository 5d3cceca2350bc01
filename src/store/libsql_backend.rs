//! libSQL backend: durable ledger and local ticket store.
//!
//! Supports local file and in-memory databases. Every statement runs in
//! autocommit mode, so a successful `execute` is durable when it returns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::{DatabaseError, StoreError};
use crate::pipeline::types::{
    Category, Priority, Ticket, TicketId, TicketStatus, TicketSummary, TimeWindow,
};
use crate::store::migrations;
use crate::store::traits::{Ledger, TicketStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Load a ticket by the email it was created from.
    pub async fn get_ticket_by_email(
        &self,
        email_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE source_email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_ticket_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_ticket_by_email: {e}"))),
        }
    }

    /// Number of stored tickets.
    pub async fn count_tickets(&self) -> Result<usize, DatabaseError> {
        count(self.conn(), "SELECT COUNT(*) FROM tickets").await
    }

    /// Change a ticket's status. Status is the only field allowed to change after creation.
    pub async fn update_ticket_status(
        &self,
        id: TicketId,
        status: TicketStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tickets SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_ticket_status: {e}")))?;
        Ok(changed > 0)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so that string comparison matches time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_category(s: &str) -> Category {
    Category::ALL
        .into_iter()
        .find(|c| c.as_str() == s)
        .unwrap_or(Category::Other)
}

fn str_to_priority(s: &str) -> Priority {
    Priority::from_token(s).unwrap_or(Priority::Medium)
}

fn str_to_status(s: &str) -> TicketStatus {
    TicketStatus::ALL
        .into_iter()
        .find(|st| st.as_str() == s)
        .unwrap_or_default()
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(f64::from(v)),
        None => libsql::Value::Null,
    }
}

async fn count(conn: &Connection, sql: &str) -> Result<usize, DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
            Ok(usize::try_from(n).unwrap_or(0))
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
    }
}

const TICKET_COLUMNS: &str = "id, source_email_id, title, description, category, priority, status, sender, confidence, created_at";

/// Map a libsql Row to a Ticket. Column order matches TICKET_COLUMNS.
fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let id = uuid::Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("invalid ticket id '{id_str}': {e}")))?;
    let category: String = row.get(4).map_err(parse)?;
    let priority: String = row.get(5).map_err(parse)?;
    let status: String = row.get(6).map_err(parse)?;
    let created_at: String = row.get(9).map_err(parse)?;

    Ok(Ticket {
        id: TicketId(id),
        source_email_id: row.get(1).map_err(parse)?,
        title: row.get(2).map_err(parse)?,
        description: row.get(3).map_err(parse)?,
        category: str_to_category(&category),
        priority: str_to_priority(&priority),
        status: str_to_status(&status),
        sender: row.get(7).map_err(parse)?,
        #[allow(clippy::cast_possible_truncation)]
        confidence: row.get::<f64>(8).ok().map(|c| c as f32),
        created_at: parse_datetime(&created_at),
    })
}

// ── Ledger ──────────────────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlBackend {
    async fn contains(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_emails WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ledger contains: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("ledger contains: {e}"))),
        }
    }

    async fn mark(&self, email_id: &str) -> Result<(), DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processed_emails (email_id, processed_at) VALUES (?1, ?2)",
                params![email_id, format_datetime(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ledger mark: {e}")))?;

        debug!(email_id, newly_marked = inserted > 0, "Ledger entry written");
        Ok(())
    }

    async fn len(&self) -> Result<usize, DatabaseError> {
        count(self.conn(), "SELECT COUNT(*) FROM processed_emails").await
    }
}

// ── Ticket store ────────────────────────────────────────────────────

#[async_trait]
impl TicketStore for LibSqlBackend {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn create(&self, ticket: &Ticket) -> Result<TicketId, StoreError> {
        // A retried email (ledger mark lost after a crash) must not produce a second row.
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO tickets (id, source_email_id, title, description, category,
                    priority, status, sender, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    ticket.id.to_string(),
                    ticket.source_email_id.clone(),
                    ticket.title.clone(),
                    ticket.description.clone(),
                    ticket.category.as_str(),
                    ticket.priority.as_str(),
                    ticket.status.as_str(),
                    ticket.sender.clone(),
                    opt_real(ticket.confidence),
                    format_datetime(&ticket.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ticket: {e}")))?;

        if inserted == 0 {
            debug!(ticket_id = %ticket.id, email_id = %ticket.source_email_id, "Ticket already stored");
        } else {
            debug!(ticket_id = %ticket.id, email_id = %ticket.source_email_id, "Ticket stored");
        }
        Ok(ticket.id)
    }

    async fn query_summary(&self, window: &TimeWindow) -> Result<Vec<TicketSummary>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT title, category, priority, status, created_at FROM tickets
                 WHERE created_at >= ?1 AND created_at < ?2
                 ORDER BY created_at ASC",
                params![format_datetime(&window.start), format_datetime(&window.end)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query_summary: {e}")))?;

        let mut summaries = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("query_summary: {e}")).into()),
            };
            let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let category: String = row.get(1).map_err(parse)?;
            let priority: String = row.get(2).map_err(parse)?;
            let status: String = row.get(3).map_err(parse)?;
            let created_at: String = row.get(4).map_err(parse)?;
            summaries.push(TicketSummary {
                title: row.get(0).map_err(parse)?,
                category: str_to_category(&category),
                priority: str_to_priority(&priority),
                status: str_to_status(&status),
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(summaries)
    }
}
