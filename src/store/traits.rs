//! Persistence traits: the deduplication ledger and the ticket store.

use async_trait::async_trait;

use crate::error::{DatabaseError, StoreError};
use crate::pipeline::types::{Ticket, TicketId, TicketSummary, TimeWindow};

/// Durable set of email ids that already produced a ticket.
///
/// Both operations must be durable before they return. `mark` is idempotent.
/// The orchestrator only calls `mark` after the ticket store accepted the ticket.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether this email already produced a ticket.
    async fn contains(&self, email_id: &str) -> Result<bool, DatabaseError>;

    /// Record that this email produced a ticket.
    async fn mark(&self, email_id: &str) -> Result<(), DatabaseError>;

    /// Number of recorded emails.
    async fn len(&self) -> Result<usize, DatabaseError>;
}

/// Where classified tickets are persisted.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Backend name, for logging and status output.
    fn name(&self) -> &str;

    /// Persist a ticket.
    ///
    /// Idempotent per source email: creating again for an email that already
    /// has a ticket returns that ticket's id and stores nothing new.
    async fn create(&self, ticket: &Ticket) -> Result<TicketId, StoreError>;

    /// Tickets created within the window.
    async fn query_summary(&self, window: &TimeWindow) -> Result<Vec<TicketSummary>, StoreError>;
}
