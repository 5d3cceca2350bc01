//! Persistence layer: deduplication ledger and ticket stores.

pub mod libsql_backend;
pub mod migrations;
pub mod notion;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use notion::{NotionConfig, NotionStore};
pub use traits::{Ledger, TicketStore};
