//! Support email pipeline.
//!
//! Every email in a run flows through:
//! 1. `EmailSource::fetch()`: emails received in the window
//! 2. `Ledger::contains()`: already-ticketed emails are skipped
//! 3. `Classifier::classify()`: category and priority from the model
//! 4. `TicketStore::create()` then `Ledger::mark()`
//!
//! The digest reads the ticket store afterwards and never touches the ledger.

pub mod classifier;
pub mod digest;
pub mod orchestrator;
pub mod types;

pub use classifier::{Classifier, LlmClassifier};
pub use digest::{DigestAggregator, DigestDelivery, DigestSummary, format_digest};
pub use orchestrator::{LastRun, Orchestrator, Trigger};
