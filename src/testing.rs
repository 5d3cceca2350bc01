//! In-memory collaborators for tests. Built for unit tests and with the
//! `testing` feature.
//!
//! Each one implements the same trait as its production counterpart and can
//! be told to fail, so pipeline behaviour under partial failure is easy to
//! exercise.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::{EmailSource, NotificationSink};
use crate::error::{
    ClassificationError, DatabaseError, LlmError, NotifyError, SourceError, StoreError,
};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::types::{
    Category, ClassificationResult, Priority, RawEmail, Ticket, TicketId, TicketSummary,
    TimeWindow,
};
use crate::store::traits::{Ledger, TicketStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a `RawEmail` received now.
pub fn email(id: &str, subject: &str, body: &str) -> RawEmail {
    RawEmail {
        id: id.to_string(),
        sender: format!("{id}@customer.example.com"),
        subject: subject.to_string(),
        body: body.to_string(),
        received_at: Utc::now(),
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Returns a fixed batch on every fetch.
#[derive(Default)]
pub struct StaticSource {
    emails: Mutex<Vec<RawEmail>>,
    failing: AtomicBool,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(emails: Vec<RawEmail>) -> Self {
        Self {
            emails: Mutex::new(emails),
            ..Self::default()
        }
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<RawEmail>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Connect {
                host: "static".into(),
                reason: "source offline".into(),
            });
        }
        Ok(lock(&self.emails)
            .iter()
            .filter(|e| e.received_at >= since)
            .cloned()
            .collect())
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

/// Ledger held in a `HashSet`. Not durable.
#[derive(Default)]
pub struct MemoryLedger {
    ids: Mutex<HashSet<String>>,
    fail_contains: AtomicBool,
    fail_mark: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_contains(&self, fail: bool) {
        self.fail_contains.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mark(&self, fail: bool) {
        self.fail_mark.store(fail, Ordering::SeqCst);
    }

    pub fn ids(&self) -> HashSet<String> {
        lock(&self.ids).clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn contains(&self, email_id: &str) -> Result<bool, DatabaseError> {
        if self.fail_contains.load(Ordering::SeqCst) {
            return Err(DatabaseError::Pool("ledger offline".into()));
        }
        Ok(lock(&self.ids).contains(email_id))
    }

    async fn mark(&self, email_id: &str) -> Result<(), DatabaseError> {
        if self.fail_mark.load(Ordering::SeqCst) {
            return Err(DatabaseError::Pool("ledger offline".into()));
        }
        lock(&self.ids).insert(email_id.to_string());
        Ok(())
    }

    async fn len(&self) -> Result<usize, DatabaseError> {
        Ok(lock(&self.ids).len())
    }
}

// ── Classifier ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Scripted {
    Classify(Category, Priority),
    Transport,
    Schema,
}

/// Classifies by subject lookup; unknown subjects become Software/Medium.
#[derive(Default)]
pub struct ScriptedClassifier {
    rules: Mutex<HashMap<String, Scripted>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn classify_as(&self, subject: &str, category: Category, priority: Priority) {
        lock(&self.rules).insert(subject.to_string(), Scripted::Classify(category, priority));
    }

    /// Calls for this subject fail as if the model were unreachable.
    pub fn fail_transport(&self, subject: &str) {
        lock(&self.rules).insert(subject.to_string(), Scripted::Transport);
    }

    /// Calls for this subject fail with an unparseable answer.
    pub fn fail_schema(&self, subject: &str) {
        lock(&self.rules).insert(subject.to_string(), Scripted::Schema);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        subject: &str,
        _body: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let rule = lock(&self.rules).get(subject).cloned();
        let (category, priority) = match rule {
            Some(Scripted::Classify(c, p)) => (c, p),
            Some(Scripted::Transport) => {
                return Err(ClassificationError::Transport(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "connection reset".into(),
                }));
            }
            Some(Scripted::Schema) => {
                return Err(ClassificationError::SchemaViolation {
                    reason: "no category or priority token".into(),
                });
            }
            None => (Category::Software, Priority::Medium),
        };
        Ok(ClassificationResult {
            category,
            priority,
            confidence: Some(0.9),
            title: None,
            description: None,
        })
    }
}

// ── Ticket store ────────────────────────────────────────────────────

/// Keeps tickets in a `Vec`. At most one ticket per source email.
#[derive(Default)]
pub struct MemoryStore {
    tickets: Mutex<Vec<Ticket>>,
    failing: Mutex<HashSet<String>>,
    fail_queries: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject creates for tickets built from this email.
    pub fn fail_for(&self, email_id: &str) {
        lock(&self.failing).insert(email_id.to_string());
    }

    pub fn recover(&self, email_id: &str) {
        lock(&self.failing).remove(email_id);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Insert a ticket directly, bypassing the pipeline.
    pub fn insert(&self, ticket: Ticket) {
        lock(&self.tickets).push(ticket);
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        lock(&self.tickets).clone()
    }

    /// Tickets created from one email.
    pub fn count_for(&self, email_id: &str) -> usize {
        lock(&self.tickets)
            .iter()
            .filter(|t| t.source_email_id == email_id)
            .count()
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, ticket: &Ticket) -> Result<TicketId, StoreError> {
        if lock(&self.failing).contains(&ticket.source_email_id) {
            return Err(StoreError::Rejected {
                status: 503,
                body: "store unavailable".into(),
            });
        }
        let mut tickets = lock(&self.tickets);
        if let Some(existing) = tickets
            .iter()
            .find(|t| t.source_email_id == ticket.source_email_id)
        {
            return Ok(existing.id);
        }
        tickets.push(ticket.clone());
        Ok(ticket.id)
    }

    async fn query_summary(&self, window: &TimeWindow) -> Result<Vec<TicketSummary>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Request("store offline".into()));
        }
        Ok(lock(&self.tickets)
            .iter()
            .filter(|t| window.contains(t.created_at))
            .map(|t| TicketSummary {
                title: t.title.clone(),
                category: t.category,
                priority: t.priority,
                status: t.status,
                created_at: t.created_at,
            })
            .collect())
    }
}

// ── Notification sink ───────────────────────────────────────────────

/// Records delivered texts.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<String>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<String> {
        lock(&self.delivered).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, text: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected(500));
        }
        lock(&self.delivered).push(text.to_string());
        Ok(())
    }
}
