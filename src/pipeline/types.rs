//! Shared types for the support pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving ticket ids from email ids.
const TICKET_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b1a_8e55_0c7a_d2f4_91b3);

/// Longest title stored on a ticket.
pub const MAX_TITLE_CHARS: usize = 100;

/// Longest description stored on a ticket.
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

// ── Raw email ───────────────────────────────────────────────────────

/// One email as fetched from the source. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEmail {
    /// Source-assigned, globally unique id.
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

// ── Enumerations ────────────────────────────────────────────────────

/// Root-cause category of a support issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Hardware,
    Software,
    Network,
    UserError,
    Security,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Hardware,
        Self::Software,
        Self::Network,
        Self::UserError,
        Self::Security,
        Self::Other,
    ];

    /// Human-readable name, as shown in the digest and the Notion select.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Hardware => "Hardware",
            Self::Software => "Software",
            Self::Network => "Network",
            Self::UserError => "User Error",
            Self::Security => "Security",
            Self::Other => "Other",
        }
    }

    /// Stable storage key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
            Self::Network => "network",
            Self::UserError => "user_error",
            Self::Security => "security",
            Self::Other => "other",
        }
    }

    /// Match a single token, ignoring case, spaces, underscores and hyphens.
    pub fn from_token(token: &str) -> Option<Self> {
        let folded = fold_token(token);
        Self::ALL
            .into_iter()
            .find(|c| fold_token(c.display_name()) == folded)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| format!("unknown category: '{s}'"))
    }
}

/// Ticket urgency. Declaration order is most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        let folded = fold_token(token);
        Self::ALL
            .into_iter()
            .find(|p| fold_token(p.as_str()) == folded)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| format!("unknown priority: '{s}'"))
    }
}

/// Ticket workflow status. Only `New` is ever written by the pipeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TicketStatus {
    #[default]
    New,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 3] = [Self::New, Self::InProgress, Self::Resolved];

    pub fn display_name(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::InProgress => "In Progress",
            Self::Resolved => "Resolved",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        let folded = fold_token(token);
        Self::ALL
            .into_iter()
            .find(|s| fold_token(s.display_name()) == folded)
    }

    pub fn is_open(self) -> bool {
        self != Self::Resolved
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Lowercase and drop separators so "User Error", "user_error" and "UserError" compare equal.
fn fold_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

// ── Classification ──────────────────────────────────────────────────

/// Structured classifier output. Always attached to a ticket, never stored alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub priority: Priority,
    /// Always within [0, 1] when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// One-line title proposed by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Short description proposed by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Ticket ──────────────────────────────────────────────────────────

/// The persisted, classified representation of one support email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub source_email_id: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub priority: Priority,
    pub status: TicketStatus,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    /// Build a `New` ticket from an email and its classification.
    ///
    /// Title and description prefer the model's wording and fall back to the
    /// email subject and body.
    pub fn from_classification(
        email: &RawEmail,
        result: &ClassificationResult,
        created_at: DateTime<Utc>,
    ) -> Self {
        let title = result
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| email.subject.trim());
        let title = if title.is_empty() { "No Subject" } else { title };

        let description = result
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| email.body.trim());
        let description = if description.is_empty() {
            "No content"
        } else {
            description
        };

        Self {
            id: TicketId::for_email(&email.id),
            source_email_id: email.id.clone(),
            title: truncate_chars(title, MAX_TITLE_CHARS),
            description: truncate_chars(description, MAX_DESCRIPTION_CHARS),
            category: result.category,
            priority: result.priority,
            status: TicketStatus::New,
            sender: email.sender.clone(),
            confidence: result.confidence,
            created_at,
        }
    }
}

/// Ticket identifier, derived 1:1 from the source email id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn for_email(email_id: &str) -> Self {
        Self(Uuid::new_v5(&TICKET_NAMESPACE, email_id.as_bytes()))
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Projection of a stored ticket used for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub title: String,
    pub category: Category,
    pub priority: Priority,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

// ── Time window ─────────────────────────────────────────────────────

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window ending now and reaching `hours` back.
    pub fn last_hours(hours: u32) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::hours(i64::from(hours)),
            end,
        }
    }

    /// Same start, ending now. Covers tickets a run over `self` created.
    pub fn through_now(&self) -> Self {
        Self {
            start: self.start,
            end: Utc::now().max(self.end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

// ── Run report ──────────────────────────────────────────────────────

/// Why a single email did not produce a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    SchemaViolation,
    Store,
}

/// Diagnostic record for one failed email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub email_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome counts of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub window: TimeWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub skipped_duplicate: usize,
    pub classified: usize,
    pub failed: usize,
    pub stored: usize,
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            window,
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            skipped_duplicate: 0,
            classified: 0,
            failed: 0,
            stored: 0,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        email_id: &str,
        kind: FailureKind,
        message: impl Into<String>,
    ) {
        self.failed += 1;
        self.failures.push(FailureRecord {
            email_id: email_id.to_string(),
            kind,
            message: message.into(),
        });
    }

    /// Emails whose outcome is settled (skipped, failed or stored).
    pub fn settled(&self) -> usize {
        self.skipped_duplicate + self.failed + self.stored
    }

    /// Fraction of fetched emails settled so far, 1.0 for an empty batch.
    pub fn completion(&self) -> f64 {
        if self.fetched == 0 {
            1.0
        } else {
            self.settled() as f64 / self.fetched as f64
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
