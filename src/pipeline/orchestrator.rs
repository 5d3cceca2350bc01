//! Pipeline orchestrator: one idempotent run over a time window.
//!
//! fetch → ledger filter → classify (bounded pool) → store → ledger mark.
//!
//! At most one run is active at a time. Classification is the only
//! concurrent step; storing, marking and counting happen on the task that
//! drives the run, in completion order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::channels::EmailSource;
use crate::error::{ClassificationError, LlmError, PipelineError, SourceError, StoreError};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::types::{
    ClassificationResult, FailureKind, RawEmail, RunReport, Ticket, TimeWindow,
};
use crate::store::traits::{Ledger, TicketStore};

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
}

/// Outcome of the most recent run, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    /// `Success`, `Success (Scheduled)` or `Error: ...`.
    pub status: String,
    pub stored: usize,
    /// Full report, or the partial one for an aborted run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

impl LastRun {
    fn from_result(trigger: Trigger, result: &Result<RunReport, PipelineError>) -> Self {
        match result {
            Ok(report) => Self {
                trigger,
                finished_at: report.finished_at.unwrap_or_else(Utc::now),
                status: match trigger {
                    Trigger::Manual => "Success".to_string(),
                    Trigger::Scheduled => "Success (Scheduled)".to_string(),
                },
                stored: report.stored,
                report: Some(report.clone()),
            },
            Err(e) => {
                let partial = e.partial_report().cloned();
                Self {
                    trigger,
                    finished_at: Utc::now(),
                    status: format!("Error: {e}"),
                    stored: partial.as_ref().map_or(0, |r| r.stored),
                    report: partial,
                }
            }
        }
    }
}

/// Composes source, ledger, classifier and store into pipeline runs.
pub struct Orchestrator {
    source: Arc<dyn EmailSource>,
    ledger: Arc<dyn Ledger>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn TicketStore>,
    concurrency: usize,
    call_timeout: Duration,
    run_lock: Mutex<()>,
    last_run: RwLock<Option<LastRun>>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn EmailSource>,
        ledger: Arc<dyn Ledger>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn TicketStore>,
    ) -> Self {
        Self {
            source,
            ledger,
            classifier,
            store,
            concurrency: 4,
            call_timeout: Duration::from_secs(30),
            run_lock: Mutex::new(()),
            last_run: RwLock::new(None),
        }
    }

    /// Classifier calls in flight per run (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Bound applied to every source, ledger, classifier and store call.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Whether a run currently holds the run lock.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn last_run(&self) -> Option<LastRun> {
        self.last_run.read().await.clone()
    }

    /// Run the pipeline over `window` as an on-demand trigger.
    pub async fn run(&self, window: TimeWindow) -> Result<RunReport, PipelineError> {
        self.run_triggered(window, Trigger::Manual).await
    }

    /// Run the pipeline over `window`.
    ///
    /// Fails fast with `RunInProgress` if another run is active. Per-email
    /// failures are counted in the report; only ledger and source failures
    /// return an error, carrying the counts reached before the abort.
    pub async fn run_triggered(
        &self,
        window: TimeWindow,
        trigger: Trigger,
    ) -> Result<RunReport, PipelineError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!(?trigger, "Pipeline run rejected, another run is active");
            return Err(PipelineError::RunInProgress);
        };

        let result = self.execute(window).await;
        *self.last_run.write().await = Some(LastRun::from_result(trigger, &result));
        result
    }

    /// Fetch the window's emails without classifying or storing anything.
    pub async fn fetch(&self, window: TimeWindow) -> Result<Vec<RawEmail>, SourceError> {
        let emails = timeout(self.call_timeout, self.source.fetch(window.start))
            .await
            .map_err(|_| SourceError::Timeout(self.call_timeout))??;
        Ok(emails
            .into_iter()
            .filter(|e| window.contains(e.received_at))
            .collect())
    }

    /// Classify one email outside any run. Nothing is persisted.
    pub async fn classify(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        timeout(self.call_timeout, self.classifier.classify(subject, body))
            .await
            .unwrap_or_else(|_| {
                Err(ClassificationError::Transport(LlmError::Timeout(
                    self.call_timeout,
                )))
            })
    }

    async fn execute(&self, window: TimeWindow) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(window);
        let run_id = report.run_id;
        info!(
            %run_id,
            start = %window.start,
            end = %window.end,
            source = self.source.name(),
            store = self.store.name(),
            "Pipeline run started"
        );

        let emails = match self.fetch(window).await {
            Ok(emails) => emails,
            Err(e) => {
                error!(%run_id, error = %e, "Email source unavailable, aborting run");
                return Err(PipelineError::SourceUnavailable {
                    reason: e.to_string(),
                    partial: Box::new(report),
                });
            }
        };
        report.fetched = emails.len();

        let pending = match self.filter_processed(emails, &mut report).await {
            Ok(pending) => pending,
            Err((email_id, reason)) => return Err(ledger_abort(report, &email_id, reason)),
        };
        debug!(
            %run_id,
            pending = pending.len(),
            skipped = report.skipped_duplicate,
            "Ledger filter complete"
        );

        let mut classified = futures::stream::iter(pending)
            .map(|email| async move {
                let outcome = self.classify(&email.subject, &email.body).await;
                (email, outcome)
            })
            .buffer_unordered(self.concurrency);

        while let Some((email, outcome)) = classified.next().await {
            let result = match outcome {
                Ok(result) => {
                    report.classified += 1;
                    result
                }
                Err(e) => {
                    let kind = match e {
                        ClassificationError::Transport(_) => FailureKind::Transport,
                        ClassificationError::SchemaViolation { .. } => FailureKind::SchemaViolation,
                    };
                    warn!(%run_id, email_id = %email.id, ?kind, error = %e, "Classification failed");
                    report.record_failure(&email.id, kind, e.to_string());
                    continue;
                }
            };

            let ticket = Ticket::from_classification(&email, &result, Utc::now());
            if let Err(e) = self.store_ticket(&ticket).await {
                warn!(%run_id, email_id = %email.id, error = %e, "Ticket store failed, email stays eligible");
                report.record_failure(&email.id, FailureKind::Store, e.to_string());
                continue;
            }

            let marked = timeout(self.call_timeout, self.ledger.mark(&email.id)).await;
            match marked {
                Ok(Ok(())) => {
                    report.stored += 1;
                    info!(
                        %run_id,
                        email_id = %email.id,
                        ticket_id = %ticket.id,
                        category = %ticket.category,
                        priority = %ticket.priority,
                        "Ticket created"
                    );
                }
                Ok(Err(e)) => return Err(ledger_abort(report, &email.id, e.to_string())),
                Err(_) => {
                    let reason = format!("mark timed out after {:?}", self.call_timeout);
                    return Err(ledger_abort(report, &email.id, reason));
                }
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            %run_id,
            fetched = report.fetched,
            skipped_duplicate = report.skipped_duplicate,
            classified = report.classified,
            failed = report.failed,
            stored = report.stored,
            "Pipeline run complete"
        );
        Ok(report)
    }

    /// Drop emails the ledger has seen and repeats within the batch.
    ///
    /// Runs before any model call, so an unreachable ledger costs nothing.
    /// On a ledger error returns the email id being checked and the reason.
    async fn filter_processed(
        &self,
        emails: Vec<RawEmail>,
        report: &mut RunReport,
    ) -> Result<Vec<RawEmail>, (String, String)> {
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(emails.len());

        for email in emails {
            if !seen.insert(email.id.clone()) {
                debug!(email_id = %email.id, "Duplicate id within batch");
                report.skipped_duplicate += 1;
                continue;
            }
            match timeout(self.call_timeout, self.ledger.contains(&email.id)).await {
                Ok(Ok(true)) => report.skipped_duplicate += 1,
                Ok(Ok(false)) => pending.push(email),
                Ok(Err(e)) => return Err((email.id, e.to_string())),
                Err(_) => {
                    let reason = format!("lookup timed out after {:?}", self.call_timeout);
                    return Err((email.id, reason));
                }
            }
        }
        Ok(pending)
    }

    async fn store_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        timeout(self.call_timeout, self.store.create(ticket))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))??;
        Ok(())
    }
}

fn ledger_abort(mut report: RunReport, email_id: &str, reason: String) -> PipelineError {
    report.finished_at = Some(Utc::now());
    error!(
        run_id = %report.run_id,
        email_id,
        error = %reason,
        completion = report.completion(),
        "Ledger unavailable, aborting run"
    );
    PipelineError::LedgerUnavailable {
        reason,
        partial: Box::new(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Category, Priority};
    use crate::testing::{MemoryLedger, MemoryStore, ScriptedClassifier, StaticSource, email};

    struct Harness {
        source: Arc<StaticSource>,
        ledger: Arc<MemoryLedger>,
        classifier: Arc<ScriptedClassifier>,
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
    }

    fn harness_with(source: StaticSource, classifier: ScriptedClassifier) -> Harness {
        let source = Arc::new(source);
        let ledger = Arc::new(MemoryLedger::new());
        let classifier = Arc::new(classifier);
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            source.clone(),
            ledger.clone(),
            classifier.clone(),
            store.clone(),
        )
        .with_concurrency(2);
        Harness {
            source,
            ledger,
            classifier,
            store,
            orchestrator,
        }
    }

    fn harness(emails: Vec<RawEmail>) -> Harness {
        harness_with(StaticSource::new(emails), ScriptedClassifier::new())
    }

    fn three_emails() -> Vec<RawEmail> {
        vec![
            email("m1", "Disk failing", "SMART errors on the laptop"),
            email("m2", "Cannot log in", "Forgot my password"),
            email("m3", "Wifi drops", "Every ten minutes"),
        ]
    }

    fn window() -> TimeWindow {
        TimeWindow::last_hours(24)
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let h = harness(three_emails());

        let first = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(first.fetched, 3);
        assert_eq!(first.classified, 3);
        assert_eq!(first.stored, 3);
        assert_eq!(first.skipped_duplicate, 0);

        let second = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.skipped_duplicate, second.fetched);
        assert_eq!(h.store.tickets().len(), 3);
        assert_eq!(h.classifier.call_count(), 3);
    }

    #[tokio::test]
    async fn one_transport_failure_does_not_abort_batch() {
        let h = harness(three_emails());
        h.classifier.fail_transport("Cannot log in");

        let report = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, report.fetched - 1 - report.skipped_duplicate);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].email_id, "m2");
        assert_eq!(report.failures[0].kind, FailureKind::Transport);
        assert!(!h.ledger.ids().contains("m2"));
    }

    #[tokio::test]
    async fn schema_violation_is_recorded_separately() {
        let h = harness(three_emails());
        h.classifier.fail_schema("Wifi drops");

        let report = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.classified, 2);
        assert_eq!(report.failures[0].kind, FailureKind::SchemaViolation);
    }

    #[tokio::test]
    async fn store_failure_leaves_email_eligible() {
        let h = harness(three_emails());
        h.store.fail_for("m1");

        let first = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.stored, 2);
        assert_eq!(first.failures[0].kind, FailureKind::Store);
        assert!(!h.ledger.ids().contains("m1"));

        h.store.recover("m1");
        let second = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(second.stored, 1);
        assert_eq!(second.skipped_duplicate, 2);
        assert_eq!(h.store.count_for("m1"), 1);
    }

    #[tokio::test]
    async fn repeated_id_in_batch_counts_as_duplicate() {
        let mut emails = three_emails();
        emails.push(email("m1", "Disk failing", "resent"));
        let h = harness(emails);

        let report = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(report.fetched, 4);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(report.stored, 3);
        assert_eq!(h.store.count_for("m1"), 1);
    }

    #[tokio::test]
    async fn ticket_carries_classification() {
        let h = harness(three_emails());
        h.classifier
            .classify_as("Disk failing", Category::Hardware, Priority::Critical);

        h.orchestrator.run(window()).await.unwrap();
        let ticket = h
            .store
            .tickets()
            .into_iter()
            .find(|t| t.source_email_id == "m1")
            .unwrap();
        assert_eq!(ticket.category, Category::Hardware);
        assert_eq!(ticket.priority, Priority::Critical);
        assert_eq!(ticket.title, "Disk failing");
        assert_eq!(ticket.sender, "m1@customer.example.com");
    }

    #[tokio::test]
    async fn unreachable_ledger_aborts_before_classifying() {
        let h = harness(three_emails());
        h.ledger.set_fail_contains(true);

        let err = h.orchestrator.run(window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::LedgerUnavailable { .. }));
        let partial = err.partial_report().unwrap();
        assert_eq!(partial.fetched, 3);
        assert_eq!(partial.stored, 0);
        assert_eq!(h.classifier.call_count(), 0);
        assert!(h.store.tickets().is_empty());
    }

    #[tokio::test]
    async fn failed_mark_aborts_run() {
        let h = harness(three_emails());
        h.ledger.set_fail_mark(true);

        let err = h.orchestrator.run(window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::LedgerUnavailable { .. }));
        assert_eq!(err.partial_report().unwrap().stored, 0);
        assert!(h.ledger.ids().is_empty());
    }

    #[tokio::test]
    async fn retry_after_failed_mark_keeps_one_ticket_per_email() {
        let h = harness(three_emails());
        h.ledger.set_fail_mark(true);

        let err = h.orchestrator.run(window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::LedgerUnavailable { .. }));
        let stored_before_abort = h.store.tickets().len();
        assert_eq!(stored_before_abort, 1);

        h.ledger.set_fail_mark(false);
        let report = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(report.stored, 3);
        assert_eq!(report.failed, 0);
        for id in ["m1", "m2", "m3"] {
            assert_eq!(h.store.count_for(id), 1, "one ticket for {id}");
        }
        assert_eq!(h.ledger.ids().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_source_aborts_and_is_tracked() {
        let h = harness(three_emails());
        h.source.set_failing(true);

        let err = h.orchestrator.run(window()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        let last = h.orchestrator.last_run().await.unwrap();
        assert!(last.status.starts_with("Error:"));
        assert_eq!(last.stored, 0);
    }

    #[tokio::test]
    async fn emails_outside_window_are_ignored() {
        let mut old = email("old", "Ancient", "from last week");
        old.received_at = Utc::now() - chrono::Duration::days(7);
        let h = harness(vec![old, email("new", "Fresh", "today")]);

        let report = h.orchestrator.run(window()).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(h.store.count_for("old"), 0);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let h = harness_with(
            StaticSource::new(three_emails()).with_delay(Duration::from_millis(200)),
            ScriptedClassifier::new(),
        );

        let (a, b) = tokio::join!(h.orchestrator.run(window()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(h.orchestrator.is_running());
            h.orchestrator.run(window()).await
        });
        assert_eq!(a.unwrap().stored, 3);
        assert!(matches!(b, Err(PipelineError::RunInProgress)));
        assert_eq!(h.source.fetch_count(), 1);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn slow_classifier_times_out_as_transport_failure() {
        let h = harness_with(
            StaticSource::new(vec![email("m1", "Slow", "model hangs")]),
            ScriptedClassifier::new().with_delay(Duration::from_millis(300)),
        );
        let orchestrator = h.orchestrator.with_call_timeout(Duration::from_millis(50));

        let report = orchestrator.run(window()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::Transport);
        assert!(report.failures[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn scheduled_success_is_labelled() {
        let h = harness(three_emails());
        h.orchestrator
            .run_triggered(window(), Trigger::Scheduled)
            .await
            .unwrap();

        let last = h.orchestrator.last_run().await.unwrap();
        assert_eq!(last.status, "Success (Scheduled)");
        assert_eq!(last.trigger, Trigger::Scheduled);
        assert_eq!(last.stored, 3);
    }

    #[tokio::test]
    async fn fetch_only_does_not_touch_ledger_or_store() {
        let h = harness(three_emails());
        let emails = h.orchestrator.fetch(window()).await.unwrap();
        assert_eq!(emails.len(), 3);
        assert!(h.ledger.ids().is_empty());
        assert!(h.store.tickets().is_empty());
    }
}
