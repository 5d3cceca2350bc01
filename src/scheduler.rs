//! Daily trigger: runs the pipeline and then sends the digest.
//!
//! The scheduler owns no pipeline logic. Each tick calls
//! `Orchestrator::run_triggered` and, when that succeeds,
//! `DigestAggregator::send_digest` from the same start up to the moment
//! the run finished.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::types::TimeWindow;
use crate::pipeline::{DigestAggregator, Orchestrator, Trigger};

/// What one scheduled tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Run finished; `digest_delivered` says whether the sink accepted the digest.
    Completed { stored: usize, digest_delivered: bool },
    /// Another run held the lock.
    Skipped,
    Failed { error: String },
}

/// Cron-driven trigger for full pipeline runs.
pub struct Scheduler {
    schedule: cron::Schedule,
    expression: String,
    window_hours: u32,
    orchestrator: Arc<Orchestrator>,
    digest: Arc<DigestAggregator>,
}

impl Scheduler {
    pub fn new(
        config: &ScheduleConfig,
        orchestrator: Arc<Orchestrator>,
        digest: Arc<DigestAggregator>,
    ) -> Result<Self, ConfigError> {
        let schedule =
            cron::Schedule::from_str(&config.expression).map_err(|e| ConfigError::InvalidValue {
                key: "SUPPORT_SCHEDULE".into(),
                message: format!("invalid cron '{}': {e}", config.expression),
            })?;
        Ok(Self {
            schedule,
            expression: config.expression.clone(),
            window_hours: config.window_hours,
            orchestrator,
            digest,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run the pipeline over the configured window, then send the digest.
    pub async fn tick(&self) -> TickOutcome {
        let window = TimeWindow::last_hours(self.window_hours);
        info!(window_hours = self.window_hours, "Scheduled run starting");

        let report = match self
            .orchestrator
            .run_triggered(window, Trigger::Scheduled)
            .await
        {
            Ok(report) => report,
            Err(PipelineError::RunInProgress) => {
                warn!("Scheduled run skipped, a run is already active");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "Scheduled run failed");
                return TickOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        // Tickets are stamped while the run executes, after `window.end`.
        match self.digest.send_digest(window.through_now()).await {
            Ok(delivery) => TickOutcome::Completed {
                stored: report.stored,
                digest_delivered: delivery.delivered,
            },
            Err(e) => {
                warn!(error = %e, "Digest summary failed after scheduled run");
                TickOutcome::Completed {
                    stored: report.stored,
                    digest_delivered: false,
                }
            }
        }
    }

    /// Spawn the scheduler background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(schedule = %self.expression, "Scheduler started");
            loop {
                let now = Utc::now();
                let Some(next) = self.next_fire_after(now) else {
                    warn!(schedule = %self.expression, "Schedule has no future fire times, stopping");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                info!(next = %next, "Next scheduled run");
                tokio::time::sleep(wait).await;

                let outcome = self.tick().await;
                info!(?outcome, "Scheduled tick finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        MemoryLedger, MemoryStore, RecordingSink, ScriptedClassifier, StaticSource, email,
    };
    use chrono::{TimeZone, Timelike};
    use std::time::Duration;

    struct Parts {
        source: Arc<StaticSource>,
        sink: Arc<RecordingSink>,
        scheduler: Scheduler,
    }

    fn parts(expression: &str, source: StaticSource) -> Parts {
        let source = Arc::new(source);
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = Arc::new(Orchestrator::new(
            source.clone(),
            Arc::new(MemoryLedger::new()),
            Arc::new(ScriptedClassifier::new()),
            store.clone(),
        ));
        let digest = Arc::new(DigestAggregator::new(store, sink.clone()));
        let config = ScheduleConfig {
            expression: expression.to_string(),
            ..ScheduleConfig::default()
        };
        let scheduler = Scheduler::new(&config, orchestrator, digest).unwrap();
        Parts {
            source,
            sink,
            scheduler,
        }
    }

    #[test]
    fn invalid_expression_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(StaticSource::default()),
            Arc::new(MemoryLedger::new()),
            Arc::new(ScriptedClassifier::new()),
            store.clone(),
        ));
        let digest = Arc::new(DigestAggregator::new(store, Arc::new(RecordingSink::new())));
        let config = ScheduleConfig {
            expression: "every morning".into(),
            ..ScheduleConfig::default()
        };
        let err = Scheduler::new(&config, orchestrator, digest).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn default_schedule_fires_daily_at_nine() {
        let p = parts("0 0 9 * * *", StaticSource::default());
        let after = Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap();
        let next = p.scheduler.next_fire_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap());
        assert_eq!(next.hour(), 9);
    }

    #[tokio::test]
    async fn tick_runs_pipeline_then_sends_digest() {
        let p = parts(
            "0 0 9 * * *",
            StaticSource::new(vec![email("m1", "Printer jam", "paper stuck")]),
        );
        let outcome = p.scheduler.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                stored: 1,
                digest_delivered: true
            }
        );
        let delivered = p.sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].contains("*Total Issues:* 1"));
        assert!(delivered[0].contains("Printer jam"));
    }

    #[tokio::test]
    async fn digest_counts_every_ticket_the_tick_stored() {
        let p = parts(
            "0 0 9 * * *",
            StaticSource::new(vec![
                email("m1", "Printer jam", "paper stuck"),
                email("m2", "VPN down", "no tunnel"),
                email("m3", "Excel crash", "on save"),
            ]),
        );
        let outcome = p.scheduler.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                stored: 3,
                digest_delivered: true
            }
        );
        assert!(p.sink.delivered()[0].contains("*Total Issues:* 3"));
    }

    #[tokio::test]
    async fn failed_run_sends_no_digest() {
        let p = parts("0 0 9 * * *", StaticSource::default());
        p.source.set_failing(true);
        let outcome = p.scheduler.tick().await;
        assert!(matches!(outcome, TickOutcome::Failed { .. }));
        assert!(p.sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn tick_during_active_run_is_skipped() {
        let p = parts(
            "0 0 9 * * *",
            StaticSource::default().with_delay(Duration::from_millis(200)),
        );
        let orchestrator = p.scheduler.orchestrator.clone();
        let (manual, scheduled) = tokio::join!(orchestrator.run(TimeWindow::last_hours(1)), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.scheduler.tick().await
        });
        assert!(manual.is_ok());
        assert_eq!(scheduled, TickOutcome::Skipped);
        assert!(p.sink.delivered().is_empty());
    }
}
