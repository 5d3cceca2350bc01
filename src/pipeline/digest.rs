//! Digest aggregation: tallies tickets in a window and formats the report.
//!
//! Reads only from the ticket store. The ledger plays no part here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::channels::NotificationSink;
use crate::error::{NotifyError, StoreError};
use crate::pipeline::types::{Category, Priority, TicketStatus, TicketSummary, TimeWindow};
use crate::store::traits::TicketStore;

/// Aggregate view of the tickets created in a window. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestSummary {
    pub window: TimeWindow,
    pub total: usize,
    /// Only categories with at least one ticket appear.
    pub by_category: BTreeMap<Category, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_status: BTreeMap<TicketStatus, usize>,
    /// Most urgent open tickets, Critical first, oldest first within a priority.
    pub urgent: Vec<TicketSummary>,
}

impl DigestSummary {
    /// Tally `tickets` that fall inside `window`, keeping up to `top_n` urgent ones.
    pub fn from_tickets(window: TimeWindow, tickets: &[TicketSummary], top_n: usize) -> Self {
        let in_window: Vec<&TicketSummary> = tickets
            .iter()
            .filter(|t| window.contains(t.created_at))
            .collect();

        let mut by_category = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        for t in &in_window {
            *by_category.entry(t.category).or_insert(0) += 1;
            *by_priority.entry(t.priority).or_insert(0) += 1;
            *by_status.entry(t.status).or_insert(0) += 1;
        }

        let mut urgent: Vec<TicketSummary> = in_window
            .iter()
            .filter(|t| t.status.is_open())
            .map(|t| (*t).clone())
            .collect();
        urgent.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        urgent.truncate(top_n);

        Self {
            window,
            total: in_window.len(),
            by_category,
            by_priority,
            by_status,
            urgent,
        }
    }
}

/// Render a digest as Slack-flavoured text.
pub fn format_digest(summary: &DigestSummary) -> String {
    let mut out = String::from("📊 *Daily Maintenance Report*\n");
    out.push_str(&format!(
        "_{} to {} (UTC)_\n\n",
        summary.window.start.format("%Y-%m-%d %H:%M"),
        summary.window.end.format("%Y-%m-%d %H:%M")
    ));
    out.push_str(&format!("*Total Issues:* {}\n", summary.total));

    push_section(
        &mut out,
        "By Category",
        summary.by_category.iter().map(|(k, v)| (k.display_name(), *v)),
    );
    push_section(
        &mut out,
        "By Priority",
        summary.by_priority.iter().map(|(k, v)| (k.as_str(), *v)),
    );
    push_section(
        &mut out,
        "By Status",
        summary.by_status.iter().map(|(k, v)| (k.display_name(), *v)),
    );

    out.push_str("\n*Most Urgent Open Tickets:*\n");
    if summary.urgent.is_empty() {
        out.push_str("✅ No urgent open tickets\n");
    } else {
        for t in &summary.urgent {
            out.push_str(&format!(
                "🔴 [{}] {} ({})\n",
                t.priority,
                t.title,
                t.category.display_name()
            ));
        }
    }
    out
}

fn push_section<'a>(out: &mut String, heading: &str, rows: impl Iterator<Item = (&'a str, usize)>) {
    out.push_str(&format!("\n*{heading}:*\n"));
    let mut any = false;
    for (name, count) in rows {
        out.push_str(&format!("• {name}: {count}\n"));
        any = true;
    }
    if !any {
        out.push_str("• None\n");
    }
}

/// Result of one digest send.
#[derive(Debug, Clone, Serialize)]
pub struct DigestDelivery {
    pub summary: DigestSummary,
    pub text: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads ticket summaries and hands formatted digests to a sink.
pub struct DigestAggregator {
    store: Arc<dyn TicketStore>,
    sink: Arc<dyn NotificationSink>,
    top_n: usize,
    call_timeout: Duration,
}

impl DigestAggregator {
    pub fn new(store: Arc<dyn TicketStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            sink,
            top_n: 5,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Tally every ticket created in the window.
    pub async fn summarize(&self, window: TimeWindow) -> Result<DigestSummary, StoreError> {
        let tickets = timeout(self.call_timeout, self.store.query_summary(&window))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))??;
        Ok(DigestSummary::from_tickets(window, &tickets, self.top_n))
    }

    /// Summarize, format and deliver.
    ///
    /// A store failure is returned. A delivery failure is logged and
    /// reported in the result, never retried.
    pub async fn send_digest(&self, window: TimeWindow) -> Result<DigestDelivery, StoreError> {
        let summary = self.summarize(window).await?;
        let text = format_digest(&summary);

        let delivered = timeout(self.call_timeout, self.sink.deliver(&text))
            .await
            .unwrap_or_else(|_| Err(NotifyError::Timeout(self.call_timeout)));

        match delivered {
            Ok(()) => {
                info!(sink = self.sink.name(), total = summary.total, "Digest delivered");
                Ok(DigestDelivery {
                    summary,
                    text,
                    delivered: true,
                    error: None,
                })
            }
            Err(e) => {
                warn!(sink = self.sink.name(), error = %e, "Digest delivery failed");
                Ok(DigestDelivery {
                    summary,
                    text,
                    delivered: false,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ClassificationResult, Ticket};
    use crate::testing::{MemoryStore, RecordingSink, email};
    use chrono::{Duration as ChronoDuration, Utc};

    fn summary(
        title: &str,
        category: Category,
        priority: Priority,
        status: TicketStatus,
        age_mins: i64,
    ) -> TicketSummary {
        TicketSummary {
            title: title.into(),
            category,
            priority,
            status,
            created_at: Utc::now() - ChronoDuration::minutes(age_mins),
        }
    }

    fn sample() -> Vec<TicketSummary> {
        vec![
            summary("App crash", Category::Software, Priority::High, TicketStatus::New, 30),
            summary("Server down", Category::Hardware, Priority::Critical, TicketStatus::New, 20),
            summary("Slow UI", Category::Software, Priority::Medium, TicketStatus::Resolved, 10),
        ]
    }

    #[test]
    fn tallies_by_category_and_priority() {
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &sample(), 5);
        assert_eq!(d.total, 3);
        assert_eq!(
            d.by_category,
            BTreeMap::from([(Category::Software, 2), (Category::Hardware, 1)])
        );
        assert_eq!(
            d.by_priority,
            BTreeMap::from([
                (Priority::High, 1),
                (Priority::Critical, 1),
                (Priority::Medium, 1)
            ])
        );
        assert_eq!(
            d.by_status,
            BTreeMap::from([(TicketStatus::New, 2), (TicketStatus::Resolved, 1)])
        );
    }

    #[test]
    fn absent_keys_are_omitted() {
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &sample(), 5);
        assert!(!d.by_category.contains_key(&Category::Network));
        assert!(!d.by_priority.contains_key(&Priority::Low));
    }

    #[test]
    fn tickets_outside_window_are_not_counted() {
        let mut tickets = sample();
        tickets.push(summary("Old", Category::Network, Priority::Low, TicketStatus::New, 60 * 48));
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &tickets, 5);
        assert_eq!(d.total, 3);
    }

    #[test]
    fn urgent_list_orders_by_priority_then_age_and_skips_resolved() {
        let tickets = vec![
            summary("newer high", Category::Other, Priority::High, TicketStatus::New, 5),
            summary("older high", Category::Other, Priority::High, TicketStatus::InProgress, 50),
            summary("critical", Category::Security, Priority::Critical, TicketStatus::New, 1),
            summary("done", Category::Security, Priority::Critical, TicketStatus::Resolved, 60),
        ];
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &tickets, 2);
        let titles: Vec<&str> = d.urgent.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["critical", "older high"]);
    }

    #[test]
    fn format_lists_breakdowns_and_urgent_tickets() {
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &sample(), 5);
        let text = format_digest(&d);
        assert!(text.starts_with("📊 *Daily Maintenance Report*"));
        assert!(text.contains("*Total Issues:* 3"));
        assert!(text.contains("• Software: 2"));
        assert!(text.contains("• Critical: 1"));
        assert!(text.contains("• Resolved: 1"));
        assert!(!text.contains("Network"));
        assert!(text.contains("🔴 [Critical] Server down (Hardware)"));
        assert!(!text.contains("Slow UI"));
    }

    #[test]
    fn format_empty_digest() {
        let d = DigestSummary::from_tickets(TimeWindow::last_hours(24), &[], 5);
        let text = format_digest(&d);
        assert!(text.contains("*Total Issues:* 0"));
        assert!(text.contains("• None"));
        assert!(text.contains("No urgent open tickets"));
    }

    fn store_with_tickets() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let result = ClassificationResult {
            category: Category::Network,
            priority: Priority::High,
            confidence: None,
            title: None,
            description: None,
        };
        let e = email("m1", "VPN down", "cannot connect");
        store.insert(Ticket::from_classification(&e, &result, Utc::now()));
        store
    }

    #[tokio::test]
    async fn send_digest_delivers_formatted_text() {
        let store = store_with_tickets();
        let sink = Arc::new(RecordingSink::new());
        let digest = DigestAggregator::new(store, sink.clone());

        let delivery = digest.send_digest(TimeWindow::last_hours(1)).await.unwrap();
        assert!(delivery.delivered);
        assert_eq!(delivery.summary.total, 1);
        assert_eq!(sink.delivered(), vec![delivery.text.clone()]);
        assert!(delivery.text.contains("VPN down"));
    }

    #[tokio::test]
    async fn tickets_at_window_end_are_excluded() {
        let window = TimeWindow::last_hours(1);
        let store = Arc::new(MemoryStore::new());
        let result = ClassificationResult {
            category: Category::Software,
            priority: Priority::Low,
            confidence: None,
            title: None,
            description: None,
        };
        let inside = email("in", "Inside", "created at start");
        let at_end = email("end", "At end", "created at end");
        store.insert(Ticket::from_classification(&inside, &result, window.start));
        store.insert(Ticket::from_classification(&at_end, &result, window.end));

        let digest = DigestAggregator::new(store, Arc::new(RecordingSink::new()));
        let summary = digest.summarize(window).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.urgent[0].title, "Inside");
    }

    #[tokio::test]
    async fn delivery_failure_is_reported_once() {
        let sink = Arc::new(RecordingSink::new());
        sink.set_failing(true);
        let digest = DigestAggregator::new(store_with_tickets(), sink.clone());

        let delivery = digest.send_digest(TimeWindow::last_hours(24)).await.unwrap();
        assert!(!delivery.delivered);
        assert!(delivery.error.is_some());
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_returned() {
        let store = store_with_tickets();
        store.set_fail_queries(true);
        let digest = DigestAggregator::new(store, Arc::new(RecordingSink::new()));
        assert!(digest.summarize(TimeWindow::last_hours(24)).await.is_err());
    }
}
