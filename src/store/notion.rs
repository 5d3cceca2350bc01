//! Notion ticket store: one database page per ticket.
//!
//! Uses the public REST API directly over reqwest:
//! - `POST /v1/databases/{id}/query` filtered on `Email ID` before creating,
//!   so a retried create finds the page an earlier attempt made
//! - `POST /v1/pages` to create a ticket
//! - `POST /v1/databases/{id}/query` (paginated) for the digest summary

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::env_string;
use crate::error::{ConfigError, StoreError};
use crate::pipeline::types::{
    Category, Priority, Ticket, TicketId, TicketStatus, TicketSummary, TimeWindow,
};
use crate::store::traits::TicketStore;

const NOTION_API_BASE: &str = "https://api.notion.com";
const NOTION_VERSION: &str = "2022-06-28";
/// Largest page size the query endpoint accepts.
const QUERY_PAGE_SIZE: u32 = 100;

// ── Configuration ───────────────────────────────────────────────────

/// Credentials and target database for the Notion store.
#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_key: SecretString,
    pub database_id: String,
}

impl NotionConfig {
    /// Read `NOTION_API_KEY` (or `NOTION_TOKEN`) and `NOTION_DATABASE_ID`.
    ///
    /// Returns `Ok(None)` when neither is set, so callers can fall back to the
    /// local store. Setting only one of the two is a configuration error.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let key = env_string("NOTION_API_KEY").or_else(|| env_string("NOTION_TOKEN"));
        let database_id = env_string("NOTION_DATABASE_ID");

        match (key, database_id) {
            (None, None) => Ok(None),
            (Some(key), Some(database_id)) => Ok(Some(Self {
                api_key: SecretString::from(key),
                database_id,
            })),
            (Some(_), None) => Err(ConfigError::MissingEnvVar("NOTION_DATABASE_ID".into())),
            (None, Some(_)) => Err(ConfigError::MissingEnvVar("NOTION_API_KEY".into())),
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Ticket store backed by a Notion database.
pub struct NotionStore {
    config: NotionConfig,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl NotionStore {
    pub fn new(config: NotionConfig, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            base_url: NOTION_API_BASE.to_string(),
            timeout,
            client,
        })
    }

    /// Point the store at a different API host (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(self.config.api_key.expose_secret())
            .header("Notion-Version", NOTION_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StoreError::Timeout(self.timeout)
                } else {
                    StoreError::Request(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }
}

impl NotionStore {
    /// Id of the page already holding the ticket for `email_id`, if any.
    async fn find_page(&self, email_id: &str) -> Result<Option<String>, StoreError> {
        let path = format!("/v1/databases/{}/query", self.config.database_id);
        let resp = self.post(&path, &email_lookup_body(email_id)).await?;
        let results = resp
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::InvalidResponse("missing 'results' array".into()))?;
        Ok(results
            .first()
            .map(|page| page.get("id").and_then(Value::as_str).unwrap_or("?").to_string()))
    }
}

#[async_trait]
impl TicketStore for NotionStore {
    fn name(&self) -> &str {
        "notion"
    }

    async fn create(&self, ticket: &Ticket) -> Result<TicketId, StoreError> {
        if let Some(page_id) = self.find_page(&ticket.source_email_id).await? {
            debug!(
                ticket_id = %ticket.id,
                page_id = %page_id,
                "Notion page already exists for email"
            );
            return Ok(ticket.id);
        }

        let body = json!({
            "parent": { "database_id": self.config.database_id },
            "properties": ticket_properties(ticket),
        });
        let page = self.post("/v1/pages", &body).await?;
        let page_id = page.get("id").and_then(Value::as_str).unwrap_or("?");
        debug!(ticket_id = %ticket.id, page_id, "Notion page created");
        Ok(ticket.id)
    }

    async fn query_summary(&self, window: &TimeWindow) -> Result<Vec<TicketSummary>, StoreError> {
        let path = format!("/v1/databases/{}/query", self.config.database_id);
        let mut cursor: Option<String> = None;
        let mut summaries = Vec::new();
        let mut pages = 0usize;

        loop {
            let body = query_body(window, cursor.as_deref());
            let resp = self.post(&path, &body).await?;
            pages += 1;

            let results = resp
                .get("results")
                .and_then(Value::as_array)
                .ok_or_else(|| StoreError::InvalidResponse("missing 'results' array".into()))?;

            summaries.extend(
                results
                    .iter()
                    .filter_map(page_to_summary)
                    .filter(|s| window.contains(s.created_at)),
            );

            let has_more = resp.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = resp
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }

        info!(pages, tickets = summaries.len(), "Notion summary query complete");
        Ok(summaries)
    }
}

// ── Property mapping ────────────────────────────────────────────────

fn rich_text(content: &str) -> Value {
    json!([{ "text": { "content": content } }])
}

fn select(name: &str) -> Value {
    json!({ "select": { "name": name } })
}

/// Database properties for a new ticket page.
pub fn ticket_properties(ticket: &Ticket) -> Value {
    json!({
        "Title": { "title": rich_text(&ticket.title) },
        "Description": { "rich_text": rich_text(&ticket.description) },
        "Root Cause": select(ticket.category.display_name()),
        "Priority": select(ticket.priority.as_str()),
        "Status": select(ticket.status.display_name()),
        "Date": { "date": { "start": ticket.created_at.to_rfc3339_opts(SecondsFormat::Secs, true) } },
        "Email ID": { "rich_text": rich_text(&ticket.source_email_id) },
    })
}

/// Query body matching the page created for one email.
pub fn email_lookup_body(email_id: &str) -> Value {
    json!({
        "filter": {
            "property": "Email ID",
            "rich_text": { "equals": email_id },
        },
        "page_size": 1,
    })
}

/// Body for one page of the summary query.
pub fn query_body(window: &TimeWindow, cursor: Option<&str>) -> Value {
    let mut body = json!({
        "filter": {
            "property": "Date",
            "date": { "on_or_after": window.start.to_rfc3339_opts(SecondsFormat::Secs, true) },
        },
        "page_size": QUERY_PAGE_SIZE,
    });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

/// Read a ticket summary back out of a query result page.
///
/// Pages without a recognizable category or priority (edited by hand in
/// Notion) are skipped. A missing status reads as `New`.
pub fn page_to_summary(page: &Value) -> Option<TicketSummary> {
    let props = page.get("properties")?;

    let title = props
        .get("Title")
        .and_then(|t| t.get("title"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    p.get("plain_text")
                        .or_else(|| p.get("text").and_then(|t| t.get("content")))
                        .and_then(Value::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default();

    let category = select_name(props, "Root Cause").and_then(Category::from_token)?;
    let priority = select_name(props, "Priority").and_then(Priority::from_token)?;
    let status = select_name(props, "Status")
        .and_then(TicketStatus::from_token)
        .unwrap_or_default();

    let created_at = props
        .get("Date")
        .and_then(|d| d.get("date"))
        .and_then(|d| d.get("start"))
        .and_then(Value::as_str)
        .or_else(|| page.get("created_time").and_then(Value::as_str))
        .and_then(parse_notion_date)?;

    Some(TicketSummary {
        title,
        category,
        priority,
        status,
        created_at,
    })
}

fn select_name<'a>(props: &'a Value, key: &str) -> Option<&'a str> {
    props
        .get(key)?
        .get("select")?
        .get("name")?
        .as_str()
}

/// Notion dates are either full RFC 3339 timestamps or bare `YYYY-MM-DD`.
fn parse_notion_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}
