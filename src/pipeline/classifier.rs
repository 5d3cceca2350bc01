//! Email classifier: one LLM call, then a strict parse-and-validate step.
//!
//! All string-matching heuristics live in [`parse_classification`]. The
//! fallback policy has two tiers:
//! - a single missing or unrecognisable field degrades to its default
//!   (`Other` for category, `Medium` for priority) as long as the other
//!   required field parsed;
//! - a response where neither category nor priority can be recovered is a
//!   [`ClassificationError::SchemaViolation`].

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ClassificationError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Category, ClassificationResult, Priority, truncate_chars};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 200;

/// Temperature for classification.
const CLASSIFY_TEMPERATURE: f32 = 0.2;

/// Default number of body characters sent to the model.
pub const DEFAULT_BODY_LIMIT: usize = 500;

/// Classifies one email into category and priority.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<ClassificationResult, ClassificationError>;
}

/// LLM-backed classifier.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    body_limit: usize,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<ClassificationResult, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(subject, body, self.body_limit)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;

        parse_classification(&response.content).inspect_err(|e| {
            warn!(
                model = self.llm.model_name(),
                raw_response = %response.content,
                error = %e,
                "Classifier response rejected"
            );
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the classification system prompt.
pub fn build_system_prompt() -> String {
    let categories: Vec<&str> = Category::ALL.iter().map(|c| c.display_name()).collect();
    let priorities: Vec<&str> = Priority::ALL.iter().map(|p| p.as_str()).collect();

    format!(
        "You are an IT support triage assistant. Classify the customer email into exactly \
         ONE category and ONE priority.\n\n\
         Categories: {categories}\n\
         - Hardware: physical equipment problems\n\
         - Software: application or program issues\n\
         - Network: connectivity problems\n\
         - User Error: mistakes by the user\n\
         - Security: security threats or incidents\n\
         - Other: anything else\n\n\
         Priorities: {priorities}\n\n\
         Respond EXACTLY in this format, one field per line:\n\
         Category: <category>\n\
         Priority: <priority>\n\
         Confidence: <number between 0 and 1>\n\
         Title: <one-line title>\n\
         Description: <one or two sentence description>",
        categories = categories.join(", "),
        priorities = priorities.join(", "),
    )
}

/// Build the user prompt from an email (body truncated to `body_limit` chars).
pub fn build_user_prompt(subject: &str, body: &str, body_limit: usize) -> String {
    format!(
        "Email Subject: {}\nEmail Body: {}",
        subject.trim(),
        truncate_chars(body.trim(), body_limit)
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// `Label: value` lines, tolerating bullets and markdown bold around the label.
static FIELD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[\s>*#-]*\**\s*(category|root cause|priority|confidence|title|summary|description)\s*\**\s*:\s*\**(.*?)\**\s*$",
    )
    .expect("field regex is valid")
});

/// Fields extracted from a raw response, before validation.
#[derive(Debug, Default)]
struct RawFields {
    category: Option<String>,
    priority: Option<String>,
    confidence: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

fn extract_fields(raw: &str) -> RawFields {
    let mut fields = RawFields::default();
    for caps in FIELD_LINE.captures_iter(raw) {
        let label = caps[1].to_lowercase();
        let value = caps[2].trim().to_string();
        // First occurrence wins.
        let slot = match label.as_str() {
            "category" | "root cause" => &mut fields.category,
            "priority" => &mut fields.priority,
            "confidence" => &mut fields.confidence,
            "title" | "summary" => &mut fields.title,
            "description" => &mut fields.description,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    fields
}

/// Match a field value against the enumerated tokens.
///
/// Brackets, quotes and markdown around the value are ignored; what remains
/// must be exactly one token. Values naming several tokens, or none, are
/// unrecognised.
fn match_token<T>(value: &str, from_token: impl Fn(&str) -> Option<T>) -> Option<T> {
    let cleaned = value.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'));
    from_token(cleaned)
}

/// Parse a confidence value; out-of-range values are clamped, garbage is dropped.
fn parse_confidence(value: &str) -> Option<f32> {
    let trimmed = value.trim().trim_matches(|c: char| c == '[' || c == ']');
    let (number, percent) = match trimmed.strip_suffix('%') {
        Some(n) => (n.trim(), true),
        None => (trimmed, false),
    };
    let parsed: f32 = number.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    let parsed = if percent { parsed / 100.0 } else { parsed };
    Some(parsed.clamp(0.0, 1.0))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().trim_matches(|c| c == '[' || c == ']').trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse and validate a raw model response.
pub fn parse_classification(raw: &str) -> Result<ClassificationResult, ClassificationError> {
    let fields = extract_fields(raw);

    let category = fields
        .category
        .as_deref()
        .and_then(|v| match_token(v, Category::from_token));
    let priority = fields
        .priority
        .as_deref()
        .and_then(|v| match_token(v, Priority::from_token));

    if category.is_none() && priority.is_none() {
        let reason = if fields.category.is_none() && fields.priority.is_none() {
            "response contains neither a category nor a priority field".to_string()
        } else {
            format!(
                "no recognised category or priority token (category: {:?}, priority: {:?})",
                fields.category, fields.priority
            )
        };
        return Err(ClassificationError::SchemaViolation { reason });
    }

    if category.is_none() {
        debug!(value = ?fields.category, "Category missing or unrecognised, defaulting to Other");
    }
    if priority.is_none() {
        debug!(value = ?fields.priority, "Priority missing or unrecognised, defaulting to Medium");
    }

    Ok(ClassificationResult {
        category: category.unwrap_or(Category::Other),
        priority: priority.unwrap_or(Priority::Medium),
        confidence: fields.confidence.as_deref().and_then(parse_confidence),
        title: non_empty(fields.title),
        description: non_empty(fields.description),
    })
}
