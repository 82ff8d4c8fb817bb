//! Trace and span records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

/// One timed unit of work inside a trace, as emitted by the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub span_data: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl SpanRecord {
    /// Kind of span, read from `span_data.type`.
    pub fn span_type(&self) -> SpanType {
        self.span_data
            .get("type")
            .and_then(Value::as_str)
            .map(SpanType::from)
            .unwrap_or(SpanType::Custom)
    }
}

/// Item of an export batch, tagged by its `object` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum ExportRecord {
    #[serde(rename = "trace")]
    Trace(TraceRecord),
    #[serde(rename = "trace.span")]
    Span(SpanRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpanType {
    Agent,
    Generation,
    Function,
    Handoff,
    Guardrail,
    Custom,
    /// Any tag not listed above, kept verbatim.
    Other(String),
}

impl SpanType {
    pub fn as_str(&self) -> &str {
        match self {
            SpanType::Agent => "agent",
            SpanType::Generation => "generation",
            SpanType::Function => "function",
            SpanType::Handoff => "handoff",
            SpanType::Guardrail => "guardrail",
            SpanType::Custom => "custom",
            SpanType::Other(tag) => tag,
        }
    }
}

impl From<&str> for SpanType {
    fn from(tag: &str) -> Self {
        match tag {
            "agent" => SpanType::Agent,
            "generation" => SpanType::Generation,
            "function" => SpanType::Function,
            "handoff" => SpanType::Handoff,
            "guardrail" => SpanType::Guardrail,
            "custom" => SpanType::Custom,
            other => SpanType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SpanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A span as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSpan {
    pub id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub span_type: String,
    pub span_data: Value,
    pub error: Option<Value>,
}

/// A trace of a conversation with its time bounds and spans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceWithSpans {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub spans: Vec<StoredSpan>,
}

/// Adjacent conversations, ordered by their latest generation span.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationNeighbors {
    pub previous: Option<String>,
    pub next: Option<String>,
}

/// Fixed-width UTC timestamp; sorts lexically in the same order as chronologically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
