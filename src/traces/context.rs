//! Tracing side of one agent run.
//!
//! A [`RunContext`] owns the trace header and collects finished spans. Spans nest
//! through parent ids: the innermost open agent span is the parent of any span
//! started without an explicit one. Everything is handed to the [`TraceSink`] as a
//! single batch when the run finishes.

use super::exporter::{NoTraceSink, TraceSink};
use super::model::{ExportRecord, SpanRecord, SpanType, TraceRecord};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn new_trace_id() -> String {
    format!("trace_{}", Uuid::new_v4().simple())
}

pub fn new_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("span_{}", &id[..24])
}

pub struct RunContext {
    trace: TraceRecord,
    sink: Arc<dyn TraceSink>,
    finished: Mutex<Vec<SpanRecord>>,
    /// Open agent spans, innermost last.
    agent_stack: Mutex<Vec<String>>,
}

impl RunContext {
    pub fn start(
        sink: Arc<dyn TraceSink>,
        workflow_name: impl Into<String>,
        group_id: Option<String>,
    ) -> Self {
        Self {
            trace: TraceRecord {
                id: new_trace_id(),
                workflow_name: Some(workflow_name.into()),
                group_id,
            },
            sink,
            finished: Mutex::new(Vec::new()),
            agent_stack: Mutex::new(Vec::new()),
        }
    }

    /// A context whose spans go nowhere.
    pub fn disabled() -> Self {
        Self::start(Arc::new(NoTraceSink), "untraced", None)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.id
    }

    pub fn group_id(&self) -> Option<&str> {
        self.trace.group_id.as_deref()
    }

    /// Innermost open agent span, if any.
    pub fn current_parent(&self) -> Option<String> {
        self.agent_stack
            .lock()
            .ok()
            .and_then(|stack| stack.last().cloned())
    }

    /// Open an agent span; spans started while it is open become its children.
    pub fn agent_span(&self, name: &str, tools: &[String]) -> SpanHandle<'_> {
        let handle = self.open(
            SpanType::Agent,
            json!({"name": name, "tools": tools, "handoffs": []}),
            true,
        );
        if let Ok(mut stack) = self.agent_stack.lock() {
            stack.push(handle.id.clone());
        }
        handle
    }

    /// A tool invocation.
    pub fn function_span(&self, tool: &str, input: &str) -> SpanHandle<'_> {
        self.span(
            SpanType::Function,
            json!({"name": tool, "input": input, "output": null}),
        )
    }

    /// One model call.
    pub fn generation_span(&self, model: &str, input: Value) -> SpanHandle<'_> {
        self.span(
            SpanType::Generation,
            json!({"model": model, "input": input, "output": null}),
        )
    }

    pub fn custom_span(&self, name: &str, data: Value) -> SpanHandle<'_> {
        self.span(SpanType::Custom, json!({"name": name, "data": data}))
    }

    /// Start a span of any type under the current parent.
    pub fn span(&self, span_type: SpanType, fields: Value) -> SpanHandle<'_> {
        self.open(span_type, fields, false)
    }

    fn open(&self, span_type: SpanType, fields: Value, is_agent: bool) -> SpanHandle<'_> {
        let mut data = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        data.insert("type".to_string(), Value::String(span_type.as_str().to_string()));

        SpanHandle {
            ctx: self,
            id: new_span_id(),
            parent_id: self.current_parent(),
            started_at: Utc::now(),
            data,
            error: None,
            is_agent,
        }
    }

    fn record(&self, span: SpanRecord) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(span);
        }
    }

    /// Export the trace header and every finished span.
    pub fn flush(&self) {
        let spans = self
            .finished
            .lock()
            .map(|mut finished| std::mem::take(&mut *finished))
            .unwrap_or_default();

        let mut batch = Vec::with_capacity(spans.len() + 1);
        batch.push(ExportRecord::Trace(self.trace.clone()));
        batch.extend(spans.into_iter().map(ExportRecord::Span));
        self.sink.export(batch);
    }

    /// End the run and export what it recorded.
    pub fn finish(self) {
        self.flush();
    }
}

/// An open span. It is recorded when dropped (or explicitly ended).
pub struct SpanHandle<'a> {
    ctx: &'a RunContext,
    id: String,
    parent_id: Option<String>,
    started_at: DateTime<Utc>,
    data: Map<String, Value>,
    error: Option<Value>,
    is_agent: bool,
}

impl SpanHandle<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Set a field of the span payload.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn set_output(&mut self, output: impl Into<Value>) {
        self.set("output", output);
    }

    pub fn set_error(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.error = Some(json!({"message": message.into(), "data": data}));
    }

    pub fn end(self) {}
}

impl Drop for SpanHandle<'_> {
    fn drop(&mut self) {
        if self.is_agent {
            if let Ok(mut stack) = self.ctx.agent_stack.lock() {
                if let Some(pos) = stack.iter().rposition(|id| *id == self.id) {
                    stack.remove(pos);
                }
            }
        }

        let ended_at = Utc::now().max(self.started_at);
        self.ctx.record(SpanRecord {
            id: std::mem::take(&mut self.id),
            trace_id: self.ctx.trace.id.clone(),
            parent_id: self.parent_id.take(),
            started_at: self.started_at,
            ended_at,
            span_data: Value::Object(std::mem::take(&mut self.data)),
            error: self.error.take(),
        });
    }
}
