//! Execution traces of agent runs.
//!
//! Runs record spans through a [`RunContext`]; finished batches go through the
//! [`TraceExporter`] queue into the [`SqliteTraceStore`].

mod context;
mod exporter;
mod model;
mod store;

pub use context::{new_span_id, new_trace_id, RunContext, SpanHandle};
pub use exporter::{NoTraceSink, TraceExporter, TraceSink};
pub use model::{
    ConversationNeighbors, ExportRecord, SpanRecord, SpanType, StoredSpan, TraceRecord,
    TraceWithSpans,
};
pub use store::{BatchOutcome, SqliteTraceStore};
