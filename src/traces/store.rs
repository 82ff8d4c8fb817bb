//! SQLite storage for traces and spans.
//!
//! Append-only: traces are upserted, spans are inserted once and never updated.

use super::model::{
    format_timestamp, ConversationNeighbors, ExportRecord, SpanRecord, StoredSpan, TraceRecord,
    TraceWithSpans,
};
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS traces (
        id TEXT PRIMARY KEY,
        workflow_name TEXT,
        group_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_traces_group_id ON traces(group_id);

    CREATE TABLE IF NOT EXISTS spans (
        id TEXT PRIMARY KEY,
        trace_id TEXT NOT NULL REFERENCES traces(id),
        parent_id TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL,
        span_type TEXT NOT NULL,
        span_data TEXT NOT NULL,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans(trace_id);
    CREATE INDEX IF NOT EXISTS idx_spans_parent_id ON spans(parent_id);
    CREATE INDEX IF NOT EXISTS idx_spans_type_started ON spans(span_type, started_at);
"#;

/// What happened to one export batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub traces: usize,
    pub spans: usize,
    pub dropped: usize,
    pub duplicates: usize,
}

/// SQLite-backed trace store.
pub struct SqliteTraceStore {
    conn: Mutex<Connection>,
}

impl SqliteTraceStore {
    /// Open (or create) the trace database at `path`.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(&conn)?;

        info!("Initialized trace store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GatewayError::TraceStore(format!("Failed to acquire lock: {}", e)))
    }

    /// Persist one export batch in a single transaction.
    ///
    /// Trace headers are written before any span. Spans that cannot be attached
    /// (unknown trace, parent in another trace, end before start) are dropped with
    /// a warning, along with their descendants in the batch. The rest of the batch
    /// is still committed.
    pub fn insert_batch(&self, batch: &[ExportRecord]) -> Result<BatchOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut outcome = BatchOutcome::default();

        for record in batch {
            if let ExportRecord::Trace(trace) = record {
                upsert_trace(&tx, trace)?;
                outcome.traces += 1;
            }
        }

        let spans: Vec<&SpanRecord> = batch
            .iter()
            .filter_map(|r| match r {
                ExportRecord::Span(s) => Some(s),
                ExportRecord::Trace(_) => None,
            })
            .collect();

        let mut verdicts = spans
            .iter()
            .map(|span| own_rejection(&tx, span))
            .collect::<Result<Vec<_>>>()?;

        // A rejected span takes its in-batch descendants with it
        loop {
            let accepted: HashMap<&str, &str> = spans
                .iter()
                .zip(&verdicts)
                .filter(|(_, verdict)| verdict.is_none())
                .map(|(span, _)| (span.id.as_str(), span.trace_id.as_str()))
                .collect();
            let rejected: HashSet<&str> = spans
                .iter()
                .zip(&verdicts)
                .filter(|(_, verdict)| verdict.is_some())
                .map(|(span, _)| span.id.as_str())
                .collect();

            let mut changed = false;
            for (span, verdict) in spans.iter().zip(verdicts.iter_mut()) {
                if verdict.is_some() {
                    continue;
                }
                if let Some(reason) = parent_rejection(&tx, span, &accepted, &rejected)? {
                    *verdict = Some(reason);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (span, verdict) in spans.iter().zip(verdicts) {
            if let Some(reason) = verdict {
                warn!("Dropping span {} of trace {}: {}", span.id, span.trace_id, reason);
                outcome.dropped += 1;
                continue;
            }

            if insert_span(&tx, span)? {
                outcome.spans += 1;
            } else {
                debug!("Span {} already stored, ignoring", span.id);
                outcome.duplicates += 1;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_trace(&self, id: &str) -> Result<Option<TraceRecord>> {
        let conn = self.lock()?;
        let trace = conn
            .query_row(
                "SELECT id, workflow_name, group_id FROM traces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TraceRecord {
                        id: row.get(0)?,
                        workflow_name: row.get(1)?,
                        group_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(trace)
    }

    /// All spans of a trace, oldest first.
    pub fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<StoredSpan>> {
        let conn = self.lock()?;
        query_spans(&conn, trace_id)
    }

    /// Traces of a conversation, ordered by their first span, each with its spans.
    pub fn traces_for_group(&self, group_id: &str) -> Result<Vec<TraceWithSpans>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.trace_id, MIN(s.started_at), MAX(s.ended_at)
            FROM spans s
            JOIN traces t ON t.id = s.trace_id
            WHERE t.group_id = ?1
            GROUP BY s.trace_id
            ORDER BY MIN(s.started_at) ASC
            "#,
        )?;

        let bounds = stmt
            .query_map(params![group_id], |row| {
                let trace_id: String = row.get(0)?;
                let started_at = timestamp_column(row, 1)?;
                let ended_at = timestamp_column(row, 2)?;
                Ok((trace_id, started_at, ended_at))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bounds
            .into_iter()
            .map(|(trace_id, started_at, ended_at)| {
                let spans = query_spans(&conn, &trace_id)?;
                Ok(TraceWithSpans {
                    trace_id,
                    started_at,
                    ended_at,
                    spans,
                })
            })
            .collect()
    }

    /// The conversations immediately before and after `group_id`, ordered by the
    /// start of each conversation's latest generation span.
    pub fn conversation_neighbors(&self, group_id: &str) -> Result<ConversationNeighbors> {
        let conn = self.lock()?;
        let neighbors = conn
            .query_row(
                r#"
                WITH latest AS (
                    SELECT t.group_id AS group_id, MAX(s.started_at) AS latest_time
                    FROM spans s
                    JOIN traces t ON t.id = s.trace_id
                    WHERE s.span_type = 'generation' AND t.group_id IS NOT NULL
                    GROUP BY t.group_id
                )
                SELECT
                    (SELECT group_id FROM latest
                     WHERE latest_time < cur.latest_time
                     ORDER BY latest_time DESC LIMIT 1),
                    (SELECT group_id FROM latest
                     WHERE latest_time > cur.latest_time
                     ORDER BY latest_time ASC LIMIT 1)
                FROM latest cur
                WHERE cur.group_id = ?1
                "#,
                params![group_id],
                |row| {
                    Ok(ConversationNeighbors {
                        previous: row.get(0)?,
                        next: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(neighbors.unwrap_or_default())
    }

    /// Number of stored spans (across all traces).
    pub fn span_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM spans", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert_trace(tx: &Transaction<'_>, trace: &TraceRecord) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO traces (id, workflow_name, group_id) VALUES (?1, ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET
            workflow_name = COALESCE(excluded.workflow_name, traces.workflow_name),
            group_id = COALESCE(excluded.group_id, traces.group_id)
        "#,
        params![trace.id, trace.workflow_name, trace.group_id],
    )?;
    Ok(())
}

/// Why a span cannot be stored on its own terms, if it cannot.
fn own_rejection(tx: &Transaction<'_>, span: &SpanRecord) -> Result<Option<String>> {
    if span.ended_at < span.started_at {
        return Ok(Some("ends before it starts".to_string()));
    }

    let trace_known = tx
        .query_row(
            "SELECT 1 FROM traces WHERE id = ?1",
            params![span.trace_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !trace_known {
        return Ok(Some("trace not found".to_string()));
    }
    Ok(None)
}

/// Why a span cannot be attached to its parent, if it cannot.
///
/// The parent is looked up among the accepted spans of the batch first, then in
/// storage. A parent unknown to both is tolerated.
fn parent_rejection(
    tx: &Transaction<'_>,
    span: &SpanRecord,
    accepted: &HashMap<&str, &str>,
    rejected: &HashSet<&str>,
) -> Result<Option<String>> {
    let Some(parent_id) = &span.parent_id else {
        return Ok(None);
    };

    let parent_trace = match accepted.get(parent_id.as_str()) {
        Some(trace_id) => Some(trace_id.to_string()),
        None if rejected.contains(parent_id.as_str()) => {
            return Ok(Some(format!("parent {} was dropped", parent_id)));
        }
        None => tx
            .query_row(
                "SELECT trace_id FROM spans WHERE id = ?1",
                params![parent_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?,
    };

    match parent_trace {
        Some(parent_trace) if parent_trace != span.trace_id => Ok(Some(format!(
            "parent {} belongs to trace {}",
            parent_id, parent_trace
        ))),
        _ => Ok(None),
    }
}

/// Insert a span; returns false if a span with the same id already exists.
fn insert_span(tx: &Transaction<'_>, span: &SpanRecord) -> Result<bool> {
    let span_data = serde_json::to_string(&span.span_data)?;
    let error = span.error.as_ref().map(serde_json::to_string).transpose()?;

    let changed = tx.execute(
        r#"
        INSERT OR IGNORE INTO spans
            (id, trace_id, parent_id, started_at, ended_at, span_type, span_data, error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            span.id,
            span.trace_id,
            span.parent_id,
            format_timestamp(&span.started_at),
            format_timestamp(&span.ended_at),
            span.span_type().as_str(),
            span_data,
            error,
        ],
    )?;
    Ok(changed > 0)
}

fn query_spans(conn: &Connection, trace_id: &str) -> Result<Vec<StoredSpan>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, trace_id, parent_id, started_at, ended_at, span_type, span_data, error
        FROM spans
        WHERE trace_id = ?1
        ORDER BY started_at ASC
        "#,
    )?;

    let spans = stmt
        .query_map(params![trace_id], |row| {
            Ok(StoredSpan {
                id: row.get(0)?,
                trace_id: row.get(1)?,
                parent_id: row.get(2)?,
                started_at: timestamp_column(row, 3)?,
                ended_at: timestamp_column(row, 4)?,
                span_type: row.get(5)?,
                span_data: json_column(row, 6)?.unwrap_or(Value::Null),
                error: json_column(row, 7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(spans)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
