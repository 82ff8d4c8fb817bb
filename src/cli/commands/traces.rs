//! Traces command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::traces::{SqliteTraceStore, StoredSpan};
use anyhow::Result;

/// Run the traces command.
pub fn run_traces(
    trace_id: Option<&str>,
    group: Option<&str>,
    neighbors: bool,
    settings: Settings,
) -> Result<()> {
    let path = settings.traces_path();
    if !path.exists() {
        Output::info(&format!("No trace database at {:?} yet.", path));
        return Ok(());
    }
    let store = SqliteTraceStore::new(&path)?;

    match (trace_id, group) {
        (Some(trace_id), _) => {
            let spans = store.spans_for_trace(trace_id)?;
            if spans.is_empty() {
                Output::warning(&format!("No spans recorded for trace {}", trace_id));
                return Ok(());
            }
            Output::header(&format!("Trace {} ({} spans)", trace_id, spans.len()));
            println!();
            print_spans(&spans);
        }
        (None, Some(group_id)) => {
            let traces = store.traces_for_group(group_id)?;
            if traces.is_empty() {
                Output::warning(&format!("No traces recorded for conversation {}", group_id));
            }
            for trace in &traces {
                Output::header(&format!(
                    "Trace {} ({})",
                    trace.trace_id,
                    Output::format_elapsed(trace.ended_at - trace.started_at)
                ));
                Output::kv("Started", &trace.started_at.to_rfc3339());
                print_spans(&trace.spans);
            }

            if neighbors {
                let adjacent = store.conversation_neighbors(group_id)?;
                println!();
                Output::kv("Previous", adjacent.previous.as_deref().unwrap_or("-"));
                Output::kv("Next", adjacent.next.as_deref().unwrap_or("-"));
            }
        }
        (None, None) => {
            Output::warning("Pass a trace id or --group <conversation>.");
        }
    }

    Ok(())
}

fn print_spans(spans: &[StoredSpan]) {
    for span in spans {
        let name = span
            .span_data
            .get("name")
            .or_else(|| span.span_data.get("model"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let elapsed = Output::format_elapsed(span.ended_at - span.started_at);
        let failed = span.error.is_some();
        Output::span_info(&span.span_type, name, &elapsed, failed);
    }
}
