use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::instrument;

use crate::api::{BatchResult, IngestError};
use crate::event::{
    normalize_analytics, normalize_debug, normalize_form, AnalyticsRow, DebugRow, FormRow,
    RowContext, MAX_ANALYTICS_EVENTS, MAX_DEBUG_EVENTS, MAX_FORM_EVENTS,
};
use crate::sinks::{Category, CategoryRows, RowSink};

/// Normalized, scrubbed per-category sub-batches plus the count of events
/// skipped during validation.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub analytics: Vec<AnalyticsRow>,
    pub debug: Vec<DebugRow>,
    pub forms: Vec<FormRow>,
    pub errors: u64,
}

/// Applies the per-category fan-out cap. Excess events are dropped, not
/// errored: a tracker that buffered too long still gets most of its batch
/// through.
fn cap_events(events: Vec<Value>, cap: usize, category: Category) -> Vec<Value> {
    if events.len() > cap {
        let dropped = (events.len() - cap) as u64;
        counter!("ingest_events_truncated_total", "category" => category.as_str())
            .increment(dropped);
        tracing::warn!(
            category = category.as_str(),
            dropped = dropped,
            "batch over category cap, truncating"
        );
    }
    events.into_iter().take(cap).collect()
}

/// Validates and normalizes a mixed batch. One malformed event skips that
/// event only; the field name lands in the error count and a debug log,
/// never in the response body.
// The `debug` parameter is named `debug_events` because `tracing`'s macros
// shadow `debug` with `tracing::field::debug` inside field expressions.
#[instrument(skip_all, fields(analytics = analytics.len(), debug = debug_events.len(), forms = forms.len()))]
pub fn normalize_batch(
    analytics: Vec<Value>,
    debug_events: Vec<Value>,
    forms: Vec<Value>,
    ctx: &RowContext,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    for event in cap_events(analytics, MAX_ANALYTICS_EVENTS, Category::Analytics) {
        match normalize_analytics(event, ctx) {
            Ok(row) => batch.analytics.push(row),
            Err(err) => batch.skip(Category::Analytics, &err),
        }
    }

    for event in cap_events(debug_events, MAX_DEBUG_EVENTS, Category::Debug) {
        match normalize_debug(event, ctx) {
            Ok(row) => batch.debug.push(row),
            Err(err) => batch.skip(Category::Debug, &err),
        }
    }

    for event in cap_events(forms, MAX_FORM_EVENTS, Category::Forms) {
        match normalize_form(event, ctx) {
            Ok(Some(row)) => batch.forms.push(row),
            // Sensitive field: dropped silently, not an error
            Ok(None) => {
                counter!("ingest_events_dropped_total", "cause" => "sensitive_field")
                    .increment(1);
            }
            Err(err) => batch.skip(Category::Forms, &err),
        }
    }

    batch
}

impl NormalizedBatch {
    fn skip(&mut self, category: Category, err: &IngestError) {
        self.errors += 1;
        counter!("ingest_events_dropped_total", "cause" => err.to_metric_tag()).increment(1);
        tracing::debug!(
            category = category.as_str(),
            "skipping invalid event: {}",
            err
        );
    }

    pub fn is_empty(&self) -> bool {
        self.analytics.is_empty() && self.debug.is_empty() && self.forms.is_empty()
    }
}

/// Issues one store append per non-empty category. Appends are isolated:
/// a failed category is counted and logged, the rest still land, and the
/// HTTP response stays 200. The tracker is a fire-and-forget beacon and
/// cannot retry a partial batch anyway.
#[instrument(skip_all)]
pub async fn write_batch(
    sink: Arc<dyn RowSink + Send + Sync>,
    batch: NormalizedBatch,
) -> BatchResult {
    let mut result = BatchResult {
        errors: batch.errors,
        ..Default::default()
    };

    let sub_batches = [
        CategoryRows::Analytics(batch.analytics),
        CategoryRows::Debug(batch.debug),
        CategoryRows::Forms(batch.forms),
    ];

    for rows in sub_batches {
        if rows.is_empty() {
            continue;
        }
        let category = rows.category();
        let count = rows.len() as u64;

        match sink.append(rows).await {
            Ok(()) => {
                counter!("ingest_events_written_total", "category" => category.as_str())
                    .increment(count);
                match category {
                    Category::Analytics => result.analytics = count,
                    Category::Debug => result.debug = count,
                    Category::Forms => result.forms = count,
                }
            }
            Err(err) => {
                result.errors += count;
                counter!("ingest_events_dropped_total", "cause" => err.to_metric_tag())
                    .increment(count);
                tracing::warn!(
                    category = category.as_str(),
                    rows = count,
                    "category write failed: {}",
                    err
                );
            }
        }
    }

    result
}
