use async_trait::async_trait;
use metrics::{counter, histogram};

use crate::api::IngestError;
use crate::sinks::{CategoryRows, RowSink};

/// Local development sink: logs rows instead of writing them anywhere.
pub struct PrintSink {}

#[async_trait]
impl RowSink for PrintSink {
    async fn append(&self, rows: CategoryRows) -> Result<(), IngestError> {
        let category = rows.category().as_str();
        histogram!("ingest_row_batch_size", "category" => category).record(rows.len() as f64);
        counter!("ingest_rows_written_total", "category" => category)
            .increment(rows.len() as u64);

        for (key, payload) in rows.payloads()? {
            tracing::info!(key = key, category = category, "row: {}", payload);
        }

        Ok(())
    }
}
