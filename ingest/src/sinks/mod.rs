use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::IngestError;
use crate::event::{AnalyticsRow, DebugRow, FormRow};

pub mod kafka;
pub mod print;

/// The three independent write lanes. A failure in one lane never blocks
/// the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Analytics,
    Debug,
    Forms,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analytics => "analytics",
            Self::Debug => "debug",
            Self::Forms => "forms",
        }
    }
}

/// One per-category sub-batch of normalized, scrubbed rows, ready for the
/// analytical store.
#[derive(Clone, Debug)]
pub enum CategoryRows {
    Analytics(Vec<AnalyticsRow>),
    Debug(Vec<DebugRow>),
    Forms(Vec<FormRow>),
}

impl CategoryRows {
    pub fn category(&self) -> Category {
        match self {
            Self::Analytics(_) => Category::Analytics,
            Self::Debug(_) => Category::Debug,
            Self::Forms(_) => Category::Forms,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Analytics(rows) => rows.len(),
            Self::Debug(rows) => rows.len(),
            Self::Forms(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized (partition key, row) pairs. Rows from one session share a
    /// key so the store receives them on one partition.
    pub fn payloads(&self) -> Result<Vec<(String, String)>, IngestError> {
        fn serialize<T: serde::Serialize>(
            rows: &[T],
            key: impl Fn(&T) -> String,
        ) -> Result<Vec<(String, String)>, IngestError> {
            rows.iter()
                .map(|row| {
                    let payload = serde_json::to_string(row).map_err(|e| {
                        tracing::error!("failed to serialize row: {}", e);
                        IngestError::NonRetryableSinkError
                    })?;
                    Ok((key(row), payload))
                })
                .collect()
        }

        match self {
            Self::Analytics(rows) => {
                serialize(rows, |r| format!("{}:{}", r.site_id, r.session_id))
            }
            Self::Debug(rows) => serialize(rows, |r| format!("{}:{}", r.site_id, r.session_id)),
            Self::Forms(rows) => serialize(rows, |r| format!("{}:{}", r.site_id, r.session_id)),
        }
    }
}

/// Store append boundary. Implementations serialize concurrent appends
/// internally; callers only sequence the per-category writes of one
/// request.
#[async_trait]
pub trait RowSink {
    async fn append(&self, rows: CategoryRows) -> Result<(), IngestError>;
}

/// Test sink capturing everything in memory, optionally failing whole
/// categories to exercise partial-failure isolation.
#[derive(Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<(Category, String)>>>,
    failing: Arc<Mutex<HashSet<Category>>>,
}

impl MemorySink {
    pub fn fail_on(self, category: Category) -> Self {
        self.failing.lock().unwrap().insert(category);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, category: Category) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == category)
            .count()
    }

    pub fn payloads(&self, category: Category) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn append(&self, rows: CategoryRows) -> Result<(), IngestError> {
        let category = rows.category();
        if self.failing.lock().unwrap().contains(&category) {
            return Err(IngestError::RetryableSinkError);
        }
        let mut stored = self.rows.lock().unwrap();
        for (_key, payload) in rows.payloads()? {
            stored.push((category, payload));
        }
        Ok(())
    }
}
