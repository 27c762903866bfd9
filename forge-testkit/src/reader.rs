use std::sync::Arc;

use async_trait::async_trait;
use forge::*;
use parking_lot::Mutex;
use serde_json::json;

/// A valid row carrying only its sku and a title.
pub fn row(sku: &str) -> RowRecord {
    let mut data = RowData::new();
    data.insert("sku".into(), json!(sku));
    data.insert("title".into(), json!(format!("Poster {}", sku)));
    RowRecord::new(sku, data)
}

/// Rows for every sku, in order.
pub fn rows(skus: &[&str]) -> Vec<RowRecord> {
    skus.iter().map(|sku| row(sku)).collect()
}

/// Owned grid from string slices, header first.
pub fn grid(cells: &[&[&str]]) -> Vec<Vec<String>> {
    cells
        .iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

#[derive(Clone, Debug)]
enum Source {
    Rows(ReadOutcome),
    Missing,
    Unavailable(String),
}

/// Row reader that answers every trigger with the same rows.
#[derive(Clone)]
pub struct StaticRowReader {
    source: Arc<Mutex<Source>>,
    reads: Arc<Mutex<Vec<TriggerEvent>>>,
}

impl StaticRowReader {
    pub fn new(outcome: ReadOutcome) -> Self {
        Self {
            source: Arc::new(Mutex::new(Source::Rows(outcome))),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_rows(
        spreadsheet_id: &str,
        skus: &[&str],
        invalid_rows_count: usize,
    ) -> Self {
        Self::new(ReadOutcome {
            valid_rows: rows(skus),
            invalid_rows_count,
            spreadsheet_id: spreadsheet_id.to_string(),
        })
    }

    /// Rows normalized and validated from a raw grid.
    pub fn from_grid(spreadsheet_id: &str, values: &[Vec<String>]) -> Self {
        Self::new(forge::rows::read_grid(
            values,
            &forge::rows::RequiredFieldsValidator::default(),
            spreadsheet_id,
        ))
    }

    /// Every read fails with [`ReadError::NotFound`].
    pub fn missing() -> Self {
        let reader = Self::new(ReadOutcome::default());
        *reader.source.lock() = Source::Missing;
        reader
    }

    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *self.source.lock() = Source::Unavailable(reason.into());
    }

    pub fn set_rows(&self, outcome: ReadOutcome) {
        *self.source.lock() = Source::Rows(outcome);
    }

    pub fn reads(&self) -> Vec<TriggerEvent> {
        self.reads.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }
}

#[async_trait]
impl RowReader for StaticRowReader {
    async fn read_rows(&self, trigger: &TriggerEvent) -> Result<ReadOutcome, ReadError> {
        self.reads.lock().push(trigger.clone());

        match self.source.lock().clone() {
            Source::Rows(outcome) => Ok(outcome),
            Source::Missing => Err(ReadError::NotFound {
                resource_id: trigger.resource_id.clone(),
            }),
            Source::Unavailable(reason) => Err(ReadError::Unavailable(reason)),
        }
    }
}
