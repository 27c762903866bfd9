//! Normalization of raw sheet grids into validated row records.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::ReadOutcome;
use crate::job::{RowData, RowRecord};

const IS_ACTIVE: &str = "is_active";
const SKU: &str = "sku";

/// Convert a grid whose first row is the header into one map per data row.
///
/// Header cells are trimmed. Rows shorter than the header are padded with
/// nulls, extra cells are ignored and rows without any non-empty cell are
/// skipped.
pub fn grid_to_records(values: &[Vec<String>]) -> Vec<RowData> {
    let Some((header, data_rows)) = values.split_first() else {
        return Vec::new();
    };
    let header: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();

    data_rows
        .iter()
        .filter(|row| row.iter().any(|cell| !cell.is_empty()))
        .map(|row| {
            header
                .iter()
                .enumerate()
                .map(|(idx, key)| {
                    let value = row
                        .get(idx)
                        .map(|cell| Value::String(cell.clone()))
                        .unwrap_or(Value::Null);
                    (key.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Sheets deliver booleans as text; `is_active` becomes true only for a
/// case-insensitive `"TRUE"`.
pub fn coerce_is_active(row: &mut RowData) {
    if let Some(value) = row.get_mut(IS_ACTIVE) {
        let active = match value {
            Value::Bool(b) => *b,
            Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        };
        *value = Value::Bool(active);
    }
}

/// Decides whether a normalized row may become a render job.
pub trait RowValidator: Send + Sync {
    /// Returns the rejection reason for an invalid row.
    fn validate(&self, row: &RowData) -> Result<(), String>;
}

/// Requires a set of fields to be present as non-empty strings.
#[derive(Clone, Debug)]
pub struct RequiredFieldsValidator {
    fields: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !fields.iter().any(|f| f == SKU) {
            fields.insert(0, SKU.to_string());
        }
        Self { fields }
    }
}

impl Default for RequiredFieldsValidator {
    fn default() -> Self {
        Self {
            fields: vec![SKU.to_string()],
        }
    }
}

impl RowValidator for RequiredFieldsValidator {
    fn validate(&self, row: &RowData) -> Result<(), String> {
        for field in &self.fields {
            match row.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) | Some(Value::Null) | None => {
                    return Err(format!("missing required field '{field}'"));
                }
                Some(_) => {
                    return Err(format!("field '{field}' must be a string"));
                }
            }
        }
        Ok(())
    }
}

/// Coerce and validate records into a [`ReadOutcome`].
pub fn partition_rows(
    records: Vec<RowData>,
    validator: &dyn RowValidator,
    spreadsheet_id: impl Into<String>,
) -> ReadOutcome {
    let mut valid_rows = Vec::new();
    let mut invalid_rows_count = 0;

    for mut row in records {
        coerce_is_active(&mut row);
        match validator.validate(&row) {
            Ok(()) => {
                let sku = row
                    .get(SKU)
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                debug!(sku = %sku, "row passed validation");
                valid_rows.push(RowRecord::new(sku, row));
            }
            Err(reason) => {
                warn!(reason = %reason, "row failed validation");
                invalid_rows_count += 1;
            }
        }
    }

    info!(
        valid = valid_rows.len(),
        invalid = invalid_rows_count,
        "row validation complete"
    );

    ReadOutcome {
        valid_rows,
        invalid_rows_count,
        spreadsheet_id: spreadsheet_id.into(),
    }
}

/// Normalize and validate a raw grid in one step.
pub fn read_grid(
    values: &[Vec<String>],
    validator: &dyn RowValidator,
    spreadsheet_id: impl Into<String>,
) -> ReadOutcome {
    partition_rows(grid_to_records(values), validator, spreadsheet_id)
}
