//! Spreadsheet export of aggregated records
//!
//! One sheet named `Data`: a header row with the union of top-level keys in
//! first-seen order, then one row per record. Records that are not JSON
//! objects land in a trailing `value` column.

use std::collections::HashSet;

use rust_xlsxwriter::{ColNum, RowNum, Workbook, Worksheet, XlsxError};
use serde_json::Value;
use tracing::warn;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const EXPORT_FILENAME: &str = "export.xlsx";
pub const SHEET_NAME: &str = "Data";
const VALUE_COLUMN: &str = "value";
/// Longest string an xlsx cell can hold, in characters
pub const MAX_CELL_CHARS: usize = 32_767;

/// Typed cell content for one JSON value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl From<&Value> for Cell {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Empty,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map(Cell::Number)
                .unwrap_or_else(|| Cell::Text(n.to_string())),
            Value::String(s) => Cell::Text(s.clone()),
            nested @ (Value::Array(_) | Value::Object(_)) => Cell::Text(nested.to_string()),
        }
    }
}

/// Header row for a set of records
pub fn columns(records: &[Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    let mut has_scalars = false;

    for record in records {
        match record {
            Value::Object(fields) => {
                for key in fields.keys() {
                    if seen.insert(key.as_str()) {
                        columns.push(key.clone());
                    }
                }
            }
            _ => has_scalars = true,
        }
    }

    if has_scalars && !seen.contains(VALUE_COLUMN) {
        columns.push(VALUE_COLUMN.to_string());
    }
    columns
}

/// Encode records as an xlsx workbook
pub fn encode_xlsx(records: &[Value]) -> Result<Vec<u8>, XlsxError> {
    let header = columns(records);
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, name) in header.iter().enumerate() {
        worksheet.write_string(0, col_num(col), name.as_str())?;
    }

    for (idx, record) in records.iter().enumerate() {
        let row = row_num(idx + 1);
        for (col, name) in header.iter().enumerate() {
            let value = match record {
                Value::Object(fields) => fields.get(name),
                scalar if name == VALUE_COLUMN => Some(scalar),
                _ => None,
            };
            if let Some(value) = value {
                write_cell(worksheet, row, col_num(col), Cell::from(value))?;
            }
        }
    }

    workbook.save_to_buffer()
}

fn write_cell(sheet: &mut Worksheet, row: RowNum, col: ColNum, cell: Cell) -> Result<(), XlsxError> {
    match cell {
        Cell::Empty => {}
        Cell::Text(mut text) => {
            if truncate_cell_text(&mut text) {
                warn!(row, col, "Cell text truncated to {} characters", MAX_CELL_CHARS);
            }
            sheet.write_string(row, col, text.as_str())?;
        }
        Cell::Number(n) => {
            sheet.write_number(row, col, n)?;
        }
        Cell::Bool(b) => {
            sheet.write_boolean(row, col, b)?;
        }
    }
    Ok(())
}

/// Cut `text` to the cell limit; returns whether anything was removed
fn truncate_cell_text(text: &mut String) -> bool {
    match text.char_indices().nth(MAX_CELL_CHARS) {
        Some((end, _)) => {
            text.truncate(end);
            true
        }
        None => false,
    }
}

// Out-of-range indices saturate and are rejected by the writer.
fn row_num(idx: usize) -> RowNum {
    RowNum::try_from(idx).unwrap_or(RowNum::MAX)
}

fn col_num(idx: usize) -> ColNum {
    ColNum::try_from(idx).unwrap_or(ColNum::MAX)
}
