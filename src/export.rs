//! Export assembly: the editable row table and its spreadsheet artifact.
//!
//! [`ExpenseTable`] owns every row of a run in file → page → item order. It
//! is a plain in-memory collection meant to be edited (insert, delete, modify)
//! before [`ExpenseTable::to_xlsx`] serialises it; edits are reflected in the
//! artifact as-is. No totals or other aggregates are added.

use crate::error::ExportError;
use crate::output::OutputRow;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// MIME type of an `.xlsx` workbook.
pub const XLSX_MIME_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Fixed download name of the artifact.
pub const XLSX_FILENAME: &str = "expenses.xlsx";

/// Name of the single data sheet.
pub const SHEET_NAME: &str = "Expenses";

// ── Columns ──────────────────────────────────────────────────────────────

/// One spreadsheet column, mapped to an [`OutputRow`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Date,
    Merchant,
    Category,
    Description,
    Quantity,
    Amount,
    Currency,
    SourceFile,
}

impl Column {
    pub fn header(&self) -> &'static str {
        match self {
            Column::Date => "Date",
            Column::Merchant => "Merchant",
            Column::Category => "Category",
            Column::Description => "Description",
            Column::Quantity => "Quantity",
            Column::Amount => "Amount",
            Column::Currency => "Currency",
            Column::SourceFile => "Source file",
        }
    }

    /// Display width in characters.
    pub fn width(&self) -> f64 {
        match self {
            Column::Date => 12.0,
            Column::Merchant => 28.0,
            Column::Category => 18.0,
            Column::Description => 40.0,
            Column::Quantity => 10.0,
            Column::Amount => 12.0,
            Column::Currency => 10.0,
            Column::SourceFile => 30.0,
        }
    }
}

/// Ordered set of exported columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSet {
    columns: Vec<Column>,
}

impl ColumnSet {
    /// The fixed column order, with or without Category.
    pub fn new(include_category: bool) -> Self {
        let columns = [
            Column::Date,
            Column::Merchant,
            Column::Category,
            Column::Description,
            Column::Quantity,
            Column::Amount,
            Column::Currency,
            Column::SourceFile,
        ]
        .into_iter()
        .filter(|c| include_category || *c != Column::Category)
        .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn headers(&self) -> Vec<&'static str> {
        self.columns.iter().map(Column::header).collect()
    }

    pub fn contains(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self::new(true)
    }
}

// ── Table ────────────────────────────────────────────────────────────────

/// The rows of one run, editable before export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpenseTable {
    rows: Vec<OutputRow>,
}

impl ExpenseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: OutputRow) {
        self.rows.push(row);
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = OutputRow>) {
        self.rows.extend(rows);
    }

    /// Insert at `index`, shifting later rows down.
    ///
    /// # Panics
    /// If `index > len`.
    pub fn insert(&mut self, index: usize, row: OutputRow) {
        self.rows.insert(index, row);
    }

    /// Remove and return the row at `index`, or `None` when out of range.
    pub fn remove(&mut self, index: usize) -> Option<OutputRow> {
        (index < self.rows.len()).then(|| self.rows.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&OutputRow> {
        self.rows.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut OutputRow> {
        self.rows.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutputRow> {
        self.rows.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, OutputRow> {
        self.rows.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn retain(&mut self, keep: impl FnMut(&OutputRow) -> bool) {
        self.rows.retain(keep);
    }

    pub fn rows(&self) -> &[OutputRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<OutputRow> {
        self.rows
    }

    /// Pretty-printed JSON array of rows, for editing outside the program.
    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(&self.rows)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ExportError> {
        Ok(Self {
            rows: serde_json::from_str(json)?,
        })
    }

    /// Serialise the table into a one-sheet `.xlsx` workbook.
    ///
    /// Text cells are written as strings, Quantity and Amount as numbers.
    /// Missing optional values leave the cell blank.
    pub fn to_xlsx(&self, columns: &ColumnSet) -> Result<SpreadsheetArtifact, ExportError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(SHEET_NAME)?;

        let header_format = Format::new().set_bold();
        for (col, column) in columns.columns().iter().enumerate() {
            let col = col as u16;
            sheet.write_string_with_format(0, col, column.header(), &header_format)?;
            sheet.set_column_width(col, column.width())?;
        }
        sheet.set_freeze_panes(1, 0)?;

        for (idx, row) in self.rows.iter().enumerate() {
            write_row(sheet, idx as u32 + 1, row, columns)?;
        }

        let bytes = workbook.save_to_buffer()?;
        debug!(
            "Built workbook: {} rows, {} columns, {} bytes",
            self.rows.len(),
            columns.columns().len(),
            bytes.len()
        );

        Ok(SpreadsheetArtifact {
            filename: XLSX_FILENAME.to_string(),
            mime_type: XLSX_MIME_TYPE.to_string(),
            bytes,
        })
    }
}

fn write_row(
    sheet: &mut Worksheet,
    row_idx: u32,
    row: &OutputRow,
    columns: &ColumnSet,
) -> Result<(), ExportError> {
    for (col, column) in columns.columns().iter().enumerate() {
        let col = col as u16;
        let text = match column {
            Column::Quantity => {
                sheet.write_number(row_idx, col, row.quantity)?;
                continue;
            }
            Column::Amount => {
                sheet.write_number(row_idx, col, row.amount)?;
                continue;
            }
            Column::Date => row.date.as_deref(),
            Column::Merchant => row.merchant.as_deref(),
            Column::Category => row.category.as_deref(),
            Column::Description => Some(row.description.as_str()),
            Column::Currency => row.currency.as_deref(),
            Column::SourceFile => Some(row.source_file.as_str()),
        };
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            sheet.write_string(row_idx, col, text)?;
        }
    }
    Ok(())
}

impl From<Vec<OutputRow>> for ExpenseTable {
    fn from(rows: Vec<OutputRow>) -> Self {
        Self { rows }
    }
}

impl FromIterator<OutputRow> for ExpenseTable {
    fn from_iter<I: IntoIterator<Item = OutputRow>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ExpenseTable {
    type Item = OutputRow;
    type IntoIter = std::vec::IntoIter<OutputRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ExpenseTable {
    type Item = &'a OutputRow;
    type IntoIter = std::slice::Iter<'a, OutputRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

// ── Artifact ─────────────────────────────────────────────────────────────

/// A finished spreadsheet, ready to be downloaded or written to disk.
#[derive(Debug, Clone)]
pub struct SpreadsheetArtifact {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SpreadsheetArtifact {
    /// Write the workbook to `path` atomically (temp file in the same
    /// directory, then rename), creating parent directories as needed.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ExportError> {
        write_atomic(path.as_ref(), &self.bytes)
    }
}

/// Write `bytes` to `path` via a sibling temp file so readers never see a
/// partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let failed = |source: std::io::Error| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(failed)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(failed)?;
    tmp.write_all(bytes).map_err(failed)?;
    tmp.persist(path).map_err(|e| failed(e.error))?;

    info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
