//! Row flattening: one [`ExtractionRecord`] → one or more [`OutputRow`]s.
//!
//! The record's shared metadata (date, merchant, category, currency) is copied
//! onto every row. A record without items still contributes exactly one
//! placeholder row, so a receipt that only shows a total is not lost.

use crate::config::DEFAULT_PLACEHOLDER_LABEL;
use crate::error::ExtractionError;
use crate::output::{Diagnostic, ExtractionRecord, OutputRow};

/// Flattening policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenOptions {
    /// Description of the synthetic row for records without items.
    pub placeholder_label: String,
    /// Drop rows whose amount is not strictly positive.
    pub paid_items_only: bool,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            placeholder_label: DEFAULT_PLACEHOLDER_LABEL.to_string(),
            paid_items_only: false,
        }
    }
}

/// Expand a record into rows attributed to `filename`, in item order.
pub fn flatten(
    record: &ExtractionRecord,
    filename: &str,
    options: &FlattenOptions,
) -> Vec<OutputRow> {
    let row = |description: &str, quantity: f64, amount: f64| OutputRow {
        date: record.date.clone(),
        merchant: record.merchant.clone(),
        category: record.category.clone(),
        description: description.to_string(),
        quantity,
        amount,
        currency: record.currency.clone(),
        source_file: filename.to_string(),
    };

    let rows: Vec<OutputRow> = if record.items.is_empty() {
        vec![row(&options.placeholder_label, 1.0, 0.0)]
    } else {
        record
            .items
            .iter()
            .map(|item| row(&item.description, item.quantity, item.price))
            .collect()
    };

    if options.paid_items_only {
        rows.into_iter().filter(|r| r.amount > 0.0).collect()
    } else {
        rows
    }
}

/// Flatten a page result.
///
/// A failed page yields no rows; its error is pushed onto `diagnostics`
/// attributed to `filename` and `page`.
pub fn flatten_result(
    result: Result<ExtractionRecord, ExtractionError>,
    filename: &str,
    page: usize,
    options: &FlattenOptions,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<OutputRow> {
    match result {
        Ok(record) => flatten(&record, filename, options),
        Err(error) => {
            diagnostics.push(Diagnostic::page(filename, page, error));
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::LineItem;

    fn record(items: Vec<LineItem>) -> ExtractionRecord {
        ExtractionRecord {
            date: Some("2024-05-02".into()),
            merchant: Some("Monoprix".into()),
            currency: Some("€".into()),
            category: Some("Groceries".into()),
            items,
        }
    }

    #[test]
    fn one_row_per_item_with_shared_metadata() {
        let rec = record(vec![
            LineItem::new("Milk", 2.0, 2.2),
            LineItem::new("Eggs", 1.0, 3.1),
        ]);
        let rows = flatten(&rec, "ticket.jpg", &FlattenOptions::default());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].description, "Milk");
        assert_eq!(rows[1].description, "Eggs");
        for row in &rows {
            assert_eq!(row.date.as_deref(), Some("2024-05-02"));
            assert_eq!(row.merchant.as_deref(), Some("Monoprix"));
            assert_eq!(row.category.as_deref(), Some("Groceries"));
            assert_eq!(row.currency.as_deref(), Some("€"));
            assert_eq!(row.source_file, "ticket.jpg");
        }
        assert_eq!(rows[0].quantity, 2.0);
        assert_eq!(rows[0].amount, 2.2);
    }

    #[test]
    fn empty_items_yield_single_placeholder() {
        let rows = flatten(&record(vec![]), "a.png", &FlattenOptions::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, DEFAULT_PLACEHOLDER_LABEL);
        assert_eq!(rows[0].quantity, 1.0);
        assert_eq!(rows[0].amount, 0.0);
        assert_eq!(rows[0].merchant.as_deref(), Some("Monoprix"));
    }

    #[test]
    fn placeholder_label_is_configurable() {
        let opts = FlattenOptions {
            placeholder_label: "Dépense globale".into(),
            ..Default::default()
        };
        let rows = flatten(&ExtractionRecord::default(), "a.png", &opts);
        assert_eq!(rows[0].description, "Dépense globale");
        assert_eq!(rows[0].merchant, None);
    }

    #[test]
    fn paid_items_only_drops_non_positive_amounts() {
        let rec = record(vec![
            LineItem::new("Coffee", 1.0, 2.5),
            LineItem::new("Free refill", 1.0, 0.0),
            LineItem::new("Voucher", 1.0, -1.0),
        ]);
        let opts = FlattenOptions {
            paid_items_only: true,
            ..Default::default()
        };
        let rows = flatten(&rec, "a.png", &opts);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "Coffee");
    }

    #[test]
    fn paid_items_only_also_drops_placeholder() {
        let opts = FlattenOptions {
            paid_items_only: true,
            ..Default::default()
        };
        assert!(flatten(&record(vec![]), "a.png", &opts).is_empty());
    }

    #[test]
    fn error_yields_no_rows_and_a_diagnostic() {
        let mut diagnostics = Vec::new();
        let rows = flatten_result(
            Err(ExtractionError::Parse {
                detail: "expected value".into(),
            }),
            "scan.pdf",
            2,
            &FlattenOptions::default(),
            &mut diagnostics,
        );
        assert!(rows.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].filename, "scan.pdf");
        assert_eq!(diagnostics[0].page, Some(2));
    }

    #[test]
    fn success_adds_no_diagnostic() {
        let mut diagnostics = Vec::new();
        let rows = flatten_result(
            Ok(record(vec![LineItem::new("Tea", 1.0, 1.8)])),
            "a.png",
            1,
            &FlattenOptions::default(),
            &mut diagnostics,
        );
        assert_eq!(rows.len(), 1);
        assert!(diagnostics.is_empty());
    }
}
