//! Normalization of per-platform raw exports into canonical transactions

use crate::error::PipelineError;
use crate::types::Transaction;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// One raw record keyed by its platform-specific column names
pub type RawRow = HashMap<String, String>;

/// Candidate source columns for each canonical field, in priority order.
///
/// Matching against the input header is case-insensitive and the first
/// candidate present wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub customer_id: Vec<String>,
    pub email: Vec<String>,
    pub order_id: Vec<String>,
    pub timestamp: Vec<String>,
    pub amount: Vec<String>,
    pub product_line_id: Vec<String>,
    pub product_id: Vec<String>,
    pub brand: Vec<String>,
    pub category: Vec<String>,
    pub price: Vec<String>,
    pub rating: Vec<String>,
}

fn names(candidates: &[&str]) -> Vec<String> {
    candidates.iter().map(|name| name.to_string()).collect()
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            customer_id: names(&["customer_id", "buyer_id", "customer", "user_id"]),
            email: names(&["customer_email", "buyer_email", "email"]),
            order_id: names(&["order_id", "amazon_order_id", "order_number"]),
            timestamp: names(&[
                "timestamp",
                "purchase_date",
                "order_date",
                "payment_time",
                "date",
            ]),
            amount: names(&["amount", "lineitem_price", "item_price", "total", "sales"]),
            product_line_id: names(&["product_line_id", "product_line"]),
            product_id: names(&["product_id", "sku", "asin"]),
            brand: names(&["brand", "manufacturer"]),
            category: names(&["category", "product_category"]),
            price: names(&["price", "unit_price"]),
            rating: names(&["rating", "stars"]),
        }
    }
}

/// Source column chosen for each canonical field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedColumns {
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub order_id: Option<String>,
    pub timestamp: Option<String>,
    pub amount: Option<String>,
    pub product_line_id: Option<String>,
    pub product_id: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub rating: Option<String>,
}

impl ColumnMapping {
    /// Resolve the mapping against the set of columns present in the input
    pub fn resolve<'a, I>(&self, header: I) -> ResolvedColumns
    where
        I: IntoIterator<Item = &'a str>,
    {
        let header: Vec<&str> = header.into_iter().collect();
        let pick = |candidates: &[String]| -> Option<String> {
            candidates.iter().find_map(|candidate| {
                header
                    .iter()
                    .find(|column| column.trim().eq_ignore_ascii_case(candidate.trim()))
                    .map(|column| column.to_string())
            })
        };

        ResolvedColumns {
            customer_id: pick(&self.customer_id),
            email: pick(&self.email),
            order_id: pick(&self.order_id),
            timestamp: pick(&self.timestamp),
            amount: pick(&self.amount),
            product_line_id: pick(&self.product_line_id),
            product_id: pick(&self.product_id),
            brand: pick(&self.brand),
            category: pick(&self.category),
            price: pick(&self.price),
            rating: pick(&self.rating),
        }
    }
}

/// Normalize raw rows of one platform into canonical transactions.
///
/// The customer identifier falls back from the explicit id column to the
/// email column to an id synthesized from the order id, row by row. Rows with
/// no identifier, an unparsable date or a negative/unparsable amount are
/// skipped and counted.
///
/// # Errors
/// `PipelineError::Schema` when no identifying column exists at all, or the
/// date or amount column is missing. An export without rows is not a schema
/// error; it normalizes to no transactions.
pub fn normalize(
    raw_rows: &[RawRow],
    platform_id: &str,
    mapping: &ColumnMapping,
) -> Result<Vec<Transaction>, PipelineError> {
    if raw_rows.is_empty() {
        debug!(platform_id, "raw export has no rows");
        return Ok(Vec::new());
    }

    let header: BTreeSet<&str> = raw_rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let columns = mapping.resolve(header.iter().copied());

    if columns.customer_id.is_none() && columns.email.is_none() && columns.order_id.is_none() {
        return Err(PipelineError::schema(
            platform_id,
            "no customer id, email or order id column found",
        ));
    }
    let timestamp_column = columns
        .timestamp
        .as_deref()
        .ok_or_else(|| PipelineError::schema(platform_id, "no transaction date column found"))?;
    let amount_column = columns
        .amount
        .as_deref()
        .ok_or_else(|| PipelineError::schema(platform_id, "no amount column found"))?;

    debug!(platform_id, ?columns, "resolved raw column mapping");

    let mut transactions = Vec::with_capacity(raw_rows.len());
    let mut skipped = 0usize;

    for row in raw_rows {
        let Some(customer_id) = resolve_customer_id(row, &columns) else {
            skipped += 1;
            continue;
        };
        let Some(timestamp) = field(row, Some(timestamp_column)).and_then(parse_date) else {
            skipped += 1;
            continue;
        };
        let Some(amount) = field(row, Some(amount_column)).and_then(parse_amount) else {
            skipped += 1;
            continue;
        };

        transactions.push(Transaction {
            customer_id,
            platform_id: platform_id.to_string(),
            timestamp,
            amount,
            product_line_id: field(row, columns.product_line_id.as_deref()).map(str::to_string),
            product_id: field(row, columns.product_id.as_deref()).map(str::to_string),
            brand: field(row, columns.brand.as_deref()).map(str::to_string),
            category: field(row, columns.category.as_deref()).map(str::to_string),
            price: field(row, columns.price.as_deref()).and_then(parse_amount),
            rating: field(row, columns.rating.as_deref()).and_then(|v| v.parse().ok()),
        });
    }

    if skipped > 0 {
        warn!(
            platform_id,
            skipped,
            kept = transactions.len(),
            "skipped raw rows without usable identifier, date or amount"
        );
    }

    Ok(transactions)
}

/// Missing-value markers of raw exports: empty, `NA` or `NaN` in any case
pub fn is_missing(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("nan")
}

/// Trimmed value of a column unless it is missing
fn field<'a>(row: &'a RawRow, column: Option<&str>) -> Option<&'a str> {
    let value = row.get(column?)?.trim();
    (!is_missing(value)).then_some(value)
}

fn resolve_customer_id(row: &RawRow, columns: &ResolvedColumns) -> Option<String> {
    if let Some(id) = field(row, columns.customer_id.as_deref()) {
        return Some(id.to_string());
    }
    if let Some(email) = field(row, columns.email.as_deref()) {
        return Some(email.to_lowercase());
    }
    field(row, columns.order_id.as_deref()).map(|order| format!("order-{order}"))
}

/// Parse the date part of common export timestamp formats
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
    const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.date());
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

/// Parse a non-negative monetary value, tolerating currency symbols and
/// thousands separators. Rounded to cents.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | 'e' | 'E'))
        .collect();
    let amount: f64 = cleaned.parse().ok()?;
    (amount.is_finite() && amount >= 0.0).then(|| round_cents(amount))
}

/// Round a monetary figure to two decimals
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_export_normalizes_to_nothing() {
        let transactions = normalize(&[], "amz", &ColumnMapping::default()).unwrap();
        assert!(transactions.is_empty());
    }

    #[test]
    fn test_missing_markers() {
        for value in ["", "  ", "NA", "na", "NaN", " nan "] {
            assert!(is_missing(value), "{value:?}");
        }
        for value in ["0", "N/A brand", "nano", "banana"] {
            assert!(!is_missing(value), "{value:?}");
        }
    }

    #[test]
    fn test_nan_rating_is_dropped() {
        let rows = vec![row(&[
            ("customer_id", "C1"),
            ("purchase_date", "2024-01-05"),
            ("amount", "10"),
            ("rating", "NaN"),
        ])];
        let transactions = normalize(&rows, "amz", &ColumnMapping::default()).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].rating, None);
    }

    #[test]
    fn test_customer_id_fallback_chain() {
        let rows = vec![
            row(&[
                ("customer_id", "C1"),
                ("buyer_email", "x@example.com"),
                ("order_id", "O1"),
                ("purchase_date", "2024-01-05"),
                ("amount", "10"),
            ]),
            row(&[
                ("customer_id", ""),
                ("buyer_email", "Someone@Example.com"),
                ("order_id", "O2"),
                ("purchase_date", "2024-01-06"),
                ("amount", "20"),
            ]),
            row(&[
                ("customer_id", ""),
                ("buyer_email", ""),
                ("order_id", "O3"),
                ("purchase_date", "2024-01-07"),
                ("amount", "30"),
            ]),
        ];

        let transactions = normalize(&rows, "amz", &ColumnMapping::default()).unwrap();
        let ids: Vec<&str> = transactions.iter().map(|t| t.customer_id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "someone@example.com", "order-O3"]);
        assert!(transactions.iter().all(|t| t.platform_id == "amz"));
    }

    #[test]
    fn test_email_only_export() {
        let rows = vec![row(&[
            ("Buyer_Email", "a@b.com"),
            ("Payment_Time", "2024-02-01 10:15:00"),
            ("Lineitem_Price", "$1,299.50"),
        ])];

        let transactions = normalize(&rows, "shop", &ColumnMapping::default()).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].customer_id, "a@b.com");
        assert_eq!(transactions[0].amount, 1299.5);
        assert_eq!(
            transactions[0].timestamp,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
    }

    #[test]
    fn test_schema_error_without_identifier_columns() {
        let rows = vec![row(&[("purchase_date", "2024-01-05"), ("amount", "10")])];
        let err = normalize(&rows, "amz", &ColumnMapping::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn test_schema_error_without_amount_column() {
        let rows = vec![row(&[("customer_id", "C1"), ("purchase_date", "2024-01-05")])];
        let err = normalize(&rows, "amz", &ColumnMapping::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn test_unusable_rows_are_skipped() {
        let rows = vec![
            row(&[("customer_id", "C1"), ("date", "not a date"), ("amount", "10")]),
            row(&[("customer_id", "C1"), ("date", "2024-01-05"), ("amount", "-5")]),
            row(&[("customer_id", ""), ("date", "2024-01-05"), ("amount", "5")]),
            row(&[("customer_id", "C2"), ("date", "2024/01/05"), ("amount", "5.005")]),
        ];

        let transactions = normalize(&rows, "amz", &ColumnMapping::default()).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].customer_id, "C2");
    }

    #[test]
    fn test_custom_mapping() {
        let mapping = ColumnMapping {
            customer_id: vec!["member_no".to_string()],
            ..ColumnMapping::default()
        };
        let rows = vec![row(&[
            ("member_no", "M-7"),
            ("order_date", "2024-03-01T08:00:00Z"),
            ("total", "42"),
            ("product_line", "tea"),
            ("sku", "T1"),
        ])];

        let transactions = normalize(&rows, "pos", &mapping).unwrap();
        assert_eq!(transactions[0].customer_id, "M-7");
        assert_eq!(transactions[0].product_line_id.as_deref(), Some("tea"));
        assert_eq!(transactions[0].product_id.as_deref(), Some("T1"));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,000.456"), Some(1000.46));
        assert_eq!(parse_amount("-1"), None);
        assert_eq!(parse_amount("abc"), None);
    }
}
