//! CSV loading and table persistence using Polars

use crate::comment_rating::CommentRating;
use crate::normalize::{is_missing, RawRow};
use crate::types::{
    AttributeValue, CustomerDna, NesTransition, PoissonFeatureResult, ProductAttributes,
};
use anyhow::Context;
use polars::prelude::*;
use std::path::Path;
use std::str::FromStr;
use tempfile::NamedTempFile;

/// Columns of the product attribute table with a dedicated field
const PRODUCT_COLUMNS: [&str; 6] = [
    "product_id",
    "product_line_id",
    "price",
    "brand",
    "category",
    "rating",
];

/// Read a CSV file with every column as text
fn read_string_frame(path: &Path) -> crate::Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .with_context(|| format!("Failed to open {}", path.display()))?
        .finish()
        .with_context(|| format!("Failed to parse CSV {}", path.display()))
}

/// Rows of a text frame keyed by column name; nulls become empty strings
fn frame_rows(df: &DataFrame) -> crate::Result<Vec<RawRow>> {
    let columns = df
        .get_columns()
        .iter()
        .map(|column| Ok((column.name().to_string(), column.as_materialized_series().str()?)))
        .collect::<PolarsResult<Vec<_>>>()?;

    Ok((0..df.height())
        .map(|i| {
            columns
                .iter()
                .map(|(name, values)| (name.clone(), values.get(i).unwrap_or("").to_string()))
                .collect()
        })
        .collect())
}

fn optional<'a>(row: &'a RawRow, column: &str) -> Option<&'a str> {
    row.get(column)
        .map(|value| value.trim())
        .filter(|value| !is_missing(value))
}

fn required<'a>(row: &'a RawRow, column: &str) -> crate::Result<&'a str> {
    optional(row, column).with_context(|| format!("Missing value in column '{column}'"))
}

fn parse_field<T>(row: &RawRow, column: &str) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = required(row, column)?;
    value
        .parse()
        .map_err(|err| anyhow::anyhow!("Invalid value '{value}' in column '{column}': {err}"))
}

fn parse_optional<T>(row: &RawRow, column: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional(row, column)
        .map(|value| {
            value
                .parse()
                .map_err(|err| anyhow::anyhow!("Invalid value '{value}' in column '{column}': {err}"))
        })
        .transpose()
}

/// Load a raw transaction export; every cell is kept as text for the
/// normalizer to interpret.
pub fn load_raw_rows<P: AsRef<Path>>(path: P) -> crate::Result<Vec<RawRow>> {
    let df = read_string_frame(path.as_ref())?;
    frame_rows(&df)
}

/// Parse every row of a CSV file, naming the failing row in errors
fn parse_rows<T>(path: &Path, parse: impl Fn(&RawRow) -> crate::Result<T>) -> crate::Result<Vec<T>> {
    let rows = frame_rows(&read_string_frame(path)?)?;
    rows.iter()
        .enumerate()
        .map(|(i, row)| parse(row).with_context(|| format!("{} row {}", path.display(), i + 1)))
        .collect()
}

fn product_from_row(row: &RawRow) -> crate::Result<ProductAttributes> {
    let extra = row
        .iter()
        .filter(|(name, _)| !PRODUCT_COLUMNS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            let value = value.trim();
            if is_missing(value) {
                return None;
            }
            let attribute = value
                .parse::<f64>()
                .map(AttributeValue::Number)
                .unwrap_or_else(|_| AttributeValue::Text(value.to_string()));
            Some((name.clone(), attribute))
        })
        .collect();

    Ok(ProductAttributes {
        product_id: required(row, "product_id")?.to_string(),
        product_line_id: required(row, "product_line_id")?.to_string(),
        price: parse_optional(row, "price")?,
        brand: optional(row, "brand").map(str::to_string),
        category: optional(row, "category").map(str::to_string),
        rating: parse_optional(row, "rating")?,
        extra,
    })
}

/// Load the product attribute table.
///
/// `product_id` and `product_line_id` are required. Columns beyond the
/// dedicated ones become extra attributes, numeric when they parse as numbers.
pub fn load_product_attributes<P: AsRef<Path>>(path: P) -> crate::Result<Vec<ProductAttributes>> {
    parse_rows(path.as_ref(), product_from_row)
}

/// Load rater responses with columns `product_id`, `property`, `response`
pub fn load_comment_ratings<P: AsRef<Path>>(path: P) -> crate::Result<Vec<CommentRating>> {
    parse_rows(path.as_ref(), |row| {
        Ok(CommentRating {
            product_id: required(row, "product_id")?.to_string(),
            property: required(row, "property")?.to_string(),
            response: row.get("response").cloned().unwrap_or_default(),
        })
    })
}

fn dna_from_row(row: &RawRow) -> crate::Result<CustomerDna> {
    Ok(CustomerDna {
        customer_id: required(row, "customer_id")?.to_string(),
        platform_id: required(row, "platform_id")?.to_string(),
        r_value: parse_field(row, "r_value")?,
        f_value: parse_field(row, "f_value")?,
        m_value: parse_field(row, "m_value")?,
        r_label: optional(row, "r_label").unwrap_or_default().to_string(),
        f_label: optional(row, "f_label").unwrap_or_default().to_string(),
        m_label: optional(row, "m_label").unwrap_or_default().to_string(),
        ipt_mean: parse_optional(row, "ipt_mean")?,
        cai: parse_field(row, "cai")?,
        pcv: parse_field(row, "pcv")?,
        clv: parse_field(row, "clv")?,
        cri: parse_field(row, "cri")?,
        nes_status: parse_field(row, "nes_status")?,
        nt: parse_field(row, "nt")?,
        e0t: parse_field(row, "e0t")?,
    })
}

/// Load a DNA table written by [`write_dna_table`]
pub fn load_dna_table<P: AsRef<Path>>(path: P) -> crate::Result<DnaTable> {
    parse_rows(path.as_ref(), dna_from_row).map(DnaTable::new)
}

fn feature_from_row(row: &RawRow) -> crate::Result<PoissonFeatureResult> {
    Ok(PoissonFeatureResult {
        platform_id: required(row, "platform_id")?.to_string(),
        product_line_id: required(row, "product_line_id")?.to_string(),
        predictor: required(row, "predictor")?.to_string(),
        predictor_type: parse_field(row, "predictor_type")?,
        coefficient: parse_optional(row, "coefficient")?,
        std_error: parse_optional(row, "std_error")?,
        p_value: parse_optional(row, "p_value")?,
        conf_low: parse_optional(row, "conf_low")?,
        conf_high: parse_optional(row, "conf_high")?,
        incidence_rate_ratio: parse_optional(row, "incidence_rate_ratio")?,
        aic: parse_optional(row, "aic")?,
        sample_size: parse_field(row, "sample_size")?,
        convergence: parse_field(row, "convergence")?,
    })
}

/// Load a feature table written by [`write_feature_table`]
pub fn load_feature_table<P: AsRef<Path>>(path: P) -> crate::Result<FeatureTable> {
    parse_rows(path.as_ref(), feature_from_row).map(FeatureTable::new)
}

/// Write a frame to a temp file next to `path`, then move it over `path` so
/// readers never see a partial table
fn write_frame_atomic(df: &mut DataFrame, path: &Path) -> crate::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn strings<T>(rows: &[T], f: impl Fn(&T) -> String) -> Vec<String> {
    rows.iter().map(f).collect()
}

/// Persist a DNA table, replacing any previous run at `path`
pub fn write_dna_table<P: AsRef<Path>>(records: &[CustomerDna], path: P) -> crate::Result<()> {
    let mut df = df!(
        "customer_id" => strings(records, |r| r.customer_id.clone()),
        "platform_id" => strings(records, |r| r.platform_id.clone()),
        "r_value" => records.iter().map(|r| r.r_value).collect::<Vec<i64>>(),
        "f_value" => records.iter().map(|r| r.f_value).collect::<Vec<i64>>(),
        "m_value" => records.iter().map(|r| r.m_value).collect::<Vec<f64>>(),
        "r_label" => strings(records, |r| r.r_label.clone()),
        "f_label" => strings(records, |r| r.f_label.clone()),
        "m_label" => strings(records, |r| r.m_label.clone()),
        "ipt_mean" => records.iter().map(|r| r.ipt_mean).collect::<Vec<Option<f64>>>(),
        "cai" => records.iter().map(|r| r.cai).collect::<Vec<f64>>(),
        "pcv" => records.iter().map(|r| r.pcv).collect::<Vec<f64>>(),
        "clv" => records.iter().map(|r| r.clv).collect::<Vec<f64>>(),
        "cri" => records.iter().map(|r| r.cri).collect::<Vec<f64>>(),
        "nes_status" => strings(records, |r| r.nes_status.to_string()),
        "nt" => records.iter().map(|r| r.nt).collect::<Vec<f64>>(),
        "e0t" => records.iter().map(|r| r.e0t).collect::<Vec<f64>>()
    )?;
    write_frame_atomic(&mut df, path.as_ref())
}

/// Persist Poisson feature results, one row per group and predictor
pub fn write_feature_table<P: AsRef<Path>>(
    results: &[PoissonFeatureResult],
    path: P,
) -> crate::Result<()> {
    let estimates = |f: fn(&PoissonFeatureResult) -> Option<f64>| {
        results.iter().map(f).collect::<Vec<Option<f64>>>()
    };
    let mut df = df!(
        "platform_id" => strings(results, |r| r.platform_id.clone()),
        "product_line_id" => strings(results, |r| r.product_line_id.clone()),
        "predictor" => strings(results, |r| r.predictor.clone()),
        "predictor_type" => strings(results, |r| r.predictor_type.to_string()),
        "coefficient" => estimates(|r| r.coefficient),
        "std_error" => estimates(|r| r.std_error),
        "p_value" => estimates(|r| r.p_value),
        "conf_low" => estimates(|r| r.conf_low),
        "conf_high" => estimates(|r| r.conf_high),
        "incidence_rate_ratio" => estimates(|r| r.incidence_rate_ratio),
        "aic" => estimates(|r| r.aic),
        "sample_size" => results.iter().map(|r| r.sample_size as u64).collect::<Vec<u64>>(),
        "convergence" => strings(results, |r| r.convergence.to_string())
    )?;
    write_frame_atomic(&mut df, path.as_ref())
}

/// Persist NES transitions between two DNA runs
pub fn write_transitions<P: AsRef<Path>>(transitions: &[NesTransition], path: P) -> crate::Result<()> {
    let mut df = df!(
        "platform_id" => strings(transitions, |t| t.platform_id.clone()),
        "customer_id" => strings(transitions, |t| t.customer_id.clone()),
        "nesstatus_pre" => strings(transitions, |t| t.nesstatus_pre.to_string()),
        "nesstatus_now" => strings(transitions, |t| t.nesstatus_now.to_string()),
        "activation_rate" => transitions.iter().map(|t| t.activation_rate).collect::<Vec<f64>>()
    )?;
    write_frame_atomic(&mut df, path.as_ref())
}

/// Persisted customer DNA records with lookup helpers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnaTable {
    records: Vec<CustomerDna>,
}

impl DnaTable {
    pub fn new(records: Vec<CustomerDna>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[CustomerDna] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CustomerDna> {
        self.records
    }

    pub fn for_platform(&self, platform_id: &str) -> Vec<&CustomerDna> {
        self.records
            .iter()
            .filter(|r| r.platform_id == platform_id)
            .collect()
    }

    pub fn for_customer(&self, platform_id: &str, customer_id: &str) -> Option<&CustomerDna> {
        self.records
            .iter()
            .find(|r| r.platform_id == platform_id && r.customer_id == customer_id)
    }
}

/// Persisted Poisson feature results with lookup helpers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    results: Vec<PoissonFeatureResult>,
}

impl FeatureTable {
    pub fn new(results: Vec<PoissonFeatureResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[PoissonFeatureResult] {
        &self.results
    }

    pub fn for_product_line(&self, platform_id: &str, product_line_id: &str) -> Vec<&PoissonFeatureResult> {
        self.results
            .iter()
            .filter(|r| r.platform_id == platform_id && r.product_line_id == product_line_id)
            .collect()
    }

    /// Rows whose group converged, the only ones with estimates
    pub fn converged(&self) -> Vec<&PoissonFeatureResult> {
        self.results
            .iter()
            .filter(|r| r.convergence.is_converged())
            .collect()
    }
}
