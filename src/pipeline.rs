//! Batch orchestration over a transaction source

use crate::config::PipelineConfig;
use crate::dna::compute_dna;
use crate::error::PipelineError;
use crate::observations::build_observations;
use crate::poisson::analyze_all;
use crate::source::{TransactionQuery, TransactionSource};
use crate::types::{CustomerDna, PoissonFeatureResult, ProductAttributes, Transaction};
use chrono::{Duration, NaiveDate};
use tracing::info;

fn dna_query(as_of: NaiveDate, config: &PipelineConfig) -> TransactionQuery {
    TransactionQuery {
        from: config.dna.window_days.map(|days| as_of - Duration::days(days)),
        to: Some(as_of),
        product_line_id: None,
    }
}

/// Customer DNA of one platform as of `as_of`.
///
/// # Errors
/// `PipelineError::EmptyInput` when the platform has no transaction in the
/// observation window.
pub fn run_dna(
    source: &dyn TransactionSource,
    platform_id: &str,
    as_of: NaiveDate,
    config: &PipelineConfig,
) -> Result<Vec<CustomerDna>, PipelineError> {
    let transactions = source.query(platform_id, &dna_query(as_of, config));
    if transactions.is_empty() {
        return Err(PipelineError::EmptyInput(format!(
            "platform {platform_id} has no transactions up to {as_of}"
        )));
    }

    let records = compute_dna(&transactions, as_of, config)?;
    info!(
        platform_id,
        %as_of,
        transactions = transactions.len(),
        customers = records.len(),
        "customer DNA computed"
    );
    Ok(records)
}

/// Customer DNA of every platform of the source. Platforms without data in
/// the window are skipped; the run fails only when none has any.
pub fn run_dna_all(
    source: &dyn TransactionSource,
    as_of: NaiveDate,
    config: &PipelineConfig,
) -> Result<Vec<CustomerDna>, PipelineError> {
    let query = dna_query(as_of, config);
    let transactions: Vec<Transaction> = source
        .platforms()
        .iter()
        .flat_map(|platform_id| source.query(platform_id, &query))
        .collect();
    if transactions.is_empty() {
        return Err(PipelineError::EmptyInput(format!(
            "no transactions up to {as_of} on any platform"
        )));
    }

    let records = compute_dna(&transactions, as_of, config)?;
    info!(%as_of, customers = records.len(), "customer DNA computed for all platforms");
    Ok(records)
}

/// Poisson feature effects for every platform × product line of the source.
///
/// # Errors
/// `PipelineError::EmptyInput` when no transaction carries a product.
pub fn run_feature_analysis(
    source: &dyn TransactionSource,
    products: &[ProductAttributes],
    config: &PipelineConfig,
) -> Result<Vec<PoissonFeatureResult>, PipelineError> {
    let transactions: Vec<Transaction> = source
        .platforms()
        .iter()
        .flat_map(|platform_id| source.get_transactions(platform_id))
        .collect();

    let observations = build_observations(&transactions, products, &config.poisson)?;
    if observations.is_empty() {
        return Err(PipelineError::EmptyInput(
            "no product sales to analyze".to_string(),
        ));
    }

    Ok(analyze_all(&observations, &config.poisson))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TransactionStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_run_dna_respects_as_of() {
        let store = TransactionStore::from_transactions(vec![
            Transaction::new("1", "amz", date(2024, 1, 1), 100.0),
            Transaction::new("1", "amz", date(2024, 3, 1), 150.0),
            Transaction::new("1", "amz", date(2024, 5, 1), 999.0),
        ]);

        let dna = run_dna(&store, "amz", date(2024, 4, 1), &PipelineConfig::default()).unwrap();

        assert_eq!(dna.len(), 1);
        assert_eq!(dna[0].f_value, 2);
        assert_eq!(dna[0].pcv, 250.0);
    }

    #[test]
    fn test_empty_platform_is_an_error() {
        let store = TransactionStore::new();
        let err = run_dna(&store, "amz", date(2024, 4, 1), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput(_)));

        let err = run_dna_all(&store, date(2024, 4, 1), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput(_)));
    }

    #[test]
    fn test_run_dna_all_covers_platforms() {
        let store = TransactionStore::from_transactions(vec![
            Transaction::new("1", "amz", date(2024, 3, 1), 10.0),
            Transaction::new("2", "shop", date(2024, 3, 2), 20.0),
        ]);

        let dna = run_dna_all(&store, date(2024, 4, 1), &PipelineConfig::default()).unwrap();
        assert_eq!(dna.len(), 2);
    }

    #[test]
    fn test_feature_analysis_without_products_is_empty_input() {
        let store = TransactionStore::from_transactions(vec![Transaction::new(
            "1",
            "amz",
            date(2024, 3, 1),
            10.0,
        )]);

        let err = run_feature_analysis(&store, &[], &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput(_)));
    }
}
