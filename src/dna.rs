//! Customer DNA computation: RFM metrics and derived indices as of a date

use crate::config::{DnaConfig, MonetaryMode, PipelineConfig};
use crate::error::PipelineError;
use crate::normalize::round_cents;
use crate::segment::{assign_rfm_labels, classify_nes, median, NesThresholds};
use crate::types::{CustomerDna, Transaction};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Raw per-customer RFM metrics before cross-customer indices
#[derive(Debug, Clone, PartialEq)]
pub struct RfmMetrics {
    pub platform_id: String,
    pub customer_id: String,
    pub recency: i64,
    pub frequency: i64,
    pub monetary: f64,
    pub total_spend: f64,
    pub ipt_mean: Option<f64>,
}

/// Compute customer DNA records for every customer with at least one
/// transaction in the observation window ending at `as_of`.
///
/// Output is sorted by platform and customer id and depends only on the
/// inputs, so repeated runs over the same data are identical.
pub fn compute_dna(
    transactions: &[Transaction],
    as_of: NaiveDate,
    config: &PipelineConfig,
) -> Result<Vec<CustomerDna>, PipelineError> {
    let metrics = compute_rfm(transactions, as_of, &config.dna)?;

    let mut by_platform: BTreeMap<&str, Vec<&RfmMetrics>> = BTreeMap::new();
    for m in &metrics {
        by_platform.entry(m.platform_id.as_str()).or_default().push(m);
    }

    let mut records = Vec::with_capacity(metrics.len());
    for (platform_id, customers) in by_platform {
        let mut frequencies: Vec<i64> = customers.iter().map(|m| m.frequency).collect();
        frequencies.sort_unstable();
        let ipts: Vec<f64> = customers.iter().filter_map(|m| m.ipt_mean).collect();
        let median_ipt = median(&ipts);
        let thresholds = NesThresholds::from_config(&config.segmentation.nes, median_ipt);

        debug!(
            platform_id,
            customers = customers.len(),
            median_ipt,
            e0t = thresholds.e0t,
            "computing customer DNA"
        );

        for m in customers {
            let frequency_percentile = frequencies.partition_point(|&f| f <= m.frequency) as f64
                / frequencies.len() as f64;
            let cai = activity_index(m.recency, frequency_percentile, config.dna.cai_decay_rate);
            let expected_ipt = m
                .ipt_mean
                .or(median_ipt)
                .unwrap_or(config.dna.default_ipt_days);
            let cri = retention_index(m.recency, expected_ipt);
            let pcv = round_cents(m.total_spend);
            let clv = lifetime_value(pcv, cri, config.dna.clv_discount_rate);

            records.push(CustomerDna {
                customer_id: m.customer_id.clone(),
                platform_id: m.platform_id.clone(),
                r_value: m.recency,
                f_value: m.frequency,
                m_value: m.monetary,
                r_label: String::new(),
                f_label: String::new(),
                m_label: String::new(),
                ipt_mean: m.ipt_mean,
                cai,
                pcv,
                clv,
                cri,
                nes_status: classify_nes(m.recency, m.frequency, &thresholds),
                nt: thresholds.nt,
                e0t: thresholds.e0t,
            });
        }
    }

    assign_rfm_labels(&mut records, &config.segmentation);
    Ok(records)
}

fn day_number(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce())
}

/// Per-customer recency, frequency, monetary value and mean inter-purchase
/// time, sorted by platform and customer id.
///
/// Aggregation runs as a lazy polars `group_by` over platform and customer.
pub fn compute_rfm(
    transactions: &[Transaction],
    as_of: NaiveDate,
    config: &DnaConfig,
) -> Result<Vec<RfmMetrics>, PipelineError> {
    let as_of_day = day_number(as_of);
    let frame = df!(
        "platform_id" => transactions.iter().map(|t| t.platform_id.as_str()).collect::<Vec<_>>(),
        "customer_id" => transactions.iter().map(|t| t.customer_id.as_str()).collect::<Vec<_>>(),
        "day" => transactions.iter().map(|t| day_number(t.timestamp)).collect::<Vec<i64>>(),
        "amount" => transactions.iter().map(|t| t.amount).collect::<Vec<f64>>()
    )?;

    let mut in_window = col("day").lt_eq(lit(as_of_day));
    if let Some(days) = config.window_days {
        in_window = in_window.and(col("day").gt_eq(lit(as_of_day - days)));
    }

    // The mean gap between sorted purchase dates telescopes to
    // (last - first) / (frequency - 1)
    let rfm = frame
        .lazy()
        .filter(in_window)
        .group_by([col("platform_id"), col("customer_id")])
        .agg([
            col("day").max().alias("last_day"),
            col("day").min().alias("first_day"),
            len().cast(DataType::Int64).alias("frequency"),
            col("amount").sum().alias("total_spend"),
            col("amount").mean().alias("mean_spend"),
        ])
        .collect()?;

    let platforms = rfm.column("platform_id")?.as_materialized_series().str()?;
    let customers = rfm.column("customer_id")?.as_materialized_series().str()?;
    let last_days = rfm.column("last_day")?.as_materialized_series().i64()?;
    let first_days = rfm.column("first_day")?.as_materialized_series().i64()?;
    let frequencies = rfm.column("frequency")?.as_materialized_series().i64()?;
    let totals = rfm.column("total_spend")?.as_materialized_series().f64()?;
    let means = rfm.column("mean_spend")?.as_materialized_series().f64()?;

    let mut metrics = Vec::with_capacity(rfm.height());
    for i in 0..rfm.height() {
        let (
            Some(platform_id),
            Some(customer_id),
            Some(last),
            Some(first),
            Some(frequency),
            Some(total_spend),
            Some(mean_spend),
        ) = (
            platforms.get(i),
            customers.get(i),
            last_days.get(i),
            first_days.get(i),
            frequencies.get(i),
            totals.get(i),
            means.get(i),
        )
        else {
            continue;
        };

        let monetary = match config.monetary {
            MonetaryMode::Mean => mean_spend,
            MonetaryMode::Sum => total_spend,
        };
        metrics.push(RfmMetrics {
            platform_id: platform_id.to_string(),
            customer_id: customer_id.to_string(),
            recency: as_of_day - last,
            frequency,
            monetary: round_cents(monetary),
            total_spend,
            ipt_mean: (frequency > 1).then(|| (last - first) as f64 / (frequency - 1) as f64),
        });
    }
    metrics.sort_by(|a, b| (&a.platform_id, &a.customer_id).cmp(&(&b.platform_id, &b.customer_id)));

    let kept: BTreeSet<(&str, &str)> = metrics
        .iter()
        .map(|m| (m.platform_id.as_str(), m.customer_id.as_str()))
        .collect();
    let excluded: BTreeSet<(&str, &str)> = transactions
        .iter()
        .map(|t| (t.platform_id.as_str(), t.customer_id.as_str()))
        .filter(|key| !kept.contains(key))
        .collect();
    for (platform_id, customer_id) in excluded {
        debug!(
            platform_id,
            customer_id,
            %as_of,
            "customer has no transactions in the observation window, excluded"
        );
    }

    Ok(metrics)
}

/// Activity index in [0, 1]: exponential decay on recency scaled by the
/// customer's frequency percentile.
pub fn activity_index(recency: i64, frequency_percentile: f64, decay_rate: f64) -> f64 {
    ((-decay_rate * recency as f64).exp() * frequency_percentile).clamp(0.0, 1.0)
}

/// Retention index in (0, 1]: chance-like decay of recency measured in
/// purchase cycles.
pub fn retention_index(recency: i64, expected_ipt: f64) -> f64 {
    (-(recency as f64) / expected_ipt.max(1.0)).exp()
}

/// Past value times the retention multiplier `cri / (1 + d - cri)`
pub fn lifetime_value(pcv: f64, cri: f64, discount_rate: f64) -> f64 {
    let multiplier = cri / (1.0 + discount_rate - cri);
    round_cents((pcv * multiplier).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tx(customer: &str, d: NaiveDate, amount: f64) -> Transaction {
        Transaction::new(customer, "amz", d, amount)
    }

    #[test]
    fn test_two_purchase_scenario() {
        let transactions = vec![
            tx("1", date(2024, 1, 1), 100.0),
            tx("1", date(2024, 3, 1), 150.0),
        ];

        let dna = compute_dna(&transactions, date(2024, 4, 1), &PipelineConfig::default()).unwrap();

        assert_eq!(dna.len(), 1);
        let customer = &dna[0];
        assert_eq!(customer.f_value, 2);
        assert_eq!(customer.r_value, 31);
        assert_eq!(customer.m_value, 125.0);
        // 2024 is a leap year: 31 days of January plus 29 of February
        assert_eq!(customer.ipt_mean, Some(60.0));
        assert_eq!(customer.pcv, 250.0);
    }

    #[test]
    fn test_single_purchase_has_no_ipt() {
        let transactions = vec![tx("solo", date(2024, 3, 20), 80.0)];

        let dna = compute_dna(&transactions, date(2024, 4, 1), &PipelineConfig::default()).unwrap();

        assert_eq!(dna[0].ipt_mean, None);
        assert!(dna[0].cai.is_finite());
        assert!((0.0..=1.0).contains(&dna[0].cai));
        assert!(dna[0].cri > 0.0 && dna[0].cri <= 1.0);
    }

    #[test]
    fn test_ipt_from_unordered_purchases() {
        let transactions = vec![
            tx("1", date(2024, 1, 31), 10.0),
            tx("1", date(2024, 1, 1), 10.0),
            tx("1", date(2024, 1, 11), 10.0),
        ];

        let metrics = compute_rfm(&transactions, date(2024, 2, 10), &DnaConfig::default()).unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].frequency, 3);
        assert_eq!(metrics[0].recency, 10);
        assert_eq!(metrics[0].ipt_mean, Some(15.0));
        assert_eq!(metrics[0].total_spend, 30.0);
    }

    #[test]
    fn test_empty_input_yields_no_records() {
        let dna = compute_dna(&[], date(2024, 4, 1), &PipelineConfig::default()).unwrap();
        assert!(dna.is_empty());
    }

    #[test]
    fn test_sum_monetary_mode() {
        let mut config = PipelineConfig::default();
        config.dna.monetary = MonetaryMode::Sum;
        let transactions = vec![
            tx("1", date(2024, 1, 1), 100.0),
            tx("1", date(2024, 3, 1), 150.0),
        ];

        let dna = compute_dna(&transactions, date(2024, 4, 1), &config).unwrap();
        assert_eq!(dna[0].m_value, 250.0);
    }

    #[test]
    fn test_window_excludes_customers_without_recent_purchases() {
        let mut config = PipelineConfig::default();
        config.dna.window_days = Some(30);
        let transactions = vec![
            tx("old", date(2023, 1, 1), 10.0),
            tx("recent", date(2024, 3, 20), 10.0),
            tx("future", date(2024, 5, 1), 10.0),
        ];

        let dna = compute_dna(&transactions, date(2024, 4, 1), &config).unwrap();

        assert_eq!(dna.len(), 1);
        assert_eq!(dna[0].customer_id, "recent");
    }

    #[test]
    fn test_cai_monotonicity() {
        assert!(activity_index(10, 0.5, 0.01) > activity_index(20, 0.5, 0.01));
        assert!(activity_index(10, 0.8, 0.01) > activity_index(10, 0.5, 0.01));
        assert_eq!(activity_index(0, 1.0, 0.01), 1.0);
    }

    #[test]
    fn test_clv_non_negative() {
        assert_eq!(lifetime_value(0.0, 0.5, 0.1), 0.0);
        assert!(lifetime_value(100.0, 1.0, 0.1) > 100.0);
        assert!(lifetime_value(100.0, 1e-9, 0.1) >= 0.0);
    }

    #[test]
    fn test_invariants_and_idempotence() {
        let transactions: Vec<Transaction> = (0..40)
            .map(|i| {
                tx(
                    &format!("c{}", i % 7),
                    date(2024, 1, 1) + chrono::Duration::days(i * 3),
                    10.0 + i as f64,
                )
            })
            .collect();
        let config = PipelineConfig::default();

        let first = compute_dna(&transactions, date(2024, 6, 1), &config).unwrap();
        let second = compute_dna(&transactions, date(2024, 6, 1), &config).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 7);
        for dna in &first {
            assert!(dna.f_value >= 1);
            assert!(dna.r_value >= 0);
            assert!(dna.m_value >= 0.0);
            assert!(dna.clv >= 0.0);
            assert!(!dna.r_label.is_empty());
        }
    }

    #[test]
    fn test_platforms_are_computed_separately() {
        let transactions = vec![
            Transaction::new("1", "amz", date(2024, 3, 1), 10.0),
            Transaction::new("1", "shop", date(2024, 3, 15), 20.0),
        ];

        let dna = compute_dna(&transactions, date(2024, 4, 1), &PipelineConfig::default()).unwrap();

        assert_eq!(dna.len(), 2);
        assert_eq!(dna[0].platform_id, "amz");
        assert_eq!(dna[1].platform_id, "shop");
        assert_eq!(dna[1].r_value, 17);
    }
}
