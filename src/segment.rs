//! Segmentation of RFM values into labeled buckets and NES lifecycle status
//!
//! Every boundary is inclusive towards the better bucket: a value sitting
//! exactly on an edge is classified as the more engaged / more valuable one.

use crate::config::{Binning, NesConfig, SegmentationConfig};
use crate::types::{CustomerDna, NesStatus, NesTransition};
use std::collections::{BTreeMap, HashMap};

/// Which end of a metric's range is the best bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

/// Quantile of already sorted values, linear interpolation between order
/// statistics (Hyndman-Fan type 7).
pub fn quantile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// Median of unsorted values
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile(&sorted, 0.5)
}

/// Four ascending edges splitting `values` into five buckets
pub fn bucket_edges(values: &[f64], binning: &Binning) -> Option<[f64; 4]> {
    match binning {
        Binning::Fixed { edges } => Some(*edges),
        Binning::Quantile => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            Some([
                quantile(&sorted, 0.2)?,
                quantile(&sorted, 0.4)?,
                quantile(&sorted, 0.6)?,
                quantile(&sorted, 0.8)?,
            ])
        }
    }
}

/// Bucket of a value, 0 being the best
pub fn bucket_index(value: f64, edges: &[f64; 4], direction: Direction) -> usize {
    match direction {
        Direction::LowerIsBetter => edges.iter().filter(|&&edge| value > edge).count(),
        Direction::HigherIsBetter => edges.iter().filter(|&&edge| value < edge).count(),
    }
}

/// Bucket of each value by mid-rank, so tied values share one bucket placed
/// by the share of values below and at them
pub fn rank_buckets(values: &[f64], direction: Direction) -> Vec<usize> {
    let n = values.len() as f64;
    values
        .iter()
        .map(|&value| {
            let below = values.iter().filter(|&&v| v < value).count() as f64;
            let tied = values.iter().filter(|&&v| v == value).count() as f64;
            let position = (below + tied / 2.0) / n;
            let from_bottom = ((position * 5.0).floor() as usize).min(4);
            match direction {
                Direction::LowerIsBetter => from_bottom,
                Direction::HigherIsBetter => 4 - from_bottom,
            }
        })
        .collect()
}

/// Buckets of a platform's values of one metric. Quantile edges that
/// coincide (heavy ties) fall back to [`rank_buckets`].
fn metric_buckets(values: &[f64], binning: &Binning, direction: Direction) -> Option<Vec<usize>> {
    let edges = bucket_edges(values, binning)?;
    let collapsed = edges.windows(2).any(|pair| pair[0] >= pair[1]);
    if collapsed && matches!(binning, Binning::Quantile) {
        return Some(rank_buckets(values, direction));
    }
    Some(
        values
            .iter()
            .map(|&value| bucket_index(value, &edges, direction))
            .collect(),
    )
}

/// Fill `r_label`, `f_label` and `m_label`, binning each platform separately
pub fn assign_rfm_labels(records: &mut [CustomerDna], config: &SegmentationConfig) {
    let mut by_platform: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        by_platform
            .entry(record.platform_id.clone())
            .or_default()
            .push(idx);
    }

    for indices in by_platform.values() {
        let recency: Vec<f64> = indices.iter().map(|&i| records[i].r_value as f64).collect();
        let frequency: Vec<f64> = indices.iter().map(|&i| records[i].f_value as f64).collect();
        let monetary: Vec<f64> = indices.iter().map(|&i| records[i].m_value).collect();

        let r_buckets = metric_buckets(&recency, &config.recency, Direction::LowerIsBetter);
        let f_buckets = metric_buckets(&frequency, &config.frequency, Direction::HigherIsBetter);
        let m_buckets = metric_buckets(&monetary, &config.monetary, Direction::HigherIsBetter);

        for (pos, &i) in indices.iter().enumerate() {
            let record = &mut records[i];
            if let Some(buckets) = &r_buckets {
                record.r_label = config.labels.recency[buckets[pos]].clone();
            }
            if let Some(buckets) = &f_buckets {
                record.f_label = config.labels.frequency[buckets[pos]].clone();
            }
            if let Some(buckets) = &m_buckets {
                record.m_label = config.labels.monetary[buckets[pos]].clone();
            }
        }
    }
}

/// Recency thresholds separating the NES states
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NesThresholds {
    /// Single-purchase customers with recency below this are new
    pub nt: f64,
    /// Upper recency bound of the engaged state
    pub e0t: f64,
    /// Upper recency bound of S1
    pub s1: f64,
    /// Upper recency bound of S2
    pub s2: f64,
}

impl NesThresholds {
    /// Thresholds for one run. With `derive_e0t_from_ipt`, e0t follows the
    /// run's median inter-purchase time when one exists.
    pub fn from_config(config: &NesConfig, median_ipt: Option<f64>) -> Self {
        let e0t = match median_ipt {
            Some(ipt) if config.derive_e0t_from_ipt => ipt * config.e0t_ipt_factor,
            _ => config.e0t_days,
        };
        Self {
            nt: config.nt_days.min(e0t),
            e0t,
            s1: e0t * config.s1_multiplier,
            s2: e0t * config.s2_multiplier,
        }
    }
}

/// NES status of a customer from current recency and frequency alone
pub fn classify_nes(recency: i64, frequency: i64, thresholds: &NesThresholds) -> NesStatus {
    let recency = recency as f64;
    if frequency <= 1 && recency < thresholds.nt {
        NesStatus::N
    } else if recency <= thresholds.e0t {
        NesStatus::E0
    } else if recency <= thresholds.s1 {
        NesStatus::S1
    } else if recency <= thresholds.s2 {
        NesStatus::S2
    } else {
        NesStatus::S3
    }
}

/// Diff NES status between two independently computed runs.
///
/// Only customers present in both runs produce a row. `activation_rate` is
/// the share of customers on the same platform with the same previous status
/// that are engaged (`E0`) now.
pub fn nes_transitions(previous: &[CustomerDna], current: &[CustomerDna]) -> Vec<NesTransition> {
    let before: HashMap<(&str, &str), NesStatus> = previous
        .iter()
        .map(|dna| ((dna.platform_id.as_str(), dna.customer_id.as_str()), dna.nes_status))
        .collect();

    let pairs: Vec<(&CustomerDna, NesStatus)> = current
        .iter()
        .filter_map(|dna| {
            before
                .get(&(dna.platform_id.as_str(), dna.customer_id.as_str()))
                .map(|&pre| (dna, pre))
        })
        .collect();

    let mut cohorts: HashMap<(&str, NesStatus), (usize, usize)> = HashMap::new();
    for (dna, pre) in &pairs {
        let entry = cohorts.entry((dna.platform_id.as_str(), *pre)).or_default();
        entry.0 += 1;
        if dna.nes_status == NesStatus::E0 {
            entry.1 += 1;
        }
    }

    pairs
        .iter()
        .map(|(dna, pre)| {
            let (total, active) = cohorts[&(dna.platform_id.as_str(), *pre)];
            NesTransition {
                platform_id: dna.platform_id.clone(),
                customer_id: dna.customer_id.clone(),
                nesstatus_pre: *pre,
                nesstatus_now: dna.nes_status,
                activation_rate: active as f64 / total as f64,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> NesThresholds {
        NesThresholds::from_config(&NesConfig::default(), None)
    }

    fn dna(customer: &str, r: i64, f: i64, m: f64, status: NesStatus) -> CustomerDna {
        CustomerDna {
            customer_id: customer.to_string(),
            platform_id: "amz".to_string(),
            r_value: r,
            f_value: f,
            m_value: m,
            r_label: String::new(),
            f_label: String::new(),
            m_label: String::new(),
            ipt_mean: None,
            cai: 0.0,
            pcv: 0.0,
            clv: 0.0,
            cri: 0.0,
            nes_status: status,
            nt: 30.0,
            e0t: 90.0,
        }
    }

    #[test]
    fn test_quantile_type7() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&sorted, 0.5), Some(3.0));
        assert!((quantile(&sorted, 0.2).unwrap() - 1.8).abs() < 1e-12);
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn test_bucket_edges_tie_to_better_bucket() {
        let edges = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(bucket_index(10.0, &edges, Direction::LowerIsBetter), 0);
        assert_eq!(bucket_index(10.5, &edges, Direction::LowerIsBetter), 1);
        assert_eq!(bucket_index(41.0, &edges, Direction::LowerIsBetter), 4);

        assert_eq!(bucket_index(40.0, &edges, Direction::HigherIsBetter), 0);
        assert_eq!(bucket_index(39.0, &edges, Direction::HigherIsBetter), 1);
        assert_eq!(bucket_index(1.0, &edges, Direction::HigherIsBetter), 4);
    }

    #[test]
    fn test_nes_classification_bands() {
        let t = thresholds();
        assert_eq!(classify_nes(5, 1, &t), NesStatus::N);
        assert_eq!(classify_nes(5, 3, &t), NesStatus::E0);
        assert_eq!(classify_nes(60, 1, &t), NesStatus::E0);
        assert_eq!(classify_nes(120, 4, &t), NesStatus::S1);
        assert_eq!(classify_nes(200, 4, &t), NesStatus::S2);
        assert_eq!(classify_nes(400, 4, &t), NesStatus::S3);
    }

    #[test]
    fn test_nes_boundaries_go_to_more_engaged_state() {
        let t = thresholds();
        for _ in 0..3 {
            assert_eq!(classify_nes(30, 1, &t), NesStatus::E0);
            assert_eq!(classify_nes(90, 2, &t), NesStatus::E0);
            assert_eq!(classify_nes(180, 2, &t), NesStatus::S1);
            assert_eq!(classify_nes(270, 2, &t), NesStatus::S2);
        }
    }

    #[test]
    fn test_derived_thresholds_follow_median_ipt() {
        let config = NesConfig {
            derive_e0t_from_ipt: true,
            e0t_ipt_factor: 1.5,
            ..NesConfig::default()
        };
        let t = NesThresholds::from_config(&config, Some(20.0));
        assert_eq!(t.e0t, 30.0);
        assert_eq!(t.nt, 30.0);
        assert_eq!(t.s1, 60.0);

        let fallback = NesThresholds::from_config(&config, None);
        assert_eq!(fallback.e0t, 90.0);
    }

    #[test]
    fn test_assign_rfm_labels_quantile() {
        let config = SegmentationConfig::default();
        let mut records: Vec<CustomerDna> = (0..5)
            .map(|i| dna(&format!("c{i}"), i * 10, 5 - i, 100.0 * (5 - i) as f64, NesStatus::E0))
            .collect();

        assign_rfm_labels(&mut records, &config);

        assert_eq!(records[0].r_label, "極近");
        assert_eq!(records[4].r_label, "非常久遠");
        assert_eq!(records[0].f_label, "極高");
        assert_eq!(records[4].m_label, "極低");
    }

    #[test]
    fn test_tied_frequencies_do_not_all_label_best() {
        let config = SegmentationConfig::default();
        let mut records: Vec<CustomerDna> = (0..10)
            .map(|i| {
                let frequency = if i < 8 { 1 } else { 2 };
                dna(&format!("c{i}"), i * 10, frequency, 50.0, NesStatus::E0)
            })
            .collect();

        assign_rfm_labels(&mut records, &config);

        assert_eq!(records[0].f_label, "一般");
        assert_eq!(records[9].f_label, "極高");
        assert!(records.iter().all(|r| r.m_label == "一般"));
    }

    #[test]
    fn test_rank_buckets_direction() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(rank_buckets(&values, Direction::LowerIsBetter), vec![0, 1, 2, 3, 4]);
        assert_eq!(rank_buckets(&values, Direction::HigherIsBetter), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_assign_rfm_labels_fixed_edges() {
        let config = SegmentationConfig {
            recency: Binning::Fixed {
                edges: [7.0, 30.0, 90.0, 180.0],
            },
            ..SegmentationConfig::default()
        };
        let mut records = vec![dna("a", 7, 1, 10.0, NesStatus::N), dna("b", 365, 1, 10.0, NesStatus::S3)];

        assign_rfm_labels(&mut records, &config);

        assert_eq!(records[0].r_label, "極近");
        assert_eq!(records[1].r_label, "非常久遠");
    }

    #[test]
    fn test_nes_transitions_activation_rate() {
        let previous = vec![
            dna("a", 100, 2, 10.0, NesStatus::S1),
            dna("b", 100, 2, 10.0, NesStatus::S1),
            dna("c", 10, 1, 10.0, NesStatus::N),
        ];
        let current = vec![
            dna("a", 5, 3, 10.0, NesStatus::E0),
            dna("b", 130, 2, 10.0, NesStatus::S2),
            dna("c", 40, 1, 10.0, NesStatus::E0),
            dna("d", 1, 1, 10.0, NesStatus::N),
        ];

        let transitions = nes_transitions(&previous, &current);

        assert_eq!(transitions.len(), 3);
        let a = transitions.iter().find(|t| t.customer_id == "a").unwrap();
        assert_eq!(a.nesstatus_pre, NesStatus::S1);
        assert_eq!(a.nesstatus_now, NesStatus::E0);
        assert_eq!(a.activation_rate, 0.5);
        let c = transitions.iter().find(|t| t.customer_id == "c").unwrap();
        assert_eq!(c.activation_rate, 1.0);
    }
}
