//! Poisson feature-effect analysis per platform × product line
//!
//! Every group yields one row per predictor whatever happens to its fit, so
//! consumers can filter on `convergence` instead of guessing at missing rows.

use crate::config::PoissonConfig;
use crate::error::PipelineError;
use crate::model::{fit_poisson, FitFailure};
use crate::normalize::is_missing;
use crate::observations::Observation;
use crate::predictor::classify_predictor;
use crate::types::{AttributeValue, Convergence, FitError, GroupKey, PoissonFeatureResult};
use ndarray::{Array1, Array2};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// One column of the design matrix besides the intercept
#[derive(Debug, Clone, PartialEq)]
struct DesignColumn {
    /// Reported predictor name, `<column><level>` for factor dummies
    name: String,
    /// Source attribute column
    source: String,
    numeric_source: bool,
}

impl DesignColumn {
    fn result(&self, key: &GroupKey, sample_size: usize, convergence: Convergence) -> PoissonFeatureResult {
        PoissonFeatureResult {
            platform_id: key.platform_id.clone(),
            product_line_id: key.product_line_id.clone(),
            predictor: self.name.clone(),
            predictor_type: classify_predictor(&self.source, self.numeric_source),
            coefficient: None,
            std_error: None,
            p_value: None,
            conf_low: None,
            conf_high: None,
            incidence_rate_ratio: None,
            aic: None,
            sample_size,
            convergence,
        }
    }
}

struct Design {
    x: Array2<f64>,
    y: Array1<f64>,
    columns: Vec<DesignColumn>,
}

/// Why no design matrix could be built, with the columns to report on
struct DesignFailure {
    error: FitError,
    columns: Vec<DesignColumn>,
}

fn numeric_value(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Number(v) => Some(*v),
        AttributeValue::Text(text) => text.trim().parse().ok(),
    }
}

/// Non-finite numbers and missing markers count as absent
fn is_missing_value(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Number(v) => !v.is_finite(),
        AttributeValue::Text(text) => {
            is_missing(text) || text.trim().parse::<f64>().is_ok_and(|v| !v.is_finite())
        }
    }
}

fn present<'a>(row: &'a Observation, source: &str) -> Option<&'a AttributeValue> {
    row.predictors.get(source).filter(|value| !is_missing_value(value))
}

fn present_sources<'a>(rows: &[&'a Observation]) -> BTreeSet<&'a str> {
    rows.iter()
        .copied()
        .flat_map(|row| {
            row.predictors
                .iter()
                .filter(|(_, value)| !is_missing_value(value))
                .map(|(name, _)| name.as_str())
        })
        .collect()
}

fn level_name(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Number(v) => v.to_string(),
        AttributeValue::Text(text) => text.trim().to_string(),
    }
}

/// Build the design matrix of complete rows. Text columns become dummies
/// against their alphabetically first level.
fn build_design(
    key: &GroupKey,
    rows: &[&Observation],
    config: &PoissonConfig,
) -> Result<Design, DesignFailure> {
    let sources = present_sources(rows);
    let complete: Vec<&Observation> = rows
        .iter()
        .copied()
        .filter(|row| sources.iter().all(|source| present(row, source).is_some()))
        .collect();

    let mut numeric: BTreeMap<&str, bool> = BTreeMap::new();
    let mut bad_value: Option<(&str, String)> = None;
    for &source in &sources {
        let values = rows.iter().filter_map(|row| present(row, source));
        let mut all_numeric = true;
        for value in values {
            if numeric_value(value).is_none() {
                all_numeric = false;
                let required = config
                    .numeric_predictors
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(source));
                if required && bad_value.is_none() {
                    bad_value = Some((source, level_name(value)));
                }
                break;
            }
        }
        numeric.insert(source, all_numeric);
    }

    let raw_columns = || -> Vec<DesignColumn> {
        sources
            .iter()
            .map(|&source| DesignColumn {
                name: source.to_string(),
                source: source.to_string(),
                numeric_source: numeric[source]
                    || config
                        .numeric_predictors
                        .iter()
                        .any(|name| name.eq_ignore_ascii_case(source)),
            })
            .collect()
    };

    if let Some((column, value)) = bad_value {
        let err = PipelineError::DataType {
            column: column.to_string(),
            value,
        };
        warn!(group = %key, error = %err, "predictor data error, group skipped");
        return Err(DesignFailure {
            error: FitError::Data,
            columns: raw_columns(),
        });
    }

    let mut columns = Vec::new();
    let mut values: Vec<Vec<f64>> = Vec::new();
    for &source in &sources {
        if numeric[source] {
            columns.push(DesignColumn {
                name: source.to_string(),
                source: source.to_string(),
                numeric_source: true,
            });
            values.push(
                complete
                    .iter()
                    .map(|row| numeric_value(&row.predictors[source]).unwrap_or(f64::NAN))
                    .collect(),
            );
            continue;
        }

        let levels: BTreeSet<String> = complete
            .iter()
            .map(|row| level_name(&row.predictors[source]))
            .collect();
        if levels.len() < 2 && !complete.is_empty() {
            debug!(group = %key, column = source, "factor with a single level");
            return Err(DesignFailure {
                error: FitError::Singular,
                columns: raw_columns(),
            });
        }
        for level in levels.iter().skip(1) {
            columns.push(DesignColumn {
                name: format!("{source}{level}"),
                source: source.to_string(),
                numeric_source: false,
            });
            values.push(
                complete
                    .iter()
                    .map(|row| {
                        if &level_name(&row.predictors[source]) == level {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect(),
            );
        }
    }

    let n = complete.len();
    let p = columns.len() + 1;
    if n <= p {
        return Err(DesignFailure {
            error: FitError::InsufficientData,
            columns: if columns.is_empty() { raw_columns() } else { columns },
        });
    }

    let mut x = Array2::<f64>::ones((n, p));
    for (j, column_values) in values.iter().enumerate() {
        for (i, &v) in column_values.iter().enumerate() {
            x[[i, j + 1]] = v;
        }
    }
    let y = complete.iter().map(|row| row.count).collect::<Array1<f64>>();

    Ok(Design { x, y, columns })
}

fn complete_rows(rows: &[&Observation]) -> usize {
    let sources = present_sources(rows);
    rows.iter()
        .filter(|row| sources.iter().all(|source| present(row, source).is_some()))
        .count()
}

fn fit_group(key: &GroupKey, rows: &[&Observation], config: &PoissonConfig) -> Vec<PoissonFeatureResult> {
    if rows.is_empty() {
        debug!(group = %key, "no observations for group");
        return Vec::new();
    }

    let design = match build_design(key, rows, config) {
        Ok(design) => design,
        Err(failure) => {
            let sample_size = complete_rows(rows);
            let convergence = Convergence::Error(failure.error);
            warn!(group = %key, %convergence, sample_size, "poisson design could not be built");
            return failure
                .columns
                .iter()
                .map(|column| column.result(key, sample_size, convergence))
                .collect();
        }
    };

    let sample_size = design.y.len();
    match fit_poisson(&design.x, &design.y, config) {
        Ok(model) => {
            debug!(
                group = %key,
                iterations = model.iterations,
                aic = model.aic,
                sample_size,
                "poisson model converged"
            );
            design
                .columns
                .iter()
                .enumerate()
                .map(|(j, column)| {
                    let idx = j + 1;
                    let coefficient = model.coefficients[idx];
                    let (conf_low, conf_high) = model.confidence_interval(idx);
                    PoissonFeatureResult {
                        coefficient: Some(coefficient),
                        std_error: Some(model.std_errors[idx]),
                        p_value: Some(model.p_value(idx)),
                        conf_low: Some(conf_low),
                        conf_high: Some(conf_high),
                        incidence_rate_ratio: Some(model.incidence_rate_ratio(idx)),
                        aic: Some(model.aic),
                        ..column.result(key, sample_size, Convergence::Converged)
                    }
                })
                .collect()
        }
        Err(failure) => {
            let convergence = match failure {
                FitFailure::Singular => Convergence::Error(FitError::Singular),
                FitFailure::NotConverged(_) | FitFailure::NonFinite | FitFailure::Separation => {
                    Convergence::Failed
                }
            };
            warn!(group = %key, %convergence, reason = %failure, sample_size, "poisson fit failed");
            design
                .columns
                .iter()
                .map(|column| column.result(key, sample_size, convergence))
                .collect()
        }
    }
}

/// Fit the Poisson model of one platform × product line group.
///
/// Never fails: data problems and non-convergence are reported through the
/// `convergence` field of the returned rows.
pub fn fit_feature_effects(
    observations: &[Observation],
    group_key: &GroupKey,
    config: &PoissonConfig,
) -> Vec<PoissonFeatureResult> {
    let rows: Vec<&Observation> = observations
        .iter()
        .filter(|o| o.platform_id == group_key.platform_id && o.product_line_id == group_key.product_line_id)
        .collect();
    fit_group(group_key, &rows, config)
}

/// Fit every group found in `observations`, spreading groups over
/// `config.workers` threads. Rows are sorted by platform, product line and
/// predictor.
pub fn analyze_all(observations: &[Observation], config: &PoissonConfig) -> Vec<PoissonFeatureResult> {
    let mut grouped: BTreeMap<GroupKey, Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        grouped.entry(observation.group_key()).or_default().push(observation);
    }
    let groups: Vec<(GroupKey, Vec<&Observation>)> = grouped.into_iter().collect();

    let mut results: Vec<PoissonFeatureResult> = if config.workers <= 1 || groups.len() <= 1 {
        groups
            .iter()
            .flat_map(|(key, rows)| fit_group(key, rows, config))
            .collect()
    } else {
        let chunk_size = groups.len().div_ceil(config.workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .flat_map(|(key, rows)| fit_group(key, rows, config))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    };

    results.sort_by(|a, b| {
        (&a.platform_id, &a.product_line_id, &a.predictor).cmp(&(
            &b.platform_id,
            &b.product_line_id,
            &b.predictor,
        ))
    });

    let converged: BTreeSet<(&str, &str)> = results
        .iter()
        .filter(|r| r.convergence.is_converged())
        .map(|r| (r.platform_id.as_str(), r.product_line_id.as_str()))
        .collect();
    info!(
        groups = groups.len(),
        converged_groups = converged.len(),
        rows = results.len(),
        "poisson feature analysis complete"
    );

    results
}
