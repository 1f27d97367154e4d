//! Configuration management for the customer DNA pipeline

use crate::error::PipelineError;
use crate::normalize::ColumnMapping;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

/// Prefix for environment overrides, e.g. `CUSTOMER_DNA__POISSON__L2_PENALTY=0.5`
const ENV_PREFIX: &str = "CUSTOMER_DNA";

/// Main pipeline configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub dna: DnaConfig,
    pub segmentation: SegmentationConfig,
    pub poisson: PoissonConfig,
    pub columns: ColumnMapping,
    pub logging: LoggingConfig,
}

/// How the monetary value of a customer is aggregated
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonetaryMode {
    #[default]
    Mean,
    Sum,
}

/// RFM / DNA calculator parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnaConfig {
    pub monetary: MonetaryMode,
    /// Only transactions within this many days before `as_of` count; whole history when unset
    pub window_days: Option<i64>,
    /// Exponential decay per day of recency in the activity index
    pub cai_decay_rate: f64,
    /// Discount rate of the retention-adjusted CLV multiplier
    pub clv_discount_rate: f64,
    /// Purchase cycle assumed when no customer has an inter-purchase time
    pub default_ipt_days: f64,
}

impl Default for DnaConfig {
    fn default() -> Self {
        Self {
            monetary: MonetaryMode::Mean,
            window_days: None,
            cai_decay_rate: 0.01,
            clv_discount_rate: 0.1,
            default_ipt_days: 90.0,
        }
    }
}

/// Binning strategy for one RFM metric
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Binning {
    /// Quintile edges computed from the run's own values
    Quantile,
    /// Four ascending edges splitting the value range into five buckets
    Fixed { edges: [f64; 4] },
}

impl Default for Binning {
    fn default() -> Self {
        Binning::Quantile
    }
}

/// Bucket labels for each RFM metric, best bucket first
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RfmLabels {
    pub recency: [String; 5],
    pub frequency: [String; 5],
    pub monetary: [String; 5],
}

impl Default for RfmLabels {
    fn default() -> Self {
        let level = || {
            ["極高", "高", "一般", "低", "極低"].map(|label| label.to_string())
        };
        Self {
            recency: ["極近", "近期", "一般", "久遠", "非常久遠"].map(|label| label.to_string()),
            frequency: level(),
            monetary: level(),
        }
    }
}

/// NES status thresholds, all in days of recency
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NesConfig {
    /// Single-purchase customers more recent than this are new
    pub nt_days: f64,
    /// Customers at or below this recency are engaged
    pub e0t_days: f64,
    /// S1 upper bound as a multiple of e0t
    pub s1_multiplier: f64,
    /// S2 upper bound as a multiple of e0t; beyond it customers are S3
    pub s2_multiplier: f64,
    /// Replace `e0t_days` with the run's median inter-purchase time
    pub derive_e0t_from_ipt: bool,
    pub e0t_ipt_factor: f64,
}

impl Default for NesConfig {
    fn default() -> Self {
        Self {
            nt_days: 30.0,
            e0t_days: 90.0,
            s1_multiplier: 2.0,
            s2_multiplier: 3.0,
            derive_e0t_from_ipt: false,
            e0t_ipt_factor: 1.0,
        }
    }
}

/// Segmentation engine parameters
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SegmentationConfig {
    pub recency: Binning,
    pub frequency: Binning,
    pub monetary: Binning,
    pub labels: RfmLabels,
    pub nes: NesConfig,
}

/// Poisson feature-effect analyzer parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoissonConfig {
    /// IRLS iteration cap; exceeding it marks the fit as failed
    pub max_iter: usize,
    /// Relative deviance change below which IRLS stops
    pub tolerance: f64,
    /// Ridge penalty on non-intercept coefficients
    pub l2_penalty: f64,
    /// Number of worker threads fitting groups in parallel
    pub workers: usize,
    /// Predictor columns that must hold numbers
    pub numeric_predictors: Vec<String>,
    /// Products without sales enter the model with a zero count
    pub include_zero_sales: bool,
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            max_iter: 25,
            tolerance: 1e-8,
            l2_penalty: 0.0,
            workers: 1,
            numeric_predictors: vec!["price".to_string(), "rating".to_string()],
            include_zero_sales: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file, with environment overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let parsed: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: Self = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject parameter combinations the calculators cannot work with
    pub fn validate(&self) -> Result<(), PipelineError> {
        let dna = &self.dna;
        if !(dna.cai_decay_rate >= 0.0 && dna.cai_decay_rate.is_finite()) {
            return Err(PipelineError::Config(
                "dna.cai_decay_rate must be a non-negative number".into(),
            ));
        }
        if !(dna.clv_discount_rate > 0.0) {
            return Err(PipelineError::Config(
                "dna.clv_discount_rate must be positive".into(),
            ));
        }
        if !(dna.default_ipt_days > 0.0) {
            return Err(PipelineError::Config(
                "dna.default_ipt_days must be positive".into(),
            ));
        }
        if matches!(dna.window_days, Some(days) if days <= 0) {
            return Err(PipelineError::Config("dna.window_days must be positive".into()));
        }

        let nes = &self.segmentation.nes;
        if !(nes.nt_days >= 0.0 && nes.e0t_days >= 0.0) {
            return Err(PipelineError::Config(
                "segmentation.nes thresholds must be non-negative".into(),
            ));
        }
        if !(nes.s1_multiplier >= 1.0 && nes.s2_multiplier >= nes.s1_multiplier) {
            return Err(PipelineError::Config(
                "segmentation.nes multipliers must satisfy 1 <= s1 <= s2".into(),
            ));
        }
        if nes.derive_e0t_from_ipt && !(nes.e0t_ipt_factor > 0.0) {
            return Err(PipelineError::Config(
                "segmentation.nes.e0t_ipt_factor must be positive".into(),
            ));
        }

        for (metric, binning) in [
            ("recency", &self.segmentation.recency),
            ("frequency", &self.segmentation.frequency),
            ("monetary", &self.segmentation.monetary),
        ] {
            if let Binning::Fixed { edges } = binning {
                if edges.windows(2).any(|pair| pair[0] > pair[1]) {
                    return Err(PipelineError::Config(format!(
                        "segmentation.{metric}.edges must be ascending"
                    )));
                }
            }
        }

        let poisson = &self.poisson;
        if poisson.max_iter == 0 {
            return Err(PipelineError::Config("poisson.max_iter must be at least 1".into()));
        }
        if !(poisson.tolerance > 0.0) {
            return Err(PipelineError::Config("poisson.tolerance must be positive".into()));
        }
        if !(poisson.l2_penalty >= 0.0) {
            return Err(PipelineError::Config(
                "poisson.l2_penalty must be non-negative".into(),
            ));
        }
        if poisson.workers == 0 {
            return Err(PipelineError::Config("poisson.workers must be at least 1".into()));
        }

        Ok(())
    }
}
