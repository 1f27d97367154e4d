//! Customer DNA: RFM metrics, lifecycle segmentation and Poisson
//! feature-effect analysis for multi-platform transaction data
//!
//! Raw exports are normalized into [`Transaction`]s, turned into per-customer
//! [`CustomerDna`] records with value labels and NES status, and joined with
//! product attributes to estimate which product features drive sales.

pub mod cli;
pub mod comment_rating;
pub mod config;
pub mod data;
pub mod dna;
pub mod error;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod observations;
pub mod pipeline;
pub mod poisson;
pub mod predictor;
pub mod segment;
pub mod source;
pub mod types;

// Re-export public items for easier access
pub use cli::Args;
pub use config::PipelineConfig;
pub use dna::compute_dna;
pub use error::PipelineError;
pub use logging::init_tracing;
pub use normalize::normalize;
pub use observations::{build_observations, Observation};
pub use pipeline::{run_dna, run_dna_all, run_feature_analysis};
pub use poisson::{analyze_all, fit_feature_effects};
pub use predictor::classify_predictor;
pub use segment::{classify_nes, nes_transitions};
pub use source::{TransactionQuery, TransactionSource, TransactionStore};
pub use types::{
    Convergence, CustomerDna, FitError, GroupKey, NesStatus, NesTransition,
    PoissonFeatureResult, PredictorType, ProductAttributes, Transaction,
};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
