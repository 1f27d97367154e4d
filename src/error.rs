//! Error taxonomy for the pipeline's library boundary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No identifying column could be resolved in the raw input
    #[error("schema error on platform {platform_id}: {message}")]
    Schema { platform_id: String, message: String },

    /// The whole run has no usable input
    #[error("no usable input: {0}")]
    EmptyInput(String),

    /// A predictor column declared numeric holds non-numeric values
    #[error("predictor '{column}' expected numeric values, found '{value}'")]
    DataType { column: String, value: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A frame computation failed
    #[error("polars: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl PipelineError {
    pub fn schema(platform_id: &str, message: impl Into<String>) -> Self {
        PipelineError::Schema {
            platform_id: platform_id.to_string(),
            message: message.into(),
        }
    }
}
