//! Command-line interface definitions and argument parsing

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// Customer DNA and Poisson feature-effect batch runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Raw transaction export (CSV) of one platform
    #[arg(short, long)]
    pub transactions: PathBuf,

    /// Platform the transactions belong to
    #[arg(short, long)]
    pub platform: String,

    /// Product attribute table (CSV); enables the Poisson feature analysis
    #[arg(long)]
    pub products: Option<PathBuf>,

    /// Reference date (YYYY-MM-DD); defaults to the latest transaction date
    #[arg(long)]
    pub as_of: Option<NaiveDate>,

    /// Pipeline configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output path of the customer DNA table
    #[arg(long, default_value = "customer_dna.csv")]
    pub dna_out: PathBuf,

    /// Output path of the Poisson feature table
    #[arg(long, default_value = "poisson_features.csv")]
    pub features_out: PathBuf,

    /// DNA table of a previous run, to report NES transitions against
    #[arg(long)]
    pub previous_dna: Option<PathBuf>,

    /// Output path of the NES transition table
    #[arg(long, default_value = "nes_transitions.csv")]
    pub transitions_out: PathBuf,

    /// Comment rating responses (CSV) merged into the product attributes
    #[arg(long)]
    pub comments: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Reject flag combinations that cannot do anything useful
    pub fn validate(&self) -> crate::Result<()> {
        if self.platform.trim().is_empty() {
            anyhow::bail!("Platform id must not be empty");
        }
        if self.comments.is_some() && self.products.is_none() {
            anyhow::bail!("--comments requires --products");
        }
        Ok(())
    }
}
