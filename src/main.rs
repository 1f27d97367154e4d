//! Customer DNA batch runner
//!
//! Normalizes one platform's transaction export, computes customer DNA,
//! optionally diffs NES status against a previous run and fits Poisson
//! feature-effect models per product line.

use anyhow::{Context, Result};
use clap::Parser;
use customer_dna::comment_rating::{aggregate_ratings, attach_to_products};
use customer_dna::data::{
    load_comment_ratings, load_dna_table, load_product_attributes, load_raw_rows,
    write_dna_table, write_feature_table, write_transitions,
};
use customer_dna::{
    init_tracing, nes_transitions, normalize, run_dna, run_feature_analysis, Args,
    PipelineConfig, PipelineError, TransactionSource, TransactionStore,
};
use std::time::Instant;
use tracing::info;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    init_tracing(&config.logging);
    args.validate()?;

    run(&args, &config)
}

fn run(args: &Args, config: &PipelineConfig) -> Result<()> {
    let start_time = Instant::now();

    let raw_rows = load_raw_rows(&args.transactions)
        .with_context(|| format!("Failed to load {}", args.transactions.display()))?;
    let transactions = normalize(&raw_rows, &args.platform, &config.columns)?;
    info!(
        platform_id = %args.platform,
        rows = raw_rows.len(),
        transactions = transactions.len(),
        "transactions normalized"
    );

    let as_of = match args.as_of {
        Some(date) => date,
        None => transactions
            .iter()
            .map(|t| t.timestamp)
            .max()
            .ok_or_else(|| {
                PipelineError::EmptyInput(format!(
                    "platform {} has no usable transactions to derive a reference date from",
                    args.platform
                ))
            })?,
    };
    let store = TransactionStore::from_transactions(transactions);

    let records = run_dna(&store, &args.platform, as_of, config)?;
    write_dna_table(&records, &args.dna_out)?;
    println!("✓ Customer DNA: {} customers as of {}", records.len(), as_of);

    if let Some(previous_path) = &args.previous_dna {
        let previous = load_dna_table(previous_path)?;
        let transitions = nes_transitions(previous.records(), &records);
        write_transitions(&transitions, &args.transitions_out)?;
        println!("✓ NES transitions: {} returning customers", transitions.len());
    }

    if let Some(products_path) = &args.products {
        let mut products = load_product_attributes(products_path)?;
        if let Some(comments_path) = &args.comments {
            let ratings = aggregate_ratings(&load_comment_ratings(comments_path)?);
            attach_to_products(&mut products, &ratings);
            info!(properties = ratings.len(), "comment ratings attached");
        }

        let results = run_feature_analysis(&store, &products, config)?;
        write_feature_table(&results, &args.features_out)?;
        let converged = results.iter().filter(|r| r.convergence.is_converged()).count();
        println!(
            "✓ Poisson features: {} rows, {} converged",
            results.len(),
            converged
        );
    }

    info!(
        platforms = store.platforms().len(),
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        "pipeline complete"
    );
    Ok(())
}
