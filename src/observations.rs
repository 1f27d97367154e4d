//! Sales-count observations joining transactions with product attributes

use crate::config::PoissonConfig;
use crate::error::PipelineError;
use crate::types::{AttributeValue, GroupKey, ProductAttributes, Transaction};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// One product's sales count on a platform, with its predictor values.
/// A predictor absent from the map is missing for this product.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub platform_id: String,
    pub product_line_id: String,
    pub product_id: String,
    pub count: f64,
    pub predictors: BTreeMap<String, AttributeValue>,
}

impl Observation {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.platform_id, &self.product_line_id)
    }
}

/// Predictors carried by the transaction itself, for products missing from
/// the attribute table
fn transaction_predictors(t: &Transaction) -> BTreeMap<String, AttributeValue> {
    let mut out = BTreeMap::new();
    if let Some(price) = t.price {
        out.insert("price".to_string(), AttributeValue::Number(price));
    }
    if let Some(brand) = &t.brand {
        out.insert("brand".to_string(), AttributeValue::Text(brand.clone()));
    }
    if let Some(category) = &t.category {
        out.insert("category".to_string(), AttributeValue::Text(category.clone()));
    }
    if let Some(rating) = t.rating {
        out.insert("rating".to_string(), AttributeValue::Number(rating));
    }
    out
}

/// Count transactions per platform and product and attach product attributes.
///
/// With `include_zero_sales`, every attribute-table product of a product line
/// a platform sells gets a row, with count 0 when it never sold there.
/// Transactions without a product id or product line are ignored.
pub fn build_observations(
    transactions: &[Transaction],
    products: &[ProductAttributes],
    config: &PoissonConfig,
) -> Result<Vec<Observation>, PipelineError> {
    let catalog: HashMap<&str, &ProductAttributes> = products
        .iter()
        .map(|p| (p.product_id.as_str(), p))
        .collect();

    let mut platforms = Vec::with_capacity(transactions.len());
    let mut lines = Vec::with_capacity(transactions.len());
    let mut product_ids = Vec::with_capacity(transactions.len());
    let mut uncatalogued: HashMap<&str, &Transaction> = HashMap::new();
    let mut ignored = 0usize;

    for t in transactions {
        let Some(product_id) = t.product_id.as_deref() else {
            ignored += 1;
            continue;
        };
        let product_line = match catalog.get(product_id) {
            Some(product) => Some(product.product_line_id.as_str()),
            None => {
                uncatalogued.entry(product_id).or_insert(t);
                t.product_line_id.as_deref()
            }
        };
        let Some(product_line) = product_line else {
            ignored += 1;
            continue;
        };
        platforms.push(t.platform_id.as_str());
        lines.push(product_line);
        product_ids.push(product_id);
    }

    let counts = df!(
        "platform_id" => platforms,
        "product_line_id" => lines,
        "product_id" => product_ids
    )?
    .lazy()
    .group_by([col("platform_id"), col("product_line_id"), col("product_id")])
    .agg([len().cast(DataType::Int64).alias("count")])
    .collect()?;

    let platform_col = counts.column("platform_id")?.as_materialized_series().str()?;
    let line_col = counts.column("product_line_id")?.as_materialized_series().str()?;
    let product_col = counts.column("product_id")?.as_materialized_series().str()?;
    let count_col = counts.column("count")?.as_materialized_series().i64()?;

    let mut observations: BTreeMap<(String, String, String), Observation> = BTreeMap::new();
    for i in 0..counts.height() {
        let (Some(platform_id), Some(product_line), Some(product_id), Some(count)) = (
            platform_col.get(i),
            line_col.get(i),
            product_col.get(i),
            count_col.get(i),
        ) else {
            continue;
        };
        let predictors = match catalog.get(product_id) {
            Some(product) => product.predictors(),
            None => uncatalogued
                .get(product_id)
                .map(|t| transaction_predictors(t))
                .unwrap_or_default(),
        };
        observations.insert(
            (
                platform_id.to_string(),
                product_line.to_string(),
                product_id.to_string(),
            ),
            Observation {
                platform_id: platform_id.to_string(),
                product_line_id: product_line.to_string(),
                product_id: product_id.to_string(),
                count: count as f64,
                predictors,
            },
        );
    }

    if config.include_zero_sales {
        let sold_lines: BTreeSet<(String, String)> = observations
            .keys()
            .map(|(platform, line, _)| (platform.clone(), line.clone()))
            .collect();
        for (platform, line) in &sold_lines {
            for product in products.iter().filter(|p| &p.product_line_id == line) {
                observations
                    .entry((platform.clone(), line.clone(), product.product_id.clone()))
                    .or_insert_with(|| Observation {
                        platform_id: platform.clone(),
                        product_line_id: line.clone(),
                        product_id: product.product_id.clone(),
                        count: 0.0,
                        predictors: product.predictors(),
                    });
            }
        }
    }

    if ignored > 0 {
        debug!(ignored, "transactions without product id or product line ignored");
    }

    Ok(observations.into_values().collect())
}
