//! Review comment ratings per product property
//!
//! Responses come from an external rater in the form `[score, reason]`, or
//! exactly `[NaN,NaN]` when the comment says nothing about the property.
//! Aggregated scores become `comment_rating_<property>` product attributes.

use crate::types::{AttributeValue, ProductAttributes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Prefix of the product attributes produced from comment ratings
pub const ATTRIBUTE_PREFIX: &str = "comment_rating_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RatingParseError {
    #[error("response is not of the form [score, reason]: {0}")]
    Format(String),
    #[error("score {0} outside 1..=5")]
    ScoreOutOfRange(u8),
}

/// A comment that demonstrated the property, with its 1-5 agreement score
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatedComment {
    pub score: u8,
    pub reason: String,
}

/// Raw rater response for one comment and property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRating {
    pub product_id: String,
    pub property: String,
    pub response: String,
}

/// Mean comment score of one product property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRating {
    pub product_id: String,
    pub property: String,
    /// `None` when no comment demonstrated the property
    pub mean_score: Option<f64>,
    pub rated: usize,
    pub unrated: usize,
}

/// Parse one rater response. `Ok(None)` means the property was not
/// demonstrated.
pub fn parse_rating_response(raw: &str) -> Result<Option<RatedComment>, RatingParseError> {
    let format_error = || RatingParseError::Format(raw.to_string());
    let inner = raw
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(format_error)?;

    let (score, reason) = inner.split_once(',').ok_or_else(format_error)?;
    let (score, reason) = (score.trim(), reason.trim());
    if score.eq_ignore_ascii_case("nan") && reason.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    if reason.is_empty() {
        return Err(format_error());
    }

    let score: u8 = score.parse().map_err(|_| format_error())?;
    if !(1..=5).contains(&score) {
        return Err(RatingParseError::ScoreOutOfRange(score));
    }
    Ok(Some(RatedComment {
        score,
        reason: reason.to_string(),
    }))
}

/// Average the parsed scores per product and property. Malformed responses
/// are logged and left out of both counts.
pub fn aggregate_ratings(records: &[CommentRating]) -> Vec<PropertyRating> {
    let mut sums: BTreeMap<(&str, &str), (f64, usize, usize)> = BTreeMap::new();
    for record in records {
        let parsed = match parse_rating_response(&record.response) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    product_id = %record.product_id,
                    property = %record.property,
                    error = %err,
                    "unparseable comment rating skipped"
                );
                continue;
            }
        };
        let (total, rated, unrated) = sums
            .entry((record.product_id.as_str(), record.property.as_str()))
            .or_insert((0.0, 0, 0));
        match parsed {
            Some(comment) => {
                *total += f64::from(comment.score);
                *rated += 1;
            }
            None => *unrated += 1,
        }
    }

    sums.into_iter()
        .map(|((product_id, property), (total, rated, unrated))| PropertyRating {
            product_id: product_id.to_string(),
            property: property.to_string(),
            mean_score: (rated > 0).then(|| total / rated as f64),
            rated,
            unrated,
        })
        .collect()
}

/// Attribute name of a property, lowercased with whitespace as `_`
pub fn attribute_name(property: &str) -> String {
    let slug: Vec<String> = property
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect();
    format!("{ATTRIBUTE_PREFIX}{}", slug.join("_"))
}

/// Add mean scores as numeric `comment_rating_<property>` attributes.
/// Properties without any rated comment stay missing.
pub fn attach_to_products(products: &mut [ProductAttributes], ratings: &[PropertyRating]) {
    let mut by_product: BTreeMap<&str, Vec<&PropertyRating>> = BTreeMap::new();
    for rating in ratings {
        by_product.entry(rating.product_id.as_str()).or_default().push(rating);
    }

    for product in products.iter_mut() {
        let Some(ratings) = by_product.get(product.product_id.as_str()) else {
            continue;
        };
        for rating in ratings {
            if let Some(mean) = rating.mean_score {
                product
                    .extra
                    .insert(attribute_name(&rating.property), AttributeValue::Number(mean));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::classify_predictor;
    use crate::types::PredictorType;

    fn record(product: &str, property: &str, response: &str) -> CommentRating {
        CommentRating {
            product_id: product.to_string(),
            property: property.to_string(),
            response: response.to_string(),
        }
    }

    #[test]
    fn test_parse_responses() {
        assert_eq!(parse_rating_response("[NaN,NaN]"), Ok(None));
        assert_eq!(parse_rating_response(" [NaN, NaN] "), Ok(None));
        assert_eq!(
            parse_rating_response("[4, Mentions the sturdy handle]"),
            Ok(Some(RatedComment {
                score: 4,
                reason: "Mentions the sturdy handle".to_string()
            }))
        );
        assert_eq!(
            parse_rating_response("[7, too good]"),
            Err(RatingParseError::ScoreOutOfRange(7))
        );
        assert!(parse_rating_response("4, no brackets").is_err());
        assert!(parse_rating_response("[4,]").is_err());
        assert!(parse_rating_response("[great, fine]").is_err());
    }

    #[test]
    fn test_aggregate_ratings() {
        let records = vec![
            record("p1", "durability", "[4, ok]"),
            record("p1", "durability", "[2, weak]"),
            record("p1", "durability", "[NaN,NaN]"),
            record("p1", "durability", "garbage"),
            record("p2", "durability", "[NaN,NaN]"),
        ];

        let ratings = aggregate_ratings(&records);

        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings[0].mean_score, Some(3.0));
        assert_eq!(ratings[0].rated, 2);
        assert_eq!(ratings[0].unrated, 1);
        assert_eq!(ratings[1].mean_score, None);
    }

    #[test]
    fn test_attach_to_products() {
        let mut products = vec![
            ProductAttributes {
                product_id: "p1".to_string(),
                ..ProductAttributes::default()
            },
            ProductAttributes {
                product_id: "p2".to_string(),
                ..ProductAttributes::default()
            },
        ];
        let ratings = aggregate_ratings(&[
            record("p1", "Easy Cleaning", "[5, spotless]"),
            record("p2", "Easy Cleaning", "[NaN,NaN]"),
        ]);

        attach_to_products(&mut products, &ratings);

        let name = attribute_name("Easy Cleaning");
        assert_eq!(name, "comment_rating_easy_cleaning");
        assert_eq!(products[0].extra.get(&name), Some(&AttributeValue::Number(5.0)));
        assert!(products[1].extra.is_empty());
        assert_eq!(classify_predictor(&name, true), PredictorType::CommentRating);
    }
}
