//! Predictor type classification shared by every analysis

use crate::comment_rating::ATTRIBUTE_PREFIX;
use crate::types::PredictorType;

/// Name patterns checked in order after the comment-rating prefix; the first
/// hit decides the type
const PATTERNS: [(PredictorType, &[&str]); 5] = [
    (PredictorType::Price, &["price", "cost", "amount"]),
    (PredictorType::Brand, &["brand", "manufacturer"]),
    (PredictorType::Positioning, &["positioning", "position", "segment"]),
    (
        PredictorType::CommentRating,
        &["rating", "comment", "review", "score"],
    ),
    (
        PredictorType::TimeFeature,
        &["date", "month", "week", "day", "year", "time"],
    ),
];

/// Classify a predictor by its source column name.
///
/// Names matching none of the patterns are `Numeric` when the column holds
/// numbers and `Factor` otherwise. Matching is case-insensitive. Attached
/// comment ratings keep their type whatever property they rate.
pub fn classify_predictor(column: &str, numeric_source: bool) -> PredictorType {
    let name = column.to_lowercase();
    if name.starts_with(ATTRIBUTE_PREFIX) {
        return PredictorType::CommentRating;
    }
    PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| name.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(if numeric_source {
            PredictorType::Numeric
        } else {
            PredictorType::Factor
        })
}
