//! Record types flowing through the pipeline

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One purchase event in the canonical schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub customer_id: String,
    pub platform_id: String,
    pub timestamp: NaiveDate,
    /// Monetary value, never negative
    pub amount: f64,
    pub product_line_id: Option<String>,
    pub product_id: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub rating: Option<f64>,
}

impl Transaction {
    /// Create a transaction without product attributes
    pub fn new(customer_id: &str, platform_id: &str, timestamp: NaiveDate, amount: f64) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            platform_id: platform_id.to_string(),
            timestamp,
            amount,
            product_line_id: None,
            product_id: None,
            brand: None,
            category: None,
            price: None,
            rating: None,
        }
    }

    pub fn with_product(mut self, product_line_id: &str, product_id: &str) -> Self {
        self.product_line_id = Some(product_line_id.to_string());
        self.product_id = Some(product_id.to_string());
        self
    }
}

/// NES lifecycle status: New, Engaged, and three Sleeping tiers.
///
/// `S3` is the terminal dormant tier ("lost"). Variants are ordered from most
/// to least engaged, so `E0 < N < S1 < S2 < S3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NesStatus {
    E0,
    N,
    S1,
    S2,
    S3,
}

impl NesStatus {
    pub const ALL: [NesStatus; 5] = [
        NesStatus::N,
        NesStatus::E0,
        NesStatus::S1,
        NesStatus::S2,
        NesStatus::S3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NesStatus::N => "N",
            NesStatus::E0 => "E0",
            NesStatus::S1 => "S1",
            NesStatus::S2 => "S2",
            NesStatus::S3 => "S3",
        }
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self, NesStatus::S1 | NesStatus::S2 | NesStatus::S3)
    }
}

impl fmt::Display for NesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NesStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "N" => Ok(NesStatus::N),
            "E0" => Ok(NesStatus::E0),
            "S1" => Ok(NesStatus::S1),
            "S2" => Ok(NesStatus::S2),
            "S3" => Ok(NesStatus::S3),
            other => Err(format!("unknown NES status: {other}")),
        }
    }
}

/// Per-customer DNA record for one computation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerDna {
    pub customer_id: String,
    pub platform_id: String,
    /// Days since the latest purchase
    pub r_value: i64,
    /// Number of purchases in the observation window, at least 1
    pub f_value: i64,
    pub m_value: f64,
    pub r_label: String,
    pub f_label: String,
    pub m_label: String,
    /// `None` for single-purchase customers
    pub ipt_mean: Option<f64>,
    pub cai: f64,
    pub pcv: f64,
    pub clv: f64,
    pub cri: f64,
    pub nes_status: NesStatus,
    pub nt: f64,
    pub e0t: f64,
}

/// Historical diff of one customer's NES status between two runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NesTransition {
    pub platform_id: String,
    pub customer_id: String,
    pub nesstatus_pre: NesStatus,
    pub nesstatus_now: NesStatus,
    /// Share of the customer's `nesstatus_pre` cohort that is engaged now
    pub activation_rate: f64,
}

/// Predictor category, derived from the predictor name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictorType {
    Price,
    Brand,
    Numeric,
    Factor,
    Positioning,
    CommentRating,
    TimeFeature,
}

impl PredictorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictorType::Price => "price",
            PredictorType::Brand => "brand",
            PredictorType::Numeric => "numeric",
            PredictorType::Factor => "factor",
            PredictorType::Positioning => "positioning",
            PredictorType::CommentRating => "comment_rating",
            PredictorType::TimeFeature => "time_feature",
        }
    }
}

impl fmt::Display for PredictorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "price" => Ok(PredictorType::Price),
            "brand" => Ok(PredictorType::Brand),
            "numeric" => Ok(PredictorType::Numeric),
            "factor" => Ok(PredictorType::Factor),
            "positioning" => Ok(PredictorType::Positioning),
            "comment_rating" => Ok(PredictorType::CommentRating),
            "time_feature" => Ok(PredictorType::TimeFeature),
            other => Err(format!("unknown predictor type: {other}")),
        }
    }
}

/// Why a regression did not produce usable estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitError {
    /// A numeric predictor contained non-numeric values
    Data,
    /// Design matrix is rank deficient
    Singular,
    /// Too few complete rows for the number of coefficients
    InsufficientData,
}

/// Outcome of one regression fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Convergence {
    Converged,
    Failed,
    Error(FitError),
}

impl Convergence {
    pub fn is_converged(&self) -> bool {
        matches!(self, Convergence::Converged)
    }
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convergence::Converged => f.write_str("converged"),
            Convergence::Failed => f.write_str("failed"),
            Convergence::Error(FitError::Data) => f.write_str("error-data"),
            Convergence::Error(FitError::Singular) => f.write_str("error-singular"),
            Convergence::Error(FitError::InsufficientData) => {
                f.write_str("error-insufficient-data")
            }
        }
    }
}

impl FromStr for Convergence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "converged" => Ok(Convergence::Converged),
            "failed" => Ok(Convergence::Failed),
            "error-data" => Ok(Convergence::Error(FitError::Data)),
            "error-singular" => Ok(Convergence::Error(FitError::Singular)),
            "error-insufficient-data" => Ok(Convergence::Error(FitError::InsufficientData)),
            other => Err(format!("unknown convergence status: {other}")),
        }
    }
}

/// One predictor's effect estimate within a platform × product line regression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonFeatureResult {
    pub platform_id: String,
    pub product_line_id: String,
    pub predictor: String,
    pub predictor_type: PredictorType,
    pub coefficient: Option<f64>,
    pub std_error: Option<f64>,
    pub p_value: Option<f64>,
    pub conf_low: Option<f64>,
    pub conf_high: Option<f64>,
    pub incidence_rate_ratio: Option<f64>,
    pub aic: Option<f64>,
    pub sample_size: usize,
    pub convergence: Convergence,
}

/// Attribute value of a product, either numeric or free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

/// Product attribute table row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductAttributes {
    pub product_id: String,
    pub product_line_id: String,
    pub price: Option<f64>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub rating: Option<f64>,
    /// Additional attributes such as positioning or comment ratings
    pub extra: BTreeMap<String, AttributeValue>,
}

impl ProductAttributes {
    /// All predictor attributes of this product, keyed by column name.
    /// Missing attributes are omitted.
    pub fn predictors(&self) -> BTreeMap<String, AttributeValue> {
        let mut out = self.extra.clone();
        if let Some(price) = self.price {
            out.insert("price".to_string(), AttributeValue::Number(price));
        }
        if let Some(brand) = &self.brand {
            out.insert("brand".to_string(), AttributeValue::Text(brand.clone()));
        }
        if let Some(category) = &self.category {
            out.insert("category".to_string(), AttributeValue::Text(category.clone()));
        }
        if let Some(rating) = self.rating {
            out.insert("rating".to_string(), AttributeValue::Number(rating));
        }
        out
    }
}

/// Key of one regression group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub platform_id: String,
    pub product_line_id: String,
}

impl GroupKey {
    pub fn new(platform_id: &str, product_line_id: &str) -> Self {
        Self {
            platform_id: platform_id.to_string(),
            product_line_id: product_line_id.to_string(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform_id, self.product_line_id)
    }
}
