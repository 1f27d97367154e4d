//! Poisson generalized linear model fitted by iteratively reweighted least squares

use crate::config::PoissonConfig;
use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

/// Fitted rates below this, for zero counts, mean the estimates are running
/// off to infinity (separation) rather than converging
const ZERO_RATE_EPS: f64 = 1e-6;

/// Relative pivot tolerance of the Cholesky factorization
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Two-sided 95% normal quantile
const Z_95: f64 = 1.959_963_984_540_054;

/// Reasons a fit produced no usable estimates
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FitFailure {
    #[error("information matrix is singular")]
    Singular,
    #[error("no convergence after {0} iterations")]
    NotConverged(usize),
    #[error("iterates became non-finite")]
    NonFinite,
    #[error("fitted rates numerically zero (separation)")]
    Separation,
}

/// Fitted Poisson model with Wald inference
#[derive(Debug, Clone)]
pub struct PoissonModel {
    /// Coefficients, intercept first
    pub coefficients: Array1<f64>,
    pub std_errors: Array1<f64>,
    /// Fitted means
    pub fitted: Array1<f64>,
    pub deviance: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub iterations: usize,
}

impl PoissonModel {
    /// Incidence rate ratio of coefficient `idx`
    pub fn incidence_rate_ratio(&self, idx: usize) -> f64 {
        self.coefficients[idx].exp()
    }

    /// Two-sided Wald p-value of coefficient `idx`
    pub fn p_value(&self, idx: usize) -> f64 {
        wald_p_value(self.coefficients[idx], self.std_errors[idx])
    }

    /// 95% Wald confidence interval of coefficient `idx`
    pub fn confidence_interval(&self, idx: usize) -> (f64, f64) {
        let beta = self.coefficients[idx];
        let half_width = Z_95 * self.std_errors[idx];
        (beta - half_width, beta + half_width)
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficients.len()
    }
}

/// Fit `log E[y] = X b` by IRLS.
///
/// # Arguments
/// * `x` - Design matrix whose first column is the intercept
/// * `y` - Non-negative counts
/// * `config` - Iteration cap, tolerance and L2 penalty (not applied to the intercept)
///
/// # Returns
/// * Fitted `PoissonModel`, or why the fit is unusable
pub fn fit_poisson(
    x: &Array2<f64>,
    y: &Array1<f64>,
    config: &PoissonConfig,
) -> Result<PoissonModel, FitFailure> {
    let p = x.ncols();
    let penalty = config.l2_penalty;

    let mut mu: Array1<f64> = y.mapv(|v| v + 0.1);
    let mut eta: Array1<f64> = mu.mapv(f64::ln);
    let mut beta = Array1::<f64>::zeros(p);
    let mut dev_old = deviance(y, &mu);
    let mut converged_at = None;

    for iteration in 1..=config.max_iter {
        let z: Array1<f64> = &eta + &((y - &mu) / &mu);
        let information = weighted_gram(x, &mu, penalty);
        let rhs = x.t().dot(&(&mu * &z));

        let chol = cholesky(&information).ok_or(FitFailure::Singular)?;
        beta = cholesky_solve(&chol, &rhs);

        eta = x.dot(&beta);
        mu = eta.mapv(f64::exp);
        if !beta.iter().chain(mu.iter()).all(|v| v.is_finite()) {
            return Err(FitFailure::NonFinite);
        }
        if y
            .iter()
            .zip(mu.iter())
            .any(|(&yi, &mi)| yi == 0.0 && mi < ZERO_RATE_EPS)
        {
            return Err(FitFailure::Separation);
        }

        let dev = deviance(y, &mu) + penalty * beta.iter().skip(1).map(|b| b * b).sum::<f64>();
        if (dev - dev_old).abs() / (dev.abs() + 0.1) < config.tolerance {
            converged_at = Some(iteration);
            break;
        }
        dev_old = dev;
    }

    let iterations = converged_at.ok_or(FitFailure::NotConverged(config.max_iter))?;

    let information = weighted_gram(x, &mu, penalty);
    let chol = cholesky(&information).ok_or(FitFailure::Singular)?;
    let covariance = cholesky_inverse(&chol);
    let std_errors: Array1<f64> = covariance.diag().mapv(|v| v.max(0.0).sqrt());

    let log_likelihood = log_likelihood(y, &mu);
    let dev = deviance(y, &mu);

    Ok(PoissonModel {
        coefficients: beta,
        std_errors,
        fitted: mu,
        deviance: dev,
        log_likelihood,
        aic: -2.0 * log_likelihood + 2.0 * p as f64,
        iterations,
    })
}

/// `X' W X + penalty * P`, W = diag(weights), P the identity without the intercept
fn weighted_gram(x: &Array2<f64>, weights: &Array1<f64>, penalty: f64) -> Array2<f64> {
    let weighted = x * &weights.view().insert_axis(ndarray::Axis(1));
    let mut gram = x.t().dot(&weighted);
    for j in 1..gram.nrows() {
        gram[[j, j]] += penalty;
    }
    gram
}

/// Poisson deviance `2 Σ [y ln(y/μ) - (y - μ)]`
pub fn deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    2.0 * y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let term = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
            term - (yi - mi)
        })
        .sum::<f64>()
}

/// Poisson log-likelihood `Σ [y ln μ - μ - ln y!]`
pub fn log_likelihood(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let term = if yi > 0.0 { yi * mi.ln() } else { 0.0 };
            term - mi - ln_factorial(yi)
        })
        .sum()
}

/// `ln(n!)` for a non-negative integer-valued count
pub fn ln_factorial(value: f64) -> f64 {
    let n = value.round().max(0.0) as u64;
    if n < 2 {
        return 0.0;
    }
    if n <= 170 {
        return (2..=n).map(|k| (k as f64).ln()).sum();
    }
    let n = n as f64;
    n * n.ln() - n + 0.5 * (2.0 * std::f64::consts::PI * n).ln() + 1.0 / (12.0 * n)
        - 1.0 / (360.0 * n.powi(3))
}

/// Two-sided p-value of a Wald z statistic
pub fn wald_p_value(coefficient: f64, std_error: f64) -> f64 {
    if std_error <= 0.0 || !std_error.is_finite() {
        return if coefficient == 0.0 { 1.0 } else { 0.0 };
    }
    let z = (coefficient / std_error).abs();
    erfc(z / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

/// Complementary error function (Abramowitz-Stegun 7.1.26, |error| < 1.5e-7)
fn erfc(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let t = 1.0 / (1.0 + p * x.abs());
    let tail = (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    if x >= 0.0 {
        tail
    } else {
        2.0 - tail
    }
}

/// Lower-triangular Cholesky factor, `None` when the matrix is not
/// numerically positive definite
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let scale = a.diag().iter().fold(0.0_f64, |acc, &v| acc.max(v.abs())).max(1.0);
    let mut l = Array2::<f64>::zeros((n, n));

    for j in 0..n {
        let row_j = l.row(j).to_owned();
        let pivot = a[[j, j]] - dot_prefix(row_j.view(), row_j.view(), j);
        if !(pivot > PIVOT_TOLERANCE * scale) {
            return None;
        }
        let diag = pivot.sqrt();
        l[[j, j]] = diag;

        for i in (j + 1)..n {
            let value = (a[[i, j]] - dot_prefix(l.row(i), row_j.view(), j)) / diag;
            l[[i, j]] = value;
        }
    }
    Some(l)
}

fn dot_prefix(a: ArrayView1<f64>, b: ArrayView1<f64>, len: usize) -> f64 {
    (0..len).map(|k| a[k] * b[k]).sum()
}

/// Solve `L L' x = b`
fn cholesky_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[[i, k]] * y[k]).sum();
        y[i] = (b[i] - sum) / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|k| l[[k, i]] * x[k]).sum();
        x[i] = (y[i] - sum) / l[[i, i]];
    }
    x
}

/// Inverse of `L L'`
fn cholesky_inverse(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inverse = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut unit = Array1::<f64>::zeros(n);
        unit[j] = 1.0;
        inverse.column_mut(j).assign(&cholesky_solve(l, &unit));
    }
    inverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn design(values: &[f64]) -> Array2<f64> {
        let mut x = Array2::<f64>::ones((values.len(), 2));
        for (i, &v) in values.iter().enumerate() {
            x[[i, 1]] = v;
        }
        x
    }

    #[test]
    fn test_intercept_only_matches_log_mean() {
        let x = Array2::<f64>::ones((4, 1));
        let y = array![2.0, 4.0, 6.0, 8.0];

        let model = fit_poisson(&x, &y, &PoissonConfig::default()).unwrap();

        assert!((model.coefficients[0] - 5.0_f64.ln()).abs() < 1e-6);
        // Var(b0) = 1 / (n * mean)
        assert!((model.std_errors[0] - (1.0_f64 / 20.0).sqrt()).abs() < 1e-6);
        assert!((model.incidence_rate_ratio(0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_binary_predictor_recovers_rate_ratio() {
        // Group means 2 and 6: slope = ln(3)
        let x = design(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let y = array![1.0, 2.0, 3.0, 5.0, 6.0, 7.0];

        let model = fit_poisson(&x, &y, &PoissonConfig::default()).unwrap();

        assert!((model.coefficients[0] - 2.0_f64.ln()).abs() < 1e-6);
        assert!((model.coefficients[1] - 3.0_f64.ln()).abs() < 1e-6);
        assert!((model.incidence_rate_ratio(1) - 3.0).abs() < 1e-6);
        let p = model.p_value(1);
        assert!(p > 0.0 && p < 0.05);
        let (low, high) = model.confidence_interval(1);
        assert!(low < model.coefficients[1] && model.coefficients[1] < high);
    }

    #[test]
    fn test_aic_uses_poisson_log_likelihood() {
        let x = Array2::<f64>::ones((3, 1));
        let y = array![1.0, 1.0, 1.0];

        let model = fit_poisson(&x, &y, &PoissonConfig::default()).unwrap();

        // mu = 1 everywhere: loglik = 3 * (0 - 1 - 0)
        assert!((model.log_likelihood + 3.0).abs() < 1e-8);
        assert!((model.aic - 8.0).abs() < 1e-8);
    }

    #[test]
    fn test_zero_variance_predictor_is_singular() {
        let x = design(&[10.0, 10.0, 10.0, 10.0]);
        let y = array![1.0, 3.0, 2.0, 4.0];

        let err = fit_poisson(&x, &y, &PoissonConfig::default()).unwrap_err();
        assert_eq!(err, FitFailure::Singular);
    }

    #[test]
    fn test_ridge_penalty_stabilizes_collinear_design() {
        let x = design(&[10.0, 10.0, 10.0, 10.0]);
        let y = array![1.0, 3.0, 2.0, 4.0];
        let config = PoissonConfig {
            l2_penalty: 1.0,
            ..PoissonConfig::default()
        };

        let model = fit_poisson(&x, &y, &config).unwrap();
        assert!(model.coefficients.iter().all(|b| b.is_finite()));
    }

    #[test]
    fn test_separation_is_not_reported_as_converged() {
        // All sales at price 10, none at price 20
        let x = design(&[10.0, 10.0, 10.0, 20.0, 20.0, 20.0]);
        let y = array![3.0, 5.0, 4.0, 0.0, 0.0, 0.0];

        let err = fit_poisson(&x, &y, &PoissonConfig::default()).unwrap_err();
        assert_eq!(err, FitFailure::Separation);
    }

    #[test]
    fn test_iteration_cap() {
        let x = design(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let y = array![1.0, 2.0, 4.0, 9.0, 15.0];
        let config = PoissonConfig {
            max_iter: 1,
            ..PoissonConfig::default()
        };

        let err = fit_poisson(&x, &y, &config).unwrap_err();
        assert_eq!(err, FitFailure::NotConverged(1));
    }

    #[test]
    fn test_ln_factorial_and_p_values() {
        assert_eq!(ln_factorial(0.0), 0.0);
        assert!((ln_factorial(5.0) - 120.0_f64.ln()).abs() < 1e-12);
        let stirling = ln_factorial(200.0);
        let exact: f64 = (2..=200u64).map(|k| (k as f64).ln()).sum();
        assert!((stirling - exact).abs() < 1e-8);

        assert!((wald_p_value(1.959963984540054, 1.0) - 0.05).abs() < 1e-6);
        assert!((wald_p_value(0.0, 1.0) - 1.0).abs() < 1e-6);
    }
}
