//! Least-squares fits used to derive calibration coefficients.
//!
//! Fits run in `f64`; the resulting coefficients are converted back to
//! [`Decimal`] with [`to_decimal`] before they are written to a device.

use crate::error::{Result, SmuError};
use nalgebra::{DMatrix, DVector};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::fmt::Write as _;

/// Significant digits kept when converting a fitted coefficient to a decimal.
const COEFFICIENT_DECIMALS: u32 = 12;

/// Result of a univariate fit `y = slope * x + intercept`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Sum of squared residuals.
    pub sse: f64,
    /// `prediction - y` for each input point.
    pub residuals: Vec<f64>,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// Per-point report, one `y => prediction (error, error %)` line per point.
    pub fn report(&self, ys: &[f64]) -> String {
        let mut out = format!("  y = {}x + {}, sse={}\n", self.slope, self.intercept, self.sse);
        out.push_str(&point_report(ys, &self.residuals));
        out
    }
}

/// Result of a multivariate fit `target = coefficients . row + offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineFit {
    /// One coefficient per predictor column, in column order.
    pub coefficients: Vec<f64>,
    pub offset: f64,
    pub residual_sum_squares: f64,
    /// Rank of the design matrix including the constant column.
    pub rank: usize,
    /// `prediction - target` for each row.
    pub residuals: Vec<f64>,
}

impl AffineFit {
    pub fn report(&self, targets: &[f64]) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "  coefficients={:?}, offset={}, residuals={}, rank={}",
            self.coefficients, self.offset, self.residual_sum_squares, self.rank
        );
        out.push_str(&point_report(targets, &self.residuals));
        out
    }
}

fn point_report(targets: &[f64], residuals: &[f64]) -> String {
    let mut out = String::new();
    for (y, error) in targets.iter().zip(residuals) {
        let prediction = y + error;
        if prediction == 0.0 {
            let _ = writeln!(out, "  {y} => {prediction:.4} ({error:.4}, n/a)");
        } else {
            let percent = error / prediction * 100.0;
            let _ = writeln!(out, "  {y} => {prediction:.4} ({error:.4}, {percent:.2}%)");
        }
    }
    out
}

fn check_finite(values: &[f64], what: &str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SmuError::InsufficientData(format!("{what} contain non-finite values")))
    }
}

/// Ordinary least-squares line through `(xs[i], ys[i])`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Result<LinearFit> {
    if xs.len() != ys.len() {
        return Err(SmuError::InsufficientData(format!(
            "{} x values but {} y values",
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < 2 {
        return Err(SmuError::InsufficientData(format!(
            "a line needs at least 2 points, got {}",
            xs.len()
        )));
    }
    check_finite(xs, "x values")?;
    check_finite(ys, "y values")?;

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (sxx, sxy) = xs.iter().zip(ys).fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
        let dx = x - mean_x;
        (sxx + dx * dx, sxy + dx * (y - mean_y))
    });
    if sxx == 0.0 {
        return Err(SmuError::InsufficientData("all x values are identical".to_string()));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let residuals: Vec<f64> = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| slope * x + intercept - y)
        .collect();
    let sse = residuals.iter().map(|r| r * r).sum();
    Ok(LinearFit {
        slope,
        intercept,
        sse,
        residuals,
    })
}

/// Least-squares solution of `[rows | 1] * [coefficients; offset] = targets` by SVD.
///
/// Rank deficiency is reported in [`AffineFit::rank`] rather than rejected; the
/// minimum-norm solution is returned in that case.
pub fn affine_fit<R: AsRef<[f64]>>(rows: &[R], targets: &[f64]) -> Result<AffineFit> {
    let Some(first) = rows.first() else {
        return Err(SmuError::InsufficientData("no data rows".to_string()));
    };
    if rows.len() != targets.len() {
        return Err(SmuError::InsufficientData(format!(
            "{} data rows but {} targets",
            rows.len(),
            targets.len()
        )));
    }
    let predictors = first.as_ref().len();
    if rows.iter().any(|r| r.as_ref().len() != predictors) {
        return Err(SmuError::InsufficientData("data rows differ in length".to_string()));
    }
    for row in rows {
        check_finite(row.as_ref(), "data rows")?;
    }
    check_finite(targets, "targets")?;

    let columns = predictors + 1;
    let a = DMatrix::from_fn(rows.len(), columns, |i, j| {
        if j < predictors { rows[i].as_ref()[j] } else { 1.0 }
    });
    let b = DVector::from_column_slice(targets);

    let svd = a.clone().svd(true, true);
    let largest = svd.singular_values.max();
    let eps = f64::EPSILON * rows.len().max(columns) as f64 * largest;
    let rank = svd.rank(eps);
    let solution = svd
        .solve(&b, eps)
        .map_err(|e| SmuError::InsufficientData(format!("least-squares solve failed: {e}")))?;

    let residuals: Vec<f64> = (&a * &solution - &b).iter().copied().collect();
    let residual_sum_squares = residuals.iter().map(|r| r * r).sum();
    check_finite(solution.as_slice(), "fitted coefficients")?;

    Ok(AffineFit {
        coefficients: solution.as_slice()[..predictors].to_vec(),
        offset: solution[predictors],
        residual_sum_squares,
        rank,
        residuals,
    })
}

/// Convert a fitted coefficient to a decimal for writing to the device.
pub fn to_decimal(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(SmuError::InsufficientData(format!("fitted value {value} is not finite")));
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp(COEFFICIENT_DECIMALS).normalize())
        .ok_or_else(|| SmuError::InsufficientData(format!("fitted value {value} is out of decimal range")))
}

/// Convert a device reading to `f64` for fitting.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}
