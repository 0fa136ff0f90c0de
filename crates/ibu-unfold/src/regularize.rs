use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::{Axis, BinLayout, Distribution};
use nalgebra::{DMatrix, DVector};

use crate::config::{FitConfig, FitFunction, Regularization};

const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

fn reg_error(code: &str, message: impl Into<String>) -> UnfoldError {
    UnfoldError::Regularization(ErrorInfo::new(code, message.into()))
}

/// Best-fit parameters and their covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    /// Best-fit parameters.
    pub params: Vec<f64>,
    /// Parameter covariance.
    pub covariance: DMatrix<f64>,
    /// Final chi-square.
    pub chi2: f64,
    /// Number of solver iterations used.
    pub iterations: usize,
}

/// Smooths intermediate posteriors with a bounded parametric fit.
#[derive(Debug, Clone, PartialEq)]
pub enum Regularizer {
    /// Returns its input unchanged.
    PassThrough,
    /// Levenberg-Marquardt fit of the configured family.
    Fit(FitConfig),
}

impl Regularizer {
    /// Validates the regularization section against the cause layout.
    pub fn new(config: &Regularization, layout: &BinLayout) -> Result<Self, UnfoldError> {
        match config {
            Regularization::Disabled => Ok(Regularizer::PassThrough),
            Regularization::Fit(fit) => {
                fit.validate()?;
                let selected = fit_mask(fit, layout.axis());
                let used = selected.iter().filter(|keep| **keep).count();
                if used < fit.function.num_params() {
                    return Err(UnfoldError::Configuration(
                        ErrorInfo::new(
                            "fit-range-too-narrow",
                            "fit range holds fewer bins than fit parameters",
                        )
                        .with_context("bins", used)
                        .with_context("params", fit.function.num_params()),
                    ));
                }
                if fit.function.needs_positive_x()
                    && layout.axis().centers().iter().any(|x| *x <= 0.0)
                {
                    return Err(UnfoldError::Configuration(ErrorInfo::new(
                        "fit-positive-x",
                        "fit family requires positive bin centers",
                    )));
                }
                Ok(Regularizer::Fit(fit.clone()))
            }
        }
    }

    /// Whether smoothing is active.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Regularizer::Fit(_))
    }

    /// Smooths one group's distribution over `axis`.
    pub fn smooth(&self, distribution: &Distribution, axis: &Axis) -> Result<Distribution, UnfoldError> {
        match self {
            Regularizer::PassThrough => Ok(distribution.clone()),
            Regularizer::Fit(fit) => {
                if distribution.len() != axis.num_bins() {
                    return Err(UnfoldError::shape(
                        "smooth-length",
                        "distribution",
                        axis.num_bins(),
                        distribution.len(),
                    ));
                }
                let summary = fit_distribution(fit, distribution, axis)?;
                evaluate_fit(fit.function, &summary, axis, &distribution.name)
            }
        }
    }

    /// Smooths every group of a flat distribution and re-interleaves the result.
    pub fn smooth_layout(
        &self,
        distribution: &Distribution,
        layout: &BinLayout,
    ) -> Result<Distribution, UnfoldError> {
        if !self.is_enabled() {
            return Ok(distribution.clone());
        }
        let mut values = Vec::with_capacity(layout.stride());
        let mut errors = Vec::with_capacity(layout.stride());
        for group in 0..layout.stride() {
            let smoothed = self.smooth(&distribution.group(layout, group)?, layout.axis())?;
            values.push(smoothed.values().to_vec());
            errors.push(smoothed.errors().to_vec());
        }
        Distribution::new(
            distribution.name.clone(),
            layout.interleave(&values)?,
            layout.interleave(&errors)?,
        )
    }
}

fn fit_mask(fit: &FitConfig, axis: &Axis) -> Vec<bool> {
    axis.centers()
        .iter()
        .map(|x| match fit.range {
            Some([lo, hi]) => *x >= lo && *x <= hi,
            None => true,
        })
        .collect()
}

/// Model value at `x`.
fn model_value(function: FitFunction, params: &[f64], x: f64) -> f64 {
    match function {
        FitFunction::Polynomial { .. } => params.iter().rev().fold(0.0, |acc, p| acc * x + p),
        FitFunction::PowerLaw => params[0] * x.powf(params[1]),
        FitFunction::LogPolynomial { .. } => {
            let lx = x.ln();
            params.iter().rev().fold(0.0, |acc, p| acc * lx + p).exp()
        }
    }
}

/// Gradient of the model with respect to the parameters at `x`.
fn model_gradient(function: FitFunction, params: &[f64], x: f64) -> Vec<f64> {
    match function {
        FitFunction::Polynomial { .. } => (0..params.len()).map(|m| x.powi(m as i32)).collect(),
        FitFunction::PowerLaw => {
            let base = x.powf(params[1]);
            vec![base, params[0] * base * x.ln()]
        }
        FitFunction::LogPolynomial { .. } => {
            let value = model_value(function, params, x);
            let lx = x.ln();
            (0..params.len()).map(|m| value * lx.powi(m as i32)).collect()
        }
    }
}

fn jacobian(function: FitFunction, params: &[f64], xs: &[f64]) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(xs.len(), params.len());
    for (row, x) in xs.iter().enumerate() {
        for (col, value) in model_gradient(function, params, *x).into_iter().enumerate() {
            jac[(row, col)] = value;
        }
    }
    jac
}

fn chi_square(function: FitFunction, params: &[f64], xs: &[f64], ys: &[f64], ws: &[f64]) -> f64 {
    xs.iter()
        .zip(ys.iter())
        .zip(ws.iter())
        .map(|((x, y), w)| w * (y - model_value(function, params, *x)).powi(2))
        .sum()
}

fn clamp_params(params: &mut [f64], fit: &FitConfig) {
    for (idx, value) in params.iter_mut().enumerate() {
        *value = value.clamp(fit.lower[idx], fit.upper[idx]);
    }
}

/// Weighted, box-constrained Levenberg-Marquardt fit of one group.
pub fn fit_distribution(
    fit: &FitConfig,
    distribution: &Distribution,
    axis: &Axis,
) -> Result<FitSummary, UnfoldError> {
    let mask = fit_mask(fit, axis);
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut sigmas = Vec::new();
    for (idx, keep) in mask.iter().enumerate() {
        if *keep {
            xs.push(axis.centers()[idx]);
            ys.push(distribution.values()[idx]);
            sigmas.push(distribution.errors()[idx]);
        }
    }
    let n_params = fit.function.num_params();
    if xs.len() < n_params {
        return Err(reg_error("fit-too-few-bins", "fewer bins than fit parameters"));
    }
    let weighted = sigmas.iter().all(|s| *s > 0.0 && s.is_finite());
    let ws: Vec<f64> = if weighted {
        sigmas.iter().map(|s| 1.0 / (s * s)).collect()
    } else {
        vec![1.0; xs.len()]
    };
    let weight_matrix = DMatrix::from_diagonal(&DVector::from_vec(ws.clone()));
    let residuals = |params: &[f64]| {
        DVector::from_iterator(
            xs.len(),
            xs.iter()
                .zip(ys.iter())
                .map(|(x, y)| y - model_value(fit.function, params, *x)),
        )
    };

    let mut params = fit.initial.clone();
    clamp_params(&mut params, fit);
    let mut chi2 = chi_square(fit.function, &params, &xs, &ys, &ws);
    if !chi2.is_finite() {
        return Err(reg_error("fit-non-finite", "initial parameters give a non-finite chi-square"));
    }
    let mut lambda = LAMBDA_START;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < fit.max_iter && !converged {
        iterations += 1;
        let jac = jacobian(fit.function, &params, &xs);
        let jt_w = jac.transpose() * &weight_matrix;
        let normal = &jt_w * &jac;
        let gradient = &jt_w * residuals(&params);
        loop {
            let mut damped = normal.clone();
            for idx in 0..n_params {
                damped[(idx, idx)] += lambda * normal[(idx, idx)].max(LAMBDA_MIN);
            }
            let step = damped.lu().solve(&gradient);
            let trial = step.map(|step| {
                let mut trial: Vec<f64> = params.iter().zip(step.iter()).map(|(p, s)| p + s).collect();
                clamp_params(&mut trial, fit);
                trial
            });
            let trial_chi2 = trial
                .as_ref()
                .map(|t| chi_square(fit.function, t, &xs, &ys, &ws));
            match (trial, trial_chi2) {
                (Some(trial), Some(trial_chi2)) if trial_chi2.is_finite() && trial_chi2 <= chi2 => {
                    let improvement = chi2 - trial_chi2;
                    params = trial;
                    chi2 = trial_chi2;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);
                    if improvement <= fit.tolerance * chi2.max(fit.tolerance) {
                        converged = true;
                    }
                    break;
                }
                _ => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        // No damped step lowers chi-square any further.
                        converged = true;
                        break;
                    }
                }
            }
        }
    }

    if !converged {
        return Err(UnfoldError::Regularization(
            ErrorInfo::new("fit-not-converged", "regularization fit did not converge")
                .with_context("iterations", iterations)
                .with_context("chi2", chi2),
        ));
    }
    for (idx, value) in params.iter().enumerate() {
        let (lo, hi) = (fit.lower[idx], fit.upper[idx]);
        let slack = 1e-12 * (1.0 + value.abs());
        if lo < hi && ((value - lo).abs() <= slack || (hi - value).abs() <= slack) {
            return Err(UnfoldError::Regularization(
                ErrorInfo::new("fit-param-at-limit", "fit parameter ended on its limit")
                    .with_context("param", idx)
                    .with_context("value", value)
                    .with_hint("widen the parameter limits or change the fit family"),
            ));
        }
    }

    let jac = jacobian(fit.function, &params, &xs);
    let normal = jac.transpose() * &weight_matrix * &jac;
    let mut covariance = normal
        .try_inverse()
        .ok_or_else(|| reg_error("fit-singular", "normal matrix of the fit is singular"))?;
    let dof = xs.len().saturating_sub(n_params);
    if !weighted && dof > 0 {
        covariance *= chi2 / dof as f64;
    }
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(reg_error("fit-non-finite", "fit covariance is not finite"));
    }
    Ok(FitSummary {
        params,
        covariance,
        chi2,
        iterations,
    })
}

fn evaluate_fit(
    function: FitFunction,
    summary: &FitSummary,
    axis: &Axis,
    name: &str,
) -> Result<Distribution, UnfoldError> {
    let mut values = Vec::with_capacity(axis.num_bins());
    let mut errors = Vec::with_capacity(axis.num_bins());
    for x in axis.centers() {
        let value = model_value(function, &summary.params, *x);
        let grad = DVector::from_vec(model_gradient(function, &summary.params, *x));
        let variance = (grad.transpose() * &summary.covariance * &grad)[(0, 0)];
        values.push(value.max(0.0));
        errors.push(variance.max(0.0).sqrt());
    }
    let smoothed = Distribution::new(name, values, errors)?;
    if !smoothed.is_finite() {
        return Err(reg_error("fit-non-finite", "fitted curve is not finite"));
    }
    Ok(smoothed)
}
