use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::{Axis, BinLayout, Distribution};

use crate::config::{PriorConfig, PriorSpec};

fn prior_error(code: &str, message: impl Into<String>) -> UnfoldError {
    UnfoldError::Validation(ErrorInfo::new(code, message.into()))
}

/// Initial cause distribution built from a [`PriorConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prior {
    config: PriorConfig,
}

impl Prior {
    /// Wraps a prior configuration.
    pub fn new(config: PriorConfig) -> Self {
        Self { config }
    }

    /// Evaluates the prior over `layout`, failing before any iteration starts
    /// when the configuration does not fit the layout.
    pub fn check(&self, layout: &BinLayout) -> Result<(), UnfoldError> {
        self.probabilities(layout).map(|_| ())
    }

    /// Probability distribution over the flat cause vector.
    ///
    /// `n_observed` is the total number of observed events the caller will
    /// scale the prior with; it must be positive and finite.
    pub fn initial_distribution(
        &self,
        n_observed: f64,
        layout: &BinLayout,
    ) -> Result<Distribution, UnfoldError> {
        if !(n_observed.is_finite() && n_observed > 0.0) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("observed-total", "total observed events must be positive")
                    .with_context("n_observed", n_observed),
            ));
        }
        let values = self.probabilities(layout)?;
        Ok(Distribution::exact("prior", values))
    }

    fn probabilities(&self, layout: &BinLayout) -> Result<Vec<f64>, UnfoldError> {
        let weights = if self.config.per_group.is_empty() {
            match &self.config.model {
                PriorSpec::UserSupplied { values } => {
                    check_length(values.len(), layout.len())?;
                    values.clone()
                }
                model => {
                    let group = evaluate(model, layout.axis())?;
                    layout.interleave(&vec![group; layout.stride()])?
                }
            }
        } else {
            if self.config.per_group.len() != layout.stride() {
                return Err(UnfoldError::Configuration(
                    ErrorInfo::new("prior-groups", "one prior per group is required")
                        .with_context("expected", layout.stride())
                        .with_context("found", self.config.per_group.len()),
                ));
            }
            let groups = self
                .config
                .per_group
                .iter()
                .map(|spec| evaluate(spec, layout.axis()))
                .collect::<Result<Vec<_>, _>>()?;
            layout.interleave(&groups)?
        };
        normalize(weights)
    }
}

fn check_length(found: usize, expected: usize) -> Result<(), UnfoldError> {
    if found != expected {
        return Err(UnfoldError::shape(
            "prior-length",
            "user supplied prior",
            expected,
            found,
        ));
    }
    Ok(())
}

fn positive_centers(axis: &Axis, model: &str) -> Result<(), UnfoldError> {
    if axis.centers().iter().any(|x| *x <= 0.0) {
        return Err(UnfoldError::Validation(
            ErrorInfo::new("prior-center-positive", "prior needs positive bin centers")
                .with_context("model", model),
        ));
    }
    Ok(())
}

/// Unnormalized weights of one group.
fn evaluate(spec: &PriorSpec, axis: &Axis) -> Result<Vec<f64>, UnfoldError> {
    let centers = axis.centers();
    match spec {
        PriorSpec::Uniform => Ok(vec![1.0; centers.len()]),
        PriorSpec::Jeffreys => {
            positive_centers(axis, "jeffreys")?;
            let lo = centers[0];
            let hi = centers[centers.len() - 1];
            let ln_factor = if hi > lo { (hi / lo).ln() } else { 1.0 };
            Ok(centers.iter().map(|x| 1.0 / (ln_factor * x)).collect())
        }
        PriorSpec::PowerLaw { index, weight } => {
            positive_centers(axis, "power_law")?;
            check_weight(*weight)?;
            Ok(centers.iter().map(|x| weight * x.powf(*index)).collect())
        }
        PriorSpec::BrokenPowerLaw {
            index_below,
            index_above,
            break_at,
            weight,
        } => {
            positive_centers(axis, "broken_power_law")?;
            check_weight(*weight)?;
            if !(*break_at > 0.0) {
                return Err(prior_error("prior-break", "break position must be positive"));
            }
            Ok(centers
                .iter()
                .map(|x| {
                    let ratio = x / break_at;
                    let index = if *x < *break_at {
                        index_below
                    } else {
                        index_above
                    };
                    weight * ratio.powf(*index)
                })
                .collect())
        }
        PriorSpec::UserSupplied { values } => {
            check_length(values.len(), centers.len())?;
            Ok(values.clone())
        }
    }
}

fn check_weight(weight: f64) -> Result<(), UnfoldError> {
    if !(weight.is_finite() && weight > 0.0) {
        return Err(prior_error("prior-weight", "group weight must be positive"));
    }
    Ok(())
}

fn normalize(weights: Vec<f64>) -> Result<Vec<f64>, UnfoldError> {
    if let Some(idx) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
        return Err(UnfoldError::Validation(
            ErrorInfo::new("prior-negative", "prior entries must be finite and non-negative")
                .with_context("index", idx),
        ));
    }
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return Err(prior_error("prior-zero-sum", "prior sums to zero"));
    }
    Ok(weights.into_iter().map(|w| w / total).collect())
}
