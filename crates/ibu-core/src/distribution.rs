//! Named value vectors with parallel uncertainties.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, UnfoldError};
use crate::layout::BinLayout;

/// Relative tolerance used when checking probability normalization.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// Values over cause or effect bins with one uncertainty per bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    /// Free-form label (prior model, iteration, group).
    pub name: String,
    values: Vec<f64>,
    errors: Vec<f64>,
}

impl Distribution {
    /// Creates a distribution, checking that both vectors have the same length.
    pub fn new(
        name: impl Into<String>,
        values: Vec<f64>,
        errors: Vec<f64>,
    ) -> Result<Self, UnfoldError> {
        if values.len() != errors.len() {
            return Err(UnfoldError::shape(
                "distribution-errors",
                "uncertainty vector",
                values.len(),
                errors.len(),
            ));
        }
        Ok(Self {
            name: name.into(),
            values,
            errors,
        })
    }

    /// Creates a distribution with zero uncertainties.
    pub fn exact(name: impl Into<String>, values: Vec<f64>) -> Self {
        let errors = vec![0.0; values.len()];
        Self {
            name: name.into(),
            values,
            errors,
        }
    }

    /// Observed counts with Poisson `sqrt(n)` uncertainties.
    pub fn counts(name: impl Into<String>, counts: Vec<f64>) -> Self {
        let errors = counts.iter().map(|count| count.max(0.0).sqrt()).collect();
        Self {
            name: name.into(),
            values: counts,
            errors,
        }
    }

    /// Bin values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Per-bin uncertainties.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the distribution has no bins.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of all values.
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }

    /// True when every value and uncertainty is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().chain(self.errors.iter()).all(|v| v.is_finite())
    }

    /// Whether the values sum to one within [`NORMALIZATION_TOLERANCE`].
    pub fn is_normalized(&self) -> bool {
        (self.total() - 1.0).abs() <= NORMALIZATION_TOLERANCE
    }

    /// Multiplies values and uncertainties by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            name: self.name.clone(),
            values: self.values.iter().map(|v| v * factor).collect(),
            errors: self.errors.iter().map(|e| e * factor.abs()).collect(),
        }
    }

    /// Rescales to unit sum. Fails when the total is zero or not finite.
    pub fn normalized(&self) -> Result<Self, UnfoldError> {
        let total = self.total();
        if !(total.is_finite() && total > 0.0) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("distribution-zero-total", "cannot normalize distribution")
                    .with_context("name", &self.name)
                    .with_context("total", total),
            ));
        }
        Ok(self.scaled(1.0 / total))
    }

    /// Checks for negative or non-finite values.
    pub fn validate_non_negative(&self) -> Result<(), UnfoldError> {
        for (idx, (value, error)) in self.values.iter().zip(self.errors.iter()).enumerate() {
            if !value.is_finite() || *value < 0.0 || !error.is_finite() || *error < 0.0 {
                return Err(UnfoldError::Validation(
                    ErrorInfo::new(
                        "distribution-negative",
                        "values and uncertainties must be finite and non-negative",
                    )
                    .with_context("name", &self.name)
                    .with_context("index", idx)
                    .with_context("value", value),
                ));
            }
        }
        Ok(())
    }

    /// Sum of the entries that belong to `group` under `layout`.
    pub fn group_total(&self, layout: &BinLayout, group: usize) -> Result<f64, UnfoldError> {
        self.check_group(layout, group)?;
        Ok(layout.group_indices(group).map(|k| self.values[k]).sum())
    }

    /// Extracts the sub-distribution of one group.
    pub fn group(&self, layout: &BinLayout, group: usize) -> Result<Self, UnfoldError> {
        let label = self.check_group(layout, group)?;
        Ok(Self {
            name: format!("{}[{}]", self.name, label),
            values: layout.group_indices(group).map(|k| self.values[k]).collect(),
            errors: layout.group_indices(group).map(|k| self.errors[k]).collect(),
        })
    }

    /// Label of `group`, once the layout is known to cover this distribution.
    fn check_group(&self, layout: &BinLayout, group: usize) -> Result<String, UnfoldError> {
        if self.len() != layout.len() {
            return Err(UnfoldError::shape(
                "distribution-layout",
                "distribution",
                layout.len(),
                self.len(),
            ));
        }
        layout.labels().get(group).cloned().ok_or_else(|| {
            UnfoldError::Configuration(
                ErrorInfo::new("distribution-group", "group index out of range")
                    .with_context("group", group)
                    .with_context("groups", layout.stride()),
            )
        })
    }
}
