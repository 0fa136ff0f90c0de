//! Bin-edge axes with cached centers and widths.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, UnfoldError};

/// Ordered discretization of a 1-D quantity.
///
/// Serialized as the plain list of edges; centers and widths are recomputed on
/// deserialization so a payload can never carry inconsistent caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Axis {
    edges: Vec<f64>,
    centers: Vec<f64>,
    widths: Vec<f64>,
}

impl Axis {
    /// Builds an axis from strictly increasing, finite bin edges.
    pub fn new(edges: Vec<f64>) -> Result<Self, UnfoldError> {
        if edges.len() < 2 {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("axis-too-short", "an axis needs at least two edges")
                    .with_context("edges", edges.len()),
            ));
        }
        if let Some(idx) = edges.iter().position(|edge| !edge.is_finite()) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("axis-non-finite", "axis edges must be finite")
                    .with_context("index", idx),
            ));
        }
        if let Some(idx) = edges.windows(2).position(|pair| pair[1] <= pair[0]) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("axis-not-increasing", "axis edges must be strictly increasing")
                    .with_context("index", idx + 1),
            ));
        }
        let centers = edges
            .windows(2)
            .map(|pair| 0.5 * (pair[0] + pair[1]))
            .collect();
        let widths = edges.windows(2).map(|pair| pair[1] - pair[0]).collect();
        Ok(Self {
            edges,
            centers,
            widths,
        })
    }

    /// Builds `bins` equal-width bins spanning `[lo, hi]`.
    pub fn linear(lo: f64, hi: f64, bins: usize) -> Result<Self, UnfoldError> {
        let bins = bins.max(1);
        let step = (hi - lo) / bins as f64;
        Self::new((0..=bins).map(|idx| lo + idx as f64 * step).collect())
    }

    /// Bin edges in ascending order.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Arithmetic bin midpoints.
    pub fn centers(&self) -> &[f64] {
        &self.centers
    }

    /// Bin widths.
    pub fn widths(&self) -> &[f64] {
        &self.widths
    }

    /// Number of bins.
    pub fn num_bins(&self) -> usize {
        self.centers.len()
    }

    /// Lowest edge.
    pub fn lower(&self) -> f64 {
        self.edges[0]
    }

    /// Highest edge.
    pub fn upper(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }
}

impl TryFrom<Vec<f64>> for Axis {
    type Error = UnfoldError;

    fn try_from(edges: Vec<f64>) -> Result<Self, Self::Error> {
        Axis::new(edges)
    }
}

impl From<Axis> for Vec<f64> {
    fn from(axis: Axis) -> Self {
        axis.edges
    }
}
