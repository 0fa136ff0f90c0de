//! Single-axis and stacked (interleaved multi-group) bin layouts.

use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::errors::{ErrorInfo, UnfoldError};

/// Several analysis groups sharing one axis, interleaved with a fixed stride.
///
/// Flat index `k` belongs to group `k % stride` and axis bin `k / stride`,
/// where the stride equals the number of groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedBinGroup {
    labels: Vec<String>,
    axis: Axis,
}

impl StackedBinGroup {
    /// Creates a stack of at least two uniquely labelled groups.
    pub fn new(labels: Vec<String>, axis: Axis) -> Result<Self, UnfoldError> {
        if labels.len() < 2 {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new("stack-too-small", "stacking requires at least two groups")
                    .with_context("groups", labels.len()),
            ));
        }
        for (idx, label) in labels.iter().enumerate() {
            if labels[..idx].contains(label) {
                return Err(UnfoldError::Configuration(
                    ErrorInfo::new("stack-duplicate-label", "group labels must be unique")
                        .with_context("label", label),
                ));
            }
        }
        Ok(Self { labels, axis })
    }

    /// Group labels in interleave order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Axis shared by every group.
    pub fn axis(&self) -> &Axis {
        &self.axis
    }

    /// Interleave stride (number of groups).
    pub fn stride(&self) -> usize {
        self.labels.len()
    }
}

/// Layout of a flat cause or effect vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BinLayout {
    /// One group over one axis.
    Single {
        /// Axis of the vector.
        axis: Axis,
    },
    /// Interleaved groups.
    Stacked(StackedBinGroup),
}

impl BinLayout {
    /// Layout over a single axis.
    pub fn single(axis: Axis) -> Self {
        BinLayout::Single { axis }
    }

    /// Axis describing one group's bins.
    pub fn axis(&self) -> &Axis {
        match self {
            BinLayout::Single { axis } => axis,
            BinLayout::Stacked(stack) => stack.axis(),
        }
    }

    /// Number of groups (1 for single layouts).
    pub fn stride(&self) -> usize {
        match self {
            BinLayout::Single { .. } => 1,
            BinLayout::Stacked(stack) => stack.stride(),
        }
    }

    /// Whether the layout interleaves more than one group.
    pub fn is_stacked(&self) -> bool {
        matches!(self, BinLayout::Stacked(_))
    }

    /// Bins per group.
    pub fn bins_per_group(&self) -> usize {
        self.axis().num_bins()
    }

    /// Length of the flat vector.
    pub fn len(&self) -> usize {
        self.stride() * self.bins_per_group()
    }

    /// Always false; axes have at least one bin.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Group owning flat index `k`.
    pub fn group_of(&self, k: usize) -> usize {
        k % self.stride()
    }

    /// Axis bin of flat index `k`.
    pub fn bin_of(&self, k: usize) -> usize {
        k / self.stride()
    }

    /// Axis center for every flat index.
    pub fn flat_centers(&self) -> Vec<f64> {
        let centers = self.axis().centers();
        (0..self.len()).map(|k| centers[self.bin_of(k)]).collect()
    }

    /// Group labels; a single layout reports one unnamed group.
    pub fn labels(&self) -> Vec<String> {
        match self {
            BinLayout::Single { .. } => vec![String::from("all")],
            BinLayout::Stacked(stack) => stack.labels().to_vec(),
        }
    }

    /// Flat indices belonging to `group`.
    pub fn group_indices(&self, group: usize) -> impl Iterator<Item = usize> {
        let stride = self.stride();
        (0..self.bins_per_group()).map(move |bin| bin * stride + group)
    }

    /// Splits a flat vector into one vector per group.
    pub fn split(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, UnfoldError> {
        if values.len() != self.len() {
            return Err(UnfoldError::shape(
                "layout-split",
                "flat vector",
                self.len(),
                values.len(),
            ));
        }
        Ok((0..self.stride())
            .map(|group| self.group_indices(group).map(|k| values[k]).collect())
            .collect())
    }

    /// Inverse of [`BinLayout::split`].
    pub fn interleave(&self, groups: &[Vec<f64>]) -> Result<Vec<f64>, UnfoldError> {
        if groups.len() != self.stride() {
            return Err(UnfoldError::shape(
                "layout-interleave",
                "group list",
                self.stride(),
                groups.len(),
            ));
        }
        let mut flat = vec![0.0; self.len()];
        for (group, values) in groups.iter().enumerate() {
            if values.len() != self.bins_per_group() {
                return Err(UnfoldError::shape(
                    "layout-interleave",
                    "group vector",
                    self.bins_per_group(),
                    values.len(),
                ));
            }
            for (bin, value) in values.iter().enumerate() {
                flat[bin * self.stride() + group] = *value;
            }
        }
        Ok(flat)
    }
}
