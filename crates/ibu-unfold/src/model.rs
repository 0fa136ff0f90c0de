use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::{Axis, BinLayout, StackedBinGroup};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Slack allowed when checking that a response row does not exceed unit probability.
const ROW_SUM_TOLERANCE: f64 = 1e-6;

fn validation_error(code: &str, message: impl Into<String>) -> UnfoldError {
    UnfoldError::Validation(ErrorInfo::new(code, message.into()))
}

/// Migration probabilities `P(E_j | C_i)`, one row per cause and one column per effect.
///
/// Rows are normalized per cause bin: a row sums to that cause's detection
/// efficiency and therefore never exceeds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMatrix {
    values: DMatrix<f64>,
    errors: DMatrix<f64>,
}

impl ResponseMatrix {
    /// Wraps a value matrix and its element-wise uncertainty matrix.
    pub fn new(values: DMatrix<f64>, errors: DMatrix<f64>) -> Result<Self, UnfoldError> {
        if values.shape() != errors.shape() {
            return Err(UnfoldError::ShapeMismatch(
                ErrorInfo::new(
                    "response-error-shape",
                    "response uncertainty matrix must match the response matrix",
                )
                .with_context("values", format!("{:?}", values.shape()))
                .with_context("errors", format!("{:?}", errors.shape())),
            ));
        }
        for row in 0..values.nrows() {
            for col in 0..values.ncols() {
                let (value, error) = (values[(row, col)], errors[(row, col)]);
                if !value.is_finite() || value < 0.0 || !error.is_finite() || error < 0.0 {
                    return Err(UnfoldError::Validation(
                        ErrorInfo::new(
                            "response-entry",
                            "response entries and uncertainties must be finite and non-negative",
                        )
                        .with_context("cause", row)
                        .with_context("effect", col),
                    ));
                }
            }
        }
        for (row, sum) in values.row_iter().map(|row| row.sum()).enumerate() {
            if sum > 1.0 + ROW_SUM_TOLERANCE {
                return Err(UnfoldError::Validation(
                    ErrorInfo::new("response-row-sum", "response row sums above one")
                        .with_context("cause", row)
                        .with_context("sum", sum)
                        .with_hint("rows are normalized per cause bin to its efficiency"),
                ));
            }
        }
        Ok(Self { values, errors })
    }

    /// Builds from row-major nested vectors (`rows[cause][effect]`).
    pub fn from_rows(rows: &[Vec<f64>], errors: &[Vec<f64>]) -> Result<Self, UnfoldError> {
        Self::new(rows_to_matrix(rows)?, rows_to_matrix(errors)?)
    }

    /// Response without uncertainties.
    pub fn exact(values: DMatrix<f64>) -> Result<Self, UnfoldError> {
        let errors = DMatrix::zeros(values.nrows(), values.ncols());
        Self::new(values, errors)
    }

    /// Probability values.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Element-wise uncertainties.
    pub fn errors(&self) -> &DMatrix<f64> {
        &self.errors
    }

    /// Number of cause bins (rows).
    pub fn num_causes(&self) -> usize {
        self.values.nrows()
    }

    /// Number of effect bins (columns).
    pub fn num_effects(&self) -> usize {
        self.values.ncols()
    }
}

fn rows_to_matrix(rows: &[Vec<f64>]) -> Result<DMatrix<f64>, UnfoldError> {
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.is_empty() || ncols == 0 {
        return Err(validation_error("matrix-empty", "matrix must not be empty"));
    }
    if let Some(row) = rows.iter().position(|row| row.len() != ncols) {
        return Err(UnfoldError::ShapeMismatch(
            ErrorInfo::new("matrix-ragged", "matrix rows differ in length")
                .with_context("row", row)
                .with_context("expected", ncols)
                .with_context("found", rows[row].len()),
        ));
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |row, col| rows[row][col]))
}

/// Per-cause detection efficiencies with symmetric uncertainties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Efficiencies {
    values: Vec<f64>,
    errors: Vec<f64>,
}

impl Efficiencies {
    /// Efficiencies in `[0, 1]` with non-negative uncertainties.
    pub fn new(values: Vec<f64>, errors: Vec<f64>) -> Result<Self, UnfoldError> {
        if values.len() != errors.len() {
            return Err(UnfoldError::shape(
                "efficiency-errors",
                "efficiency uncertainty vector",
                values.len(),
                errors.len(),
            ));
        }
        for (idx, (value, error)) in values.iter().zip(errors.iter()).enumerate() {
            if !(0.0..=1.0).contains(value) || !error.is_finite() || *error < 0.0 {
                return Err(UnfoldError::Validation(
                    ErrorInfo::new(
                        "efficiency-range",
                        "efficiencies must lie in [0, 1] with non-negative uncertainty",
                    )
                    .with_context("cause", idx)
                    .with_context("value", value),
                ));
            }
        }
        Ok(Self { values, errors })
    }

    /// Asymmetric uncertainties; the larger side is propagated.
    pub fn asymmetric(
        values: Vec<f64>,
        errors_low: Vec<f64>,
        errors_high: Vec<f64>,
    ) -> Result<Self, UnfoldError> {
        if errors_low.len() != errors_high.len() {
            return Err(UnfoldError::shape(
                "efficiency-asymmetric",
                "upper efficiency uncertainty vector",
                errors_low.len(),
                errors_high.len(),
            ));
        }
        let errors = errors_low
            .iter()
            .zip(errors_high.iter())
            .map(|(lo, hi)| lo.max(*hi))
            .collect();
        Self::new(values, errors)
    }

    /// Perfect detection for `n` causes.
    pub fn perfect(n: usize) -> Self {
        Self {
            values: vec![1.0; n],
            errors: vec![0.0; n],
        }
    }

    /// Efficiency values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Efficiency uncertainties.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Number of cause bins.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no cause bins are described.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One composition group of a stacked model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Group label, e.g. `"light"`.
    pub label: String,
    /// Effect axis the group's observations were histogrammed on.
    pub effect_axis: Axis,
}

/// Inputs for a stacked cause-effect model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedModelSpec {
    /// Groups in interleave order.
    pub groups: Vec<GroupSpec>,
    /// Cause axis shared by every group.
    pub cause_axis: Axis,
    /// Response over the interleaved cause and effect vectors.
    pub response: ResponseMatrix,
    /// Interleaved efficiencies.
    pub efficiencies: Efficiencies,
}

/// Discretized cause/effect description consumed by the mixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseEffectModel {
    cause_layout: BinLayout,
    effect_layout: BinLayout,
    response: ResponseMatrix,
    efficiencies: Efficiencies,
}

impl CauseEffectModel {
    /// Assembles a model, checking that every input implies the same bin counts.
    pub fn new(
        cause_layout: BinLayout,
        effect_layout: BinLayout,
        response: ResponseMatrix,
        efficiencies: Efficiencies,
    ) -> Result<Self, UnfoldError> {
        if cause_layout.is_stacked()
            && effect_layout.is_stacked()
            && cause_layout.stride() != effect_layout.stride()
        {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new(
                    "stack-stride-mismatch",
                    "stacked cause and effect layouts need the same number of groups",
                )
                .with_context("cause_groups", cause_layout.stride())
                .with_context("effect_groups", effect_layout.stride()),
            ));
        }
        if response.num_causes() != cause_layout.len() {
            return Err(UnfoldError::shape(
                "response-causes",
                "response matrix rows",
                cause_layout.len(),
                response.num_causes(),
            ));
        }
        if response.num_effects() != effect_layout.len() {
            return Err(UnfoldError::shape(
                "response-effects",
                "response matrix columns",
                effect_layout.len(),
                response.num_effects(),
            ));
        }
        if efficiencies.len() != cause_layout.len() {
            return Err(UnfoldError::shape(
                "efficiency-causes",
                "efficiency vector",
                cause_layout.len(),
                efficiencies.len(),
            ));
        }
        Ok(Self {
            cause_layout,
            effect_layout,
            response,
            efficiencies,
        })
    }

    /// Single-group model over plain axes.
    pub fn single(
        cause_axis: Axis,
        effect_axis: Axis,
        response: ResponseMatrix,
        efficiencies: Efficiencies,
    ) -> Result<Self, UnfoldError> {
        Self::new(
            BinLayout::single(cause_axis),
            BinLayout::single(effect_axis),
            response,
            efficiencies,
        )
    }

    /// Stacked model; every group must share the same effect axis.
    pub fn stacked(spec: StackedModelSpec) -> Result<Self, UnfoldError> {
        let Some(first) = spec.groups.first() else {
            return Err(UnfoldError::Configuration(ErrorInfo::new(
                "stack-empty",
                "a stacked model needs at least two groups",
            )));
        };
        let effect_axis = first.effect_axis.clone();
        if let Some(group) = spec
            .groups
            .iter()
            .find(|group| group.effect_axis != effect_axis)
        {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new(
                    "stack-effect-axis",
                    "every stacked group must share the same effect axis",
                )
                .with_context("group", &group.label)
                .with_context("reference", &first.label),
            ));
        }
        let labels: Vec<String> = spec.groups.iter().map(|g| g.label.clone()).collect();
        let causes = StackedBinGroup::new(labels.clone(), spec.cause_axis)?;
        let effects = StackedBinGroup::new(labels, effect_axis)?;
        Self::new(
            BinLayout::Stacked(causes),
            BinLayout::Stacked(effects),
            spec.response,
            spec.efficiencies,
        )
    }

    /// Builds the response from Monte-Carlo tallies `tallies[cause][effect]`.
    ///
    /// Each row is normalized to the cause efficiency; uncertainties combine the
    /// Poisson error of the tally, of the row total and of the efficiency.
    pub fn from_tallies(
        cause_layout: BinLayout,
        effect_layout: BinLayout,
        tallies: &[Vec<f64>],
        efficiencies: Efficiencies,
    ) -> Result<Self, UnfoldError> {
        let counts = rows_to_matrix(tallies)?;
        if counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(validation_error(
                "tally-negative",
                "Monte-Carlo tallies must be finite and non-negative",
            ));
        }
        if counts.nrows() != efficiencies.len() {
            return Err(UnfoldError::shape(
                "tally-causes",
                "efficiency vector",
                counts.nrows(),
                efficiencies.len(),
            ));
        }
        let mut values = DMatrix::zeros(counts.nrows(), counts.ncols());
        let mut errors = DMatrix::zeros(counts.nrows(), counts.ncols());
        for cause in 0..counts.nrows() {
            let total: f64 = counts.row(cause).sum();
            let eff = efficiencies.values()[cause];
            let eff_err = efficiencies.errors()[cause];
            for effect in 0..counts.ncols() {
                let tally = counts[(cause, effect)];
                let (fraction, fraction_err) =
                    ratio_error(tally, tally.sqrt(), total, total.sqrt());
                let (value, error) = product_error(fraction, fraction_err, eff, eff_err);
                values[(cause, effect)] = value;
                errors[(cause, effect)] = error;
            }
        }
        let response = ResponseMatrix::new(values, errors)?;
        Self::new(cause_layout, effect_layout, response, efficiencies)
    }

    /// `P(E|C)` with causes as rows.
    pub fn response_matrix(&self) -> &DMatrix<f64> {
        self.response.values()
    }

    /// Element-wise uncertainty of [`CauseEffectModel::response_matrix`].
    pub fn response_uncertainty(&self) -> &DMatrix<f64> {
        self.response.errors()
    }

    /// Full response including uncertainties.
    pub fn response(&self) -> &ResponseMatrix {
        &self.response
    }

    /// Per-cause efficiencies.
    pub fn efficiencies(&self) -> &Efficiencies {
        &self.efficiencies
    }

    /// Axis of one cause group.
    pub fn cause_axis(&self) -> &Axis {
        self.cause_layout.axis()
    }

    /// Axis of one effect group.
    pub fn effect_axis(&self) -> &Axis {
        self.effect_layout.axis()
    }

    /// Layout of the flat cause vector.
    pub fn cause_layout(&self) -> &BinLayout {
        &self.cause_layout
    }

    /// Layout of the flat effect vector.
    pub fn effect_layout(&self) -> &BinLayout {
        &self.effect_layout
    }

    /// Length of the flat cause vector.
    pub fn num_causes(&self) -> usize {
        self.cause_layout.len()
    }

    /// Length of the flat effect vector.
    pub fn num_effects(&self) -> usize {
        self.effect_layout.len()
    }
}

/// Ratio of two measured quantities with first-order error propagation.
///
/// A zero denominator yields `(0, 0)`.
pub fn ratio_error(num: f64, num_err: f64, den: f64, den_err: f64) -> (f64, f64) {
    if den == 0.0 {
        return (0.0, 0.0);
    }
    let ratio = num / den;
    let mut rel_sq = (den_err / den).powi(2);
    if num != 0.0 {
        rel_sq += (num_err / num).powi(2);
    }
    (ratio, ratio.abs() * rel_sq.sqrt())
}

fn product_error(a: f64, a_err: f64, b: f64, b_err: f64) -> (f64, f64) {
    let value = a * b;
    let error = ((a_err * b).powi(2) + (a * b_err).powi(2)).sqrt();
    (value, error)
}
