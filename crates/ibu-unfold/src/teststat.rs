use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::{BinLayout, Distribution};
use serde::{Deserialize, Serialize};

use crate::config::{StoppingRule, TestStatConfig, TestStatKind};

/// Outcome of one convergence test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticReport {
    /// Statistic that decides convergence (maximum over groups for per-group stopping).
    pub value: f64,
    /// Whether the run may stop.
    pub converged: bool,
    /// Per-group values, empty unless stopping per group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_values: Vec<f64>,
}

/// Convergence test between consecutive cause distributions.
#[derive(Debug, Clone, PartialEq)]
pub struct TestStatistic {
    kind: TestStatKind,
    tolerance: f64,
    /// Bins taking part, over the full flat vector.
    mask: Vec<bool>,
}

impl TestStatistic {
    /// Builds the statistic for `layout`, resolving the optional range to a bin mask.
    pub fn new(config: &TestStatConfig, layout: &BinLayout) -> Result<Self, UnfoldError> {
        if !(config.tolerance.is_finite() && config.tolerance >= 0.0) {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new("ts-tolerance", "tolerance must be finite and non-negative")
                    .with_context("tolerance", config.tolerance),
            ));
        }
        let mask: Vec<bool> = layout
            .flat_centers()
            .iter()
            .map(|x| match config.range {
                Some([lo, hi]) => *x >= lo && *x <= hi,
                None => true,
            })
            .collect();
        if !mask.iter().any(|keep| *keep) {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new("ts-range-empty", "test statistic range selects no bins")
                    .with_hint("widen the range so it covers at least one bin center"),
            ));
        }
        Ok(Self {
            kind: config.kind,
            tolerance: config.tolerance,
            mask,
        })
    }

    /// Statistic kind.
    pub fn kind(&self) -> TestStatKind {
        self.kind
    }

    /// Convergence threshold.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Compares two flat distributions; `converged` iff the value is strictly below tolerance.
    pub fn compare(
        &self,
        previous: &Distribution,
        current: &Distribution,
    ) -> Result<(f64, bool), UnfoldError> {
        let value = self.masked_value(previous.values(), current.values(), &self.mask)?;
        Ok((value, value < self.tolerance))
    }

    /// Applies the stopping rule over `layout`.
    pub fn evaluate(
        &self,
        previous: &Distribution,
        current: &Distribution,
        rule: StoppingRule,
        layout: &BinLayout,
    ) -> Result<StatisticReport, UnfoldError> {
        if rule == StoppingRule::Combined || !layout.is_stacked() {
            let (value, converged) = self.compare(previous, current)?;
            return Ok(StatisticReport {
                value,
                converged,
                group_values: Vec::new(),
            });
        }

        check_lengths(previous.len(), current.len())?;
        check_axis("ts-layout", layout.len(), previous.len())?;
        let mut group_values = Vec::with_capacity(layout.stride());
        for group in 0..layout.stride() {
            let indices: Vec<usize> = layout.group_indices(group).collect();
            let pick = |values: &[f64]| indices.iter().map(|k| values[*k]).collect::<Vec<_>>();
            let mask: Vec<bool> = indices.iter().map(|k| self.mask[*k]).collect();
            group_values.push(self.masked_value(
                &pick(previous.values()),
                &pick(current.values()),
                &mask,
            )?);
        }
        let value = group_values.iter().copied().fold(0.0, f64::max);
        let converged = group_values.iter().all(|v| *v < self.tolerance);
        // NaN never compares below the tolerance, but keep it visible in `value`.
        let value = if group_values.iter().any(|v| v.is_nan()) {
            f64::NAN
        } else {
            value
        };
        Ok(StatisticReport {
            value,
            converged,
            group_values,
        })
    }

    fn masked_value(&self, previous: &[f64], current: &[f64], mask: &[bool]) -> Result<f64, UnfoldError> {
        check_lengths(previous.len(), current.len())?;
        check_axis("ts-mask", mask.len(), current.len())?;
        let select = |values: &[f64]| {
            values
                .iter()
                .zip(mask.iter())
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| *v)
                .collect::<Vec<_>>()
        };
        Ok(statistic(self.kind, &select(current), &select(previous)))
    }
}

fn check_lengths(previous: usize, current: usize) -> Result<(), UnfoldError> {
    if previous != current {
        return Err(UnfoldError::Comparison(
            ErrorInfo::new("ts-length", "compared distributions differ in length")
                .with_context("previous", previous)
                .with_context("current", current),
        ));
    }
    Ok(())
}

fn check_axis(code: &str, bins: usize, found: usize) -> Result<(), UnfoldError> {
    if bins != found {
        return Err(UnfoldError::Comparison(
            ErrorInfo::new(code, "compared distributions do not match the cause layout")
                .with_context("bins", bins)
                .with_context("found", found),
        ));
    }
    Ok(())
}

/// Value of `kind` between `a` (current) and `b` (previous) after
/// normalizing both on the given support.
///
/// Two empty inputs are identical (0); one empty input is maximally distant (+inf).
pub fn statistic(kind: TestStatKind, a: &[f64], b: &[f64]) -> f64 {
    let total_a: f64 = a.iter().sum();
    let total_b: f64 = b.iter().sum();
    match (total_a == 0.0, total_b == 0.0) {
        (true, true) => return 0.0,
        (true, false) | (false, true) => return f64::INFINITY,
        _ => {}
    }
    let a: Vec<f64> = a.iter().map(|v| v / total_a).collect();
    let b: Vec<f64> = b.iter().map(|v| v / total_b).collect();
    let pairs = a.iter().zip(b.iter());
    match kind {
        TestStatKind::Chi2 => {
            let n1: f64 = a.iter().sum();
            let n2: f64 = b.iter().sum();
            let (ka, kb) = ((n2 / n1).sqrt(), (n1 / n2).sqrt());
            let (sum, bins) = pairs
                .filter(|(x, y)| *x + *y > 0.0)
                .fold((0.0, 0usize), |(sum, bins), (x, y)| {
                    (sum + (ka * x - kb * y).powi(2) / (x + y), bins + 1)
                });
            if bins == 0 {
                0.0
            } else {
                sum / bins as f64
            }
        }
        TestStatKind::Ks => {
            let mut cdf_a = 0.0;
            let mut cdf_b = 0.0;
            let mut max = 0.0f64;
            for (x, y) in pairs {
                cdf_a += x;
                cdf_b += y;
                max = max.max((cdf_a - cdf_b).abs());
            }
            max
        }
        TestStatKind::Rmd => {
            let (sum, bins) = pairs
                .filter(|(_, y)| **y > 0.0)
                .fold((0.0, 0usize), |(sum, bins), (x, y)| {
                    (sum + (x - y).abs() / y, bins + 1)
                });
            if bins == 0 {
                0.0
            } else {
                sum / bins as f64
            }
        }
        TestStatKind::Pf => {
            let diff: f64 = pairs.map(|(x, y)| (x - y).powi(2)).sum();
            let norm: f64 = b.iter().map(|y| y * y).sum();
            diff / norm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibu_core::{Axis, StackedBinGroup};

    fn layout() -> BinLayout {
        BinLayout::single(Axis::linear(0.0, 4.0, 4).unwrap())
    }

    fn config(kind: TestStatKind, range: Option<[f64; 2]>) -> TestStatConfig {
        TestStatConfig {
            kind,
            tolerance: 0.05,
            range,
        }
    }

    #[test]
    fn identical_inputs_score_zero_for_every_kind() {
        let d = Distribution::exact("d", vec![0.1, 0.2, 0.3, 0.4]);
        for kind in [TestStatKind::Chi2, TestStatKind::Ks, TestStatKind::Rmd, TestStatKind::Pf] {
            let ts = TestStatistic::new(&config(kind, None), &layout()).unwrap();
            assert_eq!(ts.compare(&d, &d).unwrap(), (0.0, true));
        }
    }

    #[test]
    fn ks_is_max_cdf_gap() {
        let a = [0.5, 0.5, 0.0, 0.0];
        let b = [0.25, 0.25, 0.25, 0.25];
        assert!((statistic(TestStatKind::Ks, &a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn totals_are_normalized_before_comparison() {
        let a = [2.0, 4.0];
        let b = [1.0, 2.0];
        assert_eq!(statistic(TestStatKind::Pf, &a, &b), 0.0);
        assert_eq!(statistic(TestStatKind::Chi2, &[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert!(statistic(TestStatKind::Rmd, &[0.0, 0.0], &b).is_infinite());
    }

    #[test]
    fn range_restricts_bins_and_empty_range_is_rejected() {
        let ts = TestStatistic::new(&config(TestStatKind::Ks, Some([0.0, 2.0])), &layout()).unwrap();
        let prev = Distribution::exact("p", vec![0.25, 0.25, 0.1, 0.4]);
        let cur = Distribution::exact("c", vec![0.25, 0.25, 0.4, 0.1]);
        assert_eq!(ts.compare(&prev, &cur).unwrap().0, 0.0);

        let err = TestStatistic::new(&config(TestStatKind::Ks, Some([10.0, 20.0])), &layout())
            .unwrap_err();
        assert!(matches!(err, UnfoldError::Configuration(_)));
    }

    #[test]
    fn length_mismatch_is_a_comparison_error() {
        let ts = TestStatistic::new(&config(TestStatKind::Chi2, None), &layout()).unwrap();
        let err = ts
            .compare(
                &Distribution::exact("p", vec![0.5, 0.5]),
                &Distribution::exact("c", vec![1.0]),
            )
            .unwrap_err();
        assert!(matches!(err, UnfoldError::Comparison(_)));

        let off_axis = [
            Distribution::exact("p", vec![0.5, 0.5]),
            Distribution::exact("c", vec![0.4, 0.6]),
        ];
        let err = ts.compare(&off_axis[0], &off_axis[1]).unwrap_err();
        assert!(matches!(err, UnfoldError::Comparison(ref info) if info.code == "ts-mask"));
        let err = ts
            .evaluate(&off_axis[0], &off_axis[1], StoppingRule::PerGroup, &layout())
            .unwrap_err();
        assert!(matches!(err, UnfoldError::Comparison(_)));
    }

    #[test]
    fn per_group_requires_every_group() {
        let group = StackedBinGroup::new(
            vec!["light".into(), "heavy".into()],
            Axis::linear(0.0, 2.0, 2).unwrap(),
        )
        .unwrap();
        let layout = BinLayout::Stacked(group);
        let ts = TestStatistic::new(&config(TestStatKind::Ks, None), &layout).unwrap();
        // light unchanged, heavy reshaped
        let prev = Distribution::exact("p", vec![0.2, 0.3, 0.2, 0.3]);
        let cur = Distribution::exact("c", vec![0.2, 0.1, 0.2, 0.5]);
        let report = ts
            .evaluate(&prev, &cur, StoppingRule::PerGroup, &layout)
            .unwrap();
        assert_eq!(report.group_values.len(), 2);
        assert_eq!(report.group_values[0], 0.0);
        assert!(!report.converged);
        assert_eq!(report.value, report.group_values[1]);

        let short = Distribution::exact("s", vec![0.5, 0.5]);
        let err = ts
            .evaluate(&short, &short, StoppingRule::PerGroup, &layout)
            .unwrap_err();
        assert!(matches!(err, UnfoldError::Comparison(ref info) if info.code == "ts-layout"));
    }
}
