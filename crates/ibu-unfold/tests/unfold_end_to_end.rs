use approx::assert_relative_eq;
use ibu_unfold::{
    Axis, CauseEffectModel, Distribution, Efficiencies, FitConfig, FitFunction,
    IterativeUnfolder, Regularization, RegularizationFailurePolicy, RegularizationOutcome,
    ResponseMatrix, StoppingConfig, StoppingRule, TerminalStatus, TestStatKind, UnfoldConfig,
    UnfoldError,
};
use nalgebra::DMatrix;

fn identity_model(bins: usize) -> CauseEffectModel {
    let axis = Axis::linear(0.0, bins as f64, bins).expect("axis");
    CauseEffectModel::single(
        axis.clone(),
        axis,
        ResponseMatrix::exact(DMatrix::identity(bins, bins)).expect("response"),
        Efficiencies::perfect(bins),
    )
    .expect("model")
}

fn falling_counts() -> Distribution {
    Distribution::counts("observed", (1..=10).rev().map(|k| 10.0 * k as f64).collect())
}

fn config(max_iter: usize, tolerance: f64) -> UnfoldConfig {
    let mut config = UnfoldConfig::new(
        Regularization::Disabled,
        StoppingConfig::new(max_iter, StoppingRule::Combined),
    );
    config.test_statistic.tolerance = tolerance;
    config
}

#[test]
fn identity_unfolding_converges_on_second_iteration() {
    let unfolder = IterativeUnfolder::new(identity_model(10), config(100, 0.01)).expect("unfolder");
    let observed = falling_counts();
    let run = unfolder.run(&observed).expect("run");

    assert_eq!(run.status, TerminalStatus::Converged);
    assert_eq!(run.iterations, 2);
    let first = &run.history[0];
    for (p, n) in first.posterior.values().iter().zip(observed.values()) {
        assert_relative_eq!(*p, n / 550.0, epsilon = 1e-9);
    }
    assert_eq!(first.regularization, RegularizationOutcome::Disabled);
    assert!(!first.statistic.converged);
    assert!(run.history[1].statistic.converged);
    assert!(run.history[1].terminal && !first.terminal);

    let counts = run.final_counts();
    assert_relative_eq!(counts.total(), 550.0, epsilon = 1e-9);
    assert_relative_eq!(counts.values()[0], 100.0, epsilon = 1e-9);
    assert_eq!(run.final_count_covariance().shape(), (10, 10));
    assert_eq!(run.final_probabilities().errors().len(), 10);
}

#[test]
fn zero_tolerance_with_single_iteration_hits_budget() {
    let unfolder = IterativeUnfolder::new(identity_model(10), config(1, 0.0)).expect("unfolder");
    let run = unfolder.run(&falling_counts()).expect("run");
    assert_eq!(run.status, TerminalStatus::MaxIterReached);
    assert_eq!(run.iterations, 1);
    assert_eq!(run.history.len(), 1);
}

fn hand_bayes(prior: &[f64], observed: &[f64], response: &[[f64; 3]; 3], eff: &[f64]) -> Vec<f64> {
    let n_obs: f64 = observed.iter().sum();
    let p_total: f64 = prior.iter().sum();
    let n0: Vec<f64> = prior.iter().map(|p| p / p_total * n_obs).collect();
    let folded: Vec<f64> = (0..3)
        .map(|j| (0..3).map(|l| response[l][j] * n0[l]).sum())
        .collect();
    let unfolded: Vec<f64> = (0..3)
        .map(|i| {
            (0..3)
                .map(|j| response[i][j] * n0[i] / (eff[i] * folded[j]) * observed[j])
                .sum()
        })
        .collect();
    let total: f64 = unfolded.iter().sum();
    unfolded.iter().map(|u| u / total).collect()
}

#[test]
fn disabled_regularization_matches_pure_bayes_updates() {
    let rows = [[0.7, 0.2, 0.0], [0.1, 0.6, 0.2], [0.0, 0.2, 0.7]];
    let eff = [0.9, 0.9, 0.9];
    let response = ResponseMatrix::exact(DMatrix::from_fn(3, 3, |i, j| rows[i][j])).expect("resp");
    let axis = Axis::new(vec![1.0, 2.0, 3.0, 4.0]).expect("axis");
    let model = CauseEffectModel::single(
        axis.clone(),
        axis,
        response,
        Efficiencies::new(eff.to_vec(), vec![0.0; 3]).expect("eff"),
    )
    .expect("model");
    let observed = Distribution::counts("observed", vec![500.0, 300.0, 150.0]);
    let unfolder = IterativeUnfolder::new(model, config(4, 0.0)).expect("unfolder");
    let run = unfolder.run(&observed).expect("run");
    assert_eq!(run.status, TerminalStatus::MaxIterReached);

    let mut prior = vec![1.0 / 3.0; 3];
    for result in &run.history {
        let expected = hand_bayes(&prior, observed.values(), &rows, &eff);
        for (got, want) in result.posterior.values().iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-12);
        }
        assert_eq!(result.smoothed.values(), result.posterior.values());
        prior = expected;
    }
}

fn pinned_fit(on_failure: RegularizationFailurePolicy) -> Regularization {
    Regularization::Fit(FitConfig {
        function: FitFunction::Polynomial { degree: 1 },
        initial: vec![0.0, 0.0],
        lower: vec![0.0, 0.0],
        upper: vec![1e-3, 1e-3],
        range: None,
        max_iter: 100,
        tolerance: 1e-10,
        on_failure,
    })
}

#[test]
fn failed_fit_aborts_when_requested() {
    let config = UnfoldConfig::new(
        pinned_fit(RegularizationFailurePolicy::Abort),
        StoppingConfig::new(5, StoppingRule::Combined),
    );
    let unfolder = IterativeUnfolder::new(identity_model(10), config).expect("unfolder");
    let failure = unfolder.run(&falling_counts()).unwrap_err();
    assert!(matches!(failure.error, UnfoldError::Regularization(_)));
    assert!(failure.history.is_empty());
    assert_eq!(failure.status(), None);
}

#[test]
fn failed_fit_falls_back_to_posterior() {
    let config = UnfoldConfig::new(
        pinned_fit(RegularizationFailurePolicy::FallBackToPosterior),
        StoppingConfig::new(5, StoppingRule::Combined),
    );
    let unfolder = IterativeUnfolder::new(identity_model(10), config).expect("unfolder");
    let run = unfolder.run(&falling_counts()).expect("run");
    assert_eq!(run.status, TerminalStatus::Converged);
    for result in &run.history {
        assert!(matches!(
            result.regularization,
            RegularizationOutcome::FellBack { .. }
        ));
        assert_eq!(result.smoothed.values(), result.posterior.values());
    }
}

#[test]
fn quadratic_spectrum_survives_smoothing() {
    let axis = Axis::linear(0.0, 10.0, 10).expect("axis");
    let counts: Vec<f64> = axis
        .centers()
        .iter()
        .map(|x| 200.0 - 30.0 * x + 2.0 * x * x)
        .collect();
    let model = CauseEffectModel::single(
        axis.clone(),
        axis,
        ResponseMatrix::exact(DMatrix::identity(10, 10)).expect("response"),
        Efficiencies::perfect(10),
    )
    .expect("model");
    let fit = Regularization::Fit(FitConfig {
        function: FitFunction::Polynomial { degree: 2 },
        initial: vec![0.1, 0.0, 0.0],
        lower: vec![-10.0, -10.0, -10.0],
        upper: vec![10.0, 10.0, 10.0],
        range: None,
        max_iter: 200,
        tolerance: 1e-10,
        on_failure: RegularizationFailurePolicy::Abort,
    });
    let mut config = UnfoldConfig::new(fit, StoppingConfig::new(10, StoppingRule::Combined));
    config.test_statistic.kind = TestStatKind::Chi2;
    config.test_statistic.tolerance = 1e-6;
    let unfolder = IterativeUnfolder::new(model, config).expect("unfolder");
    let run = unfolder.run(&Distribution::counts("observed", counts.clone())).expect("run");

    assert_eq!(run.status, TerminalStatus::Converged);
    assert_eq!(run.history[0].regularization, RegularizationOutcome::Applied);
    let total: f64 = counts.iter().sum();
    for (p, n) in run.final_probabilities().values().iter().zip(counts.iter()) {
        assert_relative_eq!(*p, n / total, epsilon = 1e-6);
    }
}

#[test]
fn construction_rejects_bad_configuration() {
    let mut zero_budget = config(1, 0.01);
    zero_budget.stopping.max_iter = 0;
    assert!(matches!(
        IterativeUnfolder::new(identity_model(4), zero_budget),
        Err(UnfoldError::Configuration(_))
    ));

    let mut bad_prior = config(5, 0.01);
    bad_prior.prior.model = ibu_unfold::PriorSpec::UserSupplied {
        values: vec![1.0, 2.0],
    };
    assert!(matches!(
        IterativeUnfolder::new(identity_model(4), bad_prior),
        Err(UnfoldError::ShapeMismatch(_))
    ));
}

#[test]
fn observed_input_is_validated_before_iterating() {
    let unfolder = IterativeUnfolder::new(identity_model(4), config(5, 0.01)).expect("unfolder");
    let short = unfolder.run(&Distribution::counts("observed", vec![1.0, 2.0])).unwrap_err();
    assert!(matches!(short.error, UnfoldError::ShapeMismatch(_)));
    let empty = unfolder.run(&Distribution::counts("observed", vec![0.0; 4])).unwrap_err();
    assert!(matches!(empty.error, UnfoldError::Validation(_)));
    assert!(empty.history.is_empty());
}

#[test]
fn repeated_runs_share_a_digest() {
    let mut config = config(3, 0.0);
    config.mixer.error_propagation = ibu_unfold::ErrorPropagation::Dcm {
        samples: 50,
        seed: 11,
    };
    let rows = [[0.8, 0.2], [0.25, 0.75]];
    let axis = Axis::new(vec![1.0, 2.0, 3.0]).expect("axis");
    let model = CauseEffectModel::single(
        axis.clone(),
        axis,
        ResponseMatrix::from_rows(
            &[rows[0].to_vec(), rows[1].to_vec()],
            &[vec![0.02, 0.02], vec![0.02, 0.02]],
        )
        .expect("response"),
        Efficiencies::perfect(2),
    )
    .expect("model");
    let unfolder = IterativeUnfolder::new(model, config).expect("unfolder");
    let observed = Distribution::counts("observed", vec![120.0, 80.0]);
    let first = unfolder.run(&observed).expect("first");
    let second = unfolder.run(&observed).expect("second");
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.provenance.seed, Some(11));
    assert_eq!(
        first.history[2].count_covariance,
        second.history[2].count_covariance
    );
}

fn two_bin_model(rows: [[f64; 2]; 2], eff: [f64; 2]) -> CauseEffectModel {
    let axis = Axis::new(vec![1.0, 2.0, 3.0]).expect("axis");
    CauseEffectModel::single(
        axis.clone(),
        axis,
        ResponseMatrix::exact(DMatrix::from_fn(2, 2, |i, j| rows[i][j])).expect("response"),
        Efficiencies::new(eff.to_vec(), vec![0.0; 2]).expect("eff"),
    )
    .expect("model")
}

#[test]
fn overflowing_posterior_diverges_before_smoothing() {
    let fit = Regularization::Fit(FitConfig {
        function: FitFunction::Polynomial { degree: 1 },
        initial: vec![0.5, 0.0],
        lower: vec![-10.0, -10.0],
        upper: vec![10.0, 10.0],
        range: None,
        max_iter: 100,
        tolerance: 1e-10,
        on_failure: RegularizationFailurePolicy::Abort,
    });
    let model = two_bin_model([[1e-10, 0.0], [0.0, 1e-10]], [1e-10, 1e-10]);
    let observed = Distribution::counts("observed", vec![1e300, 1e300]);

    let smoothed = IterativeUnfolder::new(
        model.clone(),
        UnfoldConfig::new(fit, StoppingConfig::new(5, StoppingRule::Combined)),
    )
    .expect("unfolder");
    let failure = smoothed.run(&observed).unwrap_err();
    assert!(matches!(failure.error, UnfoldError::Divergence(_)));
    assert_eq!(failure.status(), Some(TerminalStatus::Diverged));
    assert!(failure.history.is_empty());

    let plain = IterativeUnfolder::new(model, config(5, 0.01)).expect("unfolder");
    let failure = plain.run(&observed).unwrap_err();
    assert!(matches!(failure.error, UnfoldError::Divergence(_)));
}

#[test]
fn divergence_keeps_completed_iterations() {
    // Iteration 1 count covariance peaks near 1.39e308; the prior feedback of
    // iteration 2 pushes the second diagonal entry past f64::MAX.
    let model = two_bin_model([[0.9, 0.1], [0.5, 0.5]], [1.0, 1.0]);
    let sigma = 1.3e154;
    let observed =
        Distribution::new("observed", vec![90.0, 10.0], vec![sigma, sigma]).expect("observed");
    let unfolder = IterativeUnfolder::new(model, config(2, 0.0)).expect("unfolder");

    let failure = unfolder.run(&observed).unwrap_err();
    assert!(matches!(failure.error, UnfoldError::Divergence(_)));
    assert_eq!(failure.status(), Some(TerminalStatus::Diverged));
    assert_eq!(failure.history.len(), 1);
    let first = &failure.history[0];
    assert_eq!(first.iteration, 1);
    assert!(!first.terminal);
    assert!(first.count_covariance.iter().all(|v| v.is_finite()));
    assert_relative_eq!(first.counts.values()[0], 59.523_809_523_809_526, epsilon = 1e-9);
}
