use std::fs;

use ibu_unfold::{
    ErrorPropagation, FitFunction, PriorSpec, Regularization, RegularizationFailurePolicy,
    StoppingRule, TestStatKind, UnfoldConfig, UnfoldError,
};

const FULL_YAML: &str = r#"
prior:
  model:
    type: power_law
    index: -2.7
mixer:
  error_propagation:
    type: dcm
    samples: 100
regularization:
  type: fit
  function:
    type: log_polynomial
    degree: 1
  initial: [1.0, -2.7]
  lower: [-50.0, -5.0]
  upper: [50.0, 0.0]
  range: [6.4, 8.0]
  on_failure: fall_back_to_posterior
test_statistic:
  kind: chi2
  tolerance: 0.001
stopping:
  max_iter: 25
  rule: per_group
"#;

#[test]
fn yaml_config_parses_every_section() {
    let config = UnfoldConfig::from_yaml_str(FULL_YAML).expect("parse yaml");
    assert_eq!(
        config.prior.model,
        PriorSpec::PowerLaw {
            index: -2.7,
            weight: 1.0
        }
    );
    assert_eq!(
        config.mixer.error_propagation,
        ErrorPropagation::Dcm {
            samples: 100,
            seed: 0x1B0F
        }
    );
    let Regularization::Fit(fit) = &config.regularization else {
        panic!("expected a fit section");
    };
    assert_eq!(fit.function, FitFunction::LogPolynomial { degree: 1 });
    assert_eq!(fit.on_failure, RegularizationFailurePolicy::FallBackToPosterior);
    assert_eq!(fit.max_iter, 200);
    assert_eq!(config.test_statistic.kind, TestStatKind::Chi2);
    assert_eq!(config.stopping.max_iter, 25);
    assert_eq!(config.stopping.rule, StoppingRule::PerGroup);
}

#[test]
fn minimal_json_uses_defaults() {
    let json = r#"{"regularization": {"type": "disabled"}, "stopping": {"rule": "combined"}}"#;
    let config = UnfoldConfig::from_json_str(json).expect("parse json");
    assert_eq!(config.prior.model, PriorSpec::Uniform);
    assert_eq!(config.mixer.error_propagation, ErrorPropagation::Acm);
    assert_eq!(ErrorPropagation::default(), ErrorPropagation::Acm);
    assert_eq!(config.test_statistic.kind, TestStatKind::Ks);
    assert_eq!(config.test_statistic.tolerance, 0.01);
    assert_eq!(config.stopping.max_iter, 100);
}

#[test]
fn stopping_rule_and_failure_policy_have_no_default() {
    let no_rule = r#"{"regularization": {"type": "disabled"}, "stopping": {"max_iter": 5}}"#;
    assert!(matches!(
        UnfoldConfig::from_json_str(no_rule),
        Err(UnfoldError::Serde(_))
    ));
    let no_policy = FULL_YAML.replace("  on_failure: fall_back_to_posterior\n", "");
    assert!(matches!(
        UnfoldConfig::from_yaml_str(&no_policy),
        Err(UnfoldError::Serde(_))
    ));
}

#[test]
fn unknown_names_fail_at_parse_time() {
    let bogus = FULL_YAML.replace("kind: chi2", "kind: bogus");
    assert!(matches!(
        UnfoldConfig::from_yaml_str(&bogus),
        Err(UnfoldError::Serde(_))
    ));
}

#[test]
fn semantic_checks_run_after_parsing() {
    let few_samples = FULL_YAML.replace("samples: 100", "samples: 1");
    assert!(matches!(
        UnfoldConfig::from_yaml_str(&few_samples),
        Err(UnfoldError::Configuration(_))
    ));
    let short_params = FULL_YAML.replace("initial: [1.0, -2.7]", "initial: [1.0]");
    assert!(matches!(
        UnfoldConfig::from_yaml_str(&short_params),
        Err(UnfoldError::Configuration(_))
    ));
}

#[test]
fn config_loads_from_path_by_extension() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let yaml_path = dir.path().join("unfold.yaml");
    fs::write(&yaml_path, FULL_YAML).expect("write yaml");
    let from_yaml = UnfoldConfig::from_path(&yaml_path).expect("load yaml");

    let json_path = dir.path().join("unfold.json");
    fs::write(&json_path, serde_json::to_vec(&from_yaml).expect("json")).expect("write json");
    let from_json = UnfoldConfig::from_path(&json_path).expect("load json");
    assert_eq!(from_yaml, from_json);

    let toml_path = dir.path().join("unfold.toml");
    fs::write(&toml_path, "").expect("write toml");
    assert!(matches!(
        UnfoldConfig::from_path(&toml_path),
        Err(UnfoldError::Configuration(_))
    ));
    assert!(matches!(
        UnfoldConfig::from_path(&dir.path().join("missing.yaml")),
        Err(UnfoldError::Serde(_))
    ));
}
