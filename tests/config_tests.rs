use deepmatrix::config::{BackendConfig, ScheduleConfig};
use deepmatrix::engine::layer::Dense;
use deepmatrix::engine::optimizer::LearningRateSchedule;
use deepmatrix::{Activation, Backend, DeepLayer, EngineConfig, MatrixError, Tensor};
use rand::Rng;

#[test]
fn test_defaults_from_empty_object() {
    let config = EngineConfig::from_json_str("{}").unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.backend, BackendConfig::Host);
    assert_eq!(config.backend().name(), "host");
    assert_eq!(config.schedule().rate(10), 0.5);
}

#[test]
fn test_parse_emulated_backend_and_schedule() {
    let json = r#"{
        "backend": { "kind": "emulated", "block_size": 8 },
        "seed": 42,
        "learning_rate": { "kind": "step", "initial": 0.4, "factor": 0.5, "every": 2 },
        "adam": { "beta1": 0.8 },
        "weight_range": [-0.1, 0.1]
    }"#;
    let config = EngineConfig::from_json_str(json).unwrap();
    assert_eq!(config.backend, BackendConfig::Emulated { block_size: 8 });
    assert_eq!(config.backend().name(), "device");
    assert_eq!(
        config.learning_rate,
        ScheduleConfig::Step {
            initial: 0.4,
            factor: 0.5,
            every: 2
        }
    );
    assert_eq!(config.schedule().rate(4), 0.1);
    assert_eq!(config.adam.beta1, 0.8);
    assert_eq!(config.adam.beta2, 0.999);
}

#[test]
fn test_seeded_rng_is_reproducible() {
    let config = EngineConfig::from_json_str(r#"{ "seed": 7 }"#).unwrap();
    let a: f32 = config.rng().gen();
    let b: f32 = config.rng().gen();
    assert_eq!(a, b);
}

#[test]
fn test_invalid_values_are_rejected() {
    for json in [
        r#"{ "backend": { "kind": "emulated", "block_size": 0 } }"#,
        r#"{ "weight_range": [1.0, -1.0] }"#,
        r#"{ "learning_rate": { "kind": "step", "initial": 1.0, "factor": 0.5, "every": 0 } }"#,
    ] {
        assert!(
            matches!(EngineConfig::from_json_str(json), Err(MatrixError::Config(_))),
            "{}",
            json
        );
    }
    assert!(matches!(
        EngineConfig::from_json_str(r#"{ "backend": { "kind": "gpu" } }"#),
        Err(MatrixError::Json(_))
    ));
}

#[test]
fn test_roundtrip_through_file() {
    let config = EngineConfig {
        seed: Some(3),
        learning_rate: ScheduleConfig::Exponential {
            initial: 1.0,
            decay: 0.01,
        },
        ..EngineConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();
    assert_eq!(EngineConfig::from_file(&path).unwrap(), config);

    assert!(matches!(
        EngineConfig::from_file(dir.path().join("missing.json")),
        Err(MatrixError::Io(_))
    ));
}

#[test]
fn test_configured_network_trains() {
    let config = EngineConfig::from_json_str(
        r#"{ "backend": { "kind": "emulated", "block_size": 4 }, "seed": 1,
             "learning_rate": { "kind": "constant", "rate": 0.5 } }"#,
    )
    .unwrap();
    let mut rng = config.rng();
    let mut net = DeepLayer::new(
        config.backend(),
        vec![
            Dense::new(2, 3, 1, Activation::Sigmoid).into(),
            Dense::new(3, 1, 1, Activation::Sigmoid).into(),
        ],
        config.schedule(),
    )
    .unwrap();
    let [min, max] = config.weight_range;
    net.randomize_weights(&mut rng, min, max);

    let input = Tensor::from_rows(&[&[1.0, 0.0]]).unwrap();
    let target = Tensor::from_rows(&[&[1.0]]).unwrap();
    net.forward(&input).unwrap();
    let before = net.error(&target).unwrap();
    for i in 0..50 {
        net.train(i, &input, &target).unwrap();
    }
    net.forward(&input).unwrap();
    assert!(net.error(&target).unwrap() < before);
}
