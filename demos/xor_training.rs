use deepmatrix::engine::layer::Dense;
use deepmatrix::logging::init_tracing;
use deepmatrix::{Activation, DeepLayer, Dimension, EngineConfig, Matrix, Tensor};
use tracing::info;

// XOR を 2-4-1 のシグモイドネットワークで学習する (4サンプルを1バッチで)
//
//   cargo run --example xor_training [engine.json]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_json_str(
            r#"{ "seed": 42, "learning_rate": { "kind": "constant", "rate": 2.0 }, "weight_range": [-1.0, 1.0] }"#,
        )?,
    };
    let mut rng = config.rng();

    let batch = 4;
    let mut net = DeepLayer::new(
        config.backend(),
        vec![
            Dense::new(2, 4, batch, Activation::Sigmoid).into(),
            Dense::new(4, 1, batch, Activation::Sigmoid).into(),
        ],
        config.schedule(),
    )?;
    let [min, max] = config.weight_range;
    net.randomize_weights(&mut rng, min, max);

    // 1サンプル = 1ハイパースライス
    let input = Tensor::from_vec(
        Dimension::row_vectors(2, batch),
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
    )?;
    let target = Tensor::from_vec(Dimension::row_vectors(1, batch), vec![0.0, 1.0, 1.0, 0.0])?;

    for iteration in 0..5000 {
        net.train(iteration, &input, &target)?;
        if iteration % 500 == 0 {
            net.forward(&input)?;
            let error = net.error(&target)?;
            info!(iteration, error, "xor");
        }
    }

    let output = net.forward(&input)?;
    for h in 0..batch {
        info!(
            a = input.at(0, 0, 0, h),
            b = input.at(0, 1, 0, h),
            prediction = output.at(0, 0, 0, h),
            "result"
        );
    }
    Ok(())
}
