use std::sync::Arc;

use approx::assert_abs_diff_eq;
use deepmatrix::engine::layer::{Convolution, Dense, Pooling};
use deepmatrix::engine::optimizer::{Constant, StepDecay};
use deepmatrix::{
    Activation, Backend, DeepLayer, DeviceBackend, Dimension, EmulatedDevice, Host, Layer, LayerKind, Matrix,
    MatrixError, MatrixMut, Tensor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

// 2-2-2 のシグモイドネットワーク (よく知られた手計算の例)
fn worked_example(backend: Arc<dyn Backend>) -> DeepLayer {
    let mut hidden = Dense::new(2, 2, 1, Activation::Sigmoid);
    hidden
        .set_weights(&Tensor::from_rows(&[&[0.15, 0.25], &[0.20, 0.30], &[0.35, 0.35]]).unwrap())
        .unwrap();
    let mut output = Dense::new(2, 2, 1, Activation::Sigmoid);
    output
        .set_weights(&Tensor::from_rows(&[&[0.40, 0.50], &[0.45, 0.55], &[0.60, 0.60]]).unwrap())
        .unwrap();
    DeepLayer::new(backend, vec![hidden.into(), output.into()], Box::new(Constant(0.5))).unwrap()
}

fn dense_weights(layer: &LayerKind) -> Tensor {
    match layer {
        LayerKind::Dense(dense) => dense.weight_matrix().copy(),
        other => panic!("expected a dense layer, got {}", other.name()),
    }
}

#[test]
fn test_forward_pass_of_worked_example() {
    let mut net = worked_example(Arc::new(Host));
    let input = Tensor::from_rows(&[&[0.05, 0.10]]).unwrap();
    let out = net.forward(&input).unwrap();
    assert_abs_diff_eq!(out.get(0, 0), 0.75137, epsilon = 1e-5);
    assert_abs_diff_eq!(out.get(0, 1), 0.77293, epsilon = 1e-5);

    let target = Tensor::from_rows(&[&[0.01, 0.99]]).unwrap();
    // (0.74137² + 0.21707²) / 2
    assert_abs_diff_eq!(net.error(&target).unwrap(), 0.29837, epsilon = 1e-4);
}

#[test]
fn test_one_training_step_of_worked_example() {
    let mut net = worked_example(Arc::new(Host));
    let input = Tensor::from_rows(&[&[0.05, 0.10]]).unwrap();
    let target = Tensor::from_rows(&[&[0.01, 0.99]]).unwrap();
    net.train(0, &input, &target).unwrap();

    let output = dense_weights(&net.layers()[1]);
    assert_abs_diff_eq!(output.get(0, 0), 0.35892, epsilon = 1e-4);
    assert_abs_diff_eq!(output.get(1, 0), 0.40867, epsilon = 1e-4);
    assert_abs_diff_eq!(output.get(0, 1), 0.51130, epsilon = 1e-4);

    // hidden weights are updated with the old output weights
    let hidden = dense_weights(&net.layers()[0]);
    assert_abs_diff_eq!(hidden.get(0, 0), 0.14978, epsilon = 1e-4);
    assert_abs_diff_eq!(hidden.get(1, 0), 0.19956, epsilon = 1e-4);
    assert_abs_diff_eq!(hidden.get(0, 1), 0.24975, epsilon = 1e-4);
}

#[test]
fn test_accumulate_defers_weight_changes() {
    let mut net = worked_example(Arc::new(Host));
    let input = Tensor::from_rows(&[&[0.05, 0.10]]).unwrap();
    let target = Tensor::from_rows(&[&[0.01, 0.99]]).unwrap();
    net.accumulate(0, &input, &target).unwrap();
    assert_eq!(dense_weights(&net.layers()[1]).get(0, 0), 0.40);

    net.accumulate(1, &input, &target).unwrap();
    net.commit().unwrap();
    // 二回分の差分がまとめて適用される
    let w = dense_weights(&net.layers()[1]).get(0, 0);
    assert_abs_diff_eq!(w, 0.40 - 2.0 * 0.04108, epsilon = 1e-3);
}

#[test]
fn test_training_reduces_error() {
    let mut net = worked_example(Arc::new(Host));
    let input = Tensor::from_rows(&[&[0.05, 0.10]]).unwrap();
    let target = Tensor::from_rows(&[&[0.01, 0.99]]).unwrap();
    net.forward(&input).unwrap();
    let before = net.error(&target).unwrap();
    for i in 0..100 {
        net.train(i, &input, &target).unwrap();
    }
    net.forward(&input).unwrap();
    assert!(net.error(&target).unwrap() < before);
}

#[test]
fn test_incompatible_layers_are_rejected() {
    let first = Dense::new(2, 3, 1, Activation::Sigmoid);
    let second = Dense::new(4, 1, 1, Activation::Sigmoid);
    let result = DeepLayer::new(
        Arc::new(Host),
        vec![first.into(), second.into()],
        Box::new(Constant(0.1)),
    );
    assert!(matches!(result, Err(MatrixError::InvalidNetwork(_))));

    // batch sizes must agree too
    let first = Dense::new(2, 3, 2, Activation::Sigmoid);
    let second = Dense::new(3, 1, 1, Activation::Sigmoid);
    let result = DeepLayer::new(
        Arc::new(Host),
        vec![first.into(), second.into()],
        Box::new(Constant(0.1)),
    );
    assert!(matches!(result, Err(MatrixError::InvalidNetwork(_))));

    assert!(matches!(
        DeepLayer::new(Arc::new(Host), Vec::new(), Box::new(Constant(0.1))),
        Err(MatrixError::InvalidNetwork(_))
    ));
}

#[test]
fn test_emulated_device_training_matches_host() {
    let mut host = worked_example(Arc::new(Host));
    let mut device = worked_example(Arc::new(DeviceBackend::new(Arc::new(EmulatedDevice::new(4)))));
    let input = Tensor::from_rows(&[&[0.05, 0.10]]).unwrap();
    let target = Tensor::from_rows(&[&[0.01, 0.99]]).unwrap();
    for i in 0..5 {
        host.train(i, &input, &target).unwrap();
        device.train(i, &input, &target).unwrap();
    }
    for (h, d) in host.layers().iter().zip(device.layers()) {
        assert!(dense_weights(h).approx_equals(&dense_weights(d), 1e-5));
    }
    host.forward(&input).unwrap();
    device.forward(&input).unwrap();
    assert!(host.output().approx_equals(device.output(), 1e-5));
}

#[test]
fn test_convolutional_pipeline_trains() {
    let batch = 2;
    let conv = Convolution::new(Dimension::new(4, 4, 1, batch), 3, 2, 1, 1, Activation::Relu).unwrap();
    let pool = Pooling::new(conv.output_dimension(), 2).unwrap();
    let dense = Dense::new(8, 2, batch, Activation::Sigmoid);
    let mut net = DeepLayer::new(
        Arc::new(Host),
        vec![conv.into(), pool.into(), dense.into()],
        Box::new(StepDecay {
            initial: 0.5,
            factor: 0.5,
            every: 100,
        }),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    net.randomize_weights(&mut rng, -0.5, 0.5);

    let mut input = Tensor::new(Dimension::new(4, 4, 1, batch));
    let mut target = Tensor::new(Dimension::row_vectors(2, batch));
    for r in 0..4 {
        for c in 0..4 {
            // 左上が明るいサンプルと右下が明るいサンプル
            let v = (r + c) as f32 / 6.0;
            input.set_at(r, c, 0, 0, 1.0 - v);
            input.set_at(r, c, 0, 1, v);
        }
    }
    target.set_at(0, 0, 0, 0, 1.0);
    target.set_at(0, 1, 0, 1, 1.0);

    net.forward(&input).unwrap();
    let before = net.error(&target).unwrap();
    for i in 0..200 {
        net.train(i, &input, &target).unwrap();
    }
    net.forward(&input).unwrap();
    let after = net.error(&target).unwrap();
    assert!(after < before, "error went from {} to {}", before, after);
    assert_eq!(net.output().dimension(), Dimension::row_vectors(2, batch));
}
