use std::sync::Arc;

use approx::assert_abs_diff_eq;
use deepmatrix::backend::host::pooled_dimension;
use deepmatrix::backend::AdamStep;
use deepmatrix::engine::view::TransposedView;
use deepmatrix::{
    Activation, Backend, DeviceBackend, Dimension, EmulatedDevice, Host, Matrix, MatrixError,
    MatrixMut, Tensor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ホスト実装と (エミュレートされた) デバイス実装で同じ結果になることを確認する

fn backends() -> (Host, DeviceBackend) {
    (Host::new(), DeviceBackend::new(Arc::new(EmulatedDevice::new(4))))
}

fn random(dim: Dimension, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::random_uniform(dim, -1.0, 1.0, &mut rng)
}

fn random_padded(dim: Dimension, padding: usize, seed: u64) -> Tensor {
    let mut t = Tensor::with_padding(dim, padding);
    let mut rng = StdRng::seed_from_u64(seed);
    t.randomize(&mut rng, -1.0, 1.0);
    t
}

fn assert_same(host: &Tensor, device: &Tensor) {
    assert_eq!(host.dimension(), device.dimension());
    for (h, d) in host.to_vec().iter().zip(device.to_vec()) {
        assert_abs_diff_eq!(*h, d, epsilon = 1e-4);
    }
}

#[test]
fn test_element_wise_operations_match() {
    let (host, device) = backends();
    let dim = Dimension::new(3, 5, 2, 2);
    let (a, b) = (random(dim, 1), random(dim, 2));

    let mut expected = Tensor::new(dim);
    let mut actual = Tensor::new(dim);
    host.dot_add(&a, &b, &mut expected).unwrap();
    device.dot_add(&a, &b, &mut actual).unwrap();
    assert_same(&expected, &actual);

    host.dot_subtract(&a, &b, &mut expected).unwrap();
    device.dot_subtract(&a, &b, &mut actual).unwrap();
    assert_same(&expected, &actual);

    host.dot_multiply(&a, &b, &mut expected).unwrap();
    device.dot_multiply(&a, &b, &mut actual).unwrap();
    assert_same(&expected, &actual);

    host.linear_combination(0.5, &a, -2.0, &b, &mut expected).unwrap();
    device.linear_combination(0.5, &a, -2.0, &b, &mut actual).unwrap();
    assert_same(&expected, &actual);
}

#[test]
fn test_element_wise_shape_mismatch_is_rejected() {
    let (host, device) = backends();
    let a = Tensor::new(Dimension::matrix(2, 3));
    let b = Tensor::new(Dimension::matrix(3, 2));
    let mut out = Tensor::new(Dimension::matrix(2, 3));
    assert!(matches!(
        host.dot_add(&a, &b, &mut out),
        Err(MatrixError::DimensionMismatch { .. })
    ));
    assert!(matches!(
        device.dot_add(&a, &b, &mut out),
        Err(MatrixError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_add_scaled_matches() {
    let (host, device) = backends();
    let dim = Dimension::new(4, 3, 1, 2);
    let source = random(dim, 3);
    let mut expected = random(dim, 4);
    let mut actual = expected.copy();
    host.add_scaled(-0.25, &source, &mut expected).unwrap();
    device.add_scaled(-0.25, &source, &mut actual).unwrap();
    assert_same(&expected, &actual);
}

#[test]
fn test_sgemm_known_product() {
    let (host, device) = backends();
    let a = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
    let b = Tensor::from_rows(&[&[5.0, 6.0], &[7.0, 8.0]]).unwrap();
    let expected = Tensor::from_rows(&[&[19.0, 22.0], &[43.0, 50.0]]).unwrap();
    for backend in [&host as &dyn Backend, &device] {
        let mut c = Tensor::new(Dimension::matrix(2, 2));
        backend.sgemm(1.0, &a, &b, 0.0, &mut c).unwrap();
        assert!(c.approx_equals(&expected, 1e-5), "{}", backend.name());
    }
}

#[test]
fn test_sgemm_transposed_operands_match() {
    let (host, device) = backends();
    let a = random(Dimension::matrix(5, 3), 5);
    let b = random(Dimension::matrix(2, 5), 6);
    let at = TransposedView::new(&a);
    let bt = TransposedView::new(&b);

    let mut expected = random(Dimension::matrix(3, 2), 7);
    let mut actual = expected.copy();
    host.sgemm(0.5, &at, &bt, 1.0, &mut expected).unwrap();
    device.sgemm(0.5, &at, &bt, 1.0, &mut actual).unwrap();
    assert_same(&expected, &actual);

    // 素朴な計算と比較
    let mut naive = 0.0;
    for k in 0..5 {
        naive += a.get(k, 1) * b.get(0, k);
    }
    let mut plain = Tensor::new(Dimension::matrix(3, 2));
    host.sgemm(1.0, &at, &bt, 0.0, &mut plain).unwrap();
    assert_abs_diff_eq!(plain.get(1, 0), naive, epsilon = 1e-5);
}

#[test]
fn test_sgemm_batched_planes_match() {
    let (host, device) = backends();
    // 4 planes of a against one shared b
    let a = random(Dimension::new(3, 4, 2, 2), 8);
    let b = random(Dimension::matrix(4, 5), 9);
    let mut expected = Tensor::new(Dimension::new(3, 5, 2, 2));
    let mut actual = Tensor::new(Dimension::new(3, 5, 2, 2));
    host.sgemm(1.0, &a, &b, 0.0, &mut expected).unwrap();
    device.sgemm(1.0, &a, &b, 0.0, &mut actual).unwrap();
    assert_same(&expected, &actual);

    // a single-plane c accumulates over every plane
    let x = random(Dimension::new(4, 2, 1, 3), 10);
    let d = random(Dimension::new(2, 3, 1, 3), 11);
    let mut expected = Tensor::new(Dimension::matrix(4, 3));
    let mut actual = Tensor::new(Dimension::matrix(4, 3));
    host.sgemm(1.0, &x, &d, 0.0, &mut expected).unwrap();
    device.sgemm(1.0, &x, &d, 0.0, &mut actual).unwrap();
    assert_same(&expected, &actual);

    let mut sum = 0.0;
    for z in 0..3 {
        for k in 0..2 {
            sum += x.at(1, k, 0, z) * d.at(k, 2, 0, z);
        }
    }
    assert_abs_diff_eq!(expected.get(1, 2), sum, epsilon = 1e-5);
}

#[test]
fn test_sgemm_rejects_inner_dimension_mismatch() {
    let (host, device) = backends();
    let a = Tensor::new(Dimension::matrix(2, 3));
    let b = Tensor::new(Dimension::matrix(2, 2));
    let mut c = Tensor::new(Dimension::matrix(2, 2));
    assert!(host.sgemm(1.0, &a, &b, 0.0, &mut c).is_err());
    assert!(device.sgemm(1.0, &a, &b, 0.0, &mut c).is_err());
}

#[test]
fn test_activation_matches() {
    let (host, device) = backends();
    let dim = Dimension::new(1, 6, 1, 3);
    for activation in [
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::Relu,
        Activation::Identity,
        Activation::Softmax,
    ] {
        let mut expected = random(dim, 12);
        let mut actual = expected.copy();
        host.activate(activation, &mut expected).unwrap();
        device.activate(activation, &mut actual).unwrap();
        assert_same(&expected, &actual);

        let errors = random(dim, 13);
        let mut expected_deltas = Tensor::new(dim);
        let mut actual_deltas = Tensor::new(dim);
        host.activation_delta(activation, &expected, &errors, &mut expected_deltas)
            .unwrap();
        device
            .activation_delta(activation, &actual, &errors, &mut actual_deltas)
            .unwrap();
        assert_same(&expected_deltas, &actual_deltas);
    }
}

#[test]
fn test_correlation_with_padding_and_stride_matches() {
    let (host, device) = backends();
    let (padding, stride, fs) = (1, 2, 3);
    let in_dim = Dimension::new(6, 5, 2, 2);
    let features = 3;
    let input = random_padded(in_dim, padding, 14);
    let filters = random(Dimension::new(fs, fs, features * in_dim.slices(), 1), 15);

    // (6 + 2 - 3) / 2 + 1 = 3, (5 + 2 - 3) / 2 + 1 = 3
    let out_dim = Dimension::new(3, 3, features, 2);
    let mut expected = Tensor::new(out_dim);
    let mut actual = Tensor::new(out_dim);
    host.correlate(&input, &filters, stride, &mut expected).unwrap();
    device.correlate(&input, &filters, stride, &mut actual).unwrap();
    assert_same(&expected, &actual);

    let deltas = random(out_dim, 16);
    let mut expected_errors = Tensor::with_padding(in_dim, padding);
    let mut actual_errors = Tensor::with_padding(in_dim, padding);
    host.backprop_correlate(&deltas, &filters, stride, &mut expected_errors)
        .unwrap();
    device
        .backprop_correlate(&deltas, &filters, stride, &mut actual_errors)
        .unwrap();
    assert_same(&expected_errors, &actual_errors);

    let mut expected_gradients = random(filters.dimension(), 17);
    let mut actual_gradients = expected_gradients.copy();
    host.correlate_weights(&input, &deltas, stride, -0.1, &mut expected_gradients)
        .unwrap();
    device
        .correlate_weights(&input, &deltas, stride, -0.1, &mut actual_gradients)
        .unwrap();
    assert_same(&expected_gradients, &actual_gradients);
}

#[test]
fn test_correlation_known_values() {
    let host = Host::new();
    // 3x3 の入力、パディング 1、全て 1 のフィルタ: 各出力は近傍の和
    let mut input = Tensor::with_padding(Dimension::matrix(3, 3), 1);
    for r in 0..3 {
        for c in 0..3 {
            input.set(r, c, 1.0);
        }
    }
    let filters = Tensor::filled(Dimension::matrix(3, 3), 1.0);
    let mut out = Tensor::new(Dimension::matrix(3, 3));
    host.correlate(&input, &filters, 1, &mut out).unwrap();
    assert_eq!(out.get(0, 0), 4.0);
    assert_eq!(out.get(1, 1), 9.0);
    assert_eq!(out.get(2, 1), 6.0);

    // the errors of a padded input must carry the same padding
    let deltas = Tensor::filled(Dimension::matrix(3, 3), 1.0);
    let mut errors = Tensor::with_padding(Dimension::matrix(3, 3), 1);
    host.backprop_correlate(&deltas, &filters, 1, &mut errors).unwrap();
    assert_eq!(errors.get(0, 0), 4.0);
    assert_eq!(errors.get(1, 1), 9.0);
}

#[test]
fn test_correlation_rejects_oversized_filter() {
    let host = Host::new();
    let input = Tensor::new(Dimension::matrix(2, 2));
    let filters = Tensor::new(Dimension::matrix(3, 3));
    let mut out = Tensor::new(Dimension::matrix(1, 1));
    assert!(matches!(
        host.correlate(&input, &filters, 1, &mut out),
        Err(MatrixError::Precondition(_))
    ));
}

#[test]
fn test_max_pool_matches() {
    let (host, device) = backends();
    let in_dim = Dimension::new(6, 4, 2, 2);
    let input = random(in_dim, 18);
    let out_dim = pooled_dimension(in_dim, 2);
    assert_eq!(out_dim, Dimension::new(3, 2, 2, 2));

    let (mut expected, mut expected_mask) = (Tensor::new(out_dim), Tensor::new(out_dim));
    let (mut actual, mut actual_mask) = (Tensor::new(out_dim), Tensor::new(out_dim));
    host.max_pool(&input, 2, &mut expected, &mut expected_mask).unwrap();
    device.max_pool(&input, 2, &mut actual, &mut actual_mask).unwrap();
    assert_same(&expected, &actual);
    assert_same(&expected_mask, &actual_mask);

    let deltas = random(out_dim, 19);
    let mut expected_errors = random(in_dim, 20);
    let mut actual_errors = random(in_dim, 21);
    host.backprop_max_pool(&deltas, &expected_mask, &mut expected_errors)
        .unwrap();
    device
        .backprop_max_pool(&deltas, &actual_mask, &mut actual_errors)
        .unwrap();
    assert_same(&expected_errors, &actual_errors);
    // 勝者以外は 0
    let non_zero = expected_errors.to_vec().iter().filter(|v| **v != 0.0).count();
    assert!(non_zero <= out_dim.size());
}

#[test]
fn test_adam_matches() {
    let (host, device) = backends();
    let dim = Dimension::matrix(3, 4);
    let gradients = random(dim, 22);
    let step = AdamStep {
        beta1: 0.9,
        beta2: 0.999,
        factor: -0.01,
        epsilon: 1e-8,
    };

    let mut expected = (random(dim, 23), Tensor::new(dim), Tensor::new(dim));
    let mut actual = (expected.0.copy(), Tensor::new(dim), Tensor::new(dim));
    for _ in 0..3 {
        host.adam(&mut expected.0, &gradients, &mut expected.1, &mut expected.2, step)
            .unwrap();
        device
            .adam(&mut actual.0, &gradients, &mut actual.1, &mut actual.2, step)
            .unwrap();
    }
    assert_same(&expected.0, &actual.0);
    assert_same(&expected.1, &actual.1);
    assert_same(&expected.2, &actual.2);
}

#[test]
fn test_misaligned_block_size_still_matches() {
    // ブロックサイズ 3 でもパディングで整列される
    let host = Host::new();
    let device = DeviceBackend::new(Arc::new(EmulatedDevice::new(3)));
    let a = random(Dimension::new(7, 2, 1, 1), 24);
    let b = random(Dimension::new(2, 5, 1, 1), 25);
    let mut expected = Tensor::new(Dimension::matrix(7, 5));
    let mut actual = Tensor::new(Dimension::matrix(7, 5));
    host.sgemm(1.0, &a, &b, 0.0, &mut expected).unwrap();
    device.sgemm(1.0, &a, &b, 0.0, &mut actual).unwrap();
    assert_same(&expected, &actual);
}
