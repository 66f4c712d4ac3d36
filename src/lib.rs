//! 4次元テンソルとそのデバイスミラーの上に構築した、層単位のニューラルネットワーク学習エンジン。

pub mod backend;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod logging;
pub mod vis;

pub use backend::{Backend, DeviceBackend, EmulatedDevice, Host};
pub use config::EngineConfig;
pub use engine::{Activation, DeepLayer, Dimension, Layer, LayerKind, Matrix, MatrixMut, Tensor};
pub use error::{MatrixError, Result};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::layer::Dense;
    use crate::engine::optimizer::Constant;

    #[test]
    fn host_network_learns_a_constant() {
        let mut layer = Dense::new(1, 1, 1, Activation::Identity);
        layer
            .set_weights(&Tensor::from_rows(&[&[0.0], &[0.0]]).unwrap())
            .unwrap();
        let mut net = DeepLayer::new(Arc::new(Host), vec![layer.into()], Box::new(Constant(0.1))).unwrap();
        let input = Tensor::from_rows(&[&[1.0]]).unwrap();
        let target = Tensor::from_rows(&[&[2.0]]).unwrap();
        for i in 0..200 {
            net.train(i, &input, &target).unwrap();
        }
        net.forward(&input).unwrap();
        assert!(net.error(&target).unwrap() < 1e-6);
    }
}
