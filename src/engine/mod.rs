pub mod activation;
pub mod cell;
pub mod dimension;
pub mod layer;
pub mod matrix;
pub mod network;
pub mod optimizer;
pub mod tensor;
pub mod view;

pub use activation::Activation;
pub use cell::Cell;
pub use dimension::Dimension;
pub use layer::{Layer, LayerKind};
pub use matrix::{Matrix, MatrixMut};
pub use network::DeepLayer;
pub use tensor::Tensor;
