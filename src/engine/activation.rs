use serde::{Deserialize, Serialize};

/// 活性化関数。
///
/// 導関数は入力ではなく出力 `o = f(x)` で評価する (逆伝播では出力しか残っていないため)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    /// Softmax over each row of every plane. Its derivative passes errors
    /// through unchanged, as used with a cross-entropy error.
    Softmax,
}

impl Activation {
    /// Cell-wise part of the activation; `Softmax` only exponentiates here,
    /// the row normalization is applied by the caller.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::Softmax => x.exp(),
        }
    }

    /// f'(x) expressed through the output `o = f(x)`.
    pub fn derivative(self, output: f32) -> f32 {
        match self {
            Activation::Identity | Activation::Softmax => 1.0,
            Activation::Sigmoid => output * (1.0 - output),
            Activation::Tanh => 1.0 - output * output,
            Activation::Relu => {
                if output > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn is_row_normalized(self) -> bool {
        self == Activation::Softmax
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
