//! JSON で記述する実行設定。
//!
//! 設定から組み立てたバックエンドはネットワークに明示的に渡されます
//! (プロセス全体で共有される演算ディスパッチャは存在しません)。

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{Backend, DeviceBackend, EmulatedDevice, Host};
use crate::engine::optimizer::{
    AdamConfig, Constant, ExponentialDecay, LearningRateSchedule, StepDecay,
};
use crate::error::{MatrixError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Host,
    Emulated { block_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant { rate: f32 },
    Step { initial: f32, factor: f32, every: usize },
    Exponential { initial: f32, decay: f32 },
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig::Constant { rate: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub seed: Option<u64>,
    pub learning_rate: ScheduleConfig,
    pub adam: AdamConfig,
    pub weight_range: [f32; 2],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            seed: None,
            learning_rate: ScheduleConfig::default(),
            adam: AdamConfig::default(),
            weight_range: [-0.5, 0.5],
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        if let BackendConfig::Emulated { block_size: 0 } = self.backend {
            return Err(MatrixError::Config("block_size must be positive".into()));
        }
        let [min, max] = self.weight_range;
        if min > max {
            return Err(MatrixError::Config(format!(
                "weight_range [{}, {}] is empty",
                min, max
            )));
        }
        if let ScheduleConfig::Step { every: 0, .. } = self.learning_rate {
            return Err(MatrixError::Config("step schedule needs every >= 1".into()));
        }
        Ok(())
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        let backend: Arc<dyn Backend> = match self.backend {
            BackendConfig::Host => Arc::new(Host::new()),
            BackendConfig::Emulated { block_size } => {
                Arc::new(DeviceBackend::new(Arc::new(EmulatedDevice::new(block_size))))
            }
        };
        info!(backend = backend.name(), "compute backend created");
        backend
    }

    pub fn schedule(&self) -> Box<dyn LearningRateSchedule> {
        match self.learning_rate {
            ScheduleConfig::Constant { rate } => Box::new(Constant(rate)),
            ScheduleConfig::Step {
                initial,
                factor,
                every,
            } => Box::new(StepDecay {
                initial,
                factor,
                every,
            }),
            ScheduleConfig::Exponential { initial, decay } => {
                Box::new(ExponentialDecay { initial, decay })
            }
        }
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
