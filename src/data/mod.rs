pub mod dataset;
pub mod idx;
pub mod loader;

pub use dataset::{Dataset, TensorDataset};
pub use idx::{read_images, read_labels, IdxImages, IdxLabels};
pub use loader::BatchLoader;
