use std::path::Path;

use image::{ImageBuffer, Luma};

use crate::engine::matrix::Matrix;
use crate::error::Result;

/// Saves every (slice, hyperslice) plane of `weights` side by side as a
/// grayscale PNG, separated by a one pixel gap.
///
/// Values are normalized to [0, 255] between `min()` and `max()`.
pub fn save_weights_png(weights: &dyn Matrix, path: impl AsRef<Path>) -> Result<()> {
    let dim = weights.dimension();
    let (min, max) = (weights.min().value, weights.max().value);
    let range = if (max - min).abs() < 1e-6 { 1.0 } else { max - min };

    let (rows, columns, planes) = (dim.rows(), dim.columns(), dim.depth());
    let width = (planes * (columns + 1) - 1) as u32;
    let height = rows as u32;
    let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        let (x, r) = (x as usize, y as usize);
        let (z, c) = (x / (columns + 1), x % (columns + 1));
        if c == columns {
            return Luma([0]);
        }
        let (s, h) = (z % dim.slices(), z / dim.slices());
        let v = (weights.at(r, c, s, h) - min) / range;
        Luma([(v * 255.0).round() as u8])
    });
    img.save(path)?;
    Ok(())
}
