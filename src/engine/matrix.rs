use crate::engine::cell::Cell;
use crate::engine::dimension::Dimension;
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// 読み取り専用のテンソルインターフェース。
///
/// `Tensor` とそのビュー (転置・部分範囲・形状変換・ゼロパディング) が実装します。
/// ビューはソースを所有せず、参照を通して読み書きを委譲します。
/// 座標は常に論理的な `(row, column, slice, hyperSlice)` で、範囲外の読み取りは
/// エラーではなく `0.0` を返します。
pub trait Matrix {
    fn dimension(&self) -> Dimension;

    /// Virtual zero border on rows and columns.
    fn zero_padding(&self) -> usize {
        0
    }

    fn is_transposed(&self) -> bool {
        false
    }

    /// Reads one cell; out-of-range coordinates read as `0.0`.
    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32;

    /// The owning tensor behind this value when its storage layout can be
    /// used directly, together with the effective transposition flag.
    fn storage(&self) -> Option<(&Tensor, bool)> {
        None
    }

    fn get(&self, r: usize, c: usize) -> f32 {
        self.at(r, c, 0, 0)
    }

    fn rows(&self) -> usize {
        self.dimension().rows()
    }
    fn columns(&self) -> usize {
        self.dimension().columns()
    }
    fn slices(&self) -> usize {
        self.dimension().slices()
    }
    fn hyper_slices(&self) -> usize {
        self.dimension().hyper_slices()
    }

    /// Reads in padded coordinates: `(r, c)` are offset by `zero_padding()`,
    /// so the border of width `zero_padding()` reads as zero.
    fn get_padded(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        let p = self.zero_padding();
        match (r.checked_sub(p), c.checked_sub(p)) {
            (Some(r), Some(c)) => self.at(r, c, s, h),
            _ => 0.0,
        }
    }

    /// 論理的な内容を新しい `Tensor` に実体化する
    fn copy(&self) -> Tensor {
        let dim = self.dimension();
        let mut out = Tensor::with_padding(dim, self.zero_padding());
        {
            let values = out.values_mut();
            for (i, v) in values.iter_mut().enumerate() {
                let (r, c, s, h) = dim.coordinates(i);
                *v = self.at(r, c, s, h);
            }
        }
        out
    }

    /// Visits every cell in `(hyperSlice, slice, row, column)` nesting order.
    fn iterate_cells(&self, callback: &mut dyn FnMut(usize, usize, usize, usize, f32)) {
        let dim = self.dimension();
        for h in 0..dim.hyper_slices() {
            for s in 0..dim.slices() {
                for r in 0..dim.rows() {
                    for c in 0..dim.columns() {
                        callback(r, c, s, h, self.at(r, c, s, h));
                    }
                }
            }
        }
    }

    fn sum(&self) -> f32 {
        let mut total = 0.0;
        self.iterate_cells(&mut |_, _, _, _, v| total += v);
        total
    }

    /// Largest value, first-seen in storage order on ties.
    fn max(&self) -> Cell {
        extremum(self, None, None, |candidate, best| candidate > best)
    }

    fn min(&self) -> Cell {
        extremum(self, None, None, |candidate, best| candidate < best)
    }

    fn max_in_row(&self, row: usize) -> Cell {
        extremum(self, Some(row), None, |candidate, best| candidate > best)
    }

    fn max_in_column(&self, column: usize) -> Cell {
        extremum(self, None, Some(column), |candidate, best| candidate > best)
    }

    fn min_in_row(&self, row: usize) -> Cell {
        extremum(self, Some(row), None, |candidate, best| candidate < best)
    }

    fn min_in_column(&self, column: usize) -> Cell {
        extremum(self, None, Some(column), |candidate, best| candidate < best)
    }

    /// One maximum per row into a caller-owned, pre-sized slice.
    fn max_per_row(&self, cells: &mut [Cell]) -> Result<()> {
        if cells.len() != self.rows() {
            return Err(MatrixError::Precondition(format!(
                "max_per_row needs {} cells, got {}",
                self.rows(),
                cells.len()
            )));
        }
        for (row, cell) in cells.iter_mut().enumerate() {
            *cell = self.max_in_row(row);
        }
        Ok(())
    }

    fn max_per_column(&self, cells: &mut [Cell]) -> Result<()> {
        if cells.len() != self.columns() {
            return Err(MatrixError::Precondition(format!(
                "max_per_column needs {} cells, got {}",
                self.columns(),
                cells.len()
            )));
        }
        for (column, cell) in cells.iter_mut().enumerate() {
            *cell = self.max_in_column(column);
        }
        Ok(())
    }

    /// 各行の和 (全スライス・ハイパースライスを通して)
    fn sum_per_row(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.rows()];
        self.iterate_cells(&mut |r, _, _, _, v| sums[r] += v);
        sums
    }

    fn sum_per_column(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.columns()];
        self.iterate_cells(&mut |_, c, _, _, v| sums[c] += v);
        sums
    }

    /// Copies row `row` (every column, slice and hyperslice) into row
    /// `target_row` of `target`.
    fn get_row(&self, row: usize, target: &mut dyn MatrixMut, target_row: usize) -> Result<()> {
        let dim = self.dimension();
        let tdim = target.dimension();
        if tdim.columns() != dim.columns() || tdim.depth() != dim.depth() {
            return Err(MatrixError::mismatch("get_row", dim, tdim));
        }
        for h in 0..dim.hyper_slices() {
            for s in 0..dim.slices() {
                for c in 0..dim.columns() {
                    target.set_at(target_row, c, s, h, self.at(row, c, s, h));
                }
            }
        }
        Ok(())
    }

    /// Copies column `column` into column `target_column` of `target`.
    fn get_column(
        &self,
        column: usize,
        target: &mut dyn MatrixMut,
        target_column: usize,
    ) -> Result<()> {
        let dim = self.dimension();
        let tdim = target.dimension();
        if tdim.rows() != dim.rows() || tdim.depth() != dim.depth() {
            return Err(MatrixError::mismatch("get_column", dim, tdim));
        }
        for h in 0..dim.hyper_slices() {
            for s in 0..dim.slices() {
                for r in 0..dim.rows() {
                    target.set_at(r, target_column, s, h, self.at(r, column, s, h));
                }
            }
        }
        Ok(())
    }

    /// Copies hyperslice `hyper_slice` into hyperslice `target_hyper_slice`
    /// of `target`. This is the gather primitive used to assemble batches.
    fn get_hyper_slice(
        &self,
        hyper_slice: usize,
        target: &mut dyn MatrixMut,
        target_hyper_slice: usize,
    ) -> Result<()> {
        let dim = self.dimension();
        let tdim = target.dimension();
        if tdim.rows() != dim.rows()
            || tdim.columns() != dim.columns()
            || tdim.slices() != dim.slices()
        {
            return Err(MatrixError::mismatch("get_hyper_slice", dim, tdim));
        }
        for s in 0..dim.slices() {
            for c in 0..dim.columns() {
                for r in 0..dim.rows() {
                    target.set_at(r, c, s, target_hyper_slice, self.at(r, c, s, hyper_slice));
                }
            }
        }
        Ok(())
    }

    /// Cell-by-cell comparison of the logical contents.
    fn approx_equals(&self, other: &dyn Matrix, tolerance: f32) -> bool {
        if self.dimension() != other.dimension() {
            return false;
        }
        let mut equal = true;
        self.iterate_cells(&mut |r, c, s, h, v| {
            if (v - other.at(r, c, s, h)).abs() > tolerance {
                equal = false;
            }
        });
        equal
    }
}

/// 書き込み可能なテンソルインターフェース
pub trait MatrixMut: Matrix {
    /// Writes one cell; writes outside the logical extent are ignored.
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32);

    fn set(&mut self, r: usize, c: usize, value: f32) {
        self.set_at(r, c, 0, 0, value)
    }

    fn add_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        let current = self.at(r, c, s, h);
        self.set_at(r, c, s, h, current + value);
    }

    /// Replaces every cell with `f(cell)`, visiting each exactly once in
    /// storage order.
    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        let dim = self.dimension();
        for i in 0..dim.size() {
            let (r, c, s, h) = dim.coordinates(i);
            let v = self.at(r, c, s, h);
            self.set_at(r, c, s, h, f(v));
        }
    }

    fn fill(&mut self, value: f32) {
        self.apply_function(&|_| value);
    }

    /// Copies the logical contents of a same-shaped source.
    fn copy_from(&mut self, source: &dyn Matrix) -> Result<()> {
        let dim = self.dimension();
        if source.dimension() != dim {
            return Err(MatrixError::mismatch("copy_from", dim, source.dimension()));
        }
        for i in 0..dim.size() {
            let (r, c, s, h) = dim.coordinates(i);
            self.set_at(r, c, s, h, source.at(r, c, s, h));
        }
        Ok(())
    }

    /// exp every cell, then divide every cell by its row sum.
    fn soft_max_per_row(&mut self) {
        self.apply_function(&f32::exp);
        let dim = self.dimension();
        for h in 0..dim.hyper_slices() {
            for s in 0..dim.slices() {
                for r in 0..dim.rows() {
                    let sum: f32 = (0..dim.columns()).map(|c| self.at(r, c, s, h)).sum();
                    for c in 0..dim.columns() {
                        let v = self.at(r, c, s, h);
                        self.set_at(r, c, s, h, v / sum);
                    }
                }
            }
        }
    }

    /// exp every cell, then divide every cell by its column sum.
    fn soft_max_per_column(&mut self) {
        self.apply_function(&f32::exp);
        let dim = self.dimension();
        for h in 0..dim.hyper_slices() {
            for s in 0..dim.slices() {
                for c in 0..dim.columns() {
                    let sum: f32 = (0..dim.rows()).map(|r| self.at(r, c, s, h)).sum();
                    for r in 0..dim.rows() {
                        let v = self.at(r, c, s, h);
                        self.set_at(r, c, s, h, v / sum);
                    }
                }
            }
        }
    }
}

// ストレージ順 (h, s, c, r) に走査し、最初に見つかったものを優先する
fn extremum<M: Matrix + ?Sized>(
    m: &M,
    row: Option<usize>,
    column: Option<usize>,
    better: impl Fn(f32, f32) -> bool,
) -> Cell {
    let dim = m.dimension();
    let rows = match row {
        Some(r) => r..r + 1,
        None => 0..dim.rows(),
    };
    let columns = match column {
        Some(c) => c..c + 1,
        None => 0..dim.columns(),
    };
    let mut best: Option<Cell> = None;
    for h in 0..dim.hyper_slices() {
        for s in 0..dim.slices() {
            for c in columns.clone() {
                for r in rows.clone() {
                    let v = m.at(r, c, s, h);
                    match best {
                        Some(ref b) if !better(v, b.value) => {}
                        _ => best = Some(Cell::new(r, c, v)),
                    }
                }
            }
        }
    }
    best.unwrap_or_default()
}

macro_rules! delegate_matrix {
    ($($ty:ty),*) => {$(
        impl<M: Matrix + ?Sized> Matrix for $ty {
            fn dimension(&self) -> Dimension {
                (**self).dimension()
            }
            fn zero_padding(&self) -> usize {
                (**self).zero_padding()
            }
            fn is_transposed(&self) -> bool {
                (**self).is_transposed()
            }
            fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
                (**self).at(r, c, s, h)
            }
            fn storage(&self) -> Option<(&Tensor, bool)> {
                (**self).storage()
            }
            fn copy(&self) -> Tensor {
                (**self).copy()
            }
            fn get_row(&self, row: usize, target: &mut dyn MatrixMut, target_row: usize) -> Result<()> {
                (**self).get_row(row, target, target_row)
            }
            fn get_column(&self, column: usize, target: &mut dyn MatrixMut, target_column: usize) -> Result<()> {
                (**self).get_column(column, target, target_column)
            }
        }
    )*};
}

delegate_matrix!(&M, &mut M);

impl<M: MatrixMut + ?Sized> MatrixMut for &mut M {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        (**self).set_at(r, c, s, h, value)
    }
    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        (**self).apply_function(f)
    }
}
