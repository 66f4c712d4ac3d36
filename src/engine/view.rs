//! コピーせずにテンソルを読み書きするためのビュー。
//!
//! ビューはソースへの参照 (`&Tensor`, `&mut Tensor`, 別のビューなど) を保持し、
//! 自分の論理座標からソースの座標を計算して委譲します。`&mut` を渡せば
//! 書き込み可能なビューになります。

use crate::engine::dimension::Dimension;
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// Swaps rows and columns on every access.
#[derive(Debug)]
pub struct TransposedView<M> {
    source: M,
}

impl<M: Matrix> TransposedView<M> {
    pub fn new(source: M) -> Self {
        Self { source }
    }

    pub fn into_inner(self) -> M {
        self.source
    }
}

impl<M: Matrix> Matrix for TransposedView<M> {
    fn dimension(&self) -> Dimension {
        self.source.dimension().transposed()
    }

    fn zero_padding(&self) -> usize {
        self.source.zero_padding()
    }

    fn is_transposed(&self) -> bool {
        !self.source.is_transposed()
    }

    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        self.source.at(c, r, s, h)
    }

    fn storage(&self) -> Option<(&Tensor, bool)> {
        self.source
            .storage()
            .map(|(tensor, transposed)| (tensor, !transposed))
    }

    fn get_row(&self, row: usize, target: &mut dyn MatrixMut, target_row: usize) -> Result<()> {
        let mut target = TransposedView::new(target);
        self.source.get_column(row, &mut target, target_row)
    }

    fn get_column(
        &self,
        column: usize,
        target: &mut dyn MatrixMut,
        target_column: usize,
    ) -> Result<()> {
        let mut target = TransposedView::new(target);
        self.source.get_row(column, &mut target, target_column)
    }
}

impl<M: MatrixMut> MatrixMut for TransposedView<M> {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        self.source.set_at(c, r, s, h, value)
    }

    // 要素ごとの関数は位置に依存しないので、ソースの格納順で適用できる
    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        self.source.apply_function(f)
    }
}

/// Rectangular window starting at `(row_base, column_base, slice_base)`.
///
/// The extent is clamped so that it never exceeds what remains of the source.
#[derive(Debug)]
pub struct SubRangeView<M> {
    source: M,
    row_base: usize,
    column_base: usize,
    slice_base: usize,
    dim: Dimension,
}

impl<M: Matrix> SubRangeView<M> {
    pub fn new(
        source: M,
        (row_base, column_base, slice_base): (usize, usize, usize),
        (rows, columns, slices): (usize, usize, usize),
    ) -> Result<Self> {
        let src = source.dimension();
        if row_base >= src.rows() || column_base >= src.columns() || slice_base >= src.slices() {
            return Err(MatrixError::InvalidView(format!(
                "sub-range base ({}, {}, {}) outside {}",
                row_base, column_base, slice_base, src
            )));
        }
        let rows = rows.min(src.rows() - row_base);
        let columns = columns.min(src.columns() - column_base);
        let slices = slices.min(src.slices() - slice_base);
        if rows == 0 || columns == 0 || slices == 0 {
            return Err(MatrixError::InvalidView("sub-range view is empty".into()));
        }
        Ok(Self {
            source,
            row_base,
            column_base,
            slice_base,
            dim: Dimension::new(rows, columns, slices, src.hyper_slices()),
        })
    }
}

impl<M: Matrix> Matrix for SubRangeView<M> {
    fn dimension(&self) -> Dimension {
        self.dim
    }

    fn is_transposed(&self) -> bool {
        self.source.is_transposed()
    }

    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        if !self.dim.contains(r, c, s, h) {
            return 0.0;
        }
        self.source
            .at(r + self.row_base, c + self.column_base, s + self.slice_base, h)
    }
}

impl<M: MatrixMut> MatrixMut for SubRangeView<M> {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        if !self.dim.contains(r, c, s, h) {
            return;
        }
        self.source.set_at(
            r + self.row_base,
            c + self.column_base,
            s + self.slice_base,
            h,
            value,
        )
    }
}

/// Reinterprets each hyperslice under another `(rows, columns, slices)`
/// triple with the same extent.
#[derive(Debug)]
pub struct ReshapeView<M> {
    source: M,
    dim: Dimension,
}

impl<M: Matrix> ReshapeView<M> {
    pub fn new(source: M, rows: usize, columns: usize, slices: usize) -> Result<Self> {
        let src = source.dimension();
        if rows * columns * slices != src.hyper_slice_size() {
            return Err(MatrixError::InvalidView(format!(
                "cannot view {} as {}x{}x{}: hyperslice extent {} != {}",
                src,
                rows,
                columns,
                slices,
                src.hyper_slice_size(),
                rows * columns * slices
            )));
        }
        Ok(Self {
            source,
            dim: Dimension::new(rows, columns, slices, src.hyper_slices()),
        })
    }

    /// Views `source` with the shape of `dim`, which must have the same
    /// per-hyperslice extent and hyperslice count.
    pub fn like(source: M, dim: Dimension) -> Result<Self> {
        if source.hyper_slices() != dim.hyper_slices() {
            return Err(MatrixError::InvalidView(format!(
                "cannot view {} as {}",
                source.dimension(),
                dim
            )));
        }
        Self::new(source, dim.rows(), dim.columns(), dim.slices())
    }

    fn source_coordinates(&self, r: usize, c: usize, s: usize) -> (usize, usize, usize) {
        let i = self.dim.index(r, c, s, 0);
        let (sr, sc, ss, _) = self.source.dimension().coordinates(i);
        (sr, sc, ss)
    }
}

impl<M: Matrix> Matrix for ReshapeView<M> {
    fn dimension(&self) -> Dimension {
        self.dim
    }

    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        if !self.dim.contains(r, c, s, h) {
            return 0.0;
        }
        let (sr, sc, ss) = self.source_coordinates(r, c, s);
        self.source.at(sr, sc, ss, h)
    }
}

impl<M: MatrixMut> MatrixMut for ReshapeView<M> {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        if !self.dim.contains(r, c, s, h) {
            return;
        }
        let (sr, sc, ss) = self.source_coordinates(r, c, s);
        self.source.set_at(sr, sc, ss, h, value)
    }

    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        self.source.apply_function(f)
    }
}

/// Reports a virtual zero border; reads and writes go to the source as-is.
#[derive(Debug)]
pub struct PaddedView<M> {
    source: M,
    padding: usize,
}

impl<M: Matrix> PaddedView<M> {
    pub fn new(source: M, padding: usize) -> Self {
        Self { source, padding }
    }
}

impl<M: Matrix> Matrix for PaddedView<M> {
    fn dimension(&self) -> Dimension {
        self.source.dimension()
    }

    fn zero_padding(&self) -> usize {
        self.padding
    }

    fn is_transposed(&self) -> bool {
        self.source.is_transposed()
    }

    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        self.source.at(r, c, s, h)
    }

    fn storage(&self) -> Option<(&Tensor, bool)> {
        self.source.storage()
    }
}

impl<M: MatrixMut> MatrixMut for PaddedView<M> {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        self.source.set_at(r, c, s, h, value)
    }

    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        self.source.apply_function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Tensor {
        Tensor::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap()
    }

    #[test]
    fn sub_range_clamps_extent() {
        let t = grid();
        let view = SubRangeView::new(&t, (1, 1, 0), (5, 5, 1)).unwrap();
        assert_eq!(view.dimension(), Dimension::matrix(1, 2));
        assert_eq!(view.get(0, 0), 5.0);
        assert_eq!(view.get(0, 1), 6.0);
        assert_eq!(view.get(0, 2), 0.0);
    }

    #[test]
    fn sub_range_writes_translate_coordinates() {
        let mut t = grid();
        {
            let mut view = SubRangeView::new(&mut t, (0, 1, 0), (2, 2, 1)).unwrap();
            view.set(1, 1, 60.0);
        }
        assert_eq!(t.get(1, 2), 60.0);
    }

    #[test]
    fn sub_range_base_outside_source_is_rejected() {
        let t = grid();
        assert!(SubRangeView::new(&t, (2, 0, 0), (1, 1, 1)).is_err());
    }

    #[test]
    fn reshape_requires_matching_hyperslice_extent() {
        let t = grid();
        assert!(ReshapeView::new(&t, 4, 1, 1).is_err());
        let flat = ReshapeView::new(&t, 1, 6, 1).unwrap();
        // storage order is column-major: 1, 4, 2, 5, 3, 6
        assert_eq!(flat.get(0, 1), 4.0);
        assert_eq!(flat.get(0, 4), 3.0);
    }

    #[test]
    fn transposed_get_row_reads_source_column() {
        let t = grid();
        let view = TransposedView::new(&t);
        let mut target = Tensor::new(Dimension::matrix(1, 2));
        view.get_row(2, &mut target, 0).unwrap();
        assert_eq!(target.to_vec(), vec![3.0, 6.0]);
    }
}
