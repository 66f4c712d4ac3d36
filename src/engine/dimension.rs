use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// 4次元の反復空間 (rows × columns × slices × hyperSlices)。
///
/// 生成後に変更されることはありません。hyperSlices はバッチ次元です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Extents")]
pub struct Dimension {
    rows: usize,
    columns: usize,
    slices: usize,
    hyper_slices: usize,
}

// 逆シリアライズ時も `new` と同じ検証を通す
#[derive(Deserialize)]
struct Extents {
    rows: usize,
    columns: usize,
    slices: usize,
    hyper_slices: usize,
}

impl TryFrom<Extents> for Dimension {
    type Error = MatrixError;

    fn try_from(e: Extents) -> Result<Self, Self::Error> {
        if e.rows == 0 || e.columns == 0 || e.slices == 0 || e.hyper_slices == 0 {
            return Err(MatrixError::Precondition(format!(
                "Dimension extents must be >= 1, got ({}, {}, {}, {})",
                e.rows, e.columns, e.slices, e.hyper_slices
            )));
        }
        Ok(Self::new(e.rows, e.columns, e.slices, e.hyper_slices))
    }
}

impl Dimension {
    /// Panics if any extent is zero.
    pub fn new(rows: usize, columns: usize, slices: usize, hyper_slices: usize) -> Self {
        assert!(
            rows >= 1 && columns >= 1 && slices >= 1 && hyper_slices >= 1,
            "Dimension extents must be >= 1, got ({}, {}, {}, {})",
            rows,
            columns,
            slices,
            hyper_slices
        );
        Self {
            rows,
            columns,
            slices,
            hyper_slices,
        }
    }

    pub fn matrix(rows: usize, columns: usize) -> Self {
        Self::new(rows, columns, 1, 1)
    }

    /// 1サンプル = 1行ベクトル (1 × n) として、バッチをhyperSlicesに並べた形状
    pub fn row_vectors(columns: usize, batch: usize) -> Self {
        Self::new(1, columns, 1, batch)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn columns(&self) -> usize {
        self.columns
    }
    pub fn slices(&self) -> usize {
        self.slices
    }
    pub fn hyper_slices(&self) -> usize {
        self.hyper_slices
    }

    /// rows * columns
    pub fn slice_size(&self) -> usize {
        self.rows * self.columns
    }

    /// rows * columns * slices, the extent of one hyperslice
    pub fn hyper_slice_size(&self) -> usize {
        self.rows * self.columns * self.slices
    }

    /// Number of (rows × columns) planes, slices * hyperSlices
    pub fn depth(&self) -> usize {
        self.slices * self.hyper_slices
    }

    pub fn size(&self) -> usize {
        self.hyper_slice_size() * self.hyper_slices
    }

    pub fn transposed(&self) -> Self {
        Self::new(self.columns, self.rows, self.slices, self.hyper_slices)
    }

    pub fn contains(&self, r: usize, c: usize, s: usize, h: usize) -> bool {
        r < self.rows && c < self.columns && s < self.slices && h < self.hyper_slices
    }

    /// ストレージ全体で共有される線形インデックス
    pub fn index(&self, r: usize, c: usize, s: usize, h: usize) -> usize {
        r + c * self.rows + s * self.slice_size() + h * self.hyper_slice_size()
    }

    /// `index` の逆写像
    pub fn coordinates(&self, index: usize) -> (usize, usize, usize, usize) {
        let h = index / self.hyper_slice_size();
        let rest = index % self.hyper_slice_size();
        let s = rest / self.slice_size();
        let rest = rest % self.slice_size();
        (rest % self.rows, rest / self.rows, s, h)
    }

    /// Same per-sample extent and batch size; the condition under which one
    /// tensor can be reinterpreted as the other.
    pub fn is_compatible(&self, other: &Dimension) -> bool {
        self.hyper_slice_size() == other.hyper_slice_size()
            && self.hyper_slices == other.hyper_slices
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}",
            self.rows, self.columns, self.slices, self.hyper_slices
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_roundtrip() {
        let dim = Dimension::new(3, 4, 2, 5);
        for i in 0..dim.size() {
            let (r, c, s, h) = dim.coordinates(i);
            assert_eq!(dim.index(r, c, s, h), i);
        }
    }

    #[test]
    fn column_major_within_slice() {
        let dim = Dimension::new(3, 4, 2, 1);
        assert_eq!(dim.index(1, 0, 0, 0), 1);
        assert_eq!(dim.index(0, 1, 0, 0), 3);
        assert_eq!(dim.index(0, 0, 1, 0), 12);
    }

    #[test]
    #[should_panic(expected = "must be >= 1")]
    fn zero_extent_rejected() {
        let _ = Dimension::new(0, 1, 1, 1);
    }

    #[test]
    fn deserialization_rejects_zero_extents() {
        let dim: Dimension =
            serde_json::from_str(r#"{"rows":2,"columns":3,"slices":1,"hyper_slices":4}"#).unwrap();
        assert_eq!(dim, Dimension::new(2, 3, 1, 4));
        assert!(serde_json::from_str::<Dimension>(r#"{"rows":0,"columns":3,"slices":1,"hyper_slices":1}"#).is_err());
    }
}
