/// 極値の位置と値 (row, column, value)。
///
/// 繰り返しのreductionで再利用できるように可変にしている。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cell {
    pub row: usize,
    pub column: usize,
    pub value: f32,
}

impl Cell {
    pub fn new(row: usize, column: usize, value: f32) -> Self {
        Self { row, column, value }
    }

    pub fn set(&mut self, row: usize, column: usize, value: f32) {
        self.row = row;
        self.column = column;
        self.value = value;
    }
}
