//! IDX 形式 (MNIST など) の画像・ラベルファイルの読み込み。
//!
//! ヘッダはビッグエンディアンの `u32` (マジック, 件数, [行, 列]) で、その後に
//! 1バイトずつのサンプルが続きます。gzip 圧縮されたファイルはマジックバイトで
//! 判別して透過的に展開します。

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;

use crate::error::{MatrixError, Result};

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxImages {
    pub rows: usize,
    pub columns: usize,
    pixels: Vec<u8>,
}

impl IdxImages {
    pub fn len(&self) -> usize {
        self.pixels.len() / (self.rows * self.columns)
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Raw pixels of one image, row-major as stored in the file.
    pub fn image(&self, index: usize) -> &[u8] {
        let size = self.rows * self.columns;
        &self.pixels[index * size..(index + 1) * size]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxLabels {
    labels: Vec<u8>,
}

impl IdxLabels {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> u8 {
        self.labels[index]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.labels
    }
}

fn read_all(path: &Path) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut buffer = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(raw)
    }
}

fn check_magic(reader: &mut Cursor<&[u8]>, expected: u32) -> Result<()> {
    let magic = reader.read_u32::<BigEndian>()?;
    if magic != expected {
        return Err(MatrixError::Format(format!(
            "invalid IDX magic number {}, expected {}",
            magic, expected
        )));
    }
    Ok(())
}

// ヘッダの値は信用しない: 実際に残っているバイト数を超える確保はしない
fn read_body(reader: &mut Cursor<&[u8]>, len: Option<usize>) -> Result<Vec<u8>> {
    let remaining = reader.get_ref().len().saturating_sub(reader.position() as usize);
    let len = match len {
        Some(len) if len <= remaining => len,
        Some(len) => {
            return Err(MatrixError::Format(format!(
                "IDX body shorter than {} bytes ({} available)",
                len, remaining
            )))
        }
        None => return Err(MatrixError::Format("IDX header sizes overflow".to_string())),
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

pub fn parse_images(bytes: &[u8]) -> Result<IdxImages> {
    let mut reader = Cursor::new(bytes);
    check_magic(&mut reader, IMAGES_MAGIC)?;
    let count = reader.read_u32::<BigEndian>()? as usize;
    let rows = reader.read_u32::<BigEndian>()? as usize;
    let columns = reader.read_u32::<BigEndian>()? as usize;
    if rows == 0 || columns == 0 {
        return Err(MatrixError::Format(format!("empty image size {}x{}", rows, columns)));
    }
    let pixels = read_body(
        &mut reader,
        count.checked_mul(rows).and_then(|n| n.checked_mul(columns)),
    )?;
    Ok(IdxImages {
        rows,
        columns,
        pixels,
    })
}

pub fn parse_labels(bytes: &[u8]) -> Result<IdxLabels> {
    let mut reader = Cursor::new(bytes);
    check_magic(&mut reader, LABELS_MAGIC)?;
    let count = reader.read_u32::<BigEndian>()? as usize;
    Ok(IdxLabels {
        labels: read_body(&mut reader, Some(count))?,
    })
}

pub fn read_images(path: impl AsRef<Path>) -> Result<IdxImages> {
    parse_images(&read_all(path.as_ref())?)
}

pub fn read_labels(path: impl AsRef<Path>) -> Result<IdxLabels> {
    parse_labels(&read_all(path.as_ref())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn header(magic: u32, dims: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(magic).unwrap();
        for &d in dims {
            bytes.write_u32::<BigEndian>(d).unwrap();
        }
        bytes
    }

    #[test]
    fn images_are_split_per_sample() {
        let mut bytes = header(IMAGES_MAGIC, &[2, 1, 2]);
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let images = parse_images(&bytes).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images.image(1), &[3, 4]);
    }

    #[test]
    fn wrong_magic_is_a_format_error() {
        let bytes = header(LABELS_MAGIC, &[0, 1, 1]);
        assert!(matches!(parse_images(&bytes), Err(MatrixError::Format(_))));
    }

    #[test]
    fn truncated_body_is_a_format_error() {
        let mut bytes = header(LABELS_MAGIC, &[3]);
        bytes.push(7);
        assert!(matches!(parse_labels(&bytes), Err(MatrixError::Format(_))));
    }

    #[test]
    fn overflowing_image_header_is_a_format_error() {
        let bytes = header(IMAGES_MAGIC, &[u32::MAX, u32::MAX, u32::MAX]);
        assert!(matches!(parse_images(&bytes), Err(MatrixError::Format(_))));
    }
}
