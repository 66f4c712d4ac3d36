use deepmatrix::engine::view::{PaddedView, ReshapeView, SubRangeView, TransposedView};
use deepmatrix::{Dimension, Matrix, MatrixError, MatrixMut, Tensor};

fn grid() -> Tensor {
    Tensor::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap()
}

#[test]
fn test_transpose_of_transpose_is_identity() {
    let t = grid();
    let once = TransposedView::new(&t);
    assert_eq!(once.dimension(), Dimension::matrix(3, 2));
    assert_eq!(once.get(2, 1), 6.0);
    assert!(once.is_transposed());

    let twice = TransposedView::new(once);
    assert!(!twice.is_transposed());
    assert!(twice.approx_equals(&t, 0.0));
    let (storage, transposed) = twice.storage().unwrap();
    assert!(std::ptr::eq(storage, &t));
    assert!(!transposed);
}

#[test]
fn test_transposed_write_lands_in_source() {
    let mut t = grid();
    {
        let mut view = TransposedView::new(&mut t);
        view.set(2, 0, 30.0);
    }
    assert_eq!(t.get(0, 2), 30.0);
}

#[test]
fn test_sub_range_reads_and_writes_offset() {
    let mut t = grid();
    {
        let mut view = SubRangeView::new(&mut t, (1, 1, 0), (1, 2, 1)).unwrap();
        assert_eq!(view.dimension(), Dimension::matrix(1, 2));
        assert_eq!(view.get(0, 1), 6.0);
        view.fill(0.0);
    }
    assert_eq!(t.to_vec(), vec![1.0, 4.0, 2.0, 0.0, 3.0, 0.0]);
}

#[test]
fn test_sub_range_extent_is_clamped() {
    let t = grid();
    let view = SubRangeView::new(&t, (0, 1, 0), (10, 10, 10)).unwrap();
    assert_eq!(view.dimension(), Dimension::matrix(2, 2));
    // 範囲外は 0
    assert_eq!(view.get(0, 5), 0.0);

    assert!(matches!(
        SubRangeView::new(&t, (2, 0, 0), (1, 1, 1)),
        Err(MatrixError::InvalidView(_))
    ));
}

#[test]
fn test_reshape_follows_storage_order() {
    let t = Tensor::from_vec(Dimension::new(1, 6, 1, 2), (0..12).map(|v| v as f32).collect()).unwrap();
    let view = ReshapeView::new(&t, 2, 3, 1).unwrap();
    assert_eq!(view.dimension(), Dimension::new(2, 3, 1, 2));
    // storage index 3 of hyperslice 1 -> (r=1, c=1)
    assert_eq!(view.at(1, 1, 0, 1), 9.0);
    assert_eq!(view.copy().to_vec(), t.to_vec());

    assert!(ReshapeView::new(&t, 4, 2, 1).is_err());
    assert!(ReshapeView::like(&t, Dimension::new(2, 3, 1, 1)).is_err());
}

#[test]
fn test_reshape_view_is_writable() {
    let mut t = Tensor::new(Dimension::row_vectors(4, 1));
    {
        let mut view = ReshapeView::new(&mut t, 2, 2, 1).unwrap();
        view.set(1, 1, 7.0);
    }
    assert_eq!(t.get(0, 3), 7.0);
}

#[test]
fn test_padded_view_reports_border() {
    let t = grid();
    let view = PaddedView::new(&t, 1);
    assert_eq!(view.zero_padding(), 1);
    assert_eq!(view.get_padded(0, 0, 0, 0), 0.0);
    assert_eq!(view.get_padded(1, 1, 0, 0), 1.0);
    assert_eq!(view.get_padded(2, 3, 0, 0), 6.0);
}

#[test]
fn test_get_row_through_transposed_view() {
    let t = grid();
    let view = TransposedView::new(&t);
    let mut target = Tensor::new(Dimension::matrix(1, 2));
    view.get_row(1, &mut target, 0).unwrap();
    assert_eq!(target.to_vec(), vec![2.0, 5.0]);
}
