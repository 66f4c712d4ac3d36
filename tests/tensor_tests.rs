use approx::assert_abs_diff_eq;
use deepmatrix::engine::cell::Cell;
use deepmatrix::{Dimension, Matrix, MatrixError, MatrixMut, Tensor};

#[test]
fn test_set_get_roundtrip() {
    let dim = Dimension::new(3, 2, 2, 2);
    let mut t = Tensor::new(dim);
    for i in 0..dim.size() {
        let (r, c, s, h) = dim.coordinates(i);
        t.set_at(r, c, s, h, i as f32 * 0.5);
    }
    for i in 0..dim.size() {
        let (r, c, s, h) = dim.coordinates(i);
        assert_eq!(t.at(r, c, s, h), i as f32 * 0.5);
    }
    // storage order is the linear index formula
    assert_eq!(t.to_vec()[dim.index(2, 1, 1, 1)], dim.index(2, 1, 1, 1) as f32 * 0.5);
}

#[test]
fn test_copy_is_independent() {
    let mut t = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
    let copy = t.copy();
    t.set(0, 0, 100.0);
    assert_eq!(copy.get(0, 0), 1.0);
    assert!(copy.approx_equals(&Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap(), 0.0));
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let mut t = Tensor::from_rows(&[&[1.0, 2.0, 3.0], &[-5.0, 0.0, 5.0]]).unwrap();
    t.soft_max_per_row();
    for sum in t.sum_per_row() {
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
    }
    assert!(t.get(0, 2) > t.get(0, 1));
}

#[test]
fn test_softmax_columns_sum_to_one() {
    let mut t = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0], &[0.0, 0.0]]).unwrap();
    t.soft_max_per_column();
    for sum in t.sum_per_column() {
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
    }
}

#[test]
fn test_extremum_ties_report_first_seen() {
    let t = Tensor::from_rows(&[&[1.0, 5.0], &[5.0, 0.0]]).unwrap();
    // storage order is column-major: (1,0) is visited before (0,1)
    let max = t.max();
    assert_eq!((max.row, max.column, max.value), (1, 0, 5.0));
    let min = t.min();
    assert_eq!((min.row, min.column), (1, 1));
    assert_eq!(t.max_in_row(0).column, 1);
    assert_eq!(t.min_in_column(0).row, 0);
}

#[test]
fn test_max_per_row_requires_presized_cells() {
    let t = Tensor::from_rows(&[&[1.0, 2.0], &[4.0, 3.0]]).unwrap();
    let mut cells = vec![Cell::default(); 2];
    t.max_per_row(&mut cells).unwrap();
    assert_eq!(cells[0].column, 1);
    assert_eq!(cells[1].column, 0);

    let mut wrong = vec![Cell::default(); 3];
    assert!(matches!(
        t.max_per_row(&mut wrong),
        Err(MatrixError::Precondition(_))
    ));
}

#[test]
fn test_hyper_slice_gather() {
    let samples = Tensor::from_vec(Dimension::new(1, 2, 1, 3), vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
    let mut batch = Tensor::new(Dimension::new(1, 2, 1, 2));
    samples.get_hyper_slice(2, &mut batch, 0).unwrap();
    samples.get_hyper_slice(0, &mut batch, 1).unwrap();
    assert_eq!(batch.to_vec(), vec![3.0, 3.0, 1.0, 1.0]);
}

#[test]
fn test_get_row_into_target_offset() {
    let t = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
    let mut target = Tensor::new(Dimension::matrix(3, 2));
    t.get_row(1, &mut target, 2).unwrap();
    assert_eq!(target.get(2, 0), 3.0);
    assert_eq!(target.get(2, 1), 4.0);
    assert_eq!(target.get(0, 0), 0.0);
}

#[test]
fn test_row_vector_reinterpretation_roundtrip() {
    let flat = Tensor::from_vec(Dimension::row_vectors(8, 2), (0..16).map(|v| v as f32).collect()).unwrap();
    let mut grid = Tensor::new(Dimension::new(2, 2, 2, 2));
    flat.row_vector_to_matrix(&mut grid).unwrap();
    // flat index 5 of sample 1 -> (r=1, c=0, s=1)
    assert_eq!(grid.at(1, 0, 1, 1), 13.0);

    let mut back = Tensor::new(Dimension::row_vectors(8, 2));
    grid.matrix_to_row_vector(&mut back).unwrap();
    assert_eq!(back, flat);

    let mut wrong = Tensor::new(Dimension::new(3, 3, 1, 2));
    assert!(flat.row_vector_to_matrix(&mut wrong).is_err());
}

#[test]
fn test_multiply_validates_inner_dimension() {
    let a = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
    let b = Tensor::from_rows(&[&[5.0, 6.0], &[7.0, 8.0]]).unwrap();
    let c = a.multiply(&b).unwrap();
    assert_eq!(c, Tensor::from_rows(&[&[19.0, 22.0], &[43.0, 50.0]]).unwrap());

    let v = Tensor::new(Dimension::matrix(3, 1));
    assert!(matches!(
        a.multiply(&v),
        Err(MatrixError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_iterate_cells_order() {
    let t = Tensor::new(Dimension::new(2, 2, 2, 1));
    let mut visited = Vec::new();
    t.iterate_cells(&mut |r, c, s, _h, _v| visited.push((s, r, c)));
    assert_eq!(visited[0], (0, 0, 0));
    assert_eq!(visited[1], (0, 0, 1));
    assert_eq!(visited[2], (0, 1, 0));
    assert_eq!(visited[4], (1, 0, 0));
}

#[test]
fn test_apply_function_visits_every_cell() {
    let mut t = Tensor::filled(Dimension::new(2, 3, 2, 2), 2.0);
    t.apply_function(&|x| x * x);
    assert_eq!(t.sum(), 4.0 * 24.0);
}
