//! Dense linear-algebra primitives shared across the core.
//!
//! Everything is stored in `nalgebra` dynamic matrices/vectors. The two
//! factorizations whose semantics the ecosystem does not expose (a
//! rank-revealing partial-pivot LU with NaN-filled deficient solves, and a
//! full-pivot LU feeding the echelon form) are implemented here on top of
//! that storage.

pub mod echelon;
pub mod lu;

pub use echelon::Echelonizer;
pub use lu::{FullPivLu, RankRevealingLu};

use nalgebra::{DMatrix, DVector};

/// Infinity norm of a vector; zero for an empty vector.
pub fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Infinity norm over the coefficients of a matrix; zero when empty.
pub fn max_abs(m: &DMatrix<f64>) -> f64 {
    m.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// True when every coefficient is finite.
pub fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Replace non-finite coefficients (NaN or ±inf) by zero, in place.
///
/// Non-finite entries appear after solving against linearly dependent rows;
/// zeroing them turns the affected directions into zero step components.
pub fn scrub_nonfinite(v: &mut DVector<f64>) {
    for x in v.iter_mut() {
        if !x.is_finite() {
            *x = 0.0;
        }
    }
}

/// Collect `v[idx[0]], v[idx[1]], ...` into a new vector.
pub fn gather_vec(v: &DVector<f64>, idx: &[usize]) -> DVector<f64> {
    DVector::from_fn(idx.len(), |i, _| v[idx[i]])
}

/// Write `src[i]` into `dst[idx[i]]` for all `i`.
pub fn scatter_vec(dst: &mut DVector<f64>, idx: &[usize], src: &DVector<f64>) {
    for (i, &j) in idx.iter().enumerate() {
        dst[j] = src[i];
    }
}

/// Collect the columns `idx` of `m` into a new matrix.
pub fn gather_cols(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), idx.len(), |i, j| m[(i, idx[j])])
}

/// Collect the rows `idx` of `m` into a new matrix.
pub fn gather_rows(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(idx.len(), m.ncols(), |i, j| m[(idx[i], j)])
}

/// Collect the submatrix `m[ridx, cidx]` into a new matrix.
pub fn gather_block(m: &DMatrix<f64>, ridx: &[usize], cidx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(ridx.len(), cidx.len(), |i, j| m[(ridx[i], cidx[j])])
}

/// Stack two matrices with equal column counts vertically.
pub fn vstack(top: &DMatrix<f64>, bottom: &DMatrix<f64>) -> DMatrix<f64> {
    debug_assert_eq!(top.ncols(), bottom.ncols());
    let mut out = DMatrix::zeros(top.nrows() + bottom.nrows(), top.ncols());
    out.rows_mut(0, top.nrows()).copy_from(top);
    out.rows_mut(top.nrows(), bottom.nrows()).copy_from(bottom);
    out
}

/// Concatenate two vectors.
pub fn concat(top: &DVector<f64>, bottom: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(top.len() + bottom.len());
    out.rows_mut(0, top.len()).copy_from(top);
    out.rows_mut(top.len(), bottom.len()).copy_from(bottom);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_replaces_nan_and_inf() {
        let mut v = DVector::from_vec(vec![1.0, f64::NAN, f64::INFINITY, -2.0]);
        scrub_nonfinite(&mut v);
        assert_eq!(v, DVector::from_vec(vec![1.0, 0.0, 0.0, -2.0]));
    }

    #[test]
    fn inf_norm_of_empty_is_zero() {
        assert_eq!(inf_norm(&DVector::zeros(0)), 0.0);
    }

    #[test]
    fn gather_and_scatter_roundtrip() {
        let v = DVector::from_vec(vec![10.0, 20.0, 30.0, 40.0]);
        let g = gather_vec(&v, &[3, 1]);
        assert_eq!(g, DVector::from_vec(vec![40.0, 20.0]));

        let mut dst = DVector::zeros(4);
        scatter_vec(&mut dst, &[3, 1], &g);
        assert_eq!(dst, DVector::from_vec(vec![0.0, 20.0, 0.0, 40.0]));
    }
}
