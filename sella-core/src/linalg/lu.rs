//! LU factorizations with rank detection.
//!
//! Two hand-rolled variants live here:
//!
//! - [`RankRevealingLu`]: partial-pivot LU of a square matrix whose solve
//!   only uses the top-left `rank × rank` triangular blocks and fills the
//!   remaining solution components with NaN. Downstream code detects those
//!   sentinels and turns the affected directions into zero steps, which is
//!   how linearly dependent constraint rows degrade gracefully instead of
//!   aborting the factorization.
//! - [`FullPivLu`]: full-pivot LU of a rectangular matrix, the backbone of
//!   the echelon form `R·W·Q = [I S]`. Exposes the packed factors, both
//!   permutations and the largest pivot so the echelonizer can build `R`
//!   and `S` by triangular substitution.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;

/// Rank-revealing LU decomposition of a square matrix with partial pivoting.
#[derive(Debug, Clone)]
pub struct RankRevealingLu {
    /// Packed factors: strict lower part holds the multipliers of the unit
    /// lower-triangular L, upper part (diagonal included) holds U.
    lu: DMatrix<f64>,

    /// Row permutation: row `k` of `P·A` is row `p[k]` of `A`.
    p: Vec<usize>,

    /// Numerical rank detected from the diagonal of U.
    rank: usize,
}

impl Default for RankRevealingLu {
    fn default() -> Self {
        Self { lu: DMatrix::zeros(0, 0), p: Vec::new(), rank: 0 }
    }
}

impl RankRevealingLu {
    /// Construct an empty decomposition; call [`decompose`](Self::decompose)
    /// before solving.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no matrix has been decomposed yet.
    pub fn is_empty(&self) -> bool {
        self.lu.is_empty()
    }

    /// The numerical rank of the last decomposed matrix.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Compute the partial-pivot LU decomposition of the square matrix `a`.
    pub fn decompose(&mut self, a: &DMatrix<f64>) -> Result<(), CoreError> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(CoreError::DimMismatch {
                context: "RankRevealingLu::decompose (square matrix required)",
                expected: n,
                actual: a.ncols(),
            });
        }

        self.lu = a.clone();
        self.p = (0..n).collect();

        for k in 0..n {
            // Pick the largest entry on or below the diagonal of column k.
            let mut imax = k;
            let mut amax = self.lu[(k, k)].abs();
            for i in k + 1..n {
                let v = self.lu[(i, k)].abs();
                if v > amax {
                    amax = v;
                    imax = i;
                }
            }
            if imax != k {
                self.lu.swap_rows(k, imax);
                self.p.swap(k, imax);
            }
            let pivot = self.lu[(k, k)];
            if pivot == 0.0 {
                // Singular column; leave a zero on the diagonal of U. The
                // rank scan below reports the deficiency.
                continue;
            }
            for i in k + 1..n {
                let factor = self.lu[(i, k)] / pivot;
                self.lu[(i, k)] = factor;
                for j in k + 1..n {
                    let sub = factor * self.lu[(k, j)];
                    self.lu[(i, j)] -= sub;
                }
            }
        }

        // Scan the diagonal of U from the bottom: trailing entries at or
        // below maxdiag*eps*n are zero or residual round-off.
        let maxdiag = (0..n).fold(0.0_f64, |acc, i| acc.max(self.lu[(i, i)].abs()));
        let threshold = maxdiag * f64::EPSILON * n as f64;
        self.rank = n;
        for i in (0..n).rev() {
            if self.lu[(i, i)].abs() <= threshold {
                self.rank -= 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Solve `A·x = b` in place using the top-left `rank × rank` blocks of
    /// the factors. Solution components beyond the rank are set to NaN.
    pub fn solve_in_place(&self, x: &mut DVector<f64>) {
        let n = self.lu.nrows();
        debug_assert_eq!(x.len(), n);
        let r = self.rank;

        // Apply the row permutation.
        let permuted = DVector::from_fn(n, |k, _| x[self.p[k]]);
        x.copy_from(&permuted);

        // Forward substitution with the unit lower-triangular block.
        for i in 1..r {
            for j in 0..i {
                let sub = self.lu[(i, j)] * x[j];
                x[i] -= sub;
            }
        }
        // Back substitution with the upper-triangular block.
        for i in (0..r).rev() {
            for j in i + 1..r {
                let sub = self.lu[(i, j)] * x[j];
                x[i] -= sub;
            }
            x[i] /= self.lu[(i, i)];
        }
        // Components tied to linearly dependent rows become NaN sentinels.
        for i in r..n {
            x[i] = f64::NAN;
        }
    }

    /// Solve `A·X = B` column by column; see [`solve_in_place`](Self::solve_in_place).
    pub fn solve_mat_in_place(&self, x: &mut DMatrix<f64>) {
        let mut col = DVector::zeros(x.nrows());
        for j in 0..x.ncols() {
            col.copy_from(&x.column(j));
            self.solve_in_place(&mut col);
            x.set_column(j, &col);
        }
    }
}

/// Full-pivot LU decomposition `P·A·Q = L·U` of a rectangular matrix.
#[derive(Debug, Clone)]
pub struct FullPivLu {
    /// Packed factors: strict lower part holds L multipliers, upper part U.
    lu: DMatrix<f64>,

    /// Row permutation: row `k` of `P·A` is row `p[k]` of `A`.
    p: Vec<usize>,

    /// Column permutation: column `k` of `A·Q` is column `q[k]` of `A`.
    q: Vec<usize>,

    /// Largest absolute pivot selected during elimination.
    max_pivot: f64,
}

impl Default for FullPivLu {
    fn default() -> Self {
        Self { lu: DMatrix::zeros(0, 0), p: Vec::new(), q: Vec::new(), max_pivot: 0.0 }
    }
}

impl FullPivLu {
    /// Construct an empty decomposition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows of the decomposed matrix.
    pub fn nrows(&self) -> usize {
        self.lu.nrows()
    }

    /// Number of columns of the decomposed matrix.
    pub fn ncols(&self) -> usize {
        self.lu.ncols()
    }

    /// The packed LU factors.
    pub fn packed(&self) -> &DMatrix<f64> {
        &self.lu
    }

    /// The row permutation as an index vector.
    pub fn row_perm(&self) -> &[usize] {
        &self.p
    }

    /// The column permutation as an index vector.
    pub fn col_perm(&self) -> &[usize] {
        &self.q
    }

    /// Largest absolute pivot of the elimination.
    pub fn max_pivot(&self) -> f64 {
        self.max_pivot
    }

    /// Compute the full-pivot LU decomposition of `a`.
    pub fn compute(&mut self, a: &DMatrix<f64>) {
        let (m, n) = a.shape();
        self.lu = a.clone();
        self.p = (0..m).collect();
        self.q = (0..n).collect();
        self.max_pivot = 0.0;

        for k in 0..m.min(n) {
            // Largest entry of the remaining bottom-right block, scanning
            // column-major so ties resolve to the first occurrence.
            let mut imax = k;
            let mut jmax = k;
            let mut amax = 0.0_f64;
            for j in k..n {
                for i in k..m {
                    let v = self.lu[(i, j)].abs();
                    if v > amax {
                        amax = v;
                        imax = i;
                        jmax = j;
                    }
                }
            }
            if amax == 0.0 {
                // Remaining block is exactly zero; elimination is complete.
                break;
            }
            if imax != k {
                self.lu.swap_rows(k, imax);
                self.p.swap(k, imax);
            }
            if jmax != k {
                self.lu.swap_columns(k, jmax);
                self.q.swap(k, jmax);
            }
            self.max_pivot = self.max_pivot.max(amax);

            let pivot = self.lu[(k, k)];
            for i in k + 1..m {
                let factor = self.lu[(i, k)] / pivot;
                self.lu[(i, k)] = factor;
                for j in k + 1..n {
                    let sub = factor * self.lu[(k, j)];
                    self.lu[(i, j)] -= sub;
                }
            }
        }
    }

    /// The numerical rank of the decomposed matrix.
    ///
    /// Diagonal entries of U above `max_pivot * eps * max(m, n)` count
    /// towards the rank. When the largest pivot itself sits below `10*eps`
    /// the comparison degenerates to an absolute one (threshold factor 1),
    /// so an essentially zero matrix reports rank zero.
    pub fn rank(&self) -> usize {
        let (m, n) = self.lu.shape();
        let diag = m.min(n);
        if diag == 0 {
            return 0;
        }
        let factor = if self.max_pivot < 10.0 * f64::EPSILON {
            1.0
        } else {
            f64::EPSILON * m.max(n) as f64
        };
        let threshold = self.max_pivot * factor;
        (0..diag)
            .filter(|&i| self.lu[(i, i)].abs() > threshold)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn solves_a_full_rank_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let xref = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let mut b = &a * &xref;

        let mut lu = RankRevealingLu::new();
        lu.decompose(&a).unwrap();
        assert_eq!(lu.rank(), 3);

        lu.solve_in_place(&mut b);
        assert_relative_eq!(b, xref, epsilon = 1e-12);
    }

    #[test]
    fn deficient_rows_yield_nan_components() {
        // Row 2 = row 0 + row 1.
        let a = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 5.0, 7.0, 9.0],
        );
        let mut lu = RankRevealingLu::new();
        lu.decompose(&a).unwrap();
        assert_eq!(lu.rank(), 2);

        let mut b = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        lu.solve_in_place(&mut b);
        assert!(b[2].is_nan());
    }

    #[test]
    fn rejects_rectangular_input() {
        let a = DMatrix::zeros(2, 3);
        let mut lu = RankRevealingLu::new();
        assert!(matches!(
            lu.decompose(&a),
            Err(CoreError::DimMismatch { .. })
        ));
    }

    #[test]
    fn full_pivot_reconstructs_the_matrix() {
        let a = DMatrix::from_row_slice(
            3,
            5,
            &[
                2.0, -1.0, 0.5, 3.0, 1.0, //
                1.0, 4.0, -2.0, 0.0, 2.0, //
                -3.0, 0.5, 1.0, 1.0, -1.0,
            ],
        );
        let mut lu = FullPivLu::new();
        lu.compute(&a);
        assert_eq!(lu.rank(), 3);

        // Rebuild P*A*Q from the packed factors and compare.
        let (m, n) = a.shape();
        let mut l = DMatrix::<f64>::identity(m, m);
        let mut u = DMatrix::<f64>::zeros(m, n);
        for i in 0..m {
            for j in 0..n {
                if j < i {
                    l[(i, j)] = lu.packed()[(i, j)];
                } else {
                    u[(i, j)] = lu.packed()[(i, j)];
                }
            }
        }
        let paq = DMatrix::from_fn(m, n, |i, j| a[(lu.row_perm()[i], lu.col_perm()[j])]);
        assert_relative_eq!(l * u, paq, epsilon = 1e-12);
    }

    #[test]
    fn full_pivot_rank_of_dependent_rows() {
        let mut a = DMatrix::from_fn(4, 6, |i, j| ((i * 7 + j * 3) % 11) as f64 - 5.0);
        let (r0, r1) = (a.row(0).clone_owned(), a.row(1).clone_owned());
        a.set_row(2, &(r0.clone() + r1.clone() * 2.0));
        a.set_row(3, &(r1 - r0 * 3.0));

        let mut lu = FullPivLu::new();
        lu.compute(&a);
        assert_eq!(lu.rank(), 2);
    }

    #[test]
    fn full_pivot_rank_of_zero_matrix_is_zero() {
        let mut lu = FullPivLu::new();
        lu.compute(&DMatrix::zeros(3, 4));
        assert_eq!(lu.rank(), 0);
        assert_eq!(lu.max_pivot(), 0.0);
    }
}
