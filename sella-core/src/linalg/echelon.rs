//! Echelon form `R·W·Q = [I S]` of the constraint coefficient matrix.
//!
//! The echelonizer maintains a reduced-row-echelon representation of
//! `W = [Ax; Jx]` across Jacobian refreshes and bound-driven variable
//! reorderings. The first `rank` entries of the column permutation `Q`
//! index the *basic* variables, the rest the *non-basic* ones. `R` is the
//! echelonizing multiplier matrix; its rows at and beyond the numerical
//! rank are kept as exact zeros so that linearly dependent constraint rows
//! drop out of every downstream product.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::linalg::lu::FullPivLu;
use crate::linalg::max_abs;

/// Maintains the canonical form `R·W·Q = [I S]` under updates.
#[derive(Debug, Clone)]
pub struct Echelonizer {
    /// Full-pivot LU of the last computed matrix, `P·W·Q = L·U`.
    lu: FullPivLu,

    /// The echelonizer matrix `R` (m×m; zero rows beyond the rank).
    r: DMatrix<f64>,

    /// The matrix `S` in the canonical form `[I S]` (rank × (n−rank)).
    s: DMatrix<f64>,

    /// Column permutation; basic variable indices first.
    q: Vec<usize>,

    /// Inverse of the row permutation of the LU (equation ordering).
    ptr: Vec<usize>,

    /// Backup of (R, S, Q) right after `compute`, for `reset`.
    r0: DMatrix<f64>,
    s0: DMatrix<f64>,
    q0: Vec<usize>,

    /// Numerical rank of the last computed matrix.
    rank: usize,

    /// Threshold below which pivot candidates count as zero.
    threshold: f64,

    /// Round-off cleanup magnitude, `10^(1 + ceil(log10(max|W|)))`.
    sigma: f64,
}

impl Default for Echelonizer {
    fn default() -> Self {
        Self {
            lu: FullPivLu::new(),
            r: DMatrix::zeros(0, 0),
            s: DMatrix::zeros(0, 0),
            q: Vec::new(),
            ptr: Vec::new(),
            r0: DMatrix::zeros(0, 0),
            s0: DMatrix::zeros(0, 0),
            q0: Vec::new(),
            rank: 0,
            threshold: 0.0,
            sigma: 0.0,
        }
    }
}

impl Echelonizer {
    /// Construct an echelonizer and compute the canonical form of `w`.
    pub fn from_matrix(w: &DMatrix<f64>) -> Result<Self, CoreError> {
        let mut out = Self::default();
        out.compute(w)?;
        Ok(out)
    }

    /// Number of variables (columns of `W`).
    pub fn num_variables(&self) -> usize {
        self.lu.ncols()
    }

    /// Number of equations (rows of `W`).
    pub fn num_equations(&self) -> usize {
        self.lu.nrows()
    }

    /// Number of basic variables, which equals the rank of `W`.
    pub fn num_basic_variables(&self) -> usize {
        self.rank
    }

    /// Number of non-basic variables.
    pub fn num_nonbasic_variables(&self) -> usize {
        self.num_variables() - self.rank
    }

    /// The echelonizer matrix `R`.
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// The matrix `S` of the canonical form `[I S]`.
    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    /// The column permutation `Q` as an index vector.
    pub fn q(&self) -> &[usize] {
        &self.q
    }

    /// The canonical matrix `C = R·W·Q = [I S; 0 0]` assembled densely.
    pub fn c(&self) -> DMatrix<f64> {
        let m = self.num_equations();
        let n = self.num_variables();
        let nb = self.rank;
        let mut out = DMatrix::zeros(m, n);
        for i in 0..nb {
            out[(i, i)] = 1.0;
        }
        out.view_mut((0, nb), (nb, n - nb)).copy_from(&self.s);
        out
    }

    /// The product `R·W` in the original column ordering, reconstructed
    /// from the canonical invariant (column `q[j]` is canonical column `j`).
    pub fn rw(&self) -> DMatrix<f64> {
        let m = self.num_equations();
        let n = self.num_variables();
        let nb = self.rank;
        let mut out = DMatrix::zeros(m, n);
        for j in 0..nb {
            out[(j, self.q[j])] = 1.0;
        }
        for k in 0..n - nb {
            for i in 0..nb {
                out[(i, self.q[nb + k])] = self.s[(i, k)];
            }
        }
        out
    }

    /// The ordering of the equations induced by the row permutation.
    pub fn indices_equations(&self) -> &[usize] {
        &self.ptr
    }

    /// Threshold below which coefficients count as numerically zero.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Indices of the basic variables (first `rank` entries of `Q`).
    pub fn indices_basic_variables(&self) -> &[usize] {
        &self.q[..self.rank]
    }

    /// Indices of the non-basic variables (trailing entries of `Q`).
    pub fn indices_nonbasic_variables(&self) -> &[usize] {
        &self.q[self.rank..]
    }

    /// Compute the canonical form of the matrix `w` from scratch.
    ///
    /// Requires at least as many columns as rows; fewer columns than rows
    /// cannot produce an `[I S]` block and is reported as a dimension
    /// mismatch.
    pub fn compute(&mut self, w: &DMatrix<f64>) -> Result<(), CoreError> {
        let (m, n) = w.shape();
        if n < m {
            return Err(CoreError::DimMismatch {
                context: "Echelonizer::compute (ncols >= nrows required)",
                expected: m,
                actual: n,
            });
        }

        self.lu.compute(w);
        let r = self.lu.rank();
        self.rank = r;
        self.q = self.lu.col_perm().to_vec();

        self.ptr = vec![0; m];
        for (k, &orig) in self.lu.row_perm().iter().enumerate() {
            self.ptr[orig] = k;
        }

        let packed = self.lu.packed().clone();

        // R = Ubb^{-1} · L^{-1} · P on the top `r` rows, zero below.
        let mut rmat = DMatrix::zeros(m, m);
        for (k, &orig) in self.lu.row_perm().iter().enumerate() {
            rmat[(k, orig)] = 1.0;
        }
        // Forward-substitute the unit lower-triangular L (row-wise).
        for i in 1..m {
            for j in 0..i.min(n) {
                let factor = packed[(i, j)];
                if factor != 0.0 {
                    for c in 0..m {
                        let sub = factor * rmat[(j, c)];
                        rmat[(i, c)] -= sub;
                    }
                }
            }
        }
        // Back-substitute the top-left r×r upper-triangular block of U.
        for i in (0..r).rev() {
            for j in i + 1..r {
                let factor = packed[(i, j)];
                if factor != 0.0 {
                    for c in 0..m {
                        let sub = factor * rmat[(j, c)];
                        rmat[(i, c)] -= sub;
                    }
                }
            }
            let pivot = packed[(i, i)];
            for c in 0..m {
                rmat[(i, c)] /= pivot;
            }
        }
        // Rows tied to linearly dependent equations are kept exactly zero.
        for i in r..m {
            for c in 0..m {
                rmat[(i, c)] = 0.0;
            }
        }
        self.r = rmat;

        // S = Ubb^{-1} · Ubn.
        let mut smat = DMatrix::zeros(r, n - r);
        for i in 0..r {
            for k in 0..n - r {
                smat[(i, k)] = packed[(i, r + k)];
            }
        }
        for i in (0..r).rev() {
            for j in i + 1..r {
                let factor = packed[(i, j)];
                if factor != 0.0 {
                    for k in 0..n - r {
                        let sub = factor * smat[(j, k)];
                        smat[(i, k)] -= sub;
                    }
                }
            }
            let pivot = packed[(i, i)];
            for k in 0..n - r {
                smat[(i, k)] /= pivot;
            }
        }
        self.s = smat;

        self.threshold =
            self.lu.max_pivot() * f64::EPSILON * m.min(n) as f64 * m.max(n) as f64;

        let wmax = max_abs(w);
        self.sigma = if wmax > 0.0 {
            10.0_f64.powf(1.0 + wmax.log10().ceil())
        } else {
            0.0
        };

        self.r0 = self.r.clone();
        self.s0 = self.s.clone();
        self.q0 = self.q.clone();
        Ok(())
    }

    /// Swap the basic variable in slot `ib` with the non-basic variable in
    /// slot `jn`, pivoting on `S[ib, jn]`.
    ///
    /// Slot indices out of range are caller logic bugs and fail fast; a
    /// numerically zero pivot is reported as [`CoreError::PivotBreakdown`].
    pub fn update_with_swap_basic_variable(
        &mut self,
        ib: usize,
        jn: usize,
    ) -> Result<(), CoreError> {
        let nb = self.rank;
        let nn = self.num_variables() - nb;
        assert!(
            ib < nb,
            "swap: basic slot {ib} out of range (rank = {nb})"
        );
        assert!(
            jn < nn,
            "swap: non-basic slot {jn} out of range ({nn} non-basic slots)"
        );
        if self.s[(ib, jn)].abs() <= self.threshold {
            return Err(CoreError::PivotBreakdown { ib, jn });
        }

        // Original values of the pivot column, needed by every row update.
        let pivot_col: DVector<f64> = self.s.column(jn).clone_owned();
        let aux = 1.0 / pivot_col[ib];
        let m = self.r.ncols();
        let nb_rows = nb;

        // Gauss-Jordan elimination applied to the top `rank` rows of R.
        for c in 0..m {
            self.r[(ib, c)] *= aux;
        }
        for i in 0..nb_rows {
            if i != ib {
                let factor = pivot_col[i];
                for c in 0..m {
                    let sub = factor * self.r[(ib, c)];
                    self.r[(i, c)] -= sub;
                }
            }
        }

        // Same elimination on S, then rewrite the pivot column.
        for k in 0..nn {
            self.s[(ib, k)] *= aux;
        }
        for i in 0..nb_rows {
            if i != ib {
                let factor = pivot_col[i];
                for k in 0..nn {
                    let sub = factor * self.s[(ib, k)];
                    self.s[(i, k)] -= sub;
                }
            }
        }
        for i in 0..nb_rows {
            self.s[(i, jn)] = -pivot_col[i] * aux;
        }
        self.s[(ib, jn)] = aux;

        self.q.swap(ib, nb + jn);
        Ok(())
    }

    /// Update the canonical form so that higher-weight variables become
    /// basic, then order both basic and non-basic slots by descending
    /// weight.
    ///
    /// A non-basic variable displaces the basic variable of row `i` when
    /// `w[nonbasic] * |S[i, k]|` exceeds the basic variable's own weight.
    pub fn update_with_priority_weights(&mut self, w: &DVector<f64>) -> Result<(), CoreError> {
        let n = self.num_variables();
        if w.len() != n {
            return Err(CoreError::DimMismatch {
                context: "Echelonizer::update_with_priority_weights",
                expected: n,
                actual: w.len(),
            });
        }

        let nb = self.rank;
        let nn = n - nb;

        if nn > 0 {
            for i in 0..nb {
                let mut jbest = 0;
                let mut wbest = f64::NEG_INFINITY;
                for k in 0..nn {
                    if self.s[(i, k)].abs() <= self.threshold {
                        continue;
                    }
                    let wk = w[self.q[nb + k]] * self.s[(i, k)].abs();
                    if wk > wbest {
                        wbest = wk;
                        jbest = k;
                    }
                }
                if w[self.q[i]] < wbest {
                    self.update_with_swap_basic_variable(i, jbest)?;
                }
            }
        }

        let mut kb: Vec<usize> = (0..nb).collect();
        kb.sort_by(|&l, &r| w[self.q[r]].total_cmp(&w[self.q[l]]));
        let mut kn: Vec<usize> = (0..nn).collect();
        kn.sort_by(|&l, &r| w[self.q[nb + r]].total_cmp(&w[self.q[nb + l]]));

        self.update_ordering(&kb, &kn);
        Ok(())
    }

    /// Reorder the basic slots by `kb` and the non-basic slots by `kn`
    /// (new slot `i` takes the variable previously in slot `kb[i]`).
    pub fn update_ordering(&mut self, kb: &[usize], kn: &[usize]) {
        let nb = self.rank;
        let nn = self.num_variables() - nb;
        assert_eq!(kb.len(), nb, "update_ordering: kb must have one entry per basic slot");
        assert_eq!(kn.len(), nn, "update_ordering: kn must have one entry per non-basic slot");

        let m = self.r.ncols();
        let s_old = self.s.clone();
        for i in 0..nb {
            for j in 0..nn {
                self.s[(i, j)] = s_old[(kb[i], kn[j])];
            }
        }

        let r_old = self.r.clone();
        for i in 0..nb {
            for c in 0..m {
                self.r[(i, c)] = r_old[(kb[i], c)];
            }
        }

        let q_old = self.q.clone();
        for i in 0..nb {
            self.q[i] = q_old[kb[i]];
        }
        for j in 0..nn {
            self.q[nb + j] = q_old[nb + kn[j]];
        }
    }

    /// Restore the canonical form computed by the last `compute` call,
    /// discarding round-off accumulated by swaps and reorderings.
    pub fn reset(&mut self) {
        self.r.copy_from(&self.r0);
        self.s.copy_from(&self.s0);
        self.q.clone_from(&self.q0);
    }

    /// Remove residual round-off noise from the coefficients of R and S by
    /// adding and subtracting `sigma`, which flushes magnitudes below
    /// `sigma * eps` to zero.
    pub fn clean_residual_roundoff_errors(&mut self) {
        let sigma = self.sigma;
        if sigma == 0.0 {
            return;
        }
        self.s.apply(|x| *x = (*x + sigma) - sigma);
        self.r.apply(|x| *x = (*x + sigma) - sigma);
    }
}
