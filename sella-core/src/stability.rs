//! Stability classification of the primal variables.
//!
//! At each canonicalization the variables are partitioned into four
//! disjoint sets:
//!
//! - *stable*: interior, or on a bound without an adverse gradient;
//! - *lower-unstable*: on the lower bound with the instability measure
//!   `z★ = fx + Wᵀw` pushing the variable further down;
//! - *upper-unstable*: the mirror case on the upper bound;
//! - *strictly unstable*: variables whose bound value is forced by the
//!   linear constraints alone. They are detected once, pinned to their
//!   bound and excluded from the Newton linear algebra for good.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::linalg::Echelonizer;

/// Relative tolerance deciding whether a variable sits on a bound.
const EPS_ACTIVE: f64 = 1.0e-12;

/// Relative tolerance on the instability measure: smaller magnitudes count
/// as zero and resolve to stable, so round-off at a freshly touched bound
/// cannot pin a variable that the Newton step would move back inside.
const EPS_UNSTABLE: f64 = 1.0e-8;

/// The four disjoint index sets produced by the classification.
#[derive(Debug, Clone, Default)]
pub struct Stability {
    js: Vec<usize>,
    jlu: Vec<usize>,
    juu: Vec<usize>,
    jslu: Vec<usize>,
    jsuu: Vec<usize>,
    jsu: Vec<usize>,
    ju: Vec<usize>,
}

impl Stability {
    /// Indices of the stable variables.
    pub fn stable(&self) -> &[usize] {
        &self.js
    }

    /// Indices of the lower-unstable variables.
    pub fn lower_unstable(&self) -> &[usize] {
        &self.jlu
    }

    /// Indices of the upper-unstable variables.
    pub fn upper_unstable(&self) -> &[usize] {
        &self.juu
    }

    /// Indices of the strictly unstable variables pinned at lower bounds.
    pub fn strictly_lower_unstable(&self) -> &[usize] {
        &self.jslu
    }

    /// Indices of the strictly unstable variables pinned at upper bounds.
    pub fn strictly_upper_unstable(&self) -> &[usize] {
        &self.jsuu
    }

    /// Indices of all strictly unstable variables, ascending.
    pub fn strictly_unstable(&self) -> &[usize] {
        &self.jsu
    }

    /// Indices of all unstable variables (lower, upper and strictly),
    /// ascending. These are excluded from the Newton unknowns.
    pub fn unstable(&self) -> &[usize] {
        &self.ju
    }
}

/// Classifies variables from the echelonized constraints and the gradient.
#[derive(Debug, Clone)]
pub struct StabilityChecker {
    nx: usize,
    strictly_lower: Vec<bool>,
    strictly_upper: Vec<bool>,
    stability: Stability,
}

impl StabilityChecker {
    /// Construct a checker for `nx` variables; all start stable.
    pub fn new(nx: usize) -> Self {
        let mut checker = Self {
            nx,
            strictly_lower: vec![false; nx],
            strictly_upper: vec![false; nx],
            stability: Stability::default(),
        };
        checker.stability.js = (0..nx).collect();
        checker
    }

    /// The current classification.
    pub fn stability(&self) -> &Stability {
        &self.stability
    }

    /// Detect the strictly unstable variables from the linear constraints
    /// `Ax·x = b` and the bounds.
    ///
    /// A canonical row `xb + S·xn = b'` with finite bounds spans an
    /// attainable interval; when `b'` coincides with one endpoint, every
    /// variable in the row is forced onto the bound that attains it.
    pub fn initialize(
        &mut self,
        ax: &DMatrix<f64>,
        b: &DVector<f64>,
        xlower: &DVector<f64>,
        xupper: &DVector<f64>,
        tol: f64,
    ) -> Result<(), CoreError> {
        self.strictly_lower.iter_mut().for_each(|v| *v = false);
        self.strictly_upper.iter_mut().for_each(|v| *v = false);

        if ax.nrows() > 0 {
            let echelon = Echelonizer::from_matrix(ax)?;
            let rank = echelon.num_basic_variables();
            let bhat = echelon.r() * b;
            let s = echelon.s();
            let q = echelon.q();
            let coeff_tol = echelon.threshold();

            for i in 0..rank {
                // Attainable interval of the canonical row under the bounds.
                let mut lo = xlower[q[i]];
                let mut hi = xupper[q[i]];
                for k in 0..echelon.num_nonbasic_variables() {
                    let c = s[(i, k)];
                    if c.abs() <= coeff_tol {
                        continue;
                    }
                    let j = q[rank + k];
                    if c > 0.0 {
                        lo += c * xlower[j];
                        hi += c * xupper[j];
                    } else {
                        lo += c * xupper[j];
                        hi += c * xlower[j];
                    }
                }

                let scale = 1.0 + bhat[i].abs();
                let forced_low = (bhat[i] - lo).abs() <= tol * scale;
                let forced_high = (hi - bhat[i]).abs() <= tol * scale;
                if !forced_low && !forced_high {
                    continue;
                }

                // Every participating variable is pinned to the endpoint
                // bound that attains b'.
                let mut pin = |j: usize, c: f64| {
                    let at_lower = (c > 0.0) == forced_low;
                    if at_lower {
                        self.strictly_lower[j] = true;
                    } else {
                        self.strictly_upper[j] = true;
                    }
                };
                pin(q[i], 1.0);
                for k in 0..echelon.num_nonbasic_variables() {
                    let c = s[(i, k)];
                    if c.abs() > coeff_tol {
                        pin(q[rank + k], c);
                    }
                }
            }
        }

        self.rebuild_strict_sets();
        Ok(())
    }

    /// Reclassify the variables for the current iterate.
    ///
    /// `w` is the full constraint matrix `[Ax; Jx]` and `wdual` the current
    /// multipliers `(y, z)`. Ties and exactly-zero instability measures
    /// resolve to stable.
    pub fn update(
        &mut self,
        w: &DMatrix<f64>,
        wdual: &DVector<f64>,
        fx: &DVector<f64>,
        x: &DVector<f64>,
        xlower: &DVector<f64>,
        xupper: &DVector<f64>,
    ) {
        let zstar = fx + w.transpose() * wdual;

        self.stability.js.clear();
        self.stability.jlu.clear();
        self.stability.juu.clear();
        for i in 0..self.nx {
            if self.strictly_lower[i] || self.strictly_upper[i] {
                continue;
            }
            let on_lower = x[i] - xlower[i] <= EPS_ACTIVE * (1.0 + xlower[i].abs());
            let on_upper = xupper[i] - x[i] <= EPS_ACTIVE * (1.0 + xupper[i].abs());
            let zmin = EPS_UNSTABLE * (1.0 + fx[i].abs());
            if on_lower && zstar[i] > zmin {
                self.stability.jlu.push(i);
            } else if on_upper && zstar[i] < -zmin {
                self.stability.juu.push(i);
            } else {
                self.stability.js.push(i);
            }
        }

        self.rebuild_unstable_union();
    }

    fn rebuild_strict_sets(&mut self) {
        let st = &mut self.stability;
        st.jslu = (0..self.nx).filter(|&i| self.strictly_lower[i]).collect();
        st.jsuu = (0..self.nx)
            .filter(|&i| self.strictly_upper[i] && !self.strictly_lower[i])
            .collect();
        st.jsu = (0..self.nx)
            .filter(|&i| self.strictly_lower[i] || self.strictly_upper[i])
            .collect();
        st.js = (0..self.nx)
            .filter(|&i| !self.strictly_lower[i] && !self.strictly_upper[i])
            .collect();
        st.jlu.clear();
        st.juu.clear();
        self.rebuild_unstable_union();
    }

    fn rebuild_unstable_union(&mut self) {
        let st = &mut self.stability;
        let mut unstable = vec![false; self.nx];
        for &i in st.jlu.iter().chain(&st.juu).chain(&st.jsu) {
            unstable[i] = true;
        }
        st.ju = (0..self.nx).filter(|&i| unstable[i]).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_partitions_the_index_range() {
        let nx = 4;
        let mut checker = StabilityChecker::new(nx);
        let w = DMatrix::from_row_slice(1, nx, &[1.0, 1.0, 1.0, 1.0]);
        let wdual = DVector::from_vec(vec![-1.0]);
        let fx = DVector::from_vec(vec![2.0, 1.0, 0.0, -3.0]);
        let x = DVector::from_vec(vec![0.0, 0.5, 0.5, 1.0]);
        let xl = DVector::from_element(nx, 0.0);
        let xu = DVector::from_element(nx, 1.0);
        checker.update(&w, &wdual, &fx, &x, &xl, &xu);

        let st = checker.stability();
        let mut all: Vec<usize> = st
            .stable()
            .iter()
            .chain(st.lower_unstable())
            .chain(st.upper_unstable())
            .chain(st.strictly_unstable())
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);

        // x0 on its lower bound with z* = 2 - 1 = 1 > 0: lower-unstable.
        assert_eq!(st.lower_unstable(), &[0]);
        // x3 on its upper bound with z* = -3 - 1 < 0: upper-unstable.
        assert_eq!(st.upper_unstable(), &[3]);
        assert_eq!(st.stable(), &[1, 2]);
    }

    #[test]
    fn zero_measure_on_bound_stays_stable() {
        let nx = 1;
        let mut checker = StabilityChecker::new(nx);
        let w = DMatrix::zeros(0, nx);
        let wdual = DVector::zeros(0);
        let fx = DVector::from_vec(vec![0.0]);
        let x = DVector::from_vec(vec![0.0]);
        let xl = DVector::from_element(nx, 0.0);
        let xu = DVector::from_element(nx, 1.0);
        checker.update(&w, &wdual, &fx, &x, &xl, &xu);
        assert_eq!(checker.stability().stable(), &[0]);
        assert!(checker.stability().unstable().is_empty());
    }

    #[test]
    fn forced_bounds_are_strictly_unstable() {
        // x0 + x1 = 2 with both variables in [0, 1] forces x = (1, 1).
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_vec(vec![2.0]);
        let xl = DVector::from_element(2, 0.0);
        let xu = DVector::from_element(2, 1.0);

        let mut checker = StabilityChecker::new(2);
        checker.initialize(&ax, &b, &xl, &xu, 1e-14).unwrap();
        assert_eq!(checker.stability().strictly_upper_unstable(), &[0, 1]);
        assert_eq!(checker.stability().unstable(), &[0, 1]);
    }

    #[test]
    fn interior_feasible_rows_force_nothing() {
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_vec(vec![1.0]);
        let xl = DVector::from_element(2, 0.0);
        let xu = DVector::from_element(2, 1.0);

        let mut checker = StabilityChecker::new(2);
        checker.initialize(&ax, &b, &xl, &xu, 1e-14).unwrap();
        assert!(checker.stability().strictly_unstable().is_empty());
    }
}
