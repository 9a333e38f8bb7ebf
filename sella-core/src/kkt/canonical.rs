//! Canonical-form building blocks of the KKT system.
//!
//! [`HessianMatrix`] is the tagged representation of the Hessian block
//! (dense or diagonal); the Rangespace method exploits the diagonal
//! variant. [`CanonicalSaddleLhs`]/[`CanonicalSaddleRhs`] describe a
//! saddle-point problem already reduced to canonical coordinates, split
//! into basic (`b`), stable (`s`) and unstable (`u`) blocks with diagonal
//! `G` and `E` parts:
//!
//! ```text
//! [ diag(G)   Bᵀ   diag(E) ] [x]   [a]
//! [ B         0    0       ] [y] = [b]
//! [ diag(E)   0    diag(E) ] [z]   [c]
//! ```
//!
//! with `B = [diag(Bb) Bs Bu]`. The `E`/`z` block is optional; when it is
//! absent the system degenerates to the plain two-block saddle problem.
//! [`solve_canonical`] reduces everything to a `nb × nb` system in the
//! basic variables and back-substitutes.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::linalg::{concat, RankRevealingLu};

/// Tagged Hessian block: either a dense `n×n` matrix or just its diagonal.
#[derive(Debug, Clone)]
pub enum HessianMatrix {
    /// Dense symmetric Hessian.
    Dense(DMatrix<f64>),
    /// Diagonal Hessian, stored as the diagonal vector.
    Diagonal(DVector<f64>),
}

impl HessianMatrix {
    /// A dense zero Hessian of dimension `n`.
    pub fn zeros(n: usize) -> Self {
        HessianMatrix::Dense(DMatrix::zeros(n, n))
    }

    /// Dimension of the (square) Hessian.
    pub fn nrows(&self) -> usize {
        match self {
            HessianMatrix::Dense(h) => h.nrows(),
            HessianMatrix::Diagonal(d) => d.len(),
        }
    }

    /// True for the diagonal variant.
    pub fn is_diagonal(&self) -> bool {
        matches!(self, HessianMatrix::Diagonal(_))
    }

    /// Coefficient at `(i, j)`.
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        match self {
            HessianMatrix::Dense(h) => h[(i, j)],
            HessianMatrix::Diagonal(d) => {
                if i == j {
                    d[i]
                } else {
                    0.0
                }
            }
        }
    }

    /// Matrix-vector product `H·v`.
    pub fn mul_vec(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            HessianMatrix::Dense(h) => h * v,
            HessianMatrix::Diagonal(d) => d.component_mul(v),
        }
    }

    /// The dense submatrix `H[ridx, cidx]`.
    pub fn block(&self, ridx: &[usize], cidx: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(ridx.len(), cidx.len(), |i, j| self.entry(ridx[i], cidx[j]))
    }

    /// All coefficients finite?
    pub fn is_finite(&self) -> bool {
        match self {
            HessianMatrix::Dense(h) => h.iter().all(|x| x.is_finite()),
            HessianMatrix::Diagonal(d) => d.iter().all(|x| x.is_finite()),
        }
    }
}

/// Left-hand side of a saddle-point problem in canonical block form.
#[derive(Debug, Clone)]
pub struct CanonicalSaddleLhs {
    /// Diagonal of `G` on the basic block.
    pub gb: DVector<f64>,
    /// Diagonal of `G` on the stable block.
    pub gs: DVector<f64>,
    /// Diagonal of `G` on the unstable block.
    pub gu: DVector<f64>,
    /// Diagonal of the basic block of `B`.
    pub bb: DVector<f64>,
    /// Stable columns of `B` (`nb × ns`).
    pub bs: DMatrix<f64>,
    /// Unstable columns of `B` (`nb × nu`).
    pub bu: DMatrix<f64>,
    /// Diagonal of `E` on the basic block; empty when there is no E block.
    pub eb: DVector<f64>,
    /// Diagonal of `E` on the stable block.
    pub es: DVector<f64>,
    /// Diagonal of `E` on the unstable block.
    pub eu: DVector<f64>,
}

impl Default for CanonicalSaddleLhs {
    fn default() -> Self {
        Self {
            gb: DVector::zeros(0),
            gs: DVector::zeros(0),
            gu: DVector::zeros(0),
            bb: DVector::zeros(0),
            bs: DMatrix::zeros(0, 0),
            bu: DMatrix::zeros(0, 0),
            eb: DVector::zeros(0),
            es: DVector::zeros(0),
            eu: DVector::zeros(0),
        }
    }
}

/// Right-hand side of a saddle-point problem in canonical block form.
#[derive(Debug, Clone)]
pub struct CanonicalSaddleRhs {
    /// Basic part of the first block row.
    pub ab: DVector<f64>,
    /// Stable part of the first block row.
    pub as_: DVector<f64>,
    /// Unstable part of the first block row.
    pub au: DVector<f64>,
    /// The constraint block row.
    pub b: DVector<f64>,
    /// Basic part of the E block row.
    pub cb: DVector<f64>,
    /// Stable part of the E block row.
    pub cs: DVector<f64>,
    /// Unstable part of the E block row.
    pub cu: DVector<f64>,
}

impl Default for CanonicalSaddleRhs {
    fn default() -> Self {
        Self {
            ab: DVector::zeros(0),
            as_: DVector::zeros(0),
            au: DVector::zeros(0),
            b: DVector::zeros(0),
            cb: DVector::zeros(0),
            cs: DVector::zeros(0),
            cu: DVector::zeros(0),
        }
    }
}

/// Solution of a canonical saddle-point problem.
#[derive(Debug, Clone)]
pub struct CanonicalSaddleSol {
    /// Primal solution, ordered `(xb, xs, xu)`.
    pub x: DVector<f64>,
    /// Multipliers of the constraint block.
    pub y: DVector<f64>,
    /// Solution of the E block; empty when the problem has no E block.
    pub z: DVector<f64>,
}

impl Default for CanonicalSaddleSol {
    fn default() -> Self {
        Self { x: DVector::zeros(0), y: DVector::zeros(0), z: DVector::zeros(0) }
    }
}

impl CanonicalSaddleLhs {
    /// Whether the problem carries an E block.
    pub fn has_e(&self) -> bool {
        !self.eb.is_empty() || !self.es.is_empty() || !self.eu.is_empty()
    }

    /// Number of primal variables `n = nb + ns + nu`.
    pub fn num_variables(&self) -> usize {
        self.gb.len() + self.gs.len() + self.gu.len()
    }

    /// Apply the canonical matrix to `(x, y, z)`; used to manufacture
    /// right-hand sides with a known solution.
    pub fn mul(
        &self,
        x: &DVector<f64>,
        y: &DVector<f64>,
        z: &DVector<f64>,
    ) -> CanonicalSaddleRhs {
        let nb = self.gb.len();
        let ns = self.gs.len();
        let nu = self.gu.len();
        let xb = x.rows(0, nb).clone_owned();
        let xs = x.rows(nb, ns).clone_owned();
        let xu = x.rows(nb + ns, nu).clone_owned();

        let mut ab = self.gb.component_mul(&xb) + self.bb.component_mul(y);
        let mut as_ = self.gs.component_mul(&xs) + self.bs.transpose() * y;
        let mut au = self.gu.component_mul(&xu) + self.bu.transpose() * y;
        let b = self.bb.component_mul(&xb) + &self.bs * &xs + &self.bu * &xu;

        let (cb, cs, cu) = if self.has_e() {
            let zb = z.rows(0, nb).clone_owned();
            let zs = z.rows(nb, ns).clone_owned();
            let zu = z.rows(nb + ns, nu).clone_owned();
            ab += self.eb.component_mul(&zb);
            as_ += self.es.component_mul(&zs);
            au += self.eu.component_mul(&zu);
            (
                self.eb.component_mul(&(&xb + &zb)),
                self.es.component_mul(&(&xs + &zs)),
                self.eu.component_mul(&(&xu + &zu)),
            )
        } else {
            (DVector::zeros(0), DVector::zeros(0), DVector::zeros(0))
        };

        CanonicalSaddleRhs { ab, as_, au, b, cb, cs, cu }
    }
}

/// Solve a canonical saddle-point problem by reducing to a `nb × nb`
/// system in the basic variables.
pub fn solve_canonical(
    lhs: &CanonicalSaddleLhs,
    rhs: &CanonicalSaddleRhs,
) -> Result<CanonicalSaddleSol, CoreError> {
    let nb = lhs.gb.len();
    let ns = lhs.gs.len();
    let nu = lhs.gu.len();
    let has_e = lhs.has_e();

    let zeros = |k: usize| DVector::<f64>::zeros(k);

    // With no E block all the t-terms vanish and the formulas collapse to
    // the plain two-block reduction.
    let tbp = if has_e { rhs.cb.component_div(&lhs.eb) } else { zeros(nb) };
    let tsp = if has_e { rhs.cs.component_div(&lhs.es) } else { zeros(ns) };
    let tup = if has_e { rhs.cu.component_div(&lhs.eu) } else { zeros(nu) };

    let gbeb = if has_e { &lhs.gb - &lhs.eb } else { lhs.gb.clone() };
    let gses = if has_e { &lhs.gs - &lhs.es } else { lhs.gs.clone() };
    let gueu = if has_e { &lhs.gu - &lhs.eu } else { lhs.gu.clone() };

    let rbp = if has_e { &rhs.ab - &rhs.cb } else { rhs.ab.clone() };
    let rsp = if has_e { &rhs.as_ - &rhs.cs } else { rhs.as_.clone() };
    let rup = &rhs.au - lhs.gu.component_mul(&tup);

    let sp = &rhs.b - &lhs.bu * &tup;
    let spp = sp.component_div(&lhs.bb);

    // B blocks scaled by the inverse of the basic diagonal.
    let inv_bb = lhs.bb.map(|v| 1.0 / v);
    let bsp = DMatrix::from_fn(nb, ns, |i, j| inv_bb[i] * lhs.bs[(i, j)]);
    let bup = DMatrix::from_fn(nb, nu, |i, j| inv_bb[i] * lhs.bu[(i, j)]);

    let inv_gses = gses.map(|v| 1.0 / v);
    let inv_gueu = gueu.map(|v| 1.0 / v);

    // lhs_xb = diag(1/(Gb-Eb)) + Bsp diag(1/(Gs-Es)) Bspᵀ
    //        + Bup diag(1/(Gu-Eu)) Bupᵀ
    let mut lhs_xb = DMatrix::from_fn(nb, nb, |i, j| {
        if i == j { 1.0 / gbeb[i] } else { 0.0 }
    });
    let bsp_scaled = DMatrix::from_fn(nb, ns, |i, j| bsp[(i, j)] * inv_gses[j]);
    lhs_xb += &bsp_scaled * bsp.transpose();
    let bup_scaled = DMatrix::from_fn(nb, nu, |i, j| bup[(i, j)] * inv_gueu[j]);
    lhs_xb += &bup_scaled * bup.transpose();

    let mut rhs_xb = spp;
    rhs_xb += &bsp_scaled * (bsp.transpose() * &rbp);
    rhs_xb += &bup_scaled * (bup.transpose() * &rbp);
    rhs_xb -= &bsp * rsp.component_mul(&inv_gses);
    rhs_xb -= &bup * rup.component_mul(&inv_gueu);

    let mut lu = RankRevealingLu::new();
    lu.decompose(&lhs_xb)?;
    let mut xb = rhs_xb;
    lu.solve_in_place(&mut xb);

    let mut y = &rbp - &xb;
    xb = xb.component_div(&gbeb);
    let xs = (&rsp - bsp.transpose() * &y).component_mul(&inv_gses);
    let zu = (bup.transpose() * &y - &rup).component_mul(&inv_gueu);
    y = y.component_div(&lhs.bb);
    let zb = &tbp - &xb;
    let zs = &tsp - &xs;
    let xu = &tup - &zu;

    let x = concat(&concat(&xb, &xs), &xu);
    let z = if has_e {
        concat(&concat(&zb, &zs), &zu)
    } else {
        zeros(0)
    };

    Ok(CanonicalSaddleSol { x, y, z })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn diagonal_hessian_entries() {
        let h = HessianMatrix::Diagonal(DVector::from_vec(vec![2.0, 3.0]));
        assert_eq!(h.entry(0, 0), 2.0);
        assert_eq!(h.entry(0, 1), 0.0);
        let v = DVector::from_vec(vec![1.0, -1.0]);
        assert_eq!(h.mul_vec(&v), DVector::from_vec(vec![2.0, -3.0]));
    }

    #[test]
    fn canonical_solve_basic_only() {
        // Three basic variables with an E block; the right-hand side is
        // built so that x = y = z = 1.
        let lhs = CanonicalSaddleLhs {
            gb: DVector::from_vec(vec![9.0, 8.0, 7.0]),
            bb: DVector::from_vec(vec![1.0, 1.0, 1.0]),
            eb: DVector::from_vec(vec![1.0, 1.0, 1.0]),
            bs: DMatrix::zeros(3, 0),
            bu: DMatrix::zeros(3, 0),
            ..Default::default()
        };
        let rhs = CanonicalSaddleRhs {
            ab: DVector::from_vec(vec![11.0, 10.0, 9.0]),
            b: DVector::from_vec(vec![1.0, 1.0, 1.0]),
            cb: DVector::from_vec(vec![2.0, 2.0, 2.0]),
            ..Default::default()
        };
        let sol = solve_canonical(&lhs, &rhs).unwrap();
        assert_relative_eq!(sol.x, DVector::from_element(3, 1.0), epsilon = 1e-12);
        assert_relative_eq!(sol.y, DVector::from_element(3, 1.0), epsilon = 1e-12);
        assert_relative_eq!(sol.z, DVector::from_element(3, 1.0), epsilon = 1e-12);
    }
}
