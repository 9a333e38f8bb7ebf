//! Saddle-point solver for the canonical KKT system.
//!
//! The Newton step solves, in next-iterate form,
//!
//! ```text
//! [ Hxx  Hxp  Wxᵀ ] [x̂]   [ Hxx·x' + Hxp·p − fx ]
//! [ Vx   Vp   0   ] [p̂] = [ Vx·x' + Vp·p − v    ]
//! [ Wx   Wp   0   ] [ŵ]   [ (b, Jx·x' + Jp·p − h) ]
//! ```
//!
//! with the constraint rows echelonized through `R` and unstable variables
//! pinned (`x̂[i] = x'[i]`, no unknown). Three methods factor the system:
//! Fullspace assembles everything, Nullspace reduces onto the non-basic
//! variables, Rangespace eliminates the primal block through the Hessian.
//! Whatever the method, non-finite solution components produced by rank
//! deficiency are projected back onto a zero step before returning.

pub mod canonical;
mod fullspace;
mod nullspace;
mod rangespace;

pub use canonical::{
    solve_canonical, CanonicalSaddleLhs, CanonicalSaddleRhs, CanonicalSaddleSol, HessianMatrix,
};

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::linalg::{concat, Echelonizer};
use crate::problem::MasterDims;

/// The saddle-point methods available for the KKT decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KktMethod {
    /// Factor the fully assembled KKT matrix with partial-pivoting LU.
    #[default]
    Fullspace,

    /// Project onto the null space of `W`; solves a system in the
    /// non-basic variables. Assumes unstable variables are non-basic.
    Nullspace,

    /// Eliminate the primal block through the Hessian and solve a system
    /// in the multipliers. Requires an invertible Hessian block; fastest
    /// with a diagonal one.
    Rangespace,
}

/// Arguments for [`SaddlePointSolver::decompose`].
pub struct KktDecomposeArgs<'a> {
    /// Hessian block `Hxx`.
    pub hxx: &'a HessianMatrix,
    /// Mixed second derivatives `Hxp` (`nx × np`).
    pub hxp: &'a DMatrix<f64>,
    /// Jacobian of `v` with respect to `x` (`np × nx`).
    pub vx: &'a DMatrix<f64>,
    /// Jacobian of `v` with respect to `p` (`np × np`).
    pub vp: &'a DMatrix<f64>,
    /// Parameter block `Wp = [Ap; Jp]` (`nw × np`).
    pub wp: &'a DMatrix<f64>,
    /// Echelon form of `Wx = [Ax; Jx]`.
    pub echelon: &'a Echelonizer,
    /// Indices of the unstable variables (sorted, duplicates-free).
    pub ju: &'a [usize],
}

/// Arguments for [`SaddlePointSolver::solve`].
pub struct KktSolveArgs<'a> {
    /// Hessian block `Hxx` given to `decompose`.
    pub hxx: &'a HessianMatrix,
    /// Mixed second derivatives `Hxp`.
    pub hxp: &'a DMatrix<f64>,
    /// Jacobian of `v` with respect to `x`.
    pub vx: &'a DMatrix<f64>,
    /// Jacobian of `v` with respect to `p`.
    pub vp: &'a DMatrix<f64>,
    /// Constraint matrix `Wx = [Ax; Jx]` (`nw × nx`).
    pub wx: &'a DMatrix<f64>,
    /// Parameter block `Wp = [Ap; Jp]`.
    pub wp: &'a DMatrix<f64>,
    /// Sanitized current primal values `x'` (strictly unstable entries
    /// held at their exact bound constants).
    pub x: &'a DVector<f64>,
    /// Current parameter values `p`.
    pub p: &'a DVector<f64>,
    /// Objective gradient `fx`.
    pub fx: &'a DVector<f64>,
    /// Values of the parameter constraints `v(x, p)`.
    pub v: &'a DVector<f64>,
    /// Right-hand side of the linear constraints.
    pub b: &'a DVector<f64>,
    /// Values of the nonlinear constraints `h(x, p)`.
    pub h: &'a DVector<f64>,
}

/// Solution of the saddle-point problem in next-iterate form.
#[derive(Debug, Clone)]
pub struct KktSol {
    /// Next primal iterate `x̂`.
    pub x: DVector<f64>,
    /// Next parameter iterate `p̂`.
    pub p: DVector<f64>,
    /// Next multiplier iterate `ŵ` (length `nw`).
    pub w: DVector<f64>,
}

impl Default for KktSol {
    fn default() -> Self {
        Self { x: DVector::zeros(0), p: DVector::zeros(0), w: DVector::zeros(0) }
    }
}

/// Canonical data captured at decompose time so that solves stay
/// consistent even if the echelonizer is updated in between.
pub(crate) struct CanonicalCapture {
    pub(crate) rank: usize,
    /// Top `rank` rows of `R`.
    pub(crate) rtop: DMatrix<f64>,
    /// `R·Wx` restricted to its top `rank` rows, original column order.
    pub(crate) wc: DMatrix<f64>,
    /// `R·Wp` restricted to its top `rank` rows.
    pub(crate) wpc: DMatrix<f64>,
    /// Matrix `S` of the canonical form.
    pub(crate) s: DMatrix<f64>,
    /// Column permutation of the canonical form.
    pub(crate) q: Vec<usize>,
    /// Stable variable indices (complement of `ju`), ascending.
    pub(crate) js: Vec<usize>,
    /// Unstable variable indices, ascending.
    pub(crate) ju: Vec<usize>,
}

pub(crate) enum Factors {
    Fullspace(fullspace::FullspaceFactors),
    Nullspace(nullspace::NullspaceFactors),
    Rangespace(rangespace::RangespaceFactors),
}

struct Decomposition {
    cap: CanonicalCapture,
    factors: Factors,
}

/// Decomposes and solves the canonical KKT system.
pub struct SaddlePointSolver {
    dims: MasterDims,
    method: KktMethod,
    dec: Option<Decomposition>,
}

impl SaddlePointSolver {
    /// Construct a solver for problems of the given dimensions.
    pub fn new(dims: MasterDims) -> Self {
        Self { dims, method: KktMethod::default(), dec: None }
    }

    /// Select the saddle-point method used by subsequent decompositions.
    pub fn set_method(&mut self, method: KktMethod) {
        self.method = method;
    }

    /// The currently selected method.
    pub fn method(&self) -> KktMethod {
        self.method
    }

    /// Factorize the KKT system for the current Hessian, Jacobians and
    /// stability partition. Must be called before [`solve`](Self::solve)
    /// or [`solve_rhs`](Self::solve_rhs).
    pub fn decompose(&mut self, args: KktDecomposeArgs) -> Result<(), CoreError> {
        let MasterDims { nx, np, nw, .. } = self.dims;
        if args.hxx.nrows() != nx {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::decompose (Hxx)",
                expected: nx,
                actual: args.hxx.nrows(),
            });
        }
        if args.hxp.shape() != (nx, np) {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::decompose (Hxp)",
                expected: np,
                actual: args.hxp.ncols(),
            });
        }
        if args.vx.shape() != (np, nx) || args.vp.shape() != (np, np) {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::decompose (V blocks)",
                expected: np,
                actual: args.vx.nrows(),
            });
        }
        if args.wp.shape() != (nw, np) {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::decompose (Wp)",
                expected: nw,
                actual: args.wp.nrows(),
            });
        }

        let rank = args.echelon.num_basic_variables();
        let rtop = args.echelon.r().rows(0, rank).clone_owned();
        let wc = args.echelon.rw().rows(0, rank).clone_owned();
        let wpc = &rtop * args.wp;

        let mut mask = vec![false; nx];
        for &i in args.ju {
            mask[i] = true;
        }
        let ju: Vec<usize> = (0..nx).filter(|&i| mask[i]).collect();
        let js: Vec<usize> = (0..nx).filter(|&i| !mask[i]).collect();

        let cap = CanonicalCapture {
            rank,
            rtop,
            wc,
            wpc,
            s: args.echelon.s().clone(),
            q: args.echelon.q().to_vec(),
            js,
            ju,
        };

        // Nullspace/Rangespace assume unstable variables are non-basic; the
        // priority weights make that the common case, but rank constraints
        // can force an on-bound variable into the basis. Fall back to the
        // general method then.
        let basic_unstable = cap.q[..rank].iter().any(|&j| mask[j]);
        let method = if basic_unstable && self.method != KktMethod::Fullspace {
            log::debug!(
                "saddle-point: unstable variable in the basis, falling back to Fullspace"
            );
            KktMethod::Fullspace
        } else {
            self.method
        };

        let factors = match method {
            KktMethod::Fullspace => {
                Factors::Fullspace(fullspace::decompose(&self.dims, &cap, &args)?)
            }
            KktMethod::Nullspace => {
                Factors::Nullspace(nullspace::decompose(&self.dims, &cap, &args)?)
            }
            KktMethod::Rangespace => {
                Factors::Rangespace(rangespace::decompose(&self.dims, &cap, &args)?)
            }
        };

        self.dec = Some(Decomposition { cap, factors });
        Ok(())
    }

    /// Solve the KKT system in next-iterate form: the outputs are the next
    /// iterates `(x̂, p̂, ŵ)`, not steps. Computing iterates directly keeps
    /// the right-hand side well scaled when residuals are tiny.
    pub fn solve(&self, args: KktSolveArgs, sol: &mut KktSol) -> Result<(), CoreError> {
        let MasterDims { nx, np, ny, nz, .. } = self.dims;
        if args.x.len() != nx {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::solve (x)",
                expected: nx,
                actual: args.x.len(),
            });
        }
        if args.b.len() != ny || args.h.len() != nz || args.v.len() != np {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::solve (rhs blocks)",
                expected: ny + nz + np,
                actual: args.b.len() + args.h.len() + args.v.len(),
            });
        }

        // Equation targets for the next iterate.
        let tobj = args.hxx.mul_vec(args.x) + args.hxp * args.p - args.fx;
        let tv = args.vx * args.x + args.vp * args.p - args.v;
        let jx = args.wx.rows(ny, nz);
        let jp = args.wp.rows(ny, nz);
        let wtail = jx * args.x + jp * args.p - args.h;
        let wtarget = concat(&args.b.clone_owned(), &wtail);

        self.solve_with(&tobj, args.x, &tv, &wtarget, args.p, sol)
    }

    /// Solve the decomposed system against a raw right-hand side
    /// `(rx, rp, rw)`; the outputs are steps `(dx, dp, dw)` directly.
    /// Unstable components of `dx` are zero. Used for the sensitivity
    /// right-hand sides, which reuse the last decomposition.
    pub fn solve_rhs(
        &self,
        rx: &DVector<f64>,
        rp: &DVector<f64>,
        rw: &DVector<f64>,
        sol: &mut KktSol,
    ) -> Result<(), CoreError> {
        let MasterDims { nx, np, nw, .. } = self.dims;
        if rx.len() != nx || rp.len() != np || rw.len() != nw {
            return Err(CoreError::DimMismatch {
                context: "SaddlePointSolver::solve_rhs",
                expected: nx + np + nw,
                actual: rx.len() + rp.len() + rw.len(),
            });
        }
        let xfix = DVector::zeros(nx);
        let pfix = DVector::zeros(np);
        self.solve_with(rx, &xfix, rp, rw, &pfix, sol)
    }

    fn solve_with(
        &self,
        tobj: &DVector<f64>,
        xfix: &DVector<f64>,
        tv: &DVector<f64>,
        wtarget: &DVector<f64>,
        pfix: &DVector<f64>,
        sol: &mut KktSol,
    ) -> Result<(), CoreError> {
        let dec = self.dec.as_ref().ok_or(CoreError::DimMismatch {
            context: "SaddlePointSolver::solve (decompose not called)",
            expected: 1,
            actual: 0,
        })?;
        let cap = &dec.cap;
        let bhat = &cap.rtop * wtarget;

        let (mut xhat, mut phat, mut what) = match &dec.factors {
            Factors::Fullspace(f) => fullspace::solve(&self.dims, cap, f, tobj, xfix, tv, &bhat),
            Factors::Nullspace(f) => nullspace::solve(&self.dims, cap, f, tobj, xfix, tv, &bhat),
            Factors::Rangespace(f) => {
                rangespace::solve(&self.dims, cap, f, tobj, xfix, tv, &bhat)
            }
        };

        // Project rank-deficient directions onto a zero step: non-finite
        // primal/parameter components fall back to their current values,
        // multiplier components in canonical space drop to zero before the
        // map back through Rᵀ.
        for i in 0..xhat.len() {
            if !xhat[i].is_finite() {
                xhat[i] = xfix[i];
            }
        }
        for c in 0..phat.len() {
            if !phat[c].is_finite() {
                phat[c] = pfix[c];
            }
        }
        for k in 0..what.len() {
            if !what[k].is_finite() {
                what[k] = 0.0;
            }
        }

        sol.x = xhat;
        sol.p = phat;
        sol.w = cap.rtop.transpose() * what;
        Ok(())
    }
}
