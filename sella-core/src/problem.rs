//! Problem data, evaluation callbacks and solver state.
//!
//! The canonical problem shape is
//!
//! ```text
//! minimize    f(x, p)
//! subject to  Ax·x + Ap·p = b
//!             h(x, p) = 0
//!             v(x, p) = 0
//!             xlower <= x <= xupper
//! ```
//!
//! where `x` are the primal variables, `p` free parameter variables
//! governed by `v`, and the multipliers `w = (y, z)` pair with the linear
//! and nonlinear equality constraints respectively.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::kkt::HessianMatrix;
use crate::stability::Stability;

/// Dimensions of the master variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterDims {
    /// Number of primal variables `x`.
    pub nx: usize,
    /// Number of parameter variables `p`.
    pub np: usize,
    /// Number of linear equality constraints (rows of `Ax`).
    pub ny: usize,
    /// Number of nonlinear equality constraints `h`.
    pub nz: usize,
    /// Total number of multipliers, `nw = ny + nz`.
    pub nw: usize,
}

impl MasterDims {
    /// Assemble the dimensions; `nw` is derived.
    pub fn new(nx: usize, np: usize, ny: usize, nz: usize) -> Self {
        Self { nx, np, ny, nz, nw: ny + nz }
    }
}

/// What an objective evaluation is asked to fill in.
pub struct ObjectiveOptions<'a> {
    /// Whether the Hessian `fxx` is needed.
    pub eval_fxx: bool,
    /// Whether the mixed derivatives `fxp` are needed.
    pub eval_fxp: bool,
    /// Indices of the current basic variables, for evaluation-side
    /// optimizations; may be ignored.
    pub ibasic: &'a [usize],
}

/// What a constraint evaluation is asked to fill in.
pub struct ConstraintOptions<'a> {
    /// Whether the Jacobian with respect to `x` is needed.
    pub eval_ddx: bool,
    /// Whether the Jacobian with respect to `p` is needed.
    pub eval_ddp: bool,
    /// Indices of the current basic variables; may be ignored.
    pub ibasic: &'a [usize],
}

/// Result of an objective evaluation `f(x, p)`.
#[derive(Debug, Clone)]
pub struct ObjectiveResult {
    /// The objective value.
    pub value: f64,
    /// Gradient with respect to `x`.
    pub fx: DVector<f64>,
    /// Gradient with respect to `p`.
    pub fp: DVector<f64>,
    /// Hessian with respect to `x`, dense or diagonal.
    pub fxx: HessianMatrix,
    /// Mixed second derivatives (`nx × np`).
    pub fxp: DMatrix<f64>,
    /// Set by the evaluator to signal a failed evaluation.
    pub failed: bool,
}

impl ObjectiveResult {
    /// Zero-initialized result for the given dimensions.
    pub fn new(dims: &MasterDims) -> Self {
        Self {
            value: 0.0,
            fx: DVector::zeros(dims.nx),
            fp: DVector::zeros(dims.np),
            fxx: HessianMatrix::zeros(dims.nx),
            fxp: DMatrix::zeros(dims.nx, dims.np),
            failed: false,
        }
    }
}

/// Result of a constraint evaluation (`h(x, p)` or `v(x, p)`).
#[derive(Debug, Clone)]
pub struct ConstraintResult {
    /// The constraint values.
    pub val: DVector<f64>,
    /// Jacobian with respect to `x`.
    pub ddx: DMatrix<f64>,
    /// Jacobian with respect to `p`.
    pub ddp: DMatrix<f64>,
    /// Set by the evaluator to signal a failed evaluation.
    pub failed: bool,
}

impl ConstraintResult {
    /// Zero-initialized result with `rows` constraint values.
    pub fn new(rows: usize, dims: &MasterDims) -> Self {
        Self {
            val: DVector::zeros(rows),
            ddx: DMatrix::zeros(rows, dims.nx),
            ddp: DMatrix::zeros(rows, dims.np),
            failed: false,
        }
    }
}

/// Objective evaluation callback.
pub type ObjectiveFn =
    Box<dyn FnMut(&DVector<f64>, &DVector<f64>, &ObjectiveOptions, &mut ObjectiveResult)>;

/// Constraint evaluation callback.
pub type ConstraintFn =
    Box<dyn FnMut(&DVector<f64>, &DVector<f64>, &ConstraintOptions, &mut ConstraintResult)>;

/// Definition of a master optimization problem.
pub struct MasterProblem {
    /// Dimensions of the master variables.
    pub dims: MasterDims,
    /// Coefficient matrix of the linear constraints on `x` (`ny × nx`).
    pub ax: DMatrix<f64>,
    /// Coefficient matrix of the linear constraints on `p` (`ny × np`).
    pub ap: DMatrix<f64>,
    /// Right-hand side of the linear constraints.
    pub b: DVector<f64>,
    /// Lower bounds on `x` (`-inf` for unbounded entries).
    pub xlower: DVector<f64>,
    /// Upper bounds on `x` (`+inf` for unbounded entries).
    pub xupper: DVector<f64>,
    /// The objective function `f(x, p)`.
    pub f: ObjectiveFn,
    /// The nonlinear equality constraints `h(x, p)`.
    pub h: ConstraintFn,
    /// The constraints `v(x, p)` governing the parameter variables.
    pub v: ConstraintFn,
}

impl MasterProblem {
    /// Check all matrix and vector dimensions against `dims`.
    pub fn validate(&self) -> Result<(), CoreError> {
        let MasterDims { nx, np, ny, .. } = self.dims;
        if self.ax.shape() != (ny, nx) {
            return Err(CoreError::DimMismatch {
                context: "MasterProblem::ax",
                expected: ny * nx,
                actual: self.ax.nrows() * self.ax.ncols(),
            });
        }
        if self.ap.shape() != (ny, np) {
            return Err(CoreError::DimMismatch {
                context: "MasterProblem::ap",
                expected: ny * np,
                actual: self.ap.nrows() * self.ap.ncols(),
            });
        }
        if self.b.len() != ny {
            return Err(CoreError::DimMismatch {
                context: "MasterProblem::b",
                expected: ny,
                actual: self.b.len(),
            });
        }
        if self.xlower.len() != nx {
            return Err(CoreError::DimMismatch {
                context: "MasterProblem::xlower",
                expected: nx,
                actual: self.xlower.len(),
            });
        }
        if self.xupper.len() != nx {
            return Err(CoreError::DimMismatch {
                context: "MasterProblem::xupper",
                expected: nx,
                actual: self.xupper.len(),
            });
        }
        Ok(())
    }
}

/// Sensitivity derivatives of the solution with respect to `nc` external
/// parameters `c`.
#[derive(Debug, Clone)]
pub struct Sensitivity {
    /// Derivatives of the primal variables, `nx × nc`.
    pub dxdc: DMatrix<f64>,
    /// Derivatives of the parameter variables, `np × nc`.
    pub dpdc: DMatrix<f64>,
    /// Derivatives of the multipliers `w = (y, z)`, `nw × nc`.
    pub dwdc: DMatrix<f64>,
    /// Derivatives of the instability measures, `nx × nc`; zero on the
    /// rows of stable variables.
    pub dzdc: DMatrix<f64>,
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self {
            dxdc: DMatrix::zeros(0, 0),
            dpdc: DMatrix::zeros(0, 0),
            dwdc: DMatrix::zeros(0, 0),
            dzdc: DMatrix::zeros(0, 0),
        }
    }
}

impl Sensitivity {
    /// Zero-initialized sensitivities for `nc` parameters.
    pub fn new(dims: &MasterDims, nc: usize) -> Self {
        Self {
            dxdc: DMatrix::zeros(dims.nx, nc),
            dpdc: DMatrix::zeros(dims.np, nc),
            dwdc: DMatrix::zeros(dims.nw, nc),
            dzdc: DMatrix::zeros(dims.nx, nc),
        }
    }

    /// Resize for a new parameter count, zeroing the contents.
    pub fn resize(&mut self, dims: &MasterDims, nc: usize) {
        *self = Self::new(dims, nc);
    }
}

/// State of the master variables `u = (x, p, w)` with `w = (y, z)`.
#[derive(Debug, Clone)]
pub struct MasterState {
    /// Primal variables.
    pub x: DVector<f64>,
    /// Parameter variables.
    pub p: DVector<f64>,
    /// Multipliers of the linear equality constraints.
    pub y: DVector<f64>,
    /// Multipliers of the nonlinear equality constraints.
    pub z: DVector<f64>,
    /// Stability classification of the primal variables at the last
    /// iterate.
    pub stability: Stability,
}

impl MasterState {
    /// Zero-initialized state for the given dimensions.
    pub fn new(dims: &MasterDims) -> Self {
        Self {
            x: DVector::zeros(dims.nx),
            p: DVector::zeros(dims.np),
            y: DVector::zeros(dims.ny),
            z: DVector::zeros(dims.nz),
            stability: Stability::default(),
        }
    }
}

/// Outcome of an optimization calculation.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    /// Whether the calculation converged.
    pub succeeded: bool,
    /// Reason for the failure when `succeeded` is false.
    pub failure_reason: String,
    /// Number of outer iterations performed.
    pub iterations: u32,
    /// Final residual error, `max(optimality, feasibility)`.
    pub error: f64,
    /// Final optimality error.
    pub error_optimality: f64,
    /// Final feasibility error.
    pub error_feasibility: f64,
    /// Number of objective evaluations.
    pub num_objective_evals: usize,
    /// Number of constraint evaluations (`h` and `v` together).
    pub num_constraint_evals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_problem(dims: MasterDims) -> MasterProblem {
        MasterProblem {
            dims,
            ax: DMatrix::zeros(dims.ny, dims.nx),
            ap: DMatrix::zeros(dims.ny, dims.np),
            b: DVector::zeros(dims.ny),
            xlower: DVector::from_element(dims.nx, f64::NEG_INFINITY),
            xupper: DVector::from_element(dims.nx, f64::INFINITY),
            f: Box::new(|_, _, _, _| {}),
            h: Box::new(|_, _, _, _| {}),
            v: Box::new(|_, _, _, _| {}),
        }
    }

    #[test]
    fn validate_accepts_consistent_dims() {
        let problem = dummy_problem(MasterDims::new(4, 1, 2, 1));
        assert!(problem.validate().is_ok());
    }

    #[test]
    fn validate_rejects_wrong_bounds_len() {
        let mut problem = dummy_problem(MasterDims::new(4, 0, 2, 0));
        problem.xlower = DVector::zeros(3);
        assert!(matches!(
            problem.validate(),
            Err(CoreError::DimMismatch { context: "MasterProblem::xlower", .. })
        ));
    }
}
