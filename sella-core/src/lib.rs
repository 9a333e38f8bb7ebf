//! Sella: a dense saddle-point core for constrained nonlinear optimization.
//!
//! This library solves problems of the form
//!
//! ```text
//! minimize    f(x, p)
//! subject to  Ax·x + Ap·p = b
//!             h(x, p) = 0
//!             v(x, p) = 0
//!             xlower <= x <= xupper
//! ```
//!
//! with a primal-dual Newton iteration on the KKT system. The pieces that
//! make each Newton step feasible and accurate are exposed individually:
//!
//! - an [`Echelonizer`] maintaining the canonical form `R·W·Q = [I S]` of
//!   the constraint matrix `W = [Ax; Jx]` under Jacobian refreshes and
//!   bound-driven variable reorderings;
//! - a [`StabilityChecker`] partitioning the variables into stable,
//!   lower/upper-unstable and strictly-unstable sets;
//! - a [`SaddlePointSolver`] decomposing the canonical KKT system with a
//!   choice of Fullspace, Nullspace or Rangespace methods, robust against
//!   linearly dependent constraint rows and variables pinned to bounds;
//! - a [`Stepper`] assembling one Newton step, its residuals and the
//!   sensitivity derivatives;
//! - a [`Solver`] driving the outer iteration.
//!
//! # Example
//!
//! ```no_run
//! use nalgebra::{DMatrix, DVector};
//! use sella_core::{
//!     HessianMatrix, MasterDims, MasterProblem, MasterState, Solver, SolverSettings,
//! };
//!
//! // minimize sum((x - 2)^2) subject to x0 + x1 = 1, 0 <= x <= 1
//! let dims = MasterDims::new(2, 0, 1, 0);
//! let mut problem = MasterProblem {
//!     dims,
//!     ax: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
//!     ap: DMatrix::zeros(1, 0),
//!     b: DVector::from_vec(vec![1.0]),
//!     xlower: DVector::from_element(2, 0.0),
//!     xupper: DVector::from_element(2, 1.0),
//!     f: Box::new(|x, _p, _opts, res| {
//!         res.value = (x[0] - 2.0).powi(2) + (x[1] - 2.0).powi(2);
//!         res.fx = DVector::from_vec(vec![2.0 * (x[0] - 2.0), 2.0 * (x[1] - 2.0)]);
//!         res.fxx = HessianMatrix::Diagonal(DVector::from_element(2, 2.0));
//!     }),
//!     h: Box::new(|_, _, _, _| {}),
//!     v: Box::new(|_, _, _, _| {}),
//! };
//!
//! let mut state = MasterState::new(&dims);
//! state.x = DVector::from_vec(vec![0.3, 0.3]);
//!
//! let mut solver = Solver::new(&problem).unwrap();
//! solver.set_settings(&SolverSettings::default());
//! let result = solver.solve(&mut problem, &mut state).unwrap();
//! assert!(result.succeeded);
//! ```

pub mod error;
pub mod kkt;
pub mod linalg;
pub mod problem;
pub mod settings;
pub mod solver;
pub mod stability;
pub mod stepper;

pub use error::CoreError;
pub use kkt::{
    solve_canonical, CanonicalSaddleLhs, CanonicalSaddleRhs, CanonicalSaddleSol, HessianMatrix,
    KktMethod, SaddlePointSolver,
};
pub use linalg::{Echelonizer, FullPivLu, RankRevealingLu};
pub use problem::{
    ConstraintFn, ConstraintOptions, ConstraintResult, MasterDims, MasterProblem, MasterState,
    ObjectiveFn, ObjectiveOptions, ObjectiveResult, Sensitivity, SolveResult,
};
pub use settings::{
    BacktrackSettings, KktSettings, OutputSettings, SolverSettings, StepMode,
};
pub use solver::Solver;
pub use stability::{Stability, StabilityChecker};
pub use stepper::{EvalContext, MasterStep, StepResiduals, Stepper};
