//! One Newton step on the KKT system.
//!
//! The stepper owns the constraint matrix `W = [Ax; Jx]`, its echelon
//! form, the stability checker and the saddle-point solver, and drives
//! them through the per-iteration sequence: install the fresh Jacobian,
//! reweight and re-echelonize, reclassify the variables, then decompose
//! and solve for the Newton direction. Residual evaluation lives here as
//! well because it shares the canonical form.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::kkt::{HessianMatrix, KktDecomposeArgs, KktSol, KktSolveArgs, SaddlePointSolver};
use crate::linalg::{concat, scrub_nonfinite, vstack, Echelonizer};
use crate::problem::{MasterDims, MasterProblem, MasterState, Sensitivity};
use crate::settings::SolverSettings;
use crate::stability::{Stability, StabilityChecker};

/// Borrowed views of the latest objective/constraint evaluations.
pub struct EvalContext<'a> {
    /// Objective gradient at the iterate.
    pub fx: &'a DVector<f64>,
    /// Hessian block at the iterate.
    pub fxx: &'a HessianMatrix,
    /// Mixed second derivatives `fxp`.
    pub fxp: &'a DMatrix<f64>,
    /// Nonlinear constraint values `h(x, p)`.
    pub h: &'a DVector<f64>,
    /// Jacobian `hx` of the nonlinear constraints.
    pub jx: &'a DMatrix<f64>,
    /// Jacobian `hp` of the nonlinear constraints.
    pub jp: &'a DMatrix<f64>,
    /// Parameter constraint values `v(x, p)`.
    pub v: &'a DVector<f64>,
    /// Jacobian `vx`.
    pub vx: &'a DMatrix<f64>,
    /// Jacobian `vp`.
    pub vp: &'a DMatrix<f64>,
}

/// Residual information produced by [`Stepper::residuals`].
#[derive(Debug, Clone)]
pub struct StepResiduals {
    /// Absolute optimality residuals `|fx + Wᵀw|`, zero on unstable rows.
    pub rx: DVector<f64>,
    /// Canonical feasibility residuals, zero beyond the rank.
    pub ry: DVector<f64>,
    /// Relative optimality errors.
    pub ex: DVector<f64>,
    /// Relative feasibility errors.
    pub ey: DVector<f64>,
    /// Relative errors of the parameter constraints `v`.
    pub ev: DVector<f64>,
    /// The instability measures `z★ = fx + Wᵀw`.
    pub zstar: DVector<f64>,
}

impl Default for StepResiduals {
    fn default() -> Self {
        Self {
            rx: DVector::zeros(0),
            ry: DVector::zeros(0),
            ex: DVector::zeros(0),
            ey: DVector::zeros(0),
            ev: DVector::zeros(0),
            zstar: DVector::zeros(0),
        }
    }
}

/// Newton step for the master variables.
#[derive(Debug, Clone)]
pub struct MasterStep {
    /// Step of the primal variables.
    pub dx: DVector<f64>,
    /// Step of the parameter variables.
    pub dp: DVector<f64>,
    /// Step of the multipliers `w = (y, z)`.
    pub dw: DVector<f64>,
}

impl Default for MasterStep {
    fn default() -> Self {
        Self { dx: DVector::zeros(0), dp: DVector::zeros(0), dw: DVector::zeros(0) }
    }
}

/// Computes Newton steps, residuals and sensitivities for the driver.
pub struct Stepper {
    dims: MasterDims,
    settings: SolverSettings,
    /// Constraint matrix `W = [Ax; Jx]`; the `Jx` block is refreshed on
    /// every canonicalization.
    w: DMatrix<f64>,
    /// Parameter block `Wp = [Ap; Jp]`.
    wp: DMatrix<f64>,
    echelon: Echelonizer,
    checker: StabilityChecker,
    spsolver: SaddlePointSolver,
    weights: DVector<f64>,
    sol: KktSol,
}

impl Stepper {
    /// Construct a stepper for the given problem; computes the initial
    /// echelon form of `[Ax; 0]`.
    pub fn new(problem: &MasterProblem) -> Result<Self, CoreError> {
        problem.validate()?;
        let dims = problem.dims;
        let w = vstack(&problem.ax, &DMatrix::zeros(dims.nz, dims.nx));
        let wp = vstack(&problem.ap, &DMatrix::zeros(dims.nz, dims.np));
        let echelon = Echelonizer::from_matrix(&w)?;
        Ok(Self {
            dims,
            settings: SolverSettings::default(),
            w,
            wp,
            echelon,
            checker: StabilityChecker::new(dims.nx),
            spsolver: SaddlePointSolver::new(dims),
            weights: DVector::zeros(dims.nx),
            sol: KktSol::default(),
        })
    }

    /// Install the solver settings.
    pub fn set_settings(&mut self, settings: &SolverSettings) {
        self.settings = settings.clone();
        self.spsolver.set_method(settings.kkt.method);
    }

    /// The current stability classification.
    pub fn stability(&self) -> &Stability {
        self.checker.stability()
    }

    /// The echelon form of the constraint matrix.
    pub fn echelon(&self) -> &Echelonizer {
        &self.echelon
    }

    /// Indices of the current basic variables, forwarded to evaluators.
    pub fn ibasic(&self) -> &[usize] {
        self.echelon.indices_basic_variables()
    }

    /// Detect strictly unstable variables from the linear constraints and
    /// pin them to their bounds. Called once per solve, before the first
    /// evaluation.
    pub fn initialize(
        &mut self,
        problem: &MasterProblem,
        state: &mut MasterState,
    ) -> Result<(), CoreError> {
        self.checker.initialize(
            &problem.ax,
            &problem.b,
            &problem.xlower,
            &problem.xupper,
            self.settings.tolerance_linear_equality_constraints,
        )?;
        self.pin_strictly_unstable(problem, state);
        Ok(())
    }

    /// Refresh the canonical form for the current iterate: install the new
    /// Jacobian blocks, update the priority weights from the bound slacks,
    /// re-echelonize, reclassify the variables and pin the strictly
    /// unstable ones.
    pub fn canonicalize(
        &mut self,
        problem: &MasterProblem,
        state: &mut MasterState,
        eval: &EvalContext,
    ) -> Result<(), CoreError> {
        let MasterDims { nx, ny, nz, nw, .. } = self.dims;
        if eval.jx.shape() != (nz, nx) {
            return Err(CoreError::DimMismatch {
                context: "Stepper::canonicalize (Jx)",
                expected: nz * nx,
                actual: eval.jx.nrows() * eval.jx.ncols(),
            });
        }

        self.w.rows_mut(ny, nz).copy_from(eval.jx);
        self.wp.rows_mut(ny, nz).copy_from(eval.jp);

        // Priority weights from the bound slacks: variables close to (or
        // on) a bound become last-choice basic variables.
        for i in 0..nx {
            let gap = (state.x[i] - problem.xlower[i]).min(problem.xupper[i] - state.x[i]);
            let mut wi = if gap.is_infinite() { state.x[i].abs() } else { gap };
            if wi <= 0.0 {
                wi = -1.0;
            }
            self.weights[i] = wi;
        }

        if nz > 0 {
            self.echelon.compute(&self.w)?;
        } else {
            // The linear block never changes; restart from the pristine
            // factorization instead of accumulating swap round-off.
            self.echelon.reset();
        }
        self.echelon.update_with_priority_weights(&self.weights)?;
        self.echelon.clean_residual_roundoff_errors();

        if nw > 0 && self.echelon.num_basic_variables() == 0 {
            return Err(CoreError::RankCollapse { rows: nw });
        }

        let wdual = concat(&state.y, &state.z);
        self.checker.update(
            &self.w,
            &wdual,
            eval.fx,
            &state.x,
            &problem.xlower,
            &problem.xupper,
        );

        self.pin_strictly_unstable(problem, state);
        Ok(())
    }

    /// Compute the optimality and feasibility residuals at the current
    /// iterate. Call after [`canonicalize`](Self::canonicalize).
    ///
    /// The feasibility computation uses a sanitized `x'` in which the
    /// strictly unstable entries are held at their exact bound constants,
    /// so drift in pinned variables cannot corrupt the residuals of the
    /// constraints they participate in.
    pub fn residuals(
        &self,
        problem: &MasterProblem,
        state: &MasterState,
        eval: &EvalContext,
        out: &mut StepResiduals,
    ) {
        let MasterDims { nx, np, nw, .. } = self.dims;
        let st = self.checker.stability();

        let xprime = self.sanitized_x(problem, state);
        let wdual = concat(&state.y, &state.z);

        // Canonical feasibility residuals R·(Ax·x' + Ap·p − b, h).
        let res_w = concat(
            &(&problem.ax * &xprime + &problem.ap * &state.p - &problem.b),
            &eval.h.clone_owned(),
        );
        let rank = self.echelon.num_basic_variables();
        let rcan = self.echelon.r().rows(0, rank) * &res_w;

        // Canonical target b' sets the relative scale.
        let wtarget = concat(
            &problem.b.clone_owned(),
            &(eval.jx * &xprime + eval.jp * &state.p - eval.h),
        );
        let bhat = self.echelon.r().rows(0, rank) * &wtarget;

        out.ry = DVector::zeros(nw);
        out.ey = DVector::zeros(nw);
        for i in 0..rank {
            out.ry[i] = rcan[i];
            out.ey[i] = rcan[i].abs() / (1.0 + bhat[i].abs());
        }

        // Optimality residuals from the instability measure z★ = fx + Wᵀw.
        out.zstar = eval.fx + self.w.transpose() * &wdual;
        out.rx = out.zstar.abs();
        for &i in st.unstable() {
            out.rx[i] = 0.0;
        }
        out.ex = DVector::from_fn(nx, |i, _| out.rx[i] / (1.0 + eval.fx[i].abs()));

        out.ev = DVector::from_fn(np, |c, _| eval.v[c].abs() / (1.0 + eval.v[c].abs()));
    }

    /// Decompose the saddle-point matrix for the current iterate. Call
    /// after [`canonicalize`](Self::canonicalize); the decomposition is
    /// reused by [`solve`](Self::solve) and
    /// [`sensitivities`](Self::sensitivities).
    pub fn decompose(&mut self, eval: &EvalContext) -> Result<(), CoreError> {
        self.spsolver.decompose(KktDecomposeArgs {
            hxx: eval.fxx,
            hxp: eval.fxp,
            vx: eval.vx,
            vp: eval.vp,
            wp: &self.wp,
            echelon: &self.echelon,
            ju: self.checker.stability().unstable(),
        })
    }

    /// Solve for the Newton step. Call after [`decompose`](Self::decompose).
    ///
    /// The saddle-point problem is solved for the next iterates directly
    /// (better conditioned than solving for the steps when residuals are
    /// tiny) and the steps recovered by subtraction. Non-finite components
    /// from rank-deficient rows become zero steps.
    pub fn solve(
        &mut self,
        problem: &MasterProblem,
        state: &MasterState,
        eval: &EvalContext,
        step: &mut MasterStep,
    ) -> Result<(), CoreError> {
        let xprime = self.sanitized_x(problem, state);
        let wdual = concat(&state.y, &state.z);

        self.spsolver.solve(
            KktSolveArgs {
                hxx: eval.fxx,
                hxp: eval.fxp,
                vx: eval.vx,
                vp: eval.vp,
                wx: &self.w,
                wp: &self.wp,
                x: &xprime,
                p: &state.p,
                fx: eval.fx,
                v: eval.v,
                b: &problem.b,
                h: eval.h,
            },
            &mut self.sol,
        )?;

        step.dx = &self.sol.x - &xprime;
        step.dp = &self.sol.p - &state.p;
        step.dw = &self.sol.w - &wdual;
        scrub_nonfinite(&mut step.dx);
        scrub_nonfinite(&mut step.dp);
        scrub_nonfinite(&mut step.dw);
        Ok(())
    }

    /// Compute sensitivity derivatives with respect to `nc` external
    /// parameters by reusing the last decomposition.
    ///
    /// The right-hand sides are built from the derivative matrices `dgdc`
    /// (`nx×nc`), `dbdc` (`ny×nc`) and `dhdc` (`nz×nc`).
    pub fn sensitivities(
        &mut self,
        dgdc: &DMatrix<f64>,
        dbdc: &DMatrix<f64>,
        dhdc: &DMatrix<f64>,
        sens: &mut Sensitivity,
    ) -> Result<(), CoreError> {
        let MasterDims { nx, np, ny, nz, .. } = self.dims;
        if dgdc.nrows() != nx {
            return Err(CoreError::DimMismatch {
                context: "Stepper::sensitivities (dgdc)",
                expected: nx,
                actual: dgdc.nrows(),
            });
        }
        let nc = dgdc.ncols();
        if dbdc.shape() != (ny, nc) {
            return Err(CoreError::DimMismatch {
                context: "Stepper::sensitivities (dbdc)",
                expected: ny * nc,
                actual: dbdc.nrows() * dbdc.ncols(),
            });
        }
        if dhdc.shape() != (nz, nc) {
            return Err(CoreError::DimMismatch {
                context: "Stepper::sensitivities (dhdc)",
                expected: nz * nc,
                actual: dhdc.nrows() * dhdc.ncols(),
            });
        }

        sens.resize(&self.dims, nc);
        let rp = DVector::zeros(np);
        for c in 0..nc {
            let mut rx = -dgdc.column(c).clone_owned();
            for &i in self.checker.stability().unstable() {
                rx[i] = 0.0;
            }
            let rw = concat(
                &dbdc.column(c).clone_owned(),
                &(-dhdc.column(c).clone_owned()),
            );
            self.spsolver.solve_rhs(&rx, &rp, &rw, &mut self.sol)?;
            sens.dxdc.set_column(c, &self.sol.x);
            sens.dpdc.set_column(c, &self.sol.p);
            sens.dwdc.set_column(c, &self.sol.w);
        }

        // dz/dc is zero on stable rows; on unstable rows the measure moves
        // with the gradient and the multipliers.
        for &i in self.checker.stability().unstable() {
            for c in 0..nc {
                let coupling = self.w.column(i).dot(&sens.dwdc.column(c));
                sens.dzdc[(i, c)] = dgdc[(i, c)] + coupling;
            }
        }
        Ok(())
    }

    /// Steepest-descent direction of the Lagrange function, used as a
    /// diagnostic/fallback direction when Newton steps stall.
    pub fn steepest_descent_lagrange(
        &self,
        problem: &MasterProblem,
        state: &MasterState,
        eval: &EvalContext,
        step: &mut MasterStep,
    ) {
        let MasterDims { np, ny, nz, .. } = self.dims;
        let wdual = concat(&state.y, &state.z);

        step.dx = -(eval.fx + self.w.transpose() * &wdual);
        for &i in self.checker.stability().unstable() {
            step.dx[i] = 0.0;
        }
        step.dp = DVector::zeros(np);

        let rlin = &problem.ax * &state.x + &problem.ap * &state.p - &problem.b;
        let mut dw = DVector::zeros(ny + nz);
        for i in 0..ny {
            dw[i] = -rlin[i];
        }
        for i in 0..nz {
            dw[ny + i] = -eval.h[i];
        }
        step.dw = dw;
    }

    /// Copy of `x` with the strictly unstable entries replaced by their
    /// exact bound constants, so that drift in pinned variables can never
    /// leak into residuals or right-hand sides.
    fn sanitized_x(&self, problem: &MasterProblem, state: &MasterState) -> DVector<f64> {
        let mut xprime = state.x.clone();
        let st = self.checker.stability();
        for &i in st.strictly_lower_unstable() {
            xprime[i] = problem.xlower[i];
        }
        for &i in st.strictly_upper_unstable() {
            xprime[i] = problem.xupper[i];
        }
        xprime
    }

    fn pin_strictly_unstable(&self, problem: &MasterProblem, state: &mut MasterState) {
        let st = self.checker.stability();
        for &i in st.strictly_lower_unstable() {
            state.x[i] = problem.xlower[i];
        }
        for &i in st.strictly_upper_unstable() {
            state.x[i] = problem.xupper[i];
        }
    }
}
