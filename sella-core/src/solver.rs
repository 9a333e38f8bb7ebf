//! Outer Newton iteration driver.
//!
//! The solver owns a [`Stepper`] and loops: evaluate the callbacks, refresh
//! the canonical form, decompose and solve the saddle-point system, apply
//! the step (aggressively or conservatively), and judge convergence on the
//! relative optimality/feasibility errors. Non-convergence is reported in
//! the returned [`SolveResult`], not as an error.

use nalgebra::DVector;

use crate::error::CoreError;
use crate::linalg::{all_finite, inf_norm};
use crate::problem::{
    ConstraintOptions, ConstraintResult, MasterDims, MasterProblem, MasterState,
    ObjectiveOptions, ObjectiveResult, Sensitivity, SolveResult,
};
use crate::settings::{SolverSettings, StepMode};
use crate::stepper::{EvalContext, MasterStep, StepResiduals, Stepper};

fn eval_ctx<'a>(
    fres: &'a ObjectiveResult,
    hres: &'a ConstraintResult,
    vres: &'a ConstraintResult,
) -> EvalContext<'a> {
    EvalContext {
        fx: &fres.fx,
        fxx: &fres.fxx,
        fxp: &fres.fxp,
        h: &hres.val,
        jx: &hres.ddx,
        jp: &hres.ddp,
        v: &vres.val,
        vx: &vres.ddx,
        vp: &vres.ddp,
    }
}

/// Driver for master optimization problems.
pub struct Solver {
    dims: MasterDims,
    settings: SolverSettings,
    stepper: Stepper,

    fres: ObjectiveResult,
    hres: ConstraintResult,
    vres: ConstraintResult,

    step: MasterStep,
    res: StepResiduals,

    xtrial: DVector<f64>,
    ptrial: DVector<f64>,
    dxtrial: DVector<f64>,

    /// Duals of the lower bounds, kept consistent with the barrier
    /// relation `zl = mu / (x - xlower)`.
    zl: DVector<f64>,
    /// Duals of the upper bounds, `zu = mu / (x - xupper)` (non-positive).
    zu: DVector<f64>,

    fcurrent: f64,
    fprev: f64,

    result: SolveResult,
}

impl Solver {
    /// Construct a solver for the given problem shape.
    pub fn new(problem: &MasterProblem) -> Result<Self, CoreError> {
        problem.validate()?;
        let dims = problem.dims;
        Ok(Self {
            dims,
            settings: SolverSettings::default(),
            stepper: Stepper::new(problem)?,
            fres: ObjectiveResult::new(&dims),
            hres: ConstraintResult::new(dims.nz, &dims),
            vres: ConstraintResult::new(dims.np, &dims),
            step: MasterStep::default(),
            res: StepResiduals::default(),
            xtrial: DVector::zeros(dims.nx),
            ptrial: DVector::zeros(dims.np),
            dxtrial: DVector::zeros(dims.nx),
            zl: DVector::zeros(dims.nx),
            zu: DVector::zeros(dims.nx),
            fcurrent: 0.0,
            fprev: 0.0,
            result: SolveResult::default(),
        })
    }

    /// Install the solver settings.
    pub fn set_settings(&mut self, settings: &SolverSettings) {
        self.settings = settings.clone();
        self.stepper.set_settings(settings);
    }

    /// The result of the last solve.
    pub fn result(&self) -> &SolveResult {
        &self.result
    }

    /// Solve the optimization problem starting from (and updating) `state`.
    pub fn solve(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<SolveResult, CoreError> {
        problem.validate()?;
        self.check_state_dims(state)?;
        self.result = SolveResult::default();

        // A problem without variables has nothing to solve.
        if self.dims.nx == 0 {
            self.result.succeeded = true;
            return Ok(self.result.clone());
        }

        self.initialize(problem, state)?;
        log::debug!(
            "initialized: f = {:.6e}, error = {:.3e}",
            self.fcurrent,
            self.result.error
        );

        let maxiters = self.settings.max_iterations;
        while self.result.iterations < maxiters && !self.result.succeeded {
            self.result.iterations += 1;

            if !self.apply_newton_stepping(problem, state)? {
                self.result.failure_reason =
                    "objective evaluation produced non-finite values along the Newton direction"
                        .to_string();
                break;
            }

            if self.converged() {
                self.result.succeeded = true;
                break;
            }

            if !self.evaluate(problem, state)? {
                self.result.failure_reason =
                    "objective or constraint evaluation failed at the accepted iterate"
                        .to_string();
                break;
            }
            self.compute_newton_step(problem, state)?;
            self.update_result_errors();

            log::debug!(
                "iter {:>3}: f = {:.6e}, optimality = {:.3e}, feasibility = {:.3e}",
                self.result.iterations,
                self.fcurrent,
                self.result.error_optimality,
                self.result.error_feasibility
            );
        }

        if !self.result.succeeded && self.result.failure_reason.is_empty() {
            self.result.failure_reason = "max iterations reached".to_string();
        }

        state.stability = self.stepper.stability().clone();
        Ok(self.result.clone())
    }

    /// Compute sensitivity derivatives with respect to external parameters,
    /// reusing the decomposition of the last Newton step.
    pub fn sensitivities(
        &mut self,
        dgdc: &nalgebra::DMatrix<f64>,
        dbdc: &nalgebra::DMatrix<f64>,
        dhdc: &nalgebra::DMatrix<f64>,
        sens: &mut Sensitivity,
    ) -> Result<(), CoreError> {
        self.stepper.sensitivities(dgdc, dbdc, dhdc, sens)
    }

    fn check_state_dims(&self, state: &MasterState) -> Result<(), CoreError> {
        let MasterDims { nx, np, ny, nz, .. } = self.dims;
        if state.x.len() != nx {
            return Err(CoreError::DimMismatch {
                context: "MasterState::x",
                expected: nx,
                actual: state.x.len(),
            });
        }
        if state.p.len() != np {
            return Err(CoreError::DimMismatch {
                context: "MasterState::p",
                expected: np,
                actual: state.p.len(),
            });
        }
        if state.y.len() != ny {
            return Err(CoreError::DimMismatch {
                context: "MasterState::y",
                expected: ny,
                actual: state.y.len(),
            });
        }
        if state.z.len() != nz {
            return Err(CoreError::DimMismatch {
                context: "MasterState::z",
                expected: nz,
                actual: state.z.len(),
            });
        }
        Ok(())
    }

    fn initialize(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<(), CoreError> {
        let nx = self.dims.nx;
        let mu = self.settings.mu;

        // Bring the initial guess inside the bounds exactly.
        for i in 0..nx {
            state.x[i] = state.x[i].max(problem.xlower[i]).min(problem.xupper[i]);
        }

        // Detect and pin the strictly unstable variables.
        self.stepper.initialize(problem, state)?;

        // Bound duals consistent with the interior-point barrier.
        for i in 0..nx {
            let xl = problem.xlower[i];
            let xu = problem.xupper[i];
            self.zl[i] = if xl.is_finite() {
                if state.x[i] == xl { 1.0 } else { mu / (state.x[i] - xl) }
            } else {
                0.0
            };
            self.zu[i] = if xu.is_finite() {
                if state.x[i] == xu { -1.0 } else { mu / (state.x[i] - xu) }
            } else {
                0.0
            };
        }

        if !self.evaluate(problem, state)? {
            return Err(CoreError::NonFiniteInit);
        }
        self.fprev = self.fcurrent;

        self.compute_newton_step(problem, state)?;
        self.update_result_errors();
        Ok(())
    }

    /// Evaluate the objective and constraints with full derivatives.
    /// Returns false when any evaluation failed or produced non-finite
    /// numbers.
    fn evaluate(
        &mut self,
        problem: &mut MasterProblem,
        state: &MasterState,
    ) -> Result<bool, CoreError> {
        let np = self.dims.np;
        let nz = self.dims.nz;

        self.fres.failed = false;
        self.hres.failed = false;
        self.vres.failed = false;

        let opts = ObjectiveOptions {
            eval_fxx: true,
            eval_fxp: np > 0,
            ibasic: self.stepper.ibasic(),
        };
        (problem.f)(&state.x, &state.p, &opts, &mut self.fres);
        self.result.num_objective_evals += 1;
        self.fprev = self.fcurrent;
        self.fcurrent = self.fres.value;

        if nz > 0 {
            let hopts = ConstraintOptions {
                eval_ddx: true,
                eval_ddp: np > 0,
                ibasic: self.stepper.ibasic(),
            };
            (problem.h)(&state.x, &state.p, &hopts, &mut self.hres);
            self.result.num_constraint_evals += 1;
        }
        if np > 0 {
            let vopts = ConstraintOptions {
                eval_ddx: true,
                eval_ddp: true,
                ibasic: self.stepper.ibasic(),
            };
            (problem.v)(&state.x, &state.p, &vopts, &mut self.vres);
            self.result.num_constraint_evals += 1;
        }

        let ok = !self.fres.failed
            && !self.hres.failed
            && !self.vres.failed
            && self.fres.value.is_finite()
            && all_finite(&self.fres.fx)
            && self.fres.fxx.is_finite()
            && all_finite(&self.hres.val)
            && all_finite(&self.vres.val);
        Ok(ok)
    }

    /// Evaluate only the objective value at a trial iterate.
    fn evaluate_trial_value(&mut self, problem: &mut MasterProblem) -> f64 {
        self.fres.failed = false;
        let opts = ObjectiveOptions {
            eval_fxx: false,
            eval_fxp: false,
            ibasic: self.stepper.ibasic(),
        };
        (problem.f)(&self.xtrial, &self.ptrial, &opts, &mut self.fres);
        self.result.num_objective_evals += 1;
        if self.fres.failed {
            f64::NAN
        } else {
            self.fres.value
        }
    }

    fn compute_newton_step(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<(), CoreError> {
        let ctx = eval_ctx(&self.fres, &self.hres, &self.vres);
        self.stepper.canonicalize(problem, state, &ctx)?;
        self.stepper.residuals(problem, state, &ctx, &mut self.res);
        self.stepper.decompose(&ctx)?;
        self.stepper.solve(problem, state, &ctx, &mut self.step)?;
        Ok(())
    }

    fn update_result_errors(&mut self) {
        self.result.error_optimality = inf_norm(&self.res.ex);
        self.result.error_feasibility = inf_norm(&self.res.ey).max(inf_norm(&self.res.ev));
        self.result.error = self
            .result
            .error_optimality
            .max(self.result.error_feasibility);
    }

    fn converged(&self) -> bool {
        let s = &self.settings;
        if s.tolerancex > 0.0 && inf_norm(&self.dxtrial) < s.tolerancex {
            return true;
        }
        if s.tolerancef > 0.0
            && self.result.iterations > 1
            && (self.fcurrent - self.fprev).abs() < s.tolerancef
        {
            return true;
        }
        self.result.error < s.tolerance
    }

    /// Apply the Newton step to the state. Returns false when no finite
    /// trial iterate was found within the allowed backtrack attempts.
    fn apply_newton_stepping(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<bool, CoreError> {
        match self.settings.step {
            StepMode::Aggressive => self.apply_aggressive(problem, state),
            StepMode::Conservative => self.apply_conservative(problem, state),
        }
    }

    /// Full Newton step; only components that would violate their bounds
    /// are pulled back inside by the fraction-to-boundary factor.
    fn apply_aggressive(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<bool, CoreError> {
        let nx = self.dims.nx;
        let tau = self.settings.tau;
        let (dzl, dzu) = self.bound_dual_steps(problem, state);

        let mut alpha = 1.0;
        let mut accepted = false;
        for attempt in 0..=self.settings.backtrack.max_attempts {
            for i in 0..nx {
                let xi = state.x[i] + alpha * self.step.dx[i];
                self.xtrial[i] = if xi <= problem.xlower[i] {
                    state.x[i] - (state.x[i] - problem.xlower[i]) * tau
                } else if xi >= problem.xupper[i] {
                    state.x[i] + (problem.xupper[i] - state.x[i]) * tau
                } else {
                    xi
                };
            }
            self.ptrial = &state.p + &self.step.dp * alpha;

            if self.evaluate_trial_value(problem).is_finite() {
                accepted = true;
                break;
            }
            log::trace!(
                "backtrack {}: non-finite objective, halving step length",
                attempt + 1
            );
            alpha *= self.settings.backtrack.factor;
        }
        if !accepted {
            return Ok(false);
        }

        self.dxtrial = &self.xtrial - &state.x;
        state.x.copy_from(&self.xtrial);
        state.p.copy_from(&self.ptrial);
        for i in 0..self.dims.ny {
            state.y[i] += alpha * self.step.dw[i];
        }
        for i in 0..self.dims.nz {
            state.z[i] += alpha * self.step.dw[self.dims.ny + i];
        }

        self.update_bound_duals(problem, &dzl, &dzu, 1.0, 1.0);
        self.pin_strictly_unstable(problem, state);
        Ok(true)
    }

    /// Scale the whole step by the fraction-to-boundary multiplier so no
    /// component leaves the bounds, with the bound duals kept positive by
    /// their own step lengths.
    fn apply_conservative(
        &mut self,
        problem: &mut MasterProblem,
        state: &mut MasterState,
    ) -> Result<bool, CoreError> {
        let nx = self.dims.nx;
        let tau = self.settings.tau;
        let (dzl, dzu) = self.bound_dual_steps(problem, state);

        // Largest multiplier keeping x inside the bounds.
        let mut alpha: f64 = 1.0;
        for i in 0..nx {
            let dxi = self.step.dx[i];
            if dxi < 0.0 && problem.xlower[i].is_finite() {
                alpha = alpha.min(tau * (problem.xlower[i] - state.x[i]) / dxi);
            } else if dxi > 0.0 && problem.xupper[i].is_finite() {
                alpha = alpha.min(tau * (problem.xupper[i] - state.x[i]) / dxi);
            }
        }

        // Step lengths keeping the bound duals on their side of zero.
        let mut alpha_zl: f64 = 1.0;
        let mut alpha_zu: f64 = 1.0;
        for i in 0..nx {
            if dzl[i] < 0.0 && self.zl[i] > 0.0 {
                alpha_zl = alpha_zl.min(-tau * self.zl[i] / dzl[i]);
            }
            if dzu[i] > 0.0 && self.zu[i] < 0.0 {
                alpha_zu = alpha_zu.min(-tau * self.zu[i] / dzu[i]);
            }
        }

        let mut accepted = false;
        for attempt in 0..=self.settings.backtrack.max_attempts {
            self.xtrial = &state.x + &self.step.dx * alpha;
            for i in 0..nx {
                self.xtrial[i] = self.xtrial[i]
                    .max(problem.xlower[i])
                    .min(problem.xupper[i]);
            }
            self.ptrial = &state.p + &self.step.dp * alpha;

            if self.evaluate_trial_value(problem).is_finite() {
                accepted = true;
                break;
            }
            log::trace!(
                "backtrack {}: non-finite objective, halving step length",
                attempt + 1
            );
            alpha *= self.settings.backtrack.factor;
        }
        if !accepted {
            return Ok(false);
        }

        self.dxtrial = &self.xtrial - &state.x;
        state.x.copy_from(&self.xtrial);
        state.p.copy_from(&self.ptrial);
        for i in 0..self.dims.ny {
            state.y[i] += self.step.dw[i];
        }
        for i in 0..self.dims.nz {
            state.z[i] += self.step.dw[self.dims.ny + i];
        }

        self.update_bound_duals(problem, &dzl, &dzu, alpha_zl, alpha_zu);
        self.pin_strictly_unstable(problem, state);
        Ok(true)
    }

    /// Bound-dual steps from the linearized complementarity relations
    /// `(x - xlower)·zl = mu` and `(x - xupper)·zu = mu`.
    fn bound_dual_steps(
        &self,
        problem: &MasterProblem,
        state: &MasterState,
    ) -> (DVector<f64>, DVector<f64>) {
        let nx = self.dims.nx;
        let mu = self.settings.mu;
        let mut dzl = DVector::zeros(nx);
        let mut dzu = DVector::zeros(nx);
        for i in 0..nx {
            let gl = state.x[i] - problem.xlower[i];
            if gl.is_finite() && gl > 0.0 {
                dzl[i] = (mu - gl * self.zl[i] - self.zl[i] * self.step.dx[i]) / gl;
            }
            let gu = state.x[i] - problem.xupper[i];
            if gu.is_finite() && gu < 0.0 {
                dzu[i] = (mu - gu * self.zu[i] - self.zu[i] * self.step.dx[i]) / gu;
            }
        }
        (dzl, dzu)
    }

    /// Update the bound duals, clipping steps that would cross zero back
    /// by the fraction-to-boundary factor.
    fn update_bound_duals(
        &mut self,
        problem: &MasterProblem,
        dzl: &DVector<f64>,
        dzu: &DVector<f64>,
        alpha_zl: f64,
        alpha_zu: f64,
    ) {
        let tau = self.settings.tau;
        for i in 0..self.dims.nx {
            if problem.xlower[i].is_finite() {
                let step = alpha_zl * dzl[i];
                self.zl[i] += if self.zl[i] + step > 0.0 { step } else { -tau * self.zl[i] };
            }
            if problem.xupper[i].is_finite() {
                let step = alpha_zu * dzu[i];
                self.zu[i] += if self.zu[i] + step < 0.0 { step } else { -tau * self.zu[i] };
            }
        }
    }

    fn pin_strictly_unstable(&self, problem: &MasterProblem, state: &mut MasterState) {
        let st = self.stepper.stability();
        for &i in st.strictly_lower_unstable() {
            state.x[i] = problem.xlower[i];
        }
        for &i in st.strictly_upper_unstable() {
            state.x[i] = problem.xupper[i];
        }
    }
}
