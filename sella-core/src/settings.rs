//! Solver settings and tuning parameters.

pub use crate::kkt::KktMethod;

/// The stepping modes for the Newton updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Scale the whole Newton step by the largest multiplier that keeps the
    /// iterate inside the bounds (fraction-to-boundary) and the bound duals
    /// positive. The conventional choice in the optimization literature.
    Conservative,

    /// Take the full Newton step, then pull only the violating components
    /// back inside the bounds. Unconventional, but converges faster on many
    /// problems where most components never touch a bound.
    Aggressive,
}

/// Options for the solution of the KKT equations.
#[derive(Debug, Clone, Copy, Default)]
pub struct KktSettings {
    /// Which saddle-point method decomposes the canonical KKT system.
    pub method: KktMethod,
}

/// Options for the backtrack search triggered by a non-finite objective
/// value at a trial iterate.
#[derive(Debug, Clone, Copy)]
pub struct BacktrackSettings {
    /// Factor in (0, 1) applied to the step length on each backtrack.
    pub factor: f64,

    /// Maximum number of backtrack attempts before the step fails.
    pub max_attempts: u32,
}

impl Default for BacktrackSettings {
    fn default() -> Self {
        Self { factor: 0.5, max_attempts: 10 }
    }
}

/// Options consumed by an external outputter when tracing iterations.
///
/// The core itself only emits `log` records; these names and prefixes are
/// carried for the surrounding code that renders human-readable tables.
#[derive(Debug, Clone, Default)]
pub struct OutputSettings {
    /// Whether per-iteration output is requested.
    pub active: bool,

    /// Prefix for the primal variables `x` (e.g. `x[0]`, `x[1]`, ...).
    pub xprefix: String,

    /// Prefix for the dual variables `y`.
    pub yprefix: String,

    /// Prefix for the dual variables `z`.
    pub zprefix: String,

    /// Names of the primal variables; index-based names are used when empty.
    pub xnames: Vec<String>,

    /// Names of the dual variables; index-based names are used when empty.
    pub ynames: Vec<String>,
}

/// Settings for an optimization calculation.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Tolerance on the residual of the optimality/feasibility conditions.
    pub tolerance: f64,

    /// Tolerance on the variation of the primal variables. Set to a value
    /// greater than zero to also stop whenever `max|dx| < tolerancex`.
    pub tolerancex: f64,

    /// Tolerance on the variation of the objective value. Set to a value
    /// greater than zero to also stop whenever `|f - fprev| < tolerancef`.
    pub tolerancef: f64,

    /// Relative tolerance used when detecting variables whose bounds are
    /// forced by the linear equality constraints alone.
    pub tolerance_linear_equality_constraints: f64,

    /// Maximum number of outer iterations.
    pub max_iterations: u32,

    /// The perturbation/barrier parameter for the bound duals.
    pub mu: f64,

    /// The fraction-to-the-boundary parameter in (0, 1). Values very close
    /// to one can drive primal variables prematurely onto their bounds and
    /// trap them there until convergence.
    pub tau: f64,

    /// The stepping mode for the Newton updates.
    pub step: StepMode,

    /// Options for the solution of the KKT equations.
    pub kkt: KktSettings,

    /// Options for the backtrack search on non-finite objective values.
    pub backtrack: BacktrackSettings,

    /// Options for the external outputter.
    pub output: OutputSettings,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1.0e-6,
            tolerancex: 0.0,
            tolerancef: 0.0,
            tolerance_linear_equality_constraints: 1.0e-14,
            max_iterations: 200,
            mu: 1.0e-20,
            tau: 0.99,
            step: StepMode::Aggressive,
            kkt: KktSettings::default(),
            backtrack: BacktrackSettings::default(),
            output: OutputSettings::default(),
        }
    }
}
