//! Fullspace method: factor the complete KKT matrix.
//!
//! The whole `(nx + np + nw) × (nx + np + nw)` system is assembled with
//! the constraint rows in echelonized form and factored by partial-pivot
//! LU. Canonical rows beyond the rank of `W` are zero, so a deficient
//! constraint matrix shows up as NaN solution components, which the
//! facade projects onto zero steps. Unstable variables keep their row
//! replaced by an identity row pinning them to their current value.

use nalgebra::DVector;

use crate::error::CoreError;
use crate::kkt::{CanonicalCapture, KktDecomposeArgs};
use crate::linalg::RankRevealingLu;
use crate::problem::MasterDims;

pub(crate) struct FullspaceFactors {
    lu: RankRevealingLu,
}

pub(crate) fn decompose(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    args: &KktDecomposeArgs,
) -> Result<FullspaceFactors, CoreError> {
    let MasterDims { nx, np, nw, .. } = *dims;
    let rank = cap.rank;
    let t = nx + np + nw;
    let mut m = nalgebra::DMatrix::<f64>::zeros(t, t);

    for i in 0..nx {
        for j in 0..nx {
            m[(i, j)] = args.hxx.entry(i, j);
        }
        for c in 0..np {
            m[(i, nx + c)] = args.hxp[(i, c)];
        }
        for k in 0..rank {
            m[(i, nx + np + k)] = cap.wc[(k, i)];
        }
    }
    for c in 0..np {
        for j in 0..nx {
            m[(nx + c, j)] = args.vx[(c, j)];
        }
        for d in 0..np {
            m[(nx + c, nx + d)] = args.vp[(c, d)];
        }
    }
    for k in 0..rank {
        for j in 0..nx {
            m[(nx + np + k, j)] = cap.wc[(k, j)];
        }
        for c in 0..np {
            m[(nx + np + k, nx + c)] = cap.wpc[(k, c)];
        }
    }

    // Unstable variables are pinned: their row degenerates to x̂[i] = x'[i],
    // while their column keeps coupling the fixed value into the other rows.
    for &i in &cap.ju {
        for j in 0..t {
            m[(i, j)] = 0.0;
        }
        m[(i, i)] = 1.0;
    }

    let mut lu = RankRevealingLu::new();
    lu.decompose(&m)?;
    Ok(FullspaceFactors { lu })
}

pub(crate) fn solve(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    factors: &FullspaceFactors,
    tobj: &DVector<f64>,
    xfix: &DVector<f64>,
    tv: &DVector<f64>,
    bhat: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>, DVector<f64>) {
    let MasterDims { nx, np, nw, .. } = *dims;
    let rank = cap.rank;
    let t = nx + np + nw;

    let mut rhs = DVector::zeros(t);
    for i in 0..nx {
        rhs[i] = tobj[i];
    }
    for &i in &cap.ju {
        rhs[i] = xfix[i];
    }
    for c in 0..np {
        rhs[nx + c] = tv[c];
    }
    for k in 0..rank {
        rhs[nx + np + k] = bhat[k];
    }

    factors.lu.solve_in_place(&mut rhs);

    let xhat = rhs.rows(0, nx).clone_owned();
    let phat = rhs.rows(nx, np).clone_owned();
    let what = rhs.rows(nx + np, rank).clone_owned();
    (xhat, phat, what)
}
