//! Rangespace method: eliminate the primal block through the Hessian.
//!
//! With the stable Hessian block invertible, the stable primal unknowns
//! are expressed as `x̂s = Hss⁻¹ (rx − Hxp·p̂ − Wcsᵀ·ŵ)` and substituted
//! into the parameter and constraint rows, leaving an `(np + rank)` system
//! in `(p̂, ŵ)`. The diagonal Hessian variant avoids factoring `Hss`
//! altogether; the dense variant pays one LU of the stable block.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::kkt::{CanonicalCapture, HessianMatrix, KktDecomposeArgs};
use crate::linalg::{gather_cols, gather_rows, gather_vec, scatter_vec, RankRevealingLu};
use crate::problem::MasterDims;

pub(crate) struct RangespaceFactors {
    /// Solves `Hss·x = rhs`, either by diagonal division or a dense LU.
    hss: StableHessian,
    /// `Hss⁻¹ · Hxp_s` (ns × np).
    x1: DMatrix<f64>,
    /// `Hss⁻¹ · Wcsᵀ` (ns × rank).
    x2: DMatrix<f64>,
    /// Stable columns of `R·Wx` (rank × ns).
    wcs: DMatrix<f64>,
    /// Unstable columns of `R·Wx` (rank × nu).
    wcu: DMatrix<f64>,
    /// Stable columns of `Vx` (np × ns).
    vxs: DMatrix<f64>,
    /// Unstable columns of `Vx` (np × nu).
    vxu: DMatrix<f64>,
    /// Unstable block `H[js, ju]` coupling pinned values into stable rows.
    hsu: DMatrix<f64>,
    /// LU of the `(np + rank)` reduced system in `(p̂, ŵ)`.
    lu: RankRevealingLu,
}

enum StableHessian {
    Diagonal(DVector<f64>),
    Dense(RankRevealingLu),
}

impl StableHessian {
    fn solve_vec(&self, rhs: &DVector<f64>) -> DVector<f64> {
        match self {
            StableHessian::Diagonal(d) => rhs.component_div(d),
            StableHessian::Dense(lu) => {
                let mut x = rhs.clone();
                lu.solve_in_place(&mut x);
                x
            }
        }
    }

    fn solve_mat(&self, rhs: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            StableHessian::Diagonal(d) => {
                DMatrix::from_fn(rhs.nrows(), rhs.ncols(), |i, j| rhs[(i, j)] / d[i])
            }
            StableHessian::Dense(lu) => {
                let mut x = rhs.clone();
                lu.solve_mat_in_place(&mut x);
                x
            }
        }
    }
}

pub(crate) fn decompose(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    args: &KktDecomposeArgs,
) -> Result<RangespaceFactors, CoreError> {
    let MasterDims { np, .. } = *dims;
    let rank = cap.rank;
    let js = &cap.js;
    let ju = &cap.ju;

    let hss = match args.hxx {
        HessianMatrix::Diagonal(d) => StableHessian::Diagonal(gather_vec(d, js)),
        HessianMatrix::Dense(_) => {
            let block = args.hxx.block(js, js);
            let mut lu = RankRevealingLu::new();
            lu.decompose(&block)?;
            StableHessian::Dense(lu)
        }
    };

    let hxp_s = gather_rows(args.hxp, js);
    let wcs = gather_cols(&cap.wc, js);
    let wcu = gather_cols(&cap.wc, ju);
    let vxs = gather_cols(args.vx, js);
    let vxu = gather_cols(args.vx, ju);
    let hsu = args.hxx.block(js, ju);

    let x1 = hss.solve_mat(&hxp_s);
    let x2 = hss.solve_mat(&wcs.transpose());

    // Schur complement in (p̂, ŵ):
    //   [ Vp − Vxs·X1       −Vxs·X2      ] [p̂]   [ rv − Vxs·Hss⁻¹ rx ]
    //   [ Wpc − Wcs·X1      −Wcs·X2      ] [ŵ] = [ rc − Wcs·Hss⁻¹ rx ]
    let t = np + rank;
    let mut m = DMatrix::zeros(t, t);
    let a11 = args.vp - &vxs * &x1;
    let a12 = -(&vxs * &x2);
    let a21 = &cap.wpc - &wcs * &x1;
    let a22 = -(&wcs * &x2);
    m.view_mut((0, 0), (np, np)).copy_from(&a11);
    m.view_mut((0, np), (np, rank)).copy_from(&a12);
    m.view_mut((np, 0), (rank, np)).copy_from(&a21);
    m.view_mut((np, np), (rank, rank)).copy_from(&a22);

    let mut lu = RankRevealingLu::new();
    lu.decompose(&m)?;

    Ok(RangespaceFactors { hss, x1, x2, wcs, wcu, vxs, vxu, hsu, lu })
}

pub(crate) fn solve(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    factors: &RangespaceFactors,
    tobj: &DVector<f64>,
    xfix: &DVector<f64>,
    tv: &DVector<f64>,
    bhat: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>, DVector<f64>) {
    let MasterDims { nx, np, .. } = *dims;
    let rank = cap.rank;
    let js = &cap.js;
    let ju = &cap.ju;

    let xfix_u = gather_vec(xfix, ju);

    // Move the pinned columns to the right-hand side.
    let rx = gather_vec(tobj, js) - &factors.hsu * &xfix_u;
    let rv = tv - &factors.vxu * &xfix_u;
    let rc = bhat - &factors.wcu * &xfix_u;

    let y1 = factors.hss.solve_vec(&rx);

    let mut rhs = DVector::zeros(np + rank);
    rhs.rows_mut(0, np).copy_from(&(&rv - &factors.vxs * &y1));
    rhs.rows_mut(np, rank).copy_from(&(&rc - &factors.wcs * &y1));
    factors.lu.solve_in_place(&mut rhs);

    let phat = rhs.rows(0, np).clone_owned();
    let what = rhs.rows(np, rank).clone_owned();

    let xs = y1 - &factors.x1 * &phat - &factors.x2 * &what;
    let mut xhat = DVector::zeros(nx);
    scatter_vec(&mut xhat, js, &xs);
    scatter_vec(&mut xhat, ju, &xfix_u);

    (xhat, phat, what)
}
