//! Nullspace method: project onto the null space of `W`.
//!
//! In canonical coordinates the constraint rows read `x̂b + S·x̂n = b̂`, so
//! the basic unknowns are expressed through the non-basic ones and the
//! multiplier rows are eliminated with them. What remains is an
//! `(ns + np) × (ns + np)` system in the stable non-basic variables and
//! the parameters, followed by back-substitution for the basic variables
//! and the multipliers.

use nalgebra::{DMatrix, DVector};

use crate::error::CoreError;
use crate::kkt::{CanonicalCapture, KktDecomposeArgs};
use crate::linalg::{gather_cols, gather_rows, gather_vec, scatter_vec, RankRevealingLu};
use crate::problem::MasterDims;

pub(crate) struct NullspaceFactors {
    /// Variable indices of the basic slots.
    jb: Vec<usize>,
    /// Variable indices of the stable non-basic slots.
    sn: Vec<usize>,
    /// Variable indices of the unstable non-basic slots.
    un: Vec<usize>,
    /// Stable columns of `S` (rank × ns).
    ss: DMatrix<f64>,
    /// Unstable columns of `S` (rank × nu).
    su: DMatrix<f64>,
    /// Hessian blocks in canonical ordering.
    hbb: DMatrix<f64>,
    hbs: DMatrix<f64>,
    hbu: DMatrix<f64>,
    hbp: DMatrix<f64>,
    hsu: DMatrix<f64>,
    /// `Hsb − Ssᵀ·Hbb`, the multiplier-elimination factor.
    m1: DMatrix<f64>,
    /// Basic and unstable columns of `Vx`.
    vb: DMatrix<f64>,
    vu: DMatrix<f64>,
    /// LU of the reduced `(ns + np)` system.
    lu: RankRevealingLu,
}

pub(crate) fn decompose(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    args: &KktDecomposeArgs,
) -> Result<NullspaceFactors, CoreError> {
    let MasterDims { nx, np, .. } = *dims;
    let rank = cap.rank;

    let mut unstable = vec![false; nx];
    for &i in &cap.ju {
        unstable[i] = true;
    }

    let jb: Vec<usize> = cap.q[..rank].to_vec();
    let mut sn = Vec::new();
    let mut un = Vec::new();
    let mut ksn = Vec::new();
    let mut kun = Vec::new();
    for (k, &j) in cap.q[rank..].iter().enumerate() {
        if unstable[j] {
            un.push(j);
            kun.push(k);
        } else {
            sn.push(j);
            ksn.push(k);
        }
    }

    let ss = gather_cols(&cap.s, &ksn);
    let su = gather_cols(&cap.s, &kun);

    let hbb = args.hxx.block(&jb, &jb);
    let hbs = args.hxx.block(&jb, &sn);
    let hbu = args.hxx.block(&jb, &un);
    let hbp = gather_rows(args.hxp, &jb);
    let hsb = args.hxx.block(&sn, &jb);
    let hss = args.hxx.block(&sn, &sn);
    let hsu = args.hxx.block(&sn, &un);
    let hsp = gather_rows(args.hxp, &sn);
    let vb = gather_cols(args.vx, &jb);
    let vs = gather_cols(args.vx, &sn);
    let vu = gather_cols(args.vx, &un);

    let m1 = &hsb - ss.transpose() * &hbb;

    let nsn = sn.len();
    let t = nsn + np;
    let b11 = (&hss - ss.transpose() * &hbs) - &m1 * &ss;
    let b12 = (&hsp - ss.transpose() * &hbp) - &m1 * &cap.wpc;
    let b21 = &vs - &vb * &ss;
    let b22 = args.vp - &vb * &cap.wpc;

    let mut m = DMatrix::zeros(t, t);
    m.view_mut((0, 0), (nsn, nsn)).copy_from(&b11);
    m.view_mut((0, nsn), (nsn, np)).copy_from(&b12);
    m.view_mut((nsn, 0), (np, nsn)).copy_from(&b21);
    m.view_mut((nsn, nsn), (np, np)).copy_from(&b22);

    let mut lu = RankRevealingLu::new();
    lu.decompose(&m)?;

    Ok(NullspaceFactors { jb, sn, un, ss, su, hbb, hbs, hbu, hbp, hsu, m1, vb, vu, lu })
}

pub(crate) fn solve(
    dims: &MasterDims,
    cap: &CanonicalCapture,
    factors: &NullspaceFactors,
    tobj: &DVector<f64>,
    xfix: &DVector<f64>,
    tv: &DVector<f64>,
    bhat: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>, DVector<f64>) {
    let MasterDims { nx, np, .. } = *dims;
    let nsn = factors.sn.len();

    let xfix_u = gather_vec(xfix, &factors.un);

    let ab = gather_vec(tobj, &factors.jb) - &factors.hbu * &xfix_u;
    let asn = gather_vec(tobj, &factors.sn) - &factors.hsu * &xfix_u;
    let rv = tv - &factors.vu * &xfix_u;
    let tvec = bhat - &factors.su * &xfix_u;

    let mut rhs = DVector::zeros(nsn + np);
    rhs.rows_mut(0, nsn)
        .copy_from(&(&asn - factors.ss.transpose() * &ab - &factors.m1 * &tvec));
    rhs.rows_mut(nsn, np)
        .copy_from(&(&rv - &factors.vb * &tvec));
    factors.lu.solve_in_place(&mut rhs);

    let xs = rhs.rows(0, nsn).clone_owned();
    let phat = rhs.rows(nsn, np).clone_owned();

    let xb = &tvec - &factors.ss * &xs - &cap.wpc * &phat;
    let what = &ab - &factors.hbb * &xb - &factors.hbs * &xs - &factors.hbp * &phat;

    let mut xhat = DVector::zeros(nx);
    scatter_vec(&mut xhat, &factors.jb, &xb);
    scatter_vec(&mut xhat, &factors.sn, &xs);
    scatter_vec(&mut xhat, &factors.un, &xfix_u);

    (xhat, phat, what)
}
