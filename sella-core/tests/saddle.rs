//! Saddle-point solver tests: the canonical block kernel against its seed
//! scenarios, and the three KKT methods against manufactured solutions.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sella_core::{
    solve_canonical, CanonicalSaddleLhs, Echelonizer, HessianMatrix, KktMethod, MasterDims,
    SaddlePointSolver,
};
use sella_core::kkt::{KktDecomposeArgs, KktSol};

fn ones(n: usize) -> DVector<f64> {
    DVector::from_element(n, 1.0)
}

/// Random canonical problem with blocks kept away from degeneracy.
fn random_canonical(
    rng: &mut ChaCha8Rng,
    nb: usize,
    ns: usize,
    nu: usize,
    with_e: bool,
) -> CanonicalSaddleLhs {
    let mut gen = |lo: f64, hi: f64| rng.gen_range(lo..hi);
    CanonicalSaddleLhs {
        gb: DVector::from_fn(nb, |_, _| gen(2.0, 3.0)),
        gs: DVector::from_fn(ns, |_, _| gen(2.0, 3.0)),
        gu: DVector::from_fn(nu, |_, _| gen(2.0, 3.0)),
        bb: DVector::from_fn(nb, |_, _| gen(1.0, 2.0)),
        bs: DMatrix::from_fn(nb, ns, |_, _| gen(-1.0, 1.0)),
        bu: DMatrix::from_fn(nb, nu, |_, _| gen(-1.0, 1.0)),
        eb: DVector::from_fn(if with_e { nb } else { 0 }, |_, _| gen(0.1, 0.5)),
        es: DVector::from_fn(if with_e { ns } else { 0 }, |_, _| gen(0.1, 0.5)),
        eu: DVector::from_fn(if with_e { nu } else { 0 }, |_, _| gen(0.1, 0.5)),
    }
}

fn check_recovers_ones(lhs: &CanonicalSaddleLhs, tol: f64) {
    let n = lhs.num_variables();
    let nb = lhs.gb.len();
    let z = if lhs.has_e() { ones(n) } else { DVector::zeros(0) };
    let rhs = lhs.mul(&ones(n), &ones(nb), &z);
    let sol = solve_canonical(lhs, &rhs).unwrap();
    assert_relative_eq!(sol.x, ones(n), epsilon = tol);
    assert_relative_eq!(sol.y, ones(nb), epsilon = tol);
    if lhs.has_e() {
        assert_relative_eq!(sol.z, ones(n), epsilon = tol);
    }
}

#[test]
fn canonical_case_basic_only_with_e() {
    // Literal basic-only scenario; the solution is the ones vector.
    let lhs = CanonicalSaddleLhs {
        gb: DVector::from_vec(vec![9.0, 8.0, 7.0]),
        bb: DVector::from_vec(vec![1.0, 1.0, 1.0]),
        eb: DVector::from_vec(vec![1.0, 1.0, 1.0]),
        bs: DMatrix::zeros(3, 0),
        bu: DMatrix::zeros(3, 0),
        ..Default::default()
    };
    let rhs = sella_core::CanonicalSaddleRhs {
        ab: DVector::from_vec(vec![11.0, 10.0, 9.0]),
        b: DVector::from_vec(vec![1.0, 1.0, 1.0]),
        cb: DVector::from_vec(vec![2.0, 2.0, 2.0]),
        ..Default::default()
    };
    let sol = solve_canonical(&lhs, &rhs).unwrap();
    assert_relative_eq!(sol.x, ones(3), epsilon = 1e-12);
    assert_relative_eq!(sol.y, ones(3), epsilon = 1e-12);
    assert_relative_eq!(sol.z, ones(3), epsilon = 1e-12);
}

#[test]
fn canonical_case_mixed_blocks_with_e() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let lhs = random_canonical(&mut rng, 10, 35, 5, true);
    check_recovers_ones(&lhs, 1e-10);
}

#[test]
fn canonical_case_basic_and_stable_without_e() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let lhs = random_canonical(&mut rng, 10, 35, 0, false);
    check_recovers_ones(&lhs, 1e-10);
}

#[test]
fn canonical_case_basic_only_without_e() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let lhs = random_canonical(&mut rng, 10, 0, 0, false);
    check_recovers_ones(&lhs, 1e-10);
}

#[test]
fn canonical_case_basic_only_with_e_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let lhs = random_canonical(&mut rng, 10, 0, 0, true);
    check_recovers_ones(&lhs, 1e-10);
}

#[test]
fn canonical_case_single_variable_mixed() {
    // Literal single-variable scenario with one basic and one stable slot.
    let lhs = CanonicalSaddleLhs {
        gb: DVector::from_vec(vec![5.0]),
        gs: DVector::from_vec(vec![5.0]),
        bb: DVector::from_vec(vec![2.0]),
        bs: DMatrix::from_vec(1, 1, vec![2.0]),
        bu: DMatrix::zeros(1, 0),
        eb: DVector::from_vec(vec![1.0]),
        es: DVector::from_vec(vec![1.0]),
        ..Default::default()
    };
    let rhs = sella_core::CanonicalSaddleRhs {
        ab: DVector::from_vec(vec![8.0]),
        as_: DVector::from_vec(vec![8.0]),
        b: DVector::from_vec(vec![4.0]),
        cb: DVector::from_vec(vec![2.0]),
        cs: DVector::from_vec(vec![2.0]),
        ..Default::default()
    };
    let sol = solve_canonical(&lhs, &rhs).unwrap();
    assert_relative_eq!(sol.x, ones(2), epsilon = 1e-12);
    assert_relative_eq!(sol.y, ones(1), epsilon = 1e-12);
    assert_relative_eq!(sol.z, ones(2), epsilon = 1e-12);
}

const METHODS: [KktMethod; 3] = [
    KktMethod::Fullspace,
    KktMethod::Nullspace,
    KktMethod::Rangespace,
];

struct KktFixture {
    dims: MasterDims,
    hxx: HessianMatrix,
    hxp: DMatrix<f64>,
    vx: DMatrix<f64>,
    vp: DMatrix<f64>,
    wx: DMatrix<f64>,
    wp: DMatrix<f64>,
    echelon: Echelonizer,
}

impl KktFixture {
    fn new(
        rng: &mut ChaCha8Rng,
        nx: usize,
        np: usize,
        m: usize,
        diagonal_h: bool,
    ) -> Self {
        let dims = MasterDims::new(nx, np, m, 0);
        let hxx = if diagonal_h {
            HessianMatrix::Diagonal(DVector::from_fn(nx, |_, _| rng.gen_range(1.0..3.0)))
        } else {
            // Diagonally dominant dense Hessian, safely invertible.
            let mut h = DMatrix::from_fn(nx, nx, |_, _| rng.gen_range(-0.5..0.5));
            h = &h * h.transpose();
            for i in 0..nx {
                h[(i, i)] += 3.0;
            }
            HessianMatrix::Dense(h)
        };
        let hxp = DMatrix::from_fn(nx, np, |_, _| rng.gen_range(-0.5..0.5));
        let vx = DMatrix::from_fn(np, nx, |_, _| rng.gen_range(-0.5..0.5));
        let mut vp = DMatrix::from_fn(np, np, |_, _| rng.gen_range(-0.5..0.5));
        for c in 0..np {
            vp[(c, c)] += 3.0;
        }
        let wx = DMatrix::from_fn(m, nx, |_, _| rng.gen_range(-1.0..1.0));
        let wp = DMatrix::from_fn(m, np, |_, _| rng.gen_range(-1.0..1.0));
        let echelon = Echelonizer::from_matrix(&wx).unwrap();
        Self { dims, hxx, hxp, vx, vp, wx, wp, echelon }
    }

    fn decompose(&self, method: KktMethod, ju: &[usize]) -> SaddlePointSolver {
        let mut solver = SaddlePointSolver::new(self.dims);
        solver.set_method(method);
        solver
            .decompose(KktDecomposeArgs {
                hxx: &self.hxx,
                hxp: &self.hxp,
                vx: &self.vx,
                vp: &self.vp,
                wp: &self.wp,
                echelon: &self.echelon,
                ju,
            })
            .unwrap();
        solver
    }

    /// Right-hand side of the raw KKT equations at a known solution.
    fn rhs_at(
        &self,
        dx: &DVector<f64>,
        dp: &DVector<f64>,
        dw: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>, DVector<f64>) {
        let rx = self.hxx.mul_vec(dx) + &self.hxp * dp + self.wx.transpose() * dw;
        let rp = &self.vx * dx + &self.vp * dp;
        let rw = &self.wx * dx + &self.wp * dp;
        (rx, rp, rw)
    }
}

#[test]
fn kkt_methods_recover_a_manufactured_solution() {
    for &method in &METHODS {
        for &diagonal_h in &[true, false] {
            if method == KktMethod::Rangespace && !diagonal_h {
                // Dense Hessians are supported but tested separately below.
                continue;
            }
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            let fixture = KktFixture::new(&mut rng, 6, 0, 3, diagonal_h);
            let solver = fixture.decompose(method, &[]);

            let dx = DVector::from_fn(6, |i, _| 0.3 + 0.1 * i as f64);
            let dp = DVector::zeros(0);
            let dw = DVector::from_fn(3, |i, _| -0.5 + 0.4 * i as f64);
            let (rx, rp, rw) = fixture.rhs_at(&dx, &dp, &dw);

            let mut sol = KktSol::default();
            solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();

            assert_relative_eq!(sol.x, dx, epsilon = 1e-9);
            assert_relative_eq!(sol.w, dw, epsilon = 1e-9);
        }
    }
}

#[test]
fn kkt_rangespace_with_dense_hessian() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let fixture = KktFixture::new(&mut rng, 5, 0, 2, false);
    let solver = fixture.decompose(KktMethod::Rangespace, &[]);

    let dx = DVector::from_fn(5, |i, _| 1.0 - 0.2 * i as f64);
    let dp = DVector::zeros(0);
    let dw = DVector::from_fn(2, |i, _| 0.7 * (i as f64 + 1.0));
    let (rx, rp, rw) = fixture.rhs_at(&dx, &dp, &dw);

    let mut sol = KktSol::default();
    solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();
    assert_relative_eq!(sol.x, dx, epsilon = 1e-9);
    assert_relative_eq!(sol.w, dw, epsilon = 1e-9);
}

#[test]
fn kkt_methods_pin_unstable_variables() {
    let ju = [1_usize, 4];
    for &method in &METHODS {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let fixture = KktFixture::new(&mut rng, 6, 0, 2, true);
        let solver = fixture.decompose(method, &ju);

        // Manufacture a solution whose unstable components are zero.
        let mut dx = DVector::from_fn(6, |i, _| 0.5 + 0.1 * i as f64);
        for &i in &ju {
            dx[i] = 0.0;
        }
        let dp = DVector::zeros(0);
        let dw = DVector::from_fn(2, |i, _| 0.3 - 0.8 * i as f64);
        let (mut rx, rp, rw) = fixture.rhs_at(&dx, &dp, &dw);
        // The unstable rows of the right-hand side are ignored.
        for &i in &ju {
            rx[i] = 123.0;
        }

        let mut sol = KktSol::default();
        solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();

        assert_relative_eq!(sol.x, dx, epsilon = 1e-9);
        assert_relative_eq!(sol.w, dw, epsilon = 1e-9);
        for &i in &ju {
            assert!(sol.x[i].abs() <= 1e-12, "pinned step leaked: {}", sol.x[i]);
        }
    }
}

#[test]
fn kkt_methods_with_parameter_block() {
    for &method in &METHODS {
        let mut rng = ChaCha8Rng::seed_from_u64(33);
        let fixture = KktFixture::new(&mut rng, 5, 2, 3, true);
        let solver = fixture.decompose(method, &[]);

        let dx = DVector::from_fn(5, |i, _| 0.2 * (i as f64 + 1.0));
        let dp = DVector::from_vec(vec![0.6, -0.9]);
        let dw = DVector::from_fn(3, |i, _| 0.5 - 0.3 * i as f64);
        let (rx, rp, rw) = fixture.rhs_at(&dx, &dp, &dw);

        let mut sol = KktSol::default();
        solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();

        assert_relative_eq!(sol.x, dx, epsilon = 1e-8);
        assert_relative_eq!(sol.p, dp, epsilon = 1e-8);
        assert_relative_eq!(sol.w, dw, epsilon = 1e-8);
    }
}

#[test]
fn kkt_with_dependent_constraint_rows_keeps_primal_solution() {
    for &method in &METHODS {
        let mut rng = ChaCha8Rng::seed_from_u64(51);
        let mut fixture = KktFixture::new(&mut rng, 6, 0, 3, true);
        // Make the last constraint row redundant, then re-echelonize.
        let sum = fixture.wx.row(0) + fixture.wx.row(1);
        fixture.wx.set_row(2, &sum);
        fixture.echelon = Echelonizer::from_matrix(&fixture.wx).unwrap();
        assert_eq!(fixture.echelon.num_basic_variables(), 2);

        let solver = fixture.decompose(method, &[]);

        let dx = DVector::from_fn(6, |i, _| 0.4 - 0.1 * i as f64);
        let dp = DVector::zeros(0);
        // Multipliers are not unique under dependent rows; manufacture the
        // right-hand side from a consistent primal solution only.
        let dw = DVector::from_vec(vec![0.8, -0.4, 0.1]);
        let (rx, rp, rw) = fixture.rhs_at(&dx, &dp, &dw);

        let mut sol = KktSol::default();
        solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();

        // The primal solution is reproduced and the returned multipliers
        // still satisfy the optimality rows.
        assert_relative_eq!(sol.x, dx, epsilon = 1e-8);
        let opt = fixture.hxx.mul_vec(&sol.x) + fixture.wx.transpose() * &sol.w;
        assert_relative_eq!(opt, rx, epsilon = 1e-8);
        let feas = &fixture.wx * &sol.x;
        assert_relative_eq!(feas, rw, epsilon = 1e-8);
    }
}

#[test]
fn kkt_projects_nonfinite_components_to_zero() {
    // A zero Hessian with a 1x3 constraint leaves the KKT system singular;
    // every returned component must still be finite.
    let dims = MasterDims::new(3, 0, 1, 0);
    let wx = DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 1.0]);
    let echelon = Echelonizer::from_matrix(&wx).unwrap();
    let hxx = HessianMatrix::Dense(DMatrix::zeros(3, 3));
    let empty_np = DMatrix::zeros(3, 0);
    let vx = DMatrix::zeros(0, 3);
    let vp = DMatrix::zeros(0, 0);
    let wp = DMatrix::zeros(1, 0);

    let mut solver = SaddlePointSolver::new(dims);
    solver.set_method(KktMethod::Fullspace);
    solver
        .decompose(KktDecomposeArgs {
            hxx: &hxx,
            hxp: &empty_np,
            vx: &vx,
            vp: &vp,
            wp: &wp,
            echelon: &echelon,
            ju: &[],
        })
        .unwrap();

    let rx = DVector::from_vec(vec![1.0, 2.0, 3.0]);
    let rp = DVector::zeros(0);
    let rw = DVector::from_vec(vec![1.0]);
    let mut sol = KktSol::default();
    solver.solve_rhs(&rx, &rp, &rw, &mut sol).unwrap();

    assert!(sol.x.iter().all(|v| v.is_finite()));
    assert!(sol.w.iter().all(|v| v.is_finite()));
}
