//! Canonical-form invariants of the echelonizer.
//!
//! Checks that `R·W·Q = [I S; 0 0]` survives swaps, priority-weight
//! reordering and rank deficiency, and reproduces the reference variable
//! orderings of the weighted update.

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sella_core::Echelonizer;

fn random_matrix(rng: &mut ChaCha8Rng, m: usize, n: usize) -> DMatrix<f64> {
    DMatrix::from_fn(m, n, |_, _| rng.gen_range(-1.0..1.0))
}

fn check_canonical_form(ech: &Echelonizer, w: &DMatrix<f64>, tol: f64) {
    let n = ech.num_variables();

    // Q must always be a permutation of 0..n.
    let mut sorted = ech.q().to_vec();
    sorted.sort_unstable();
    let identity: Vec<usize> = (0..n).collect();
    assert_eq!(sorted, identity, "Q is not a permutation");

    let qmat = DMatrix::from_fn(n, n, |i, j| if ech.q()[j] == i { 1.0 } else { 0.0 });
    let residual = ech.r() * w * qmat - ech.c();
    let err = residual.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    assert!(err < tol, "canonical form violated: residual {err:.3e}");
}

#[test]
fn canonical_form_survives_every_swap() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let w = random_matrix(&mut rng, 4, 10);

    let mut ech = Echelonizer::from_matrix(&w).unwrap();
    let r = ech.num_basic_variables();
    assert_eq!(r, 4);
    check_canonical_form(&ech, &w, 1e-10);

    for i in 0..r {
        for j in 0..ech.num_nonbasic_variables() {
            if ech.s()[(i, j)].abs() <= 1e-10 {
                continue;
            }
            ech.update_with_swap_basic_variable(i, j).unwrap();
            check_canonical_form(&ech, &w, 1e-8);
        }
    }
}

#[test]
fn canonical_form_with_linearly_dependent_rows() {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let mut w = random_matrix(&mut rng, 4, 10);
    let r0 = w.row(0).clone_owned();
    let r1 = w.row(1).clone_owned();
    w.set_row(2, &(r0.clone() + r1.clone() * 2.0));
    let r2 = w.row(2).clone_owned();
    w.set_row(3, &(r1 - r2 * 2.0));

    let mut ech = Echelonizer::from_matrix(&w).unwrap();
    assert_eq!(ech.num_basic_variables(), 2);
    check_canonical_form(&ech, &w, 1e-10);

    // Rows of R beyond the rank are exact zeros.
    for i in 2..4 {
        for j in 0..4 {
            assert_eq!(ech.r()[(i, j)], 0.0);
        }
    }

    for i in 0..ech.num_basic_variables() {
        for j in 0..ech.num_nonbasic_variables() {
            if ech.s()[(i, j)].abs() <= 1e-10 {
                continue;
            }
            ech.update_with_swap_basic_variable(i, j).unwrap();
            check_canonical_form(&ech, &w, 1e-8);
        }
    }
}

#[test]
fn priority_weights_reproduce_reference_ordering() {
    let w = DMatrix::from_row_slice(
        4,
        6,
        &[
            2.0, 1.0, 1.0, 1.0, 0.0, 0.0, //
            1.0, 0.0, 1.0, 3.0, 2.0, 3.0, //
            0.0, 0.0, 0.0, 1.0, 1.0, 1.0, //
            0.0, 1.0, -1.0, -1.0, 0.0, -2.0,
        ],
    );

    let mut ech = Echelonizer::from_matrix(&w).unwrap();
    assert_eq!(ech.num_basic_variables(), 3);
    check_canonical_form(&ech, &w, 1e-12);

    let weights = nalgebra::DVector::from_vec(vec![55.1, 1.0e-4, 1.0e-10, 0.1, 0.5, 1.0e-2]);
    ech.update_with_priority_weights(&weights).unwrap();
    check_canonical_form(&ech, &w, 1e-12);
    assert_eq!(ech.q(), &[0, 4, 3, 5, 1, 2]);

    let weights = nalgebra::DVector::from_vec(vec![55.1, 1.0e-4, 1.0e-10, 0.3, 0.1, 0.8]);
    ech.update_with_priority_weights(&weights).unwrap();
    check_canonical_form(&ech, &w, 1e-12);
    assert_eq!(ech.q(), &[0, 5, 3, 4, 1, 2]);
}

#[test]
fn no_beneficial_swap_remains_after_weighted_update() {
    let w = DMatrix::from_row_slice(
        4,
        6,
        &[
            2.0, 1.0, 1.0, 1.0, 0.0, 0.0, //
            1.0, 0.0, 1.0, 3.0, 2.0, 3.0, //
            0.0, 0.0, 0.0, 1.0, 1.0, 1.0, //
            0.0, 1.0, -1.0, -1.0, 0.0, -2.0,
        ],
    );
    let weights = nalgebra::DVector::from_vec(vec![55.1, 1.0e-4, 1.0e-10, 0.1, 0.5, 1.0e-2]);

    let mut ech = Echelonizer::from_matrix(&w).unwrap();
    ech.update_with_priority_weights(&weights).unwrap();

    let nb = ech.num_basic_variables();
    for i in 0..nb {
        for k in 0..ech.num_nonbasic_variables() {
            let wb = weights[ech.q()[i]];
            let wn = weights[ech.q()[nb + k]] * ech.s()[(i, k)].abs();
            assert!(
                wb >= wn - 1e-12,
                "beneficial swap left behind: slot {i} (weight {wb}) vs \
                 non-basic {k} (effective weight {wn})"
            );
        }
    }
}

#[test]
fn weighted_update_keeps_canonical_form_on_random_matrices() {
    for seed in [1_u64, 2, 3, 4, 5] {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let w = random_matrix(&mut rng, 3, 8);
        let mut ech = Echelonizer::from_matrix(&w).unwrap();
        for _ in 0..4 {
            let weights =
                nalgebra::DVector::from_fn(8, |_, _| rng.gen_range(1.0e-6..10.0_f64));
            ech.update_with_priority_weights(&weights).unwrap();
            check_canonical_form(&ech, &w, 1e-8);
        }
    }
}

#[test]
fn reset_discards_accumulated_updates() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let w = random_matrix(&mut rng, 3, 7);
    let mut ech = Echelonizer::from_matrix(&w).unwrap();
    let q0 = ech.q().to_vec();
    let s0 = ech.s().clone();

    let weights = nalgebra::DVector::from_fn(7, |_, _| rng.gen_range(1.0e-3..1.0_f64));
    ech.update_with_priority_weights(&weights).unwrap();
    ech.reset();

    assert_eq!(ech.q(), &q0[..]);
    assert_relative_eq!(*ech.s(), s0, epsilon = 1e-14);
    check_canonical_form(&ech, &w, 1e-10);
}
