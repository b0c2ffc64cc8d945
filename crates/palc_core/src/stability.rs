//! Stability bookkeeping: unstable-mode counting and crossing
//! classification for equilibria and periodic orbits.

use crate::continuation::types::BifKind;
use num_complex::Complex;
use std::f64::consts::PI;

/// Eigenvalues this close to the real axis are treated as real.
const IMAG_EPS: f64 = 1e-8;

/// `(n_unstable, n_imag)`: eigenvalues with real part beyond `precision`,
/// and the subset of those that are genuinely complex.
pub fn count_unstable(values: &[Complex<f64>], precision: f64) -> (isize, isize) {
    let mut n_unstable = 0;
    let mut n_imag = 0;
    for v in values {
        if v.re > precision {
            n_unstable += 1;
            if v.im.abs() > IMAG_EPS {
                n_imag += 1;
            }
        }
    }
    (n_unstable, n_imag)
}

/// Classify an equilibrium crossing from the change in the counters. Pure in
/// `(delta_unstable, delta_imag)`.
pub fn classify_equilibrium(delta_unstable: isize, delta_imag: isize) -> BifKind {
    match (delta_unstable.abs(), delta_imag.abs()) {
        (1, 0) => BifKind::BranchPoint,
        (2, 2) => BifKind::Hopf,
        _ => BifKind::Undetermined,
    }
}

/// Classify a Floquet crossing. `crossing_log` is the log of the multiplier
/// that crossed the unit circle: imaginary part 0 means the multiplier went
/// through +1, imaginary part pi through -1, anything else is a complex
/// pair leaving the circle.
pub fn classify_cycle(delta_unstable: isize, crossing_log: Complex<f64>) -> BifKind {
    let im = crossing_log.im.abs();
    if delta_unstable.abs() >= 2 {
        return BifKind::NeimarkSacker;
    }
    if (im - PI).abs() < 0.05 {
        BifKind::PeriodDoubling
    } else if im < 0.05 {
        BifKind::CycleFold
    } else {
        BifKind::NeimarkSacker
    }
}

/// Index of the eigenvalue nearest the stability boundary; this is the mode
/// responsible for a detected crossing.
pub fn crossing_index(values: &[Complex<f64>], precision: f64) -> usize {
    let mut idx = 0;
    let mut best = f64::INFINITY;
    for (i, v) in values.iter().enumerate() {
        let dist = (v.re - precision).abs();
        if dist < best {
            best = dist;
            idx = i;
        }
    }
    idx
}
