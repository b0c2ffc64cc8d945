//! Periodic-orbit functionals. Each problem here implements the same seam
//! as an equilibrium system, so `newton` and `continuation` apply unchanged;
//! their spectra are Floquet logs and crossings classify as cycle
//! bifurcations.

pub mod poincare;
pub mod shooting;
pub mod trap;

use crate::hopf::hopf_guess;
use crate::linear::DenseAssembly;
use crate::problem::BifProblem;
use anyhow::{ensure, Result};
use nalgebra::DVector;
use num_complex::Complex;
use std::f64::consts::PI;

/// Floquet multipliers to logs sorted by decreasing real part, optionally
/// dropping the trivial multiplier (the one closest to +1) first. The logs
/// feed the same unstable-mode counters as equilibrium eigenvalues:
/// `Re(log mu) > 0` iff `|mu| > 1`.
pub(crate) fn floquet_logs(
    multipliers: Vec<Complex<f64>>,
    drop_trivial: bool,
    nev: usize,
) -> Vec<Complex<f64>> {
    let mut mults = multipliers;
    if drop_trivial && !mults.is_empty() {
        let mut idx = 0;
        let mut best = f64::INFINITY;
        for (i, mu) in mults.iter().enumerate() {
            let dist = (mu - Complex::new(1.0, 0.0)).norm();
            if dist < best {
                best = dist;
                idx = i;
            }
        }
        mults.remove(idx);
    }
    let mut logs: Vec<Complex<f64>> = mults
        .into_iter()
        .map(|mu| {
            if mu.norm() < 1e-300 {
                Complex::new(-700.0, 0.0)
            } else {
                mu.ln()
            }
        })
        .collect();
    logs.sort_by(|a, b| b.re.partial_cmp(&a.re).unwrap_or(std::cmp::Ordering::Equal));
    logs.truncate(nev.max(1));
    logs
}

/// Initial data for a periodic-orbit solver: `m` state slices along the
/// orbit, the period, and the phase condition anchor/direction.
#[derive(Debug, Clone)]
pub struct OrbitGuess {
    pub states: Vec<DVector<f64>>,
    pub period: f64,
    pub phase_anchor: DVector<f64>,
    pub phase_direction: DVector<f64>,
}

/// Build a small-amplitude orbit guess from a Hopf point: slices on the
/// ellipse spanned by the critical eigenvector, period `2 pi / omega`, and
/// the phase direction along its real part.
pub fn guess_from_hopf<Q>(
    problem: &mut Q,
    x_hopf: &DVector<f64>,
    p_hopf: f64,
    m: usize,
    amplitude: f64,
) -> Result<OrbitGuess>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    ensure!(m >= 3, "orbit meshes require at least 3 slices");
    ensure!(amplitude > 0.0, "amplitude must be positive");

    let hopf = hopf_guess(problem, x_hopf, p_hopf)?;
    let omega = hopf.omega.abs();
    ensure!(omega > 0.0, "Hopf frequency is zero");

    let dir_norm = hopf.v_re.norm();
    ensure!(
        dir_norm > 0.0,
        "real part of the Hopf eigenvector vanished; cannot define a phase direction"
    );
    let phase_direction = &hopf.v_re / dir_norm;

    let mut states = Vec::with_capacity(m);
    for k in 0..m {
        let theta = 2.0 * PI * (k as f64) / (m as f64);
        let state =
            x_hopf + (&hopf.v_re * theta.cos() - &hopf.v_im * theta.sin()) * amplitude;
        states.push(state);
    }

    Ok(OrbitGuess {
        states,
        period: 2.0 * PI / omega,
        phase_anchor: x_hopf.clone(),
        phase_direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::FnProblem;
    use nalgebra::DMatrix;

    #[test]
    fn test_guess_from_hopf_shape_and_period() {
        // Linear rotation with rate 2: period pi.
        let mut problem = FnProblem::new(
            |u: &DVector<f64>, p: f64| {
                DVector::from_vec(vec![p * u[0] - 2.0 * u[1], 2.0 * u[0] + p * u[1]])
            },
            |_u: &DVector<f64>, p: f64| {
                DMatrix::from_row_slice(2, 2, &[p, -2.0, 2.0, p])
            },
        );
        let guess = guess_from_hopf(
            &mut problem,
            &DVector::zeros(2),
            0.0,
            8,
            0.3,
        )
        .expect("guess");

        assert_eq!(guess.states.len(), 8);
        assert!((guess.period - PI).abs() < 1e-10);
        // The eigenvector halves carry weight 1/sqrt(2) each, so the slices
        // sit on a circle of radius amplitude / sqrt(2).
        let radius = 0.3 / 2.0_f64.sqrt();
        for s in &guess.states {
            assert!((s.norm() - radius).abs() < 1e-8, "slice radius {}", s.norm());
        }
        assert!((guess.phase_direction.norm() - 1.0).abs() < 1e-12);
    }
}
