//! Finite-difference periodic-orbit functional with implicit trapezoidal
//! coupling between time slices.
//!
//! Unknowns `(x_1, ..., x_M, T)` with the cyclic dynamics constraint
//!
//! ```text
//! x_{i+1} - x_i - h/2 (f(x_{i+1}) + f(x_i)) = 0,   h = T / M,  x_{M+1} = x_1
//! ```
//!
//! plus the phase condition `<x_1 - u_ref, phi> = 0`. The monodromy is the
//! cyclic product of per-slice transfer matrices, applied through block
//! solves and only materialized for the eigensolver.

use crate::error::SolveFailure;
use crate::linear::{EigenDecomposition, EigenSolver, EigenWhich};
use crate::periodic::{floquet_logs, OrbitGuess};
use crate::problem::{BifFlavor, BifProblem};
use anyhow::{ensure, Result};
use nalgebra::{DMatrix, DVector};

pub struct PeriodicOrbitTrap<F, J> {
    field: F,
    jac: J,
    /// Phase anchor, typically the equilibrium the orbit bifurcated from.
    pub u_ref: DVector<f64>,
    /// Phase direction.
    pub phi: DVector<f64>,
    /// Number of time slices.
    pub m: usize,
}

impl<F, J> PeriodicOrbitTrap<F, J>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    J: FnMut(&DVector<f64>, f64) -> DMatrix<f64>,
{
    pub fn new(
        field: F,
        jac: J,
        u_ref: DVector<f64>,
        phi: DVector<f64>,
        m: usize,
    ) -> Result<Self> {
        ensure!(m >= 3, "trapezoidal meshes require at least 3 slices");
        ensure!(
            u_ref.len() == phi.len(),
            "phase anchor and direction dimensions differ"
        );
        Ok(Self {
            field,
            jac,
            u_ref,
            phi,
            m,
        })
    }

    pub fn from_guess(field: F, jac: J, guess: &OrbitGuess) -> Result<Self> {
        Self::new(
            field,
            jac,
            guess.phase_anchor.clone(),
            guess.phase_direction.clone(),
            guess.states.len(),
        )
    }

    fn n(&self) -> usize {
        self.u_ref.len()
    }

    /// Pack an orbit guess into the unknown layout `[x_1..x_M, T]`.
    pub fn initial_state(&self, guess: &OrbitGuess) -> Result<DVector<f64>> {
        let (m, n) = (self.m, self.n());
        ensure!(guess.states.len() == m, "guess has the wrong slice count");
        let mut w = DVector::zeros(m * n + 1);
        for (i, state) in guess.states.iter().enumerate() {
            ensure!(state.len() == n, "guess slice dimension mismatch");
            for row in 0..n {
                w[i * n + row] = state[row];
            }
        }
        w[m * n] = guess.period;
        Ok(w)
    }

    pub fn period(&self, w: &DVector<f64>) -> f64 {
        w[self.m * self.n()]
    }

    pub fn slices(&self, w: &DVector<f64>) -> Vec<DVector<f64>> {
        let n = self.n();
        (0..self.m)
            .map(|i| DVector::from_iterator(n, w.iter().skip(i * n).take(n).cloned()))
            .collect()
    }

    /// Monodromy as the cyclic product of trapezoidal transfer matrices
    /// `(I - h/2 J_{i+1})^{-1} (I + h/2 J_i)`.
    pub fn monodromy_matrix(&mut self, w: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        let (m, n) = (self.m, self.n());
        let h = self.period(w) / m as f64;
        let xs = self.slices(w);
        let js: Vec<DMatrix<f64>> = xs.iter().map(|x| (self.jac)(x, p)).collect();

        let ident = DMatrix::identity(n, n);
        let mut mono = ident.clone();
        for i in 0..m {
            let next = (i + 1) % m;
            let a = &ident - &js[next] * (h / 2.0);
            let b = &ident + &js[i] * (h / 2.0);
            mono = a
                .lu()
                .solve(&(&b * &mono))
                .ok_or(SolveFailure::Singular)?;
        }
        Ok(mono)
    }
}

impl<F, J> BifProblem for PeriodicOrbitTrap<F, J>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    J: FnMut(&DVector<f64>, f64) -> DMatrix<f64>,
{
    type Vector = DVector<f64>;
    type Operator = DMatrix<f64>;

    fn residual(&mut self, w: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let (m, n) = (self.m, self.n());
        let h = self.period(w) / m as f64;
        let xs = self.slices(w);
        let fs: Vec<DVector<f64>> = xs.iter().map(|x| (self.field)(x, p)).collect();

        let mut out = DVector::zeros(m * n + 1);
        for i in 0..m {
            let next = (i + 1) % m;
            for row in 0..n {
                out[i * n + row] = xs[next][row] - xs[i][row]
                    - h / 2.0 * (fs[next][row] + fs[i][row]);
            }
        }
        out[m * n] = (&xs[0] - &self.u_ref).dot(&self.phi);
        Ok(out)
    }

    fn jacobian(&mut self, w: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        let (m, n) = (self.m, self.n());
        let h = self.period(w) / m as f64;
        let xs = self.slices(w);
        let fs: Vec<DVector<f64>> = xs.iter().map(|x| (self.field)(x, p)).collect();
        let js: Vec<DMatrix<f64>> = xs.iter().map(|x| (self.jac)(x, p)).collect();

        let dim = m * n + 1;
        let mut out = DMatrix::zeros(dim, dim);
        for i in 0..m {
            let next = (i + 1) % m;
            for row in 0..n {
                for col in 0..n {
                    // d/dx_i and d/dx_{i+1} of the trapezoidal constraint.
                    out[(i * n + row, i * n + col)] -= h / 2.0 * js[i][(row, col)];
                    out[(i * n + row, next * n + col)] -= h / 2.0 * js[next][(row, col)];
                }
                out[(i * n + row, i * n + row)] -= 1.0;
                out[(i * n + row, next * n + row)] += 1.0;
                // d/dT through h = T/M.
                out[(i * n + row, m * n)] =
                    -(fs[next][row] + fs[i][row]) / (2.0 * m as f64);
            }
        }
        for col in 0..n {
            out[(m * n, col)] = self.phi[col];
        }
        Ok(out)
    }

    fn spectrum<E: EigenSolver<DMatrix<f64>>>(
        &mut self,
        eig: &mut E,
        w: &DVector<f64>,
        p: f64,
        nev: usize,
    ) -> Result<EigenDecomposition> {
        let mono = self.monodromy_matrix(w, p)?;
        let dec = eig.eigen(&mono, nev + 1, EigenWhich::LargestModulus)?;
        Ok(EigenDecomposition {
            values: floquet_logs(dec.values, true, nev),
            vectors: None,
            converged: dec.converged,
        })
    }

    fn flavor(&self) -> BifFlavor {
        BifFlavor::PeriodicOrbit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bordered::BorderingBls;
    use crate::continuation::{continuation, BifKind, ContinuationSettings};
    use crate::linear::{DenseEigen, DenseLu};
    use crate::newton::{solve_equilibrium, NewtonSettings};
    use crate::periodic::guess_from_hopf;
    use crate::predictor::Predictor;
    use crate::problem::FnProblem;
    use std::f64::consts::PI;

    fn hopf_field(u: &DVector<f64>, p: f64) -> DVector<f64> {
        let r2 = u[0] * u[0] + u[1] * u[1];
        DVector::from_vec(vec![
            p * u[0] - u[1] - u[0] * r2,
            u[0] + p * u[1] - u[1] * r2,
        ])
    }

    fn hopf_jac(u: &DVector<f64>, p: f64) -> DMatrix<f64> {
        let (x, y) = (u[0], u[1]);
        DMatrix::from_row_slice(
            2,
            2,
            &[
                p - 3.0 * x * x - y * y,
                -1.0 - 2.0 * x * y,
                1.0 - 2.0 * x * y,
                p - x * x - 3.0 * y * y,
            ],
        )
    }

    #[test]
    fn test_trap_newton_converges_to_hopf_orbit() {
        // At p = 0.5 the normal form has the circle r = sqrt(0.5), T = 2 pi.
        let p = 0.5;
        let guess = {
            let mut equilibrium = FnProblem::new(hopf_field, hopf_jac);
            guess_from_hopf(&mut equilibrium, &DVector::zeros(2), p, 60, 1.0)
                .expect("orbit guess")
        };
        let mut problem =
            PeriodicOrbitTrap::from_guess(hopf_field, hopf_jac, &guess).expect("trap problem");
        let w0 = problem.initial_state(&guess).expect("initial state");

        let mut bls = BorderingBls::new(DenseLu);
        let out = solve_equilibrium(
            &mut problem,
            &mut bls,
            w0,
            p,
            &NewtonSettings {
                tol: 1e-9,
                ..NewtonSettings::default()
            },
        )
        .expect("newton");
        assert!(out.converged, "residuals: {:?}", out.residuals);
        assert!(out.iterations < 10, "took {} iterations", out.iterations);

        let period = problem.period(&out.x);
        assert!((period - 2.0 * PI).abs() < 0.02, "period = {period}");
        let amplitude = problem
            .slices(&out.x)
            .iter()
            .map(|s| s.norm())
            .fold(0.0_f64, f64::max);
        assert!(
            (amplitude - 0.5_f64.sqrt()).abs() < 0.02,
            "amplitude = {amplitude}"
        );

        // Floquet: one trivial multiplier (dropped) and one stable one near
        // exp(-2 p T).
        let dec = problem
            .spectrum(&mut DenseEigen::default(), &out.x, p, 2)
            .expect("floquet");
        assert!(!dec.values.is_empty());
        assert!(
            dec.values[0].re < -3.0,
            "nontrivial Floquet log {:?}",
            dec.values[0]
        );
    }

    fn quintic_field(u: &DVector<f64>, p: f64) -> DVector<f64> {
        let r2 = u[0] * u[0] + u[1] * u[1];
        let s = p + r2 - r2 * r2;
        DVector::from_vec(vec![u[0] * s - u[1], u[1] * s + u[0]])
    }

    fn quintic_jac(u: &DVector<f64>, p: f64) -> DMatrix<f64> {
        let (x, y) = (u[0], u[1]);
        let r2 = x * x + y * y;
        let s = p + r2 - r2 * r2;
        let ds_dx = 2.0 * x - 4.0 * r2 * x;
        let ds_dy = 2.0 * y - 4.0 * r2 * y;
        DMatrix::from_row_slice(
            2,
            2,
            &[
                s + x * ds_dx,
                -1.0 + x * ds_dy,
                1.0 + y * ds_dx,
                s + y * ds_dy,
            ],
        )
    }

    #[test]
    fn test_trap_continuation_detects_fold_of_cycles() {
        // r' = r (p + r^2 - r^4): two circular orbits that collide at
        // p = -1/4 in a fold of cycles.
        let m = 60;
        let r0 = (0.5 * (1.0 + 0.6_f64.sqrt())).sqrt();
        let mut states = Vec::with_capacity(m);
        for k in 0..m {
            let theta = 2.0 * PI * k as f64 / m as f64;
            states.push(DVector::from_vec(vec![
                r0 * theta.cos(),
                r0 * theta.sin(),
            ]));
        }
        let guess = OrbitGuess {
            states,
            period: 2.0 * PI,
            phase_anchor: DVector::zeros(2),
            phase_direction: DVector::from_vec(vec![0.0, 1.0]),
        };

        let mut problem =
            PeriodicOrbitTrap::from_guess(quintic_field, quintic_jac, &guess)
                .expect("trap problem");
        let w0 = problem.initial_state(&guess).expect("initial state");

        let settings = ContinuationSettings {
            ds: -0.02,
            dsmin: 1e-6,
            dsmax: 0.03,
            p_min: -0.3,
            p_max: -0.02,
            max_steps: 150,
            detect_fold: true,
            newton: NewtonSettings {
                tol: 1e-9,
                ..NewtonSettings::default()
            },
            ..ContinuationSettings::default()
        };
        let result = continuation(
            &mut problem,
            w0,
            -0.1,
            settings,
            Predictor::Secant,
            BorderingBls::new(DenseLu),
            DenseEigen::default(),
        )
        .expect("continuation");

        assert!(
            !result.branch.foldpoints.is_empty(),
            "no fold of cycles detected"
        );
        let fold = &result.branch.foldpoints[0];
        assert_eq!(fold.kind, BifKind::CycleFold);
        assert!(
            (fold.param + 0.25).abs() < 0.03,
            "cycle fold at p = {}",
            fold.param
        );
    }
}
