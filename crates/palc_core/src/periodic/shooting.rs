//! Standard (single and multiple) shooting for periodic orbits.
//!
//! Unknowns `(x_1, ..., x_M, T)` with flow constraints
//! `phi^{ds_i T}(x_i) = x_{i+1 mod M}` over a partition
//! `0 = s_0 < ... < s_M = 1`, plus a hyperplane phase section on `x_1`.
//! Flow Jacobian actions are taken by directional finite differences, so
//! the monodromy `M_M ... M_1` never materializes unless the eigensolver
//! asks for a matrix.

use crate::flow::{FlowMap, TimeStepper};
use crate::linear::{EigenDecomposition, EigenSolver, EigenWhich};
use crate::periodic::{floquet_logs, OrbitGuess};
use crate::problem::{BifFlavor, BifProblem};
use anyhow::{ensure, Result};
use nalgebra::{DMatrix, DVector};

pub struct ShootingProblem<F, S> {
    field: F,
    pub flow: FlowMap<S>,
    /// Partition of the period, `0 = s_0 < ... < s_M = 1`.
    pub fractions: Vec<f64>,
    /// Phase section: `<x_1 - section_point, section_normal> = 0`.
    pub section_point: DVector<f64>,
    pub section_normal: DVector<f64>,
    /// Finite-difference step for Jacobian and monodromy actions.
    pub eps: f64,
}

impl<F, S> ShootingProblem<F, S>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    S: TimeStepper,
{
    /// Uniform partition with `m` shooting segments.
    pub fn new(
        field: F,
        flow: FlowMap<S>,
        m: usize,
        section_point: DVector<f64>,
        section_normal: DVector<f64>,
    ) -> Result<Self> {
        ensure!(m >= 1, "shooting requires at least one segment");
        ensure!(
            section_point.len() == section_normal.len(),
            "section point and normal dimensions differ"
        );
        let fractions = (0..=m).map(|i| i as f64 / m as f64).collect();
        Ok(Self {
            field,
            flow,
            fractions,
            section_point,
            section_normal,
            eps: 1e-7,
        })
    }

    fn m(&self) -> usize {
        self.fractions.len() - 1
    }

    fn n(&self) -> usize {
        self.section_point.len()
    }

    pub fn period(&self, w: &DVector<f64>) -> f64 {
        w[self.m() * self.n()]
    }

    pub fn slices(&self, w: &DVector<f64>) -> Vec<DVector<f64>> {
        let n = self.n();
        (0..self.m())
            .map(|i| DVector::from_iterator(n, w.iter().skip(i * n).take(n).cloned()))
            .collect()
    }

    pub fn initial_state(&self, guess: &OrbitGuess) -> Result<DVector<f64>> {
        let (m, n) = (self.m(), self.n());
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

    /// Monodromy action `v -> M_M ... M_1 v` by directional differences of
    /// the flow along each segment.
    pub fn monodromy_apply(
        &mut self,
        w: &DVector<f64>,
        p: f64,
        v: &DVector<f64>,
    ) -> DVector<f64> {
        let m = self.m();
        let t = self.period(w);
        let xs = self.slices(w);
        let eps = self.eps;
        let fractions = self.fractions.clone();
        let Self { field, flow, .. } = self;
        let mut g = |x: &DVector<f64>| field(x, p);

        let mut out = v.clone();
        for i in 0..m {
            let dt = (fractions[i + 1] - fractions[i]) * t;
            let base = flow.evolve(&mut g, &xs[i], dt);
            let vnorm = out.norm();
            if vnorm == 0.0 {
                return out;
            }
            let h = eps * (1.0 + xs[i].norm()) / vnorm;
            let bumped = flow.evolve(&mut g, &(&xs[i] + &out * h), dt);
            out = (bumped - base) / h;
        }
        out
    }

    /// Monodromy assembled column by column; only for matrix eigensolvers.
    pub fn monodromy_matrix(&mut self, w: &DVector<f64>, p: f64) -> DMatrix<f64> {
        let n = self.n();
        let mut mono = DMatrix::zeros(n, n);
        for j in 0..n {
            let mut e = DVector::zeros(n);
            e[j] = 1.0;
            let col = self.monodromy_apply(w, p, &e);
            for i in 0..n {
                mono[(i, j)] = col[i];
            }
        }
        mono
    }
}

impl<F, S> BifProblem for ShootingProblem<F, S>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    S: TimeStepper,
{
    type Vector = DVector<f64>;
    type Operator = DMatrix<f64>;

    fn residual(&mut self, w: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let (m, n) = (self.m(), self.n());
        let t = self.period(w);
        let xs = self.slices(w);
        let fractions = self.fractions.clone();
        let Self {
            field,
            flow,
            section_point,
            section_normal,
            ..
        } = self;
        let mut g = |x: &DVector<f64>| field(x, p);

        let mut out = DVector::zeros(m * n + 1);
        for i in 0..m {
            let next = (i + 1) % m;
            let dt = (fractions[i + 1] - fractions[i]) * t;
            let y = flow.evolve(&mut g, &xs[i], dt);
            for row in 0..n {
                out[i * n + row] = y[row] - xs[next][row];
            }
        }
        out[m * n] = (&xs[0] - &*section_point).dot(section_normal);
        Ok(out)
    }

    fn jacobian(&mut self, w: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        // Dense forward differences of the full residual; segment flows
        // dominate the cost, so this is only sensible for modest M and N.
        let dim = w.len();
        let r0 = self.residual(w, p)?;
        let mut out = DMatrix::zeros(dim, dim);
        for j in 0..dim {
            let h = self.eps * (1.0 + w[j].abs());
            let mut wp = w.clone();
            wp[j] += h;
            let rp = self.residual(&wp, p)?;
            for i in 0..dim {
                out[(i, j)] = (rp[i] - r0[i]) / h;
            }
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
        let mono = self.monodromy_matrix(w, p);
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
