//! Poincaré shooting: periodic orbits as fixed points of first-return maps
//! between hyperplane sections.
//!
//! Each section `Sigma_i = { <n_i, x - c_i> = 0 }` carries an orthonormal
//! basis of its tangent space; unknowns live in the `N - 1` dimensional
//! section coordinates and the period is a by-product of the return times.
//! Event detection is oriented: the first strict crossing from the negative
//! to the positive side of the target section wins, refined by bisection of
//! the crossing step.

use crate::flow::TimeStepper;
use crate::linear::{EigenDecomposition, EigenSolver, EigenWhich};
use crate::periodic::floquet_logs;
use crate::problem::{BifFlavor, BifProblem};
use anyhow::{anyhow, ensure, Result};
use nalgebra::{DMatrix, DVector};

/// A hyperplane section with an orthonormal basis of its tangent space.
#[derive(Debug, Clone)]
pub struct Section {
    pub normal: DVector<f64>,
    pub center: DVector<f64>,
    basis: DMatrix<f64>,
}

impl Section {
    pub fn new(normal: DVector<f64>, center: DVector<f64>) -> Result<Self> {
        ensure!(
            normal.len() == center.len(),
            "section normal and center dimensions differ"
        );
        let norm = normal.norm();
        ensure!(norm > 0.0, "section normal must be non-zero");
        let normal = normal / norm;
        let basis = orthonormal_complement(&normal)?;
        Ok(Self {
            normal,
            center,
            basis,
        })
    }

    /// Section coordinates of a state.
    pub fn project(&self, x: &DVector<f64>) -> DVector<f64> {
        self.basis.transpose() * (x - &self.center)
    }

    /// State-space point of section coordinates.
    pub fn lift(&self, y: &DVector<f64>) -> DVector<f64> {
        &self.center + &self.basis * y
    }

    /// Signed distance from the hyperplane.
    pub fn side(&self, x: &DVector<f64>) -> f64 {
        self.normal.dot(&(x - &self.center))
    }
}

/// Orthonormal basis of the complement of `normal`, by Gram-Schmidt over
/// the coordinate directions.
fn orthonormal_complement(normal: &DVector<f64>) -> Result<DMatrix<f64>> {
    let n = normal.len();
    ensure!(n >= 2, "sections need at least a two-dimensional state");
    let mut cols: Vec<DVector<f64>> = Vec::with_capacity(n - 1);
    for j in 0..n {
        if cols.len() == n - 1 {
            break;
        }
        let mut v = DVector::zeros(n);
        v[j] = 1.0;
        v -= normal * normal[j];
        for c in &cols {
            let proj = c.dot(&v);
            v -= c * proj;
        }
        let norm = v.norm();
        if norm > 1e-8 {
            cols.push(v / norm);
        }
    }
    ensure!(
        cols.len() == n - 1,
        "failed to build a section basis"
    );
    Ok(DMatrix::from_columns(&cols))
}

pub struct PoincareShootingProblem<F, S> {
    field: F,
    pub stepper: S,
    /// Integration step for event scanning.
    pub dt: f64,
    pub sections: Vec<Section>,
    /// Flight-time budget per return before giving up.
    pub t_max: f64,
    /// Finite-difference step for Jacobians.
    pub eps: f64,
    last_times: Vec<f64>,
}

impl<F, S> PoincareShootingProblem<F, S>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    S: TimeStepper,
{
    pub fn new(field: F, stepper: S, dt: f64, sections: Vec<Section>) -> Result<Self> {
        ensure!(!sections.is_empty(), "at least one section is required");
        ensure!(dt > 0.0, "scan step must be positive");
        Ok(Self {
            field,
            stepper,
            dt,
            sections,
            t_max: 1e3,
            eps: 1e-6,
            last_times: Vec::new(),
        })
    }

    fn m(&self) -> usize {
        self.sections.len()
    }

    fn k(&self) -> usize {
        self.sections[0].normal.len() - 1
    }

    /// Sum of the return times of the last residual evaluation: the period,
    /// once the unknowns have converged.
    pub fn last_period(&self) -> f64 {
        self.last_times.iter().sum()
    }

    fn section_coords(&self, w: &DVector<f64>, i: usize) -> DVector<f64> {
        let k = self.k();
        DVector::from_iterator(k, w.iter().skip(i * k).take(k).cloned())
    }

    /// Full loop of the return maps starting from section 0; used for the
    /// monodromy of the composed Poincaré map.
    fn return_loop(&mut self, y0: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let m = self.m();
        let mut x = self.sections[0].lift(y0);
        for i in 0..m {
            let target = (i + 1) % m;
            let Self {
                field,
                stepper,
                sections,
                dt,
                t_max,
                ..
            } = self;
            let mut g = |s: &DVector<f64>| field(s, p);
            let (hit, _) =
                first_return(stepper, *dt, *t_max, &mut g, &x, &sections[target])?;
            x = hit;
        }
        Ok(self.sections[0].project(&x))
    }

    /// Jacobian of the composed return map, finite-differenced.
    pub fn monodromy_matrix(&mut self, w: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        let k = self.k();
        let y0 = self.section_coords(w, 0);
        let base = self.return_loop(&y0, p)?;
        let mut mono = DMatrix::zeros(k, k);
        for j in 0..k {
            let h = self.eps * (1.0 + y0[j].abs());
            let mut yp = y0.clone();
            yp[j] += h;
            let bumped = self.return_loop(&yp, p)?;
            for i in 0..k {
                mono[(i, j)] = (bumped[i] - base[i]) / h;
            }
        }
        Ok(mono)
    }
}

/// Integrate until the first strict negative-to-positive crossing of the
/// target section, then refine the crossing time by bisecting the step.
fn first_return<S: TimeStepper>(
    stepper: &mut S,
    dt: f64,
    t_max: f64,
    field: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>,
    x0: &DVector<f64>,
    target: &Section,
) -> Result<(DVector<f64>, f64)> {
    // Starting points sit on a section up to rounding; require a genuine
    // excursion to the negative side before accepting a crossing, so the
    // launch point itself never counts as the return.
    const SIDE_TOL: f64 = 1e-10;
    let mut x = x0.clone();
    let mut g_prev = target.side(&x);
    let mut seen_negative = g_prev < -SIDE_TOL;
    let mut t = 0.0;

    while t < t_max {
        let mut x_new = x.clone();
        stepper.step(field, &mut x_new, dt);
        let g_new = target.side(&x_new);
        if seen_negative && g_prev < 0.0 && g_new > 0.0 {
            let (hit, dt_hit) = bisect_crossing(stepper, field, &x, dt, target);
            return Ok((hit, t + dt_hit));
        }
        if g_new < -SIDE_TOL {
            seen_negative = true;
        }
        x = x_new;
        g_prev = g_new;
        t += dt;
    }
    Err(anyhow!(
        "no section crossing within {t_max} time units"
    ))
}

/// Bisection of the crossing step: shrink the interval `[0, dt]` from a
/// point on the negative side until the step lands just past the section.
fn bisect_crossing<S: TimeStepper>(
    stepper: &mut S,
    field: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>,
    x_lo: &DVector<f64>,
    dt: f64,
    target: &Section,
) -> (DVector<f64>, f64) {
    let mut x_lo = x_lo.clone();
    let mut t_lo = 0.0;
    let mut h = dt;
    for _ in 0..100 {
        if h < 1e-13 {
            break;
        }
        let mut x_mid = x_lo.clone();
        stepper.step(field, &mut x_mid, h / 2.0);
        if target.side(&x_mid) > 0.0 {
            h /= 2.0;
        } else {
            x_lo = x_mid;
            t_lo += h / 2.0;
            h /= 2.0;
        }
    }
    let mut hit = x_lo.clone();
    stepper.step(field, &mut hit, h);
    (hit, t_lo + h)
}

impl<F, S> BifProblem for PoincareShootingProblem<F, S>
where
    F: FnMut(&DVector<f64>, f64) -> DVector<f64>,
    S: TimeStepper,
{
    type Vector = DVector<f64>;
    type Operator = DMatrix<f64>;

    fn residual(&mut self, w: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let (m, k) = (self.m(), self.k());
        let mut out = DVector::zeros(m * k);
        let mut times = Vec::with_capacity(m);

        for i in 0..m {
            let next = (i + 1) % m;
            let y_i = self.section_coords(w, i);
            let y_next = self.section_coords(w, next);
            let x = self.sections[i].lift(&y_i);
            let Self {
                field,
                stepper,
                sections,
                dt,
                t_max,
                ..
            } = self;
            let mut g = |s: &DVector<f64>| field(s, p);
            let (hit, time) =
                first_return(stepper, *dt, *t_max, &mut g, &x, &sections[next])?;
            times.push(time);
            let mapped = self.sections[next].project(&hit);
            for row in 0..k {
                out[i * k + row] = mapped[row] - y_next[row];
            }
        }
        self.last_times = times;
        Ok(out)
    }

    fn jacobian(&mut self, w: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
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
        // The section already removes the trivial multiplier, so every
        // eigenvalue of the composed return map is a genuine Floquet mode.
        let mono = self.monodromy_matrix(w, p)?;
        let dec = eig.eigen(&mono, nev, EigenWhich::LargestModulus)?;
        Ok(EigenDecomposition {
            values: floquet_logs(dec.values, false, nev),
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
    use crate::flow::Rk4;
    use crate::linear::{DenseEigen, DenseLu};
    use crate::newton::{solve_equilibrium, NewtonSettings};
    use std::f64::consts::PI;

    #[test]
    fn test_section_basis_is_orthonormal_complement() {
        let section = Section::new(
            DVector::from_vec(vec![0.0, 2.0, 0.0]),
            DVector::zeros(3),
        )
        .expect("section");
        let b = &section.basis;
        assert_eq!(b.ncols(), 2);
        let gram = b.transpose() * b;
        assert!((gram - DMatrix::identity(2, 2)).amax() < 1e-12);
        assert!((b.transpose() * &section.normal).amax() < 1e-12);

        // Project and lift are mutually inverse on the section.
        let y = DVector::from_vec(vec![0.3, -0.7]);
        let x = section.lift(&y);
        assert!(section.side(&x).abs() < 1e-12);
        assert!((section.project(&x) - y).amax() < 1e-12);
    }

    fn hopf_field(u: &DVector<f64>, p: f64) -> DVector<f64> {
        let r2 = u[0] * u[0] + u[1] * u[1];
        DVector::from_vec(vec![
            p * u[0] - u[1] - u[0] * r2,
            u[0] + p * u[1] - u[1] * r2,
        ])
    }

    #[test]
    fn test_poincare_fixed_point_on_circle_orbit() {
        let p = 0.5;
        let section = Section::new(
            DVector::from_vec(vec![0.0, 1.0]),
            DVector::zeros(2),
        )
        .expect("section");
        let mut problem =
            PoincareShootingProblem::new(hopf_field, Rk4, 0.01, vec![section])
                .expect("poincare problem");

        // One section in the plane: the unknown is the x-offset along it.
        let w0 = DVector::from_vec(vec![0.65]);
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
        assert!(
            (out.x[0] - 0.5_f64.sqrt()).abs() < 1e-4,
            "fixed point at {}",
            out.x[0]
        );

        // Recompute the residual at the solution so the cached return times
        // correspond to the fixed point; the period is their sum.
        let r = problem.residual(&out.x, p).expect("residual");
        assert!(r.norm() < 1e-8);
        let period = problem.last_period();
        assert!((period - 2.0 * PI).abs() < 1e-2, "period = {period}");

        // The single Floquet log of the return map is strongly stable.
        let dec = problem
            .spectrum(&mut DenseEigen::default(), &out.x, p, 1)
            .expect("spectrum");
        assert_eq!(dec.values.len(), 1);
        assert!(dec.values[0].re < -4.0, "Floquet log {:?}", dec.values[0]);
    }
}
