//! Damped Newton iteration over any vector space, plus deflation.

use crate::algebra::VectorOps;
use crate::bordered::BorderedSolver;
use crate::error::SolveFailure;
use crate::problem::BifProblem;
use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    /// Convergence threshold on the residual norm.
    pub tol: f64,
    pub max_iterations: usize,
    /// Damping factor applied to the Newton direction.
    pub alpha: f64,
    /// Smallest damping the line search may fall back to.
    pub alpha_min: f64,
    /// Backtrack when a full step would grow the residual.
    pub linesearch: bool,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iterations: 25,
            alpha: 1.0,
            alpha_min: 1.0 / 32.0,
            linesearch: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewtonOutcome<V> {
    pub x: V,
    /// Residual norm history, starting with the initial guess.
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// A square nonlinear system together with the means to solve its own Newton
/// update. Folding the linear solve into the system lets the arclength
/// corrector route through the bordered solver while plain problems use an
/// ordinary one.
pub trait NewtonSystem {
    type Vector: VectorOps;

    fn residual(&mut self, x: &Self::Vector) -> Result<Self::Vector>;

    /// Solve `J(x) d = fx` for the update direction `d`.
    fn newton_step(&mut self, x: &Self::Vector, fx: &Self::Vector) -> Result<Self::Vector>;

    fn norm(&self, v: &Self::Vector) -> f64 {
        v.norm_inf()
    }
}

pub fn newton<S: NewtonSystem>(
    sys: &mut S,
    x0: S::Vector,
    settings: &NewtonSettings,
) -> Result<NewtonOutcome<S::Vector>> {
    newton_with_callback(sys, x0, settings, |_, _, _| true)
}

/// Newton iteration with a user callback `(x, residual_norm, iteration)`;
/// returning `false` aborts the solve without error.
pub fn newton_with_callback<S, C>(
    sys: &mut S,
    x0: S::Vector,
    settings: &NewtonSettings,
    mut callback: C,
) -> Result<NewtonOutcome<S::Vector>>
where
    S: NewtonSystem,
    C: FnMut(&S::Vector, f64, usize) -> bool,
{
    let mut x = x0;
    let mut fx = sys.residual(&x)?;
    let mut res = sys.norm(&fx);
    let mut residuals = vec![res];
    let mut iterations = 0;

    if !callback(&x, res, 0) {
        return Ok(NewtonOutcome {
            x,
            residuals,
            converged: false,
            iterations,
        });
    }

    while res > settings.tol && iterations < settings.max_iterations {
        let d = sys.newton_step(&x, &fx)?;

        let mut alpha = settings.alpha;
        loop {
            let x_try = x.plus_scaled(-alpha, &d);
            let fx_try = sys.residual(&x_try)?;
            let res_try = sys.norm(&fx_try);
            if !settings.linesearch || res_try < res || alpha <= settings.alpha_min {
                x = x_try;
                fx = fx_try;
                res = res_try;
                break;
            }
            alpha = (alpha * 0.5).max(settings.alpha_min);
        }

        iterations += 1;
        residuals.push(res);
        debug!("newton it {iterations}: |F| = {res:.3e}");
        if !callback(&x, res, iterations) {
            return Ok(NewtonOutcome {
                x,
                residuals,
                converged: false,
                iterations,
            });
        }
    }

    let converged = res <= settings.tol;
    Ok(NewtonOutcome {
        x,
        residuals,
        converged,
        iterations,
    })
}

/// Plain Newton view of a [`BifProblem`] at a frozen parameter value, with
/// updates solved through the bordered backend's inner solver.
pub struct EquilibriumSystem<'a, P: BifProblem, B> {
    pub problem: &'a mut P,
    pub solver: &'a mut B,
    pub p: f64,
}

impl<'a, P, B> NewtonSystem for EquilibriumSystem<'a, P, B>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
{
    type Vector = P::Vector;

    fn residual(&mut self, x: &Self::Vector) -> Result<Self::Vector> {
        self.problem.residual(x, self.p)
    }

    fn newton_step(&mut self, x: &Self::Vector, fx: &Self::Vector) -> Result<Self::Vector> {
        let op = self.problem.jacobian(x, self.p)?;
        Ok(self.solver.solve_plain(&op, fx)?.x)
    }
}

/// Solve `F(x, p) = 0` at fixed `p`.
pub fn solve_equilibrium<P, B>(
    problem: &mut P,
    solver: &mut B,
    x0: P::Vector,
    p: f64,
    settings: &NewtonSettings,
) -> Result<NewtonOutcome<P::Vector>>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
{
    let mut sys = EquilibriumSystem {
        problem,
        solver,
        p,
    };
    newton(&mut sys, x0, settings)
}

/// Multiplicative deflation of known roots: `M(x) = prod_i (shift +
/// |x - x_i|^-2a)`. Newton on `M(x) F(x)` repels the iteration from every
/// recorded root, so fresh starts land on solutions not seen before.
#[derive(Debug, Clone)]
pub struct DeflationOperator<V> {
    roots: Vec<V>,
    pub power: f64,
    pub shift: f64,
}

impl<V: VectorOps> DeflationOperator<V> {
    pub fn new(power: f64, shift: f64) -> Self {
        Self {
            roots: Vec::new(),
            power,
            shift,
        }
    }

    pub fn push(&mut self, root: V) {
        self.roots.push(root);
    }

    pub fn pop(&mut self) -> Option<V> {
        self.roots.pop()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&V> {
        self.roots.get(i)
    }

    /// `M(x)`; grows without bound as `x` approaches a deflated root.
    pub fn evaluate(&self, x: &V) -> f64 {
        let mut m = 1.0;
        for root in &self.roots {
            let d = x.minus(root);
            let dist_sq = d.dot(&d);
            m *= self.shift + dist_sq.powf(-self.power);
        }
        m
    }

    /// Gradient of `M` at `x`.
    pub fn gradient(&self, x: &V) -> V {
        let m = self.evaluate(x);
        let mut grad = x.zero_like();
        for root in &self.roots {
            let d = x.minus(root);
            let dist_sq = d.dot(&d);
            let factor = self.shift + dist_sq.powf(-self.power);
            // d/dx of dist_sq^-a is -a dist_sq^(-a-1) * 2 (x - root)
            let coeff = -2.0 * self.power * dist_sq.powf(-self.power - 1.0) * m / factor;
            grad.axpy(coeff, &d);
        }
        grad
    }
}

struct DeflatedSystem<'a, S: NewtonSystem> {
    inner: &'a mut S,
    deflation: &'a DeflationOperator<S::Vector>,
}

impl<'a, S: NewtonSystem> NewtonSystem for DeflatedSystem<'a, S> {
    type Vector = S::Vector;

    fn residual(&mut self, x: &Self::Vector) -> Result<Self::Vector> {
        let mut f = self.inner.residual(x)?;
        f.scale_mut(self.deflation.evaluate(x));
        Ok(f)
    }

    fn newton_step(&mut self, x: &Self::Vector, gx: &Self::Vector) -> Result<Self::Vector> {
        // The deflated Jacobian is M J + F grad(M)^T, a rank-one update of
        // the scaled Jacobian; by Sherman-Morrison its Newton direction is
        // the plain direction h = J \ F rescaled by M / (M + <grad M, h>).
        let m = self.deflation.evaluate(x);
        let mut f = gx.clone();
        f.scale_mut(1.0 / m);
        let h = self.inner.newton_step(x, &f)?;
        let denom = m + self.deflation.gradient(x).dot(&h);
        if denom.abs() < f64::MIN_POSITIVE {
            return Err(SolveFailure::Singular.into());
        }
        let mut d = h;
        d.scale_mut(m / denom);
        Ok(d)
    }

    fn norm(&self, v: &Self::Vector) -> f64 {
        self.inner.norm(v)
    }
}

/// Newton on the deflated system `M(x) F(x) = 0`.
pub fn newton_deflated<S: NewtonSystem>(
    sys: &mut S,
    deflation: &DeflationOperator<S::Vector>,
    x0: S::Vector,
    settings: &NewtonSettings,
) -> Result<NewtonOutcome<S::Vector>> {
    let mut deflated = DeflatedSystem {
        inner: sys,
        deflation,
    };
    newton(&mut deflated, x0, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    struct Cubic;

    impl NewtonSystem for Cubic {
        type Vector = DVector<f64>;

        fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![x[0] * x[0] * x[0] - 2.0 * x[0] - 5.0]))
        }

        fn newton_step(&mut self, x: &DVector<f64>, fx: &DVector<f64>) -> Result<DVector<f64>> {
            let j = 3.0 * x[0] * x[0] - 2.0;
            Ok(DVector::from_vec(vec![fx[0] / j]))
        }
    }

    #[test]
    fn test_newton_scalar_cubic() {
        let out = newton(
            &mut Cubic,
            DVector::from_vec(vec![2.0]),
            &NewtonSettings::default(),
        )
        .expect("newton");
        assert!(out.converged);
        assert!(out.iterations < 10);
        // Root of x^3 - 2x - 5 near 2.0945515.
        assert!((out.x[0] - 2.0945514815423265).abs() < 1e-9);
        assert_eq!(out.residuals.len(), out.iterations + 1);
    }

    #[test]
    fn test_newton_max_iterations_is_not_an_error() {
        let settings = NewtonSettings {
            max_iterations: 1,
            ..NewtonSettings::default()
        };
        let out = newton(&mut Cubic, DVector::from_vec(vec![50.0]), &settings).expect("newton");
        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
    }

    #[test]
    fn test_newton_callback_aborts() {
        let out = newton_with_callback(
            &mut Cubic,
            DVector::from_vec(vec![2.0]),
            &NewtonSettings::default(),
            |_, _, it| it < 2,
        )
        .expect("newton");
        assert!(!out.converged);
        assert_eq!(out.iterations, 2);
    }

    #[test]
    fn test_linesearch_contains_overshoot() {
        // atan has a tiny basin for full Newton steps; the line search
        // rescues an initial guess where undamped Newton diverges.
        struct Atan;
        impl NewtonSystem for Atan {
            type Vector = DVector<f64>;
            fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
                Ok(DVector::from_vec(vec![x[0].atan()]))
            }
            fn newton_step(&mut self, x: &DVector<f64>, fx: &DVector<f64>) -> Result<DVector<f64>> {
                Ok(DVector::from_vec(vec![fx[0] * (1.0 + x[0] * x[0])]))
            }
        }

        let settings = NewtonSettings {
            tol: 1e-12,
            max_iterations: 60,
            linesearch: true,
            ..NewtonSettings::default()
        };
        let out = newton(&mut Atan, DVector::from_vec(vec![2.0]), &settings).expect("newton");
        assert!(out.converged, "residuals: {:?}", out.residuals);
        assert!(out.x[0].abs() < 1e-10);
    }

    struct Quadratic;

    impl NewtonSystem for Quadratic {
        type Vector = DVector<f64>;

        fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![x[0] * x[0] - 1.0]))
        }

        fn newton_step(&mut self, x: &DVector<f64>, fx: &DVector<f64>) -> Result<DVector<f64>> {
            let j = 2.0 * x[0];
            if j.abs() < 1e-14 {
                return Err(SolveFailure::Singular.into());
            }
            Ok(DVector::from_vec(vec![fx[0] / j]))
        }
    }

    #[test]
    fn test_deflation_finds_second_root() {
        let settings = NewtonSettings::default();
        let x0 = DVector::from_vec(vec![2.0]);

        let first = newton(&mut Quadratic, x0.clone(), &settings).expect("first root");
        assert!(first.converged);
        assert!((first.x[0] - 1.0).abs() < 1e-8);

        let mut deflation = DeflationOperator::new(1.0, 1.0);
        deflation.push(first.x);
        assert_eq!(deflation.len(), 1);

        let second =
            newton_deflated(&mut Quadratic, &deflation, x0, &settings).expect("second root");
        assert!(second.converged, "residuals: {:?}", second.residuals);
        assert!(
            (second.x[0] + 1.0).abs() < 1e-6,
            "deflated newton landed on {}",
            second.x[0]
        );
    }

    #[test]
    fn test_solve_equilibrium_via_bordered_backend() {
        use crate::bordered::BorderingBls;
        use crate::linear::DenseLu;
        use crate::problem::FnProblem;

        // F(u, p) = u^2 - p componentwise Jacobian 2u.
        let mut problem = FnProblem::new(
            |u: &DVector<f64>, p: f64| u.map(|x| x * x - p),
            |u: &DVector<f64>, _p: f64| DMatrix::from_diagonal(&u.map(|x| 2.0 * x)),
        );
        let mut bls = BorderingBls::new(DenseLu);
        let out = solve_equilibrium(
            &mut problem,
            &mut bls,
            DVector::from_vec(vec![1.5, 1.5]),
            4.0,
            &NewtonSettings::default(),
        )
        .expect("solve");
        assert!(out.converged);
        assert!((out.x[0] - 2.0).abs() < 1e-9);
    }
}
