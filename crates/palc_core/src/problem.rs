//! The problem seam: what a user system must provide to be continued.

use crate::algebra::VectorOps;
use crate::linear::{EigenDecomposition, EigenSolver, EigenWhich};
use anyhow::Result;
use std::marker::PhantomData;

/// How spectral crossings along a branch are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BifFlavor {
    /// Eigenvalues of the Jacobian crossing the imaginary axis.
    Equilibrium,
    /// Floquet multipliers crossing the unit circle (tracked as logs).
    PeriodicOrbit,
}

/// A parameter-dependent system `F(u, p) = 0` with its Jacobian.
///
/// `Operator` is whatever the Jacobian evaluates to; the engine only hands it
/// to the configured linear and eigen solvers, so a matrix, a sparse wrapper,
/// or a matrix-free action all work.
pub trait BifProblem {
    type Vector: VectorOps;
    type Operator;

    fn residual(&mut self, u: &Self::Vector, p: f64) -> Result<Self::Vector>;

    fn jacobian(&mut self, u: &Self::Vector, p: f64) -> Result<Self::Operator>;

    /// `dF/dp` by forward differences. The step is scaled by `|p| + 1` so a
    /// fixed `eps` stays meaningful across parameter magnitudes.
    fn dfdp(&mut self, u: &Self::Vector, p: f64, eps: f64) -> Result<Self::Vector> {
        let h = eps * (p.abs() + 1.0);
        let fp = self.residual(u, p + h)?;
        let f0 = self.residual(u, p)?;
        let mut out = fp;
        out.axpy(-1.0, &f0);
        out.scale_mut(1.0 / h);
        Ok(out)
    }

    /// Spectrum used for stability bookkeeping. Equilibrium problems report
    /// the rightmost eigenvalues of the Jacobian; periodic-orbit problems
    /// override this with Floquet logs.
    fn spectrum<E: EigenSolver<Self::Operator>>(
        &mut self,
        eig: &mut E,
        u: &Self::Vector,
        p: f64,
        nev: usize,
    ) -> Result<EigenDecomposition> {
        let j = self.jacobian(u, p)?;
        eig.eigen(&j, nev, EigenWhich::LargestReal)
    }

    fn flavor(&self) -> BifFlavor {
        BifFlavor::Equilibrium
    }
}

/// Adapter turning a pair of closures `(F, J)` into a [`BifProblem`].
pub struct FnProblem<V, Op, F, J> {
    f: F,
    jac: J,
    _marker: PhantomData<(V, Op)>,
}

impl<V, Op, F, J> FnProblem<V, Op, F, J>
where
    V: VectorOps,
    F: FnMut(&V, f64) -> V,
    J: FnMut(&V, f64) -> Op,
{
    pub fn new(f: F, jac: J) -> Self {
        Self {
            f,
            jac,
            _marker: PhantomData,
        }
    }
}

impl<V, Op, F, J> BifProblem for FnProblem<V, Op, F, J>
where
    V: VectorOps,
    F: FnMut(&V, f64) -> V,
    J: FnMut(&V, f64) -> Op,
{
    type Vector = V;
    type Operator = Op;

    fn residual(&mut self, u: &V, p: f64) -> Result<V> {
        Ok((self.f)(u, p))
    }

    fn jacobian(&mut self, u: &V, p: f64) -> Result<Op> {
        Ok((self.jac)(u, p))
    }
}

/// A system depending on two parameters, consumed by the fold and Hopf
/// curve continuations where the second parameter frees the first.
pub trait TwoParamProblem {
    type Vector: VectorOps;
    type Operator;

    fn residual(&mut self, u: &Self::Vector, p1: f64, p2: f64) -> Result<Self::Vector>;

    fn jacobian(&mut self, u: &Self::Vector, p1: f64, p2: f64) -> Result<Self::Operator>;
}

/// View of a [`TwoParamProblem`] with the second parameter frozen.
pub struct FrozenSecond<'a, P: TwoParamProblem> {
    pub inner: &'a mut P,
    pub p2: f64,
}

impl<'a, P: TwoParamProblem> BifProblem for FrozenSecond<'a, P> {
    type Vector = P::Vector;
    type Operator = P::Operator;

    fn residual(&mut self, u: &Self::Vector, p: f64) -> Result<Self::Vector> {
        self.inner.residual(u, p, self.p2)
    }

    fn jacobian(&mut self, u: &Self::Vector, p: f64) -> Result<Self::Operator> {
        self.inner.jacobian(u, p, self.p2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_finite_difference_dfdp_scales_with_parameter() {
        // F(u, p) = u - p^2, dF/dp = -2p.
        let mut problem = FnProblem::new(
            |u: &DVector<f64>, p: f64| u.map(|x| x - p * p),
            |u: &DVector<f64>, _p: f64| DMatrix::<f64>::identity(u.len(), u.len()),
        );
        let u = DVector::from_vec(vec![0.5]);
        for &p in &[0.3, 30.0] {
            let d = problem.dfdp(&u, p, 1e-8).expect("dfdp");
            assert!(
                (d[0] + 2.0 * p).abs() < 1e-5 * (1.0 + p.abs()),
                "dF/dp at p={p}: got {}",
                d[0]
            );
        }
    }
}
