//! Solvers for the bordered system arising from the arclength constraint:
//!
//! ```text
//! [ J            dFdp    ] [X]   [R]
//! [ xi_u dgdu^T  xi_p dgdp ] [y] = [n]
//! ```
//!
//! Three interchangeable strategies: bordering (two solves with `J`), full
//! assembly of the `(N+1) x (N+1)` matrix, and a matrix-free Krylov solve of
//! the augmented operator.

use crate::algebra::{BorderedPair, VectorOps};
use crate::error::SolveFailure;
use crate::linear::{
    DenseAssembly, LinearOperator, LinearSolution, LinearSolver, MatVecSolver,
};
use anyhow::Result;
use nalgebra::{DMatrix, DVector};

/// A linear backend for the continuation engine: plain solves with `J` for
/// Newton bootstrap, bordered solves for the arclength corrector.
pub trait BorderedSolver<Op> {
    type Vector: VectorOps;

    fn solve_plain(&mut self, op: &Op, rhs: &Self::Vector)
        -> Result<LinearSolution<Self::Vector>>;

    #[allow(clippy::too_many_arguments)]
    fn solve_bordered(
        &mut self,
        op: &Op,
        dfdp: &Self::Vector,
        dgdu: &Self::Vector,
        dgdp: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &BorderedPair<Self::Vector>,
    ) -> Result<BorderedPair<Self::Vector>>;
}

/// Bordering: `X1 = J\R`, `X2 = J\dFdp`, then eliminate the scalar row.
/// Cheap and works for any inner solver, but breaks down when the
/// elimination denominator underflows (`SolveFailure::BorderingSingular`).
pub struct BorderingBls<L> {
    pub inner: L,
    pub epsilon: f64,
}

impl<L> BorderingBls<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            epsilon: 1e-12,
        }
    }
}

impl<Op, L: LinearSolver<Op>> BorderedSolver<Op> for BorderingBls<L> {
    type Vector = L::Vector;

    fn solve_plain(
        &mut self,
        op: &Op,
        rhs: &Self::Vector,
    ) -> Result<LinearSolution<Self::Vector>> {
        self.inner.solve(op, rhs)
    }

    fn solve_bordered(
        &mut self,
        op: &Op,
        dfdp: &Self::Vector,
        dgdu: &Self::Vector,
        dgdp: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &BorderedPair<Self::Vector>,
    ) -> Result<BorderedPair<Self::Vector>> {
        let x1 = self.inner.solve(op, &rhs.u)?;
        let x2 = self.inner.solve(op, dfdp)?;
        let denom = xi_p * dgdp - xi_u * dgdu.dot(&x2.x);
        if denom.abs() < self.epsilon {
            return Err(SolveFailure::BorderingSingular(denom).into());
        }
        let y = (rhs.p - xi_u * dgdu.dot(&x1.x)) / denom;
        let mut x = x1.x;
        x.axpy(-y, &x2.x);
        Ok(BorderedPair::new(x, y))
    }
}

/// Assemble the augmented matrix and hand it to the inner dense solver.
/// Robust near folds (the augmented matrix stays regular where `J` alone is
/// singular), at the price of requiring a materializable operator.
pub struct FullMatrixBls<L> {
    pub inner: L,
}

impl<L> FullMatrixBls<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<Op, L> BorderedSolver<Op> for FullMatrixBls<L>
where
    Op: DenseAssembly,
    L: LinearSolver<DMatrix<f64>, Vector = DVector<f64>>,
{
    type Vector = DVector<f64>;

    fn solve_plain(
        &mut self,
        op: &Op,
        rhs: &DVector<f64>,
    ) -> Result<LinearSolution<DVector<f64>>> {
        let m = op.assemble();
        self.inner.solve(&m, rhs)
    }

    fn solve_bordered(
        &mut self,
        op: &Op,
        dfdp: &DVector<f64>,
        dgdu: &DVector<f64>,
        dgdp: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &BorderedPair<DVector<f64>>,
    ) -> Result<BorderedPair<DVector<f64>>> {
        let j = op.assemble();
        let n = j.nrows();
        let mut aug = DMatrix::zeros(n + 1, n + 1);
        aug.view_mut((0, 0), (n, n)).copy_from(&j);
        for i in 0..n {
            aug[(i, n)] = dfdp[i];
            aug[(n, i)] = xi_u * dgdu[i];
        }
        aug[(n, n)] = xi_p * dgdp;

        let mut b = DVector::zeros(n + 1);
        for i in 0..n {
            b[i] = rhs.u[i];
        }
        b[n] = rhs.p;

        let sol = self.inner.solve(&aug, &b)?;
        let x = DVector::from_iterator(n, sol.x.iter().take(n).cloned());
        Ok(BorderedPair::new(x, sol.x[n]))
    }
}

/// Apply the augmented operator through a user-supplied Krylov method; `J`
/// is never materialized.
pub struct MatrixFreeBls<K> {
    pub krylov: K,
}

impl<K> MatrixFreeBls<K> {
    pub fn new(krylov: K) -> Self {
        Self { krylov }
    }
}

impl<Op, V, K> BorderedSolver<Op> for MatrixFreeBls<K>
where
    V: VectorOps,
    Op: LinearOperator<Vector = V>,
    K: MatVecSolver<V> + MatVecSolver<BorderedPair<V>>,
{
    type Vector = V;

    fn solve_plain(&mut self, op: &Op, rhs: &V) -> Result<LinearSolution<V>> {
        let mut apply = |v: &V| op.apply(v);
        self.krylov.solve_matvec(&mut apply, rhs)
    }

    fn solve_bordered(
        &mut self,
        op: &Op,
        dfdp: &V,
        dgdu: &V,
        dgdp: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &BorderedPair<V>,
    ) -> Result<BorderedPair<V>> {
        let mut apply = |w: &BorderedPair<V>| {
            let mut u = op.apply(&w.u);
            u.axpy(w.p, dfdp);
            let p = xi_u * dgdu.dot(&w.u) + xi_p * dgdp * w.p;
            BorderedPair::new(u, p)
        };
        let sol = self.krylov.solve_matvec(&mut apply, rhs)?;
        Ok(sol.x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::{BiCgStab, DenseLu};

    fn sample_system() -> (
        DMatrix<f64>,
        DVector<f64>,
        DVector<f64>,
        f64,
        BorderedPair<DVector<f64>>,
    ) {
        let j = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, -1.0, 2.0]);
        let dfdp = DVector::from_vec(vec![1.0, 0.5]);
        let dgdu = DVector::from_vec(vec![0.2, -0.4]);
        let dgdp = 0.9;
        let rhs = BorderedPair::new(DVector::from_vec(vec![1.0, -1.0]), 0.3);
        (j, dfdp, dgdu, dgdp, rhs)
    }

    fn residual(
        j: &DMatrix<f64>,
        dfdp: &DVector<f64>,
        dgdu: &DVector<f64>,
        dgdp: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &BorderedPair<DVector<f64>>,
        sol: &BorderedPair<DVector<f64>>,
    ) -> f64 {
        let top = j * &sol.u + dfdp * sol.p - &rhs.u;
        let bottom = xi_u * dgdu.dot(&sol.u) + xi_p * dgdp * sol.p - rhs.p;
        top.amax().max(bottom.abs())
    }

    #[test]
    fn test_three_strategies_agree() {
        let (j, dfdp, dgdu, dgdp, rhs) = sample_system();
        let (xi_u, xi_p) = (0.25, 0.5);

        let a = BorderingBls::new(DenseLu)
            .solve_bordered(&j, &dfdp, &dgdu, dgdp, xi_u, xi_p, &rhs)
            .expect("bordering");
        let b = FullMatrixBls::new(DenseLu)
            .solve_bordered(&j, &dfdp, &dgdu, dgdp, xi_u, xi_p, &rhs)
            .expect("full matrix");
        let c = MatrixFreeBls::new(BiCgStab::default())
            .solve_bordered(&j, &dfdp, &dgdu, dgdp, xi_u, xi_p, &rhs)
            .expect("matrix free");

        for sol in [&a, &b, &c] {
            assert!(
                residual(&j, &dfdp, &dgdu, dgdp, xi_u, xi_p, &rhs, sol) < 1e-8,
                "augmented residual too large"
            );
        }
        assert!((a.p - b.p).abs() < 1e-10);
        assert!((a.p - c.p).abs() < 1e-7);
    }

    #[test]
    fn test_bordering_reports_singular_denominator() {
        // dgdu chosen so the Schur complement of the border vanishes:
        // with J = I, X2 = dfdp, pick dgdp and dgdu with
        // xi_p*dgdp == xi_u*<dgdu, dfdp>.
        let j = DMatrix::identity(2, 2);
        let dfdp = DVector::from_vec(vec![1.0, 1.0]);
        let dgdu = DVector::from_vec(vec![1.0, 1.0]);
        let rhs = BorderedPair::new(DVector::from_vec(vec![1.0, 0.0]), 0.0);
        let err = BorderingBls::new(DenseLu)
            .solve_bordered(&j, &dfdp, &dgdu, 2.0, 0.5, 0.5, &rhs)
            .unwrap_err();
        match err.downcast_ref::<SolveFailure>() {
            Some(SolveFailure::BorderingSingular(_)) => {}
            other => panic!("expected bordering singular, got {other:?}"),
        }
    }
}
