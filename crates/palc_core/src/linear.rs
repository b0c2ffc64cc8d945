//! Linear and eigen solver seams consumed by the engine.
//!
//! The continuation machinery is written against the traits in this module;
//! the dense implementations ([`DenseLu`], [`DenseEigen`]) make the crate
//! usable out of the box, and [`BiCgStab`] provides a matrix-free Krylov
//! method for operators that only expose their action on a vector.

use crate::algebra::VectorOps;
use crate::error::SolveFailure;
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen, SVD};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// An operator that can act on a vector. Jacobians only ever need this much;
/// materialization as a matrix is a separate, optional capability.
pub trait LinearOperator {
    type Vector: VectorOps;

    fn apply(&self, v: &Self::Vector) -> Self::Vector;
}

impl LinearOperator for DMatrix<f64> {
    type Vector = DVector<f64>;

    fn apply(&self, v: &Self::Vector) -> Self::Vector {
        self * v
    }
}

/// Operators that can materialize as a dense matrix. Required by the
/// full-matrix bordered solver and by the fold/Hopf defining systems.
pub trait DenseAssembly {
    fn assemble(&self) -> DMatrix<f64>;
}

impl DenseAssembly for DMatrix<f64> {
    fn assemble(&self) -> DMatrix<f64> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct LinearSolution<V> {
    pub x: V,
    pub converged: bool,
    pub iterations: usize,
}

/// Solver for `(a0 I + a1 Op) x = rhs`. Plain systems use `a0 = 0, a1 = 1`.
pub trait LinearSolver<Op> {
    type Vector: VectorOps;

    fn solve_shifted(
        &mut self,
        op: &Op,
        a0: f64,
        a1: f64,
        rhs: &Self::Vector,
    ) -> Result<LinearSolution<Self::Vector>>;

    fn solve(&mut self, op: &Op, rhs: &Self::Vector) -> Result<LinearSolution<Self::Vector>> {
        self.solve_shifted(op, 0.0, 1.0, rhs)
    }
}

/// Direct LU factorization of a dense matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLu;

impl LinearSolver<DMatrix<f64>> for DenseLu {
    type Vector = DVector<f64>;

    fn solve_shifted(
        &mut self,
        op: &DMatrix<f64>,
        a0: f64,
        a1: f64,
        rhs: &DVector<f64>,
    ) -> Result<LinearSolution<DVector<f64>>> {
        let mut m = op * a1;
        for i in 0..m.nrows().min(m.ncols()) {
            m[(i, i)] += a0;
        }
        let x = m.lu().solve(rhs).ok_or(SolveFailure::Singular)?;
        if !x.iter().all(|v| v.is_finite()) {
            return Err(SolveFailure::Singular.into());
        }
        Ok(LinearSolution {
            x,
            converged: true,
            iterations: 1,
        })
    }
}

/// Spectral window requested from an eigensolver: equilibria track the
/// rightmost eigenvalues, Floquet analysis the largest multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EigenWhich {
    LargestReal,
    LargestModulus,
}

#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    pub values: Vec<Complex<f64>>,
    pub vectors: Option<Vec<Vec<Complex<f64>>>>,
    pub converged: bool,
}

pub trait EigenSolver<Op> {
    fn eigen(&mut self, op: &Op, nev: usize, which: EigenWhich) -> Result<EigenDecomposition>;
}

/// Full dense spectrum via the real Schur form, sorted and truncated to the
/// requested window. Eigenvector extraction is optional since it costs one
/// SVD per requested value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEigen {
    pub compute_vectors: bool,
}

impl EigenSolver<DMatrix<f64>> for DenseEigen {
    fn eigen(
        &mut self,
        op: &DMatrix<f64>,
        nev: usize,
        which: EigenWhich,
    ) -> Result<EigenDecomposition> {
        if op.nrows() == 0 {
            return Ok(EigenDecomposition {
                values: Vec::new(),
                vectors: None,
                converged: true,
            });
        }

        let mut values: Vec<Complex<f64>> =
            op.clone().complex_eigenvalues().iter().cloned().collect();
        match which {
            EigenWhich::LargestReal => {
                values.sort_by(|a, b| b.re.partial_cmp(&a.re).unwrap_or(std::cmp::Ordering::Equal))
            }
            EigenWhich::LargestModulus => values.sort_by(|a, b| {
                b.norm()
                    .partial_cmp(&a.norm())
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        values.truncate(nev);

        let vectors = if self.compute_vectors {
            let mut vecs = Vec::with_capacity(values.len());
            for lambda in &values {
                vecs.push(complex_eigenvector(op, *lambda)?);
            }
            Some(vecs)
        } else {
            None
        };

        Ok(EigenDecomposition {
            values,
            vectors,
            converged: true,
        })
    }
}

/// Eigenvector of `mat` for a known eigenvalue, via the singular vector of
/// the complex-shifted matrix `mat - lambda I` closest to its null space.
pub fn complex_eigenvector(
    mat: &DMatrix<f64>,
    lambda: Complex<f64>,
) -> Result<Vec<Complex<f64>>> {
    let dim = mat.nrows();
    let mut shifted = mat.map(|v| Complex::new(v, 0.0));
    for i in 0..dim {
        shifted[(i, i)] -= lambda;
    }
    let svd = SVD::new(shifted, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("failed to compute eigenvector basis"))?;
    let mut min_idx = 0;
    let mut min_val = f64::INFINITY;
    for (i, &s) in svd.singular_values.iter().enumerate() {
        if s < min_val {
            min_val = s;
            min_idx = i;
        }
    }
    let mut vector = Vec::with_capacity(dim);
    for i in 0..dim {
        vector.push(v_t[(min_idx, i)].conj());
    }
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Err(anyhow!("eigenvector for {lambda} is degenerate"));
    }
    for c in &mut vector {
        *c /= norm;
    }
    Ok(vector)
}

/// Null direction of an `n x (n+1)` extended Jacobian, from the Gram matrix
/// eigenvector with the smallest eigenvalue.
pub fn nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    if j_ext.ncols() == 0 {
        return Err(anyhow!("cannot compute tangent of an empty Jacobian"));
    }
    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("extended Jacobian is not finite"));
    }
    let eig = SymmetricEigen::new(gram);
    let mut min_idx = 0;
    let mut min_val = f64::INFINITY;
    for (i, &val) in eig.eigenvalues.iter().enumerate() {
        if val.is_finite() && val < min_val {
            min_val = val;
            min_idx = i;
        }
    }
    let vec = eig.eigenvectors.column(min_idx).into_owned();
    let norm = vec.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(anyhow!("null direction of extended Jacobian is degenerate"));
    }
    Ok(vec / norm)
}

/// Solver for systems given only as a matrix-vector action.
pub trait MatVecSolver<V: VectorOps> {
    fn solve_matvec(
        &mut self,
        apply: &mut dyn FnMut(&V) -> V,
        rhs: &V,
    ) -> Result<LinearSolution<V>>;
}

/// Un-preconditioned BiCGStab over any [`VectorOps`] type.
#[derive(Debug, Clone, Copy)]
pub struct BiCgStab {
    pub tol: f64,
    pub max_iterations: usize,
}

impl Default for BiCgStab {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iterations: 200,
        }
    }
}

impl<V: VectorOps> MatVecSolver<V> for BiCgStab {
    fn solve_matvec(
        &mut self,
        apply: &mut dyn FnMut(&V) -> V,
        rhs: &V,
    ) -> Result<LinearSolution<V>> {
        let bnorm = rhs.norm_inf();
        let mut x = rhs.zero_like();
        if bnorm == 0.0 {
            return Ok(LinearSolution {
                x,
                converged: true,
                iterations: 0,
            });
        }

        let mut r = rhs.clone();
        let rhat = r.clone();
        let mut rho = rhat.dot(&r);
        let mut p = r.clone();

        for it in 1..=self.max_iterations {
            let v = apply(&p);
            let denom = rhat.dot(&v);
            if denom.abs() < f64::MIN_POSITIVE {
                return Err(SolveFailure::NotConverged(it).into());
            }
            let alpha = rho / denom;

            let mut s = r.clone();
            s.axpy(-alpha, &v);
            if s.norm_inf() <= self.tol * bnorm {
                x.axpy(alpha, &p);
                return Ok(LinearSolution {
                    x,
                    converged: true,
                    iterations: it,
                });
            }

            let t = apply(&s);
            let tt = t.dot(&t);
            if tt == 0.0 {
                return Err(SolveFailure::NotConverged(it).into());
            }
            let omega = t.dot(&s) / tt;

            x.axpy(alpha, &p);
            x.axpy(omega, &s);
            r = s;
            r.axpy(-omega, &t);
            if r.norm_inf() <= self.tol * bnorm {
                return Ok(LinearSolution {
                    x,
                    converged: true,
                    iterations: it,
                });
            }

            let rho_new = rhat.dot(&r);
            if rho_new.abs() < f64::MIN_POSITIVE || omega == 0.0 {
                return Err(SolveFailure::NotConverged(it).into());
            }
            let beta = (rho_new / rho) * (alpha / omega);
            p.axpy(-omega, &v);
            p.axpby(1.0, &r, beta);
            rho = rho_new;
        }

        Err(SolveFailure::NotConverged(self.max_iterations).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dense_lu_shifted_solve() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 3.0]);
        let mut solver = DenseLu;

        let sol = solver.solve(&a, &b).expect("plain solve");
        assert_relative_eq!(sol.x[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(sol.x[0], 0.0, epsilon = 1e-12);

        // (I + A) x = b
        let sol = solver.solve_shifted(&a, 1.0, 1.0, &b).expect("shifted");
        let residual = (DMatrix::identity(2, 2) + &a) * &sol.x - &b;
        assert!(residual.amax() < 1e-12);
    }

    #[test]
    fn test_dense_lu_reports_singularity() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let err = DenseLu.solve(&a, &b).unwrap_err();
        assert!(err.downcast_ref::<SolveFailure>().is_some());
    }

    #[test]
    fn test_dense_eigen_ordering() {
        let a = DMatrix::from_row_slice(3, 3, &[-5.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, -1.0]);
        let dec = DenseEigen::default()
            .eigen(&a, 2, EigenWhich::LargestReal)
            .expect("eigen");
        assert_eq!(dec.values.len(), 2);
        assert_relative_eq!(dec.values[0].re, 2.0, epsilon = 1e-12);
        assert_relative_eq!(dec.values[1].re, -1.0, epsilon = 1e-12);

        let dec = DenseEigen::default()
            .eigen(&a, 1, EigenWhich::LargestModulus)
            .expect("eigen");
        assert_relative_eq!(dec.values[0].re, -5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_complex_eigenvector_residual() {
        // Rotation-like block, eigenvalues 1 +/- 2i.
        let a = DMatrix::from_row_slice(2, 2, &[1.0, -2.0, 2.0, 1.0]);
        let lambda = Complex::new(1.0, 2.0);
        let v = complex_eigenvector(&a, lambda).expect("eigenvector");
        // Check A v = lambda v componentwise.
        for i in 0..2 {
            let mut av = Complex::new(0.0, 0.0);
            for j in 0..2 {
                av += Complex::new(a[(i, j)], 0.0) * v[j];
            }
            let diff = av - lambda * v[i];
            assert!(diff.norm() < 1e-10, "row {i} residual {}", diff.norm());
        }
    }

    #[test]
    fn test_nullspace_tangent_of_extended_jacobian() {
        // [1 0 1] has null direction ~ (1, 0, -1)/sqrt(2); row 2 pins e2.
        let j = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let t = nullspace_tangent(&j).expect("tangent");
        assert!((j * &t).amax() < 1e-12);
        assert_relative_eq!(t.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bicgstab_matches_direct_solve() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 5.0]);
        let b = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let mut apply = |v: &DVector<f64>| &a * v;
        let sol = BiCgStab::default()
            .solve_matvec(&mut apply, &b)
            .expect("bicgstab");
        assert!(sol.converged);
        let direct = a.clone().lu().solve(&b).unwrap();
        assert!((sol.x - direct).amax() < 1e-8);
    }
}
