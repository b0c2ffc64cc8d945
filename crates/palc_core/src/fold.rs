//! Fold (saddle-node) defining system: Newton refinement of a fold point
//! and continuation of a fold curve in a second parameter.
//!
//! Unknowns `(x, p, v)` with equations
//!
//! ```text
//! F(x, p)   = 0        (equilibrium)
//! J(x, p) v = 0        (singular direction)
//! <v, v0>   = 1        (normalization against the reference vector)
//! ```
//!
//! The second derivative entering the Jacobian is taken by directional
//! finite differences of `J`, so only the user Jacobian is required. The
//! solvers here work on the assembled dense blocks; the operator therefore
//! has to be materializable.

use crate::linear::DenseAssembly;
use crate::newton::{newton, NewtonOutcome, NewtonSettings, NewtonSystem};
use crate::problem::{BifProblem, FrozenSecond, TwoParamProblem};
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

/// A refined fold point: solution, parameter and the null direction of the
/// Jacobian there.
#[derive(Debug, Clone)]
pub struct FoldPoint {
    pub x: DVector<f64>,
    pub p: f64,
    pub v: DVector<f64>,
}

fn unpack(w: &DVector<f64>, n: usize) -> (DVector<f64>, DVector<f64>, f64) {
    let x = DVector::from_iterator(n, w.iter().take(n).cloned());
    let v = DVector::from_iterator(n, w.iter().skip(n).take(n).cloned());
    (x, v, w[2 * n])
}

fn pack(x: &DVector<f64>, v: &DVector<f64>, p: f64) -> DVector<f64> {
    let n = x.len();
    let mut w = DVector::zeros(2 * n + 1);
    for i in 0..n {
        w[i] = x[i];
        w[n + i] = v[i];
    }
    w[2 * n] = p;
    w
}

fn fold_residual<Q>(q: &mut Q, w: &DVector<f64>, v_ref: &DVector<f64>) -> Result<DVector<f64>>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let n = v_ref.len();
    let (x, v, p) = unpack(w, n);
    let f = q.residual(&x, p)?;
    let j = q.jacobian(&x, p)?.assemble();
    let jv = &j * &v;

    let mut out = DVector::zeros(2 * n + 1);
    for i in 0..n {
        out[i] = f[i];
        out[n + i] = jv[i];
    }
    out[2 * n] = v.dot(v_ref) - 1.0;
    Ok(out)
}

fn fold_jacobian<Q>(
    q: &mut Q,
    w: &DVector<f64>,
    v_ref: &DVector<f64>,
    eps: f64,
) -> Result<DMatrix<f64>>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let n = v_ref.len();
    let (x, v, p) = unpack(w, n);
    let j0 = q.jacobian(&x, p)?.assemble();
    let jv = &j0 * &v;
    let fp = q.dfdp(&x, p, eps)?;

    let dim = 2 * n + 1;
    let mut m = DMatrix::zeros(dim, dim);

    m.view_mut((0, 0), (n, n)).copy_from(&j0);
    m.view_mut((n, n), (n, n)).copy_from(&j0);
    for i in 0..n {
        m[(i, 2 * n)] = fp[i];
        m[(2 * n, n + i)] = v_ref[i];
    }

    // d(Jv)/dx by directional differences of the Jacobian.
    for col in 0..n {
        let h = eps * (1.0 + x[col].abs());
        let mut xp = x.clone();
        xp[col] += h;
        let jp = q.jacobian(&xp, p)?.assemble();
        let dcol = (&jp * &v - &jv) / h;
        for row in 0..n {
            m[(n + row, col)] = dcol[row];
        }
    }

    // d(Jv)/dp.
    let hp = eps * (1.0 + p.abs());
    let jp = q.jacobian(&x, p + hp)?.assemble();
    let dcol = (&jp * &v - &jv) / hp;
    for row in 0..n {
        m[(n + row, 2 * n)] = dcol[row];
    }

    Ok(m)
}

struct FoldSystem<'b, Q> {
    problem: &'b mut Q,
    v_ref: DVector<f64>,
    eps: f64,
}

impl<'b, Q> NewtonSystem for FoldSystem<'b, Q>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    type Vector = DVector<f64>;

    fn residual(&mut self, w: &DVector<f64>) -> Result<DVector<f64>> {
        fold_residual(self.problem, w, &self.v_ref)
    }

    fn newton_step(&mut self, w: &DVector<f64>, fw: &DVector<f64>) -> Result<DVector<f64>> {
        let m = fold_jacobian(self.problem, w, &self.v_ref, self.eps)?;
        m.lu()
            .solve(fw)
            .ok_or_else(|| anyhow!("fold system Jacobian is singular"))
    }
}

/// Null direction of the Jacobian at `(x, p)`, from the singular vector of
/// the smallest singular value. The usual starting `v` for [`newton_fold`].
pub fn fold_initial_vector<Q>(problem: &mut Q, x: &DVector<f64>, p: f64) -> Result<DVector<f64>>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let j = problem.jacobian(x, p)?.assemble();
    let svd = j.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("SVD failed on the Jacobian at the fold guess"))?;
    let mut min_idx = 0;
    let mut min_val = f64::INFINITY;
    for (i, &s) in svd.singular_values.iter().enumerate() {
        if s < min_val {
            min_val = s;
            min_idx = i;
        }
    }
    let v: DVector<f64> = v_t.row(min_idx).transpose();
    let norm = v.norm();
    if norm == 0.0 {
        return Err(anyhow!("null direction at the fold guess is degenerate"));
    }
    Ok(v / norm)
}

/// Newton on the fold defining system from `(x0, p0)` with starting null
/// direction `v0`.
pub fn newton_fold<Q>(
    problem: &mut Q,
    x0: &DVector<f64>,
    p0: f64,
    v0: &DVector<f64>,
    settings: &NewtonSettings,
    fin_diff_eps: f64,
) -> Result<(FoldPoint, NewtonOutcome<DVector<f64>>)>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let norm = v0.norm();
    if norm == 0.0 {
        return Err(anyhow!("starting null direction must be non-zero"));
    }
    let v_ref = v0 / norm;

    let mut sys = FoldSystem {
        problem,
        v_ref: v_ref.clone(),
        eps: fin_diff_eps,
    };
    let out = newton(&mut sys, pack(x0, &v_ref, p0), settings)?;
    let n = v_ref.len();
    let (x, v, p) = unpack(&out.x, n);
    Ok((FoldPoint { x, p, v }, out))
}

/// The fold defining system of a two-parameter problem, viewed as an
/// ordinary continuation problem in the second parameter. The packed state
/// is `[x, v, p1]`; running the standard engine over it traces the fold
/// curve `p2 -> (x(p2), p1(p2))`.
pub struct FoldCurveProblem<'a, P> {
    inner: &'a mut P,
    v_ref: DVector<f64>,
    eps: f64,
}

impl<'a, P> FoldCurveProblem<'a, P>
where
    P: TwoParamProblem<Vector = DVector<f64>>,
    P::Operator: DenseAssembly,
{
    /// Build from a refined fold point of the frozen-`p2` problem.
    pub fn new(inner: &'a mut P, fold: &FoldPoint, eps: f64) -> Self {
        Self {
            inner,
            v_ref: fold.v.clone(),
            eps,
        }
    }

    pub fn pack(fold: &FoldPoint) -> DVector<f64> {
        pack(&fold.x, &fold.v, fold.p)
    }

    pub fn unpack(&self, w: &DVector<f64>) -> FoldPoint {
        let (x, v, p) = unpack(w, self.v_ref.len());
        FoldPoint { x, p, v }
    }
}

impl<'a, P> BifProblem for FoldCurveProblem<'a, P>
where
    P: TwoParamProblem<Vector = DVector<f64>>,
    P::Operator: DenseAssembly,
{
    type Vector = DVector<f64>;
    type Operator = DMatrix<f64>;

    fn residual(&mut self, w: &DVector<f64>, p2: f64) -> Result<DVector<f64>> {
        let mut frozen = FrozenSecond {
            inner: &mut *self.inner,
            p2,
        };
        fold_residual(&mut frozen, w, &self.v_ref)
    }

    fn jacobian(&mut self, w: &DVector<f64>, p2: f64) -> Result<DMatrix<f64>> {
        let mut frozen = FrozenSecond {
            inner: &mut *self.inner,
            p2,
        };
        fold_jacobian(&mut frozen, w, &self.v_ref, self.eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bordered::BorderingBls;
    use crate::continuation::{continuation, ContinuationSettings};
    use crate::linear::{nullspace_tangent, DenseEigen, DenseLu};
    use crate::predictor::Predictor;
    use crate::problem::FnProblem;

    fn cubic() -> FnProblem<
        DVector<f64>,
        DMatrix<f64>,
        impl FnMut(&DVector<f64>, f64) -> DVector<f64>,
        impl FnMut(&DVector<f64>, f64) -> DMatrix<f64>,
    > {
        FnProblem::new(
            |u: &DVector<f64>, p: f64| DVector::from_vec(vec![p + u[0] - u[0].powi(3)]),
            |u: &DVector<f64>, _p: f64| {
                DMatrix::from_row_slice(1, 1, &[1.0 - 3.0 * u[0] * u[0]])
            },
        )
    }

    #[test]
    fn test_newton_fold_refines_cubic_fold() {
        let fold_x = 1.0 / 3.0_f64.sqrt();
        let fold_p = -2.0 / (3.0 * 3.0_f64.sqrt());

        let mut problem = cubic();
        let v0 = fold_initial_vector(&mut problem, &DVector::from_vec(vec![0.5]), -0.3)
            .expect("initial null vector");
        let (fold, out) = newton_fold(
            &mut problem,
            &DVector::from_vec(vec![0.5]),
            -0.3,
            &v0,
            &NewtonSettings::default(),
            1e-8,
        )
        .expect("newton fold");

        assert!(out.converged, "residuals: {:?}", out.residuals);
        assert!((fold.p - fold_p).abs() < 1e-8, "fold p = {}", fold.p);
        assert!((fold.x[0] - fold_x).abs() < 1e-8, "fold x = {}", fold.x[0]);

        // At the refined fold the branch tangent has no parameter component.
        let mut j_ext = DMatrix::zeros(1, 2);
        j_ext[(0, 0)] = 1.0 - 3.0 * fold.x[0] * fold.x[0];
        j_ext[(0, 1)] = 1.0;
        let t = nullspace_tangent(&j_ext).expect("tangent");
        assert!(
            t[1].abs() < 1e-6,
            "parameter tangent at the fold: {}",
            t[1]
        );
    }

    struct ShiftedCubic;

    impl TwoParamProblem for ShiftedCubic {
        type Vector = DVector<f64>;
        type Operator = DMatrix<f64>;

        fn residual(&mut self, u: &DVector<f64>, p1: f64, p2: f64) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![p1 - p2 + u[0] - u[0].powi(3)]))
        }

        fn jacobian(&mut self, u: &DVector<f64>, _p1: f64, _p2: f64) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 1, &[1.0 - 3.0 * u[0] * u[0]]))
        }
    }

    #[test]
    fn test_fold_curve_continuation_tracks_shifted_fold() {
        // F = p1 - p2 + x - x^3: fold curve is the line p1 = p2 - 2/(3 sqrt 3).
        let fold_p = -2.0 / (3.0 * 3.0_f64.sqrt());
        let mut two = ShiftedCubic;

        // Refine the fold at p2 = 0 first.
        let (fold, out) = {
            let mut frozen = FrozenSecond {
                inner: &mut two,
                p2: 0.0,
            };
            let v0 = fold_initial_vector(&mut frozen, &DVector::from_vec(vec![0.5]), -0.3)
                .expect("null vector");
            newton_fold(
                &mut frozen,
                &DVector::from_vec(vec![0.5]),
                -0.3,
                &v0,
                &NewtonSettings::default(),
                1e-8,
            )
            .expect("newton fold")
        };
        assert!(out.converged);

        let w0 = FoldCurveProblem::<ShiftedCubic>::pack(&fold);
        let mut curve = FoldCurveProblem::new(&mut two, &fold, 1e-8);
        let settings = ContinuationSettings {
            ds: 0.05,
            dsmax: 0.1,
            p_min: -0.5,
            p_max: 1.0,
            max_steps: 60,
            detect_fold: false,
            ..ContinuationSettings::default()
        };
        let result = continuation(
            &mut curve,
            w0,
            0.0,
            settings,
            Predictor::Secant,
            BorderingBls::new(DenseLu),
            DenseEigen::default(),
        )
        .expect("fold curve continuation");

        assert!(result.last.p > 1.0 - 1e-9, "p2 advanced to {}", result.last.p);
        // Along the whole curve p1 - p2 stays at the fold value.
        let p1 = result.last.u[2];
        assert!(
            (p1 - result.last.p - fold_p).abs() < 1e-6,
            "fold curve drifted: p1 = {p1}, p2 = {}",
            result.last.p
        );
    }
}
