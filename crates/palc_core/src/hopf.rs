//! Hopf defining system: Newton refinement of a Hopf point and continuation
//! of a Hopf curve in a second parameter.
//!
//! Unknowns `(x, p, v_r, v_i, omega)` with equations
//!
//! ```text
//! F(x, p)             = 0
//! J v_r + omega v_i   = 0
//! J v_i - omega v_r   = 0
//! <v_r,v_r> + <v_i,v_i> = 1
//! <v_r, v_i>          = 0
//! ```
//!
//! which pin the eigenpair `J (v_r + i v_i) = i omega (v_r + i v_i)` up to
//! phase. As with the fold system, the Jacobian blocks are assembled dense
//! and second derivatives are taken by directional finite differences.

use crate::linear::{complex_eigenvector, DenseAssembly};
use crate::newton::{newton, NewtonOutcome, NewtonSettings, NewtonSystem};
use crate::problem::{BifProblem, FrozenSecond, TwoParamProblem};
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

/// A refined Hopf point with its frequency and eigenvector split into real
/// and imaginary parts.
#[derive(Debug, Clone)]
pub struct HopfPoint {
    pub x: DVector<f64>,
    pub p: f64,
    pub omega: f64,
    pub v_re: DVector<f64>,
    pub v_im: DVector<f64>,
}

struct Parts {
    x: DVector<f64>,
    vr: DVector<f64>,
    vi: DVector<f64>,
    omega: f64,
    p: f64,
}

fn unpack(w: &DVector<f64>, n: usize) -> Parts {
    Parts {
        x: DVector::from_iterator(n, w.iter().take(n).cloned()),
        vr: DVector::from_iterator(n, w.iter().skip(n).take(n).cloned()),
        vi: DVector::from_iterator(n, w.iter().skip(2 * n).take(n).cloned()),
        omega: w[3 * n],
        p: w[3 * n + 1],
    }
}

fn pack(point: &HopfPoint) -> DVector<f64> {
    let n = point.x.len();
    let mut w = DVector::zeros(3 * n + 2);
    for i in 0..n {
        w[i] = point.x[i];
        w[n + i] = point.v_re[i];
        w[2 * n + i] = point.v_im[i];
    }
    w[3 * n] = point.omega;
    w[3 * n + 1] = point.p;
    w
}

fn hopf_residual<Q>(q: &mut Q, w: &DVector<f64>, n: usize) -> Result<DVector<f64>>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let parts = unpack(w, n);
    let f = q.residual(&parts.x, parts.p)?;
    let j = q.jacobian(&parts.x, parts.p)?.assemble();
    let jvr = &j * &parts.vr;
    let jvi = &j * &parts.vi;

    let mut out = DVector::zeros(3 * n + 2);
    for i in 0..n {
        out[i] = f[i];
        out[n + i] = jvr[i] + parts.omega * parts.vi[i];
        out[2 * n + i] = jvi[i] - parts.omega * parts.vr[i];
    }
    out[3 * n] = parts.vr.dot(&parts.vr) + parts.vi.dot(&parts.vi) - 1.0;
    out[3 * n + 1] = parts.vr.dot(&parts.vi);
    Ok(out)
}

fn hopf_jacobian<Q>(q: &mut Q, w: &DVector<f64>, n: usize, eps: f64) -> Result<DMatrix<f64>>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let parts = unpack(w, n);
    let j0 = q.jacobian(&parts.x, parts.p)?.assemble();
    let jvr = &j0 * &parts.vr;
    let jvi = &j0 * &parts.vi;
    let fp = q.dfdp(&parts.x, parts.p, eps)?;

    let dim = 3 * n + 2;
    let mut m = DMatrix::zeros(dim, dim);

    m.view_mut((0, 0), (n, n)).copy_from(&j0);
    m.view_mut((n, n), (n, n)).copy_from(&j0);
    m.view_mut((2 * n, 2 * n), (n, n)).copy_from(&j0);
    for i in 0..n {
        m[(i, 3 * n + 1)] = fp[i];
        m[(n + i, 2 * n + i)] += parts.omega;
        m[(2 * n + i, n + i)] -= parts.omega;
        m[(n + i, 3 * n)] = parts.vi[i];
        m[(2 * n + i, 3 * n)] = -parts.vr[i];
        m[(3 * n, n + i)] = 2.0 * parts.vr[i];
        m[(3 * n, 2 * n + i)] = 2.0 * parts.vi[i];
        m[(3 * n + 1, n + i)] = parts.vi[i];
        m[(3 * n + 1, 2 * n + i)] = parts.vr[i];
    }

    // Second-derivative blocks d(J v)/dx for both eigenvector parts, one
    // Jacobian assembly per column.
    for col in 0..n {
        let h = eps * (1.0 + parts.x[col].abs());
        let mut xp = parts.x.clone();
        xp[col] += h;
        let jp = q.jacobian(&xp, parts.p)?.assemble();
        let dvr = (&jp * &parts.vr - &jvr) / h;
        let dvi = (&jp * &parts.vi - &jvi) / h;
        for row in 0..n {
            m[(n + row, col)] = dvr[row];
            m[(2 * n + row, col)] = dvi[row];
        }
    }

    // d(J v)/dp.
    let hp = eps * (1.0 + parts.p.abs());
    let jp = q.jacobian(&parts.x, parts.p + hp)?.assemble();
    let dvr = (&jp * &parts.vr - &jvr) / hp;
    let dvi = (&jp * &parts.vi - &jvi) / hp;
    for row in 0..n {
        m[(n + row, 3 * n + 1)] = dvr[row];
        m[(2 * n + row, 3 * n + 1)] = dvi[row];
    }

    Ok(m)
}

struct HopfSystem<'b, Q> {
    problem: &'b mut Q,
    n: usize,
    eps: f64,
}

impl<'b, Q> NewtonSystem for HopfSystem<'b, Q>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    type Vector = DVector<f64>;

    fn residual(&mut self, w: &DVector<f64>) -> Result<DVector<f64>> {
        hopf_residual(self.problem, w, self.n)
    }

    fn newton_step(&mut self, w: &DVector<f64>, fw: &DVector<f64>) -> Result<DVector<f64>> {
        let m = hopf_jacobian(self.problem, w, self.n, self.eps)?;
        m.lu()
            .solve(fw)
            .ok_or_else(|| anyhow!("Hopf system Jacobian is singular"))
    }
}

/// Starting data for [`newton_hopf`] from a Hopf guess `(x, p)`: frequency
/// and eigenvector of the eigenvalue closest to the imaginary axis, rotated
/// and scaled to satisfy both normalization constraints.
pub fn hopf_guess<Q>(problem: &mut Q, x: &DVector<f64>, p: f64) -> Result<HopfPoint>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let j = problem.jacobian(x, p)?.assemble();
    let eigenvalues = j.clone().complex_eigenvalues();
    let mut best: Option<num_complex::Complex<f64>> = None;
    for ev in eigenvalues.iter() {
        if ev.im <= 1e-8 {
            continue;
        }
        match best {
            Some(b) if ev.re.abs() >= b.re.abs() => {}
            _ => best = Some(*ev),
        }
    }
    let lambda = best.ok_or_else(|| anyhow!("no complex eigenpair at the Hopf guess"))?;
    let vector = complex_eigenvector(&j, lambda)?;

    let n = x.len();
    let mut vr = DVector::zeros(n);
    let mut vi = DVector::zeros(n);
    for i in 0..n {
        vr[i] = vector[i].re;
        vi[i] = vector[i].im;
    }

    // Rotate the phase so <v_r, v_i> = 0, then normalize the total length.
    let (a, b, c) = (vr.dot(&vr), vi.dot(&vi), vr.dot(&vi));
    if c.abs() > 1e-12 {
        let phi = 0.5 * (-2.0 * c).atan2(a - b);
        let (sin, cos) = phi.sin_cos();
        let vr_new = &vr * cos - &vi * sin;
        let vi_new = &vr * sin + &vi * cos;
        vr = vr_new;
        vi = vi_new;
    }
    let total = (vr.dot(&vr) + vi.dot(&vi)).sqrt();
    if total == 0.0 {
        return Err(anyhow!("Hopf eigenvector is degenerate"));
    }
    vr /= total;
    vi /= total;

    Ok(HopfPoint {
        x: x.clone(),
        p,
        omega: lambda.im,
        v_re: vr,
        v_im: vi,
    })
}

/// Newton on the Hopf defining system from a starting [`HopfPoint`].
pub fn newton_hopf<Q>(
    problem: &mut Q,
    guess: &HopfPoint,
    settings: &NewtonSettings,
    fin_diff_eps: f64,
) -> Result<(HopfPoint, NewtonOutcome<DVector<f64>>)>
where
    Q: BifProblem<Vector = DVector<f64>>,
    Q::Operator: DenseAssembly,
{
    let n = guess.x.len();
    let mut sys = HopfSystem {
        problem,
        n,
        eps: fin_diff_eps,
    };
    let out = newton(&mut sys, pack(guess), settings)?;
    let parts = unpack(&out.x, n);
    Ok((
        HopfPoint {
            x: parts.x,
            p: parts.p,
            omega: parts.omega,
            v_re: parts.vr,
            v_im: parts.vi,
        },
        out,
    ))
}

/// The Hopf defining system of a two-parameter problem as an ordinary
/// continuation problem in the second parameter; packed state
/// `[x, v_r, v_i, omega, p1]`.
pub struct HopfCurveProblem<'a, P> {
    inner: &'a mut P,
    n: usize,
    eps: f64,
}

impl<'a, P> HopfCurveProblem<'a, P>
where
    P: TwoParamProblem<Vector = DVector<f64>>,
    P::Operator: DenseAssembly,
{
    pub fn new(inner: &'a mut P, hopf: &HopfPoint, eps: f64) -> Self {
        Self {
            inner,
            n: hopf.x.len(),
            eps,
        }
    }

    pub fn pack(hopf: &HopfPoint) -> DVector<f64> {
        pack(hopf)
    }

    pub fn unpack(&self, w: &DVector<f64>) -> HopfPoint {
        let parts = unpack(w, self.n);
        HopfPoint {
            x: parts.x,
            p: parts.p,
            omega: parts.omega,
            v_re: parts.vr,
            v_im: parts.vi,
        }
    }
}

impl<'a, P> BifProblem for HopfCurveProblem<'a, P>
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
        hopf_residual(&mut frozen, w, self.n)
    }

    fn jacobian(&mut self, w: &DVector<f64>, p2: f64) -> Result<DMatrix<f64>> {
        let mut frozen = FrozenSecond {
            inner: &mut *self.inner,
            p2,
        };
        hopf_jacobian(&mut frozen, w, self.n, self.eps)
    }
}
