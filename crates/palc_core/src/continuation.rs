//! Pseudo-arclength continuation: predictor, arclength corrector, stability
//! bookkeeping, fold and bifurcation detection, adaptive step control.
//!
//! The run is a single-threaded state machine. Each step predicts a new
//! point, corrects it by Newton on the extended system
//! `[F(x, p); <(x, p) - z_old, tau>_theta - ds] = 0` through the bordered
//! solver, updates the tangent, refreshes the spectrum, and appends to the
//! branch record. Failures of the corrector shrink `ds` and retry; only at
//! `dsmin` does a failing step end the run.

pub mod bisection;
pub mod types;

use crate::algebra::{BorderedPair, ThetaDot, VectorOps};
use crate::bordered::BorderedSolver;
use crate::error::{is_recoverable, ConfigError};
use crate::linear::{EigenDecomposition, EigenSolver};
use crate::newton::{
    newton, newton_with_callback, solve_equilibrium, NewtonOutcome, NewtonSettings,
    NewtonSystem,
};
use crate::predictor::{secant_tangent, Predictor};
use crate::problem::{BifFlavor, BifProblem};
use crate::stability::{classify_cycle, classify_equilibrium, count_unstable, crossing_index};
use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub use types::{
    BifKind, BifPoint, BifStatus, BranchRecord, BranchRow, EigenSnapshot, IterState,
    SavedSolution, StepSummary, StopReason,
};

/// Immutable configuration of a continuation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    /// Initial signed arclength step.
    pub ds: f64,
    pub dsmin: f64,
    pub dsmax: f64,
    /// Weight of the state part in the arclength metric, in (0, 1).
    pub theta: f64,
    pub do_arclength_scaling: bool,
    pub g_goal: f64,
    pub g_max: f64,
    pub theta_min: f64,
    /// Exponent of the tangent-angle factor in step adaptation.
    pub tangent_exponent: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub max_steps: usize,
    pub newton: NewtonSettings,
    /// Flag folds from parameter non-monotonicity.
    pub detect_fold: bool,
    /// 0 = off, 1 = guess from eigenvalue counts, 2 = refine by bisection.
    pub detect_bifurcation: u8,
    /// Real parts beyond this threshold count as unstable.
    pub precision_stability: f64,
    pub dsmin_bisection: f64,
    /// Sign inversions after which bisection stops; must be even.
    pub n_inversion: usize,
    pub max_bisection_steps: usize,
    pub compute_eigenvalues: bool,
    /// Eigenvalues requested per spectrum; grown automatically until at
    /// least one stable mode is visible.
    pub nev: usize,
    pub save_eig_every: usize,
    pub save_eigenvectors: bool,
    /// Save full solutions every this many steps; 0 disables.
    pub save_sol_every: usize,
    /// Invoke the plot hook every this many steps; 0 disables.
    pub plot_every: usize,
    /// Aggressiveness of step growth after an easy Newton solve.
    pub aggressiveness: f64,
    /// Base step for finite-difference parameter derivatives, scaled by
    /// `|p| + 1` at the point of use.
    pub fin_diff_eps: f64,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            ds: 1e-2,
            dsmin: 1e-5,
            dsmax: 1e-1,
            theta: 0.5,
            do_arclength_scaling: false,
            g_goal: 0.5,
            g_max: 0.8,
            theta_min: 1e-3,
            tangent_exponent: 1.5,
            p_min: f64::NEG_INFINITY,
            p_max: f64::INFINITY,
            max_steps: 100,
            newton: NewtonSettings::default(),
            detect_fold: true,
            detect_bifurcation: 0,
            precision_stability: 1e-10,
            dsmin_bisection: 1e-9,
            n_inversion: 2,
            max_bisection_steps: 25,
            compute_eigenvalues: false,
            nev: 8,
            save_eig_every: 1,
            save_eigenvectors: false,
            save_sol_every: 0,
            plot_every: 0,
            aggressiveness: 0.5,
            fin_diff_eps: 1e-8,
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dsmin > 0.0 && self.dsmin <= self.dsmax) {
            return Err(ConfigError::StepBounds {
                dsmin: self.dsmin,
                dsmax: self.dsmax,
            });
        }
        if self.ds.abs() < self.dsmin || self.ds.abs() > self.dsmax {
            return Err(ConfigError::InitialStep {
                ds: self.ds.abs(),
                dsmin: self.dsmin,
                dsmax: self.dsmax,
            });
        }
        if !(self.theta > 0.0 && self.theta < 1.0) {
            return Err(ConfigError::Theta(self.theta));
        }
        if self.p_min > self.p_max {
            return Err(ConfigError::ParamWindow {
                p_min: self.p_min,
                p_max: self.p_max,
            });
        }
        if self.n_inversion % 2 != 0 {
            return Err(ConfigError::OddInversion(self.n_inversion));
        }
        if self.nev == 0 {
            return Err(ConfigError::Nev);
        }
        Ok(())
    }
}

/// Output of a finished run.
#[derive(Debug, Clone)]
pub struct ContinuationResult<V> {
    pub branch: BranchRecord<V>,
    pub last: BorderedPair<V>,
    pub tangent: BorderedPair<V>,
    pub stop: StopReason,
}

/// Newton view of the arclength-extended system; updates route through the
/// bordered solver with the previous tangent as the constraint border.
pub(crate) struct PalcSystem<'b, P: BifProblem, B> {
    pub problem: &'b mut P,
    pub bls: &'b mut B,
    pub dot: &'b ThetaDot<P::Vector>,
    pub z_ref: &'b BorderedPair<P::Vector>,
    pub tau: &'b BorderedPair<P::Vector>,
    pub ds: f64,
    pub theta: f64,
    pub xi_u: f64,
    pub xi_p: f64,
    pub eps: f64,
}

impl<'b, P, B> NewtonSystem for PalcSystem<'b, P, B>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
{
    type Vector = BorderedPair<P::Vector>;

    fn residual(&mut self, z: &Self::Vector) -> Result<Self::Vector> {
        let f = self.problem.residual(&z.u, z.p)?;
        let diff = z.minus(self.z_ref);
        let constraint = self.dot.dot(&diff, self.tau, self.theta) - self.ds;
        Ok(BorderedPair::new(f, constraint))
    }

    fn newton_step(&mut self, z: &Self::Vector, fz: &Self::Vector) -> Result<Self::Vector> {
        let op = self.problem.jacobian(&z.u, z.p)?;
        let dfdp = self.problem.dfdp(&z.u, z.p, self.eps)?;
        self.bls.solve_bordered(
            &op,
            &dfdp,
            &self.tau.u,
            self.tau.p,
            self.xi_u,
            self.xi_p,
            fz,
        )
    }
}

/// One corrector solve of the extended system from `z_pred`, anchored at
/// `z_ref` with tangent `tau`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn palc_correct<P, B>(
    problem: &mut P,
    bls: &mut B,
    dot: &ThetaDot<P::Vector>,
    newton_settings: &NewtonSettings,
    z_ref: &BorderedPair<P::Vector>,
    tau: &BorderedPair<P::Vector>,
    ds: f64,
    theta: f64,
    eps: f64,
    z_pred: BorderedPair<P::Vector>,
) -> Result<NewtonOutcome<BorderedPair<P::Vector>>>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
{
    let n = z_ref.u.length().max(1) as f64;
    let mut sys = PalcSystem {
        problem,
        bls,
        dot,
        z_ref,
        tau,
        ds,
        theta,
        xi_u: theta / n,
        xi_p: 1.0 - theta,
        eps,
    };
    newton(&mut sys, z_pred, newton_settings)
}

/// Spectrum with automatic growth of `nev` until at least one stable mode
/// is visible (or the full dimension is requested).
pub(crate) fn spectrum_with<P, E>(
    problem: &mut P,
    eig: &mut E,
    nev0: usize,
    precision: f64,
    u: &P::Vector,
    p: f64,
) -> Result<EigenDecomposition>
where
    P: BifProblem,
    E: EigenSolver<P::Operator>,
{
    let dim = u.length().max(1);
    let mut nev = nev0.max(1).min(dim);
    loop {
        let dec = problem.spectrum(eig, u, p, nev)?;
        let all_unstable =
            !dec.values.is_empty() && dec.values.iter().all(|v| v.re > precision);
        if !all_unstable || nev >= dim || dec.values.len() < nev {
            return Ok(dec);
        }
        nev = (2 * nev).min(dim);
    }
}

/// Tangent from the bordered solve with right-hand side `(0, 1)`, oriented
/// along the previous tangent and normalized in the theta norm.
pub(crate) fn bordered_tangent<P, B>(
    problem: &mut P,
    bls: &mut B,
    dot: &ThetaDot<P::Vector>,
    z: &BorderedPair<P::Vector>,
    tau_prev: &BorderedPair<P::Vector>,
    theta: f64,
    eps: f64,
) -> Result<BorderedPair<P::Vector>>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
{
    let n = z.u.length().max(1) as f64;
    let op = problem.jacobian(&z.u, z.p)?;
    let dfdp = problem.dfdp(&z.u, z.p, eps)?;
    let rhs = BorderedPair::new(z.u.zero_like(), 1.0);
    let mut t = bls.solve_bordered(
        &op,
        &dfdp,
        &tau_prev.u,
        tau_prev.p,
        theta / n,
        1.0 - theta,
        &rhs,
    )?;
    if dot.dot(&t, tau_prev, theta) < 0.0 {
        t.scale_mut(-1.0);
    }
    let norm = dot.norm(&t, theta);
    if norm == 0.0 || !norm.is_finite() {
        return Err(anyhow!("bordered tangent is degenerate"));
    }
    t.scale_mut(1.0 / norm);
    Ok(t)
}

/// Parabola through three `(s, p)` samples: its stationary point, as
/// `(s*, p(s*))`. Used to place fold guesses between mesh points.
fn quadratic_turning_point(pts: &[(f64, f64); 3]) -> Option<(f64, f64)> {
    let [(s1, p1), (s2, p2), (s3, p3)] = *pts;
    let denom = p1 * (s2 - s3) + p2 * (s3 - s1) + p3 * (s1 - s2);
    if denom.abs() < 1e-300 {
        return None;
    }
    let s_star = (p1 * (s2 * s2 - s3 * s3)
        + p2 * (s3 * s3 - s1 * s1)
        + p3 * (s1 * s1 - s2 * s2))
        / (2.0 * denom);
    let l1 = ((s_star - s2) * (s_star - s3)) / ((s1 - s2) * (s1 - s3));
    let l2 = ((s_star - s1) * (s_star - s3)) / ((s2 - s1) * (s2 - s3));
    let l3 = ((s_star - s1) * (s_star - s2)) / ((s3 - s1) * (s3 - s2));
    Some((s_star, p1 * l1 + p2 * l2 + p3 * l3))
}

/// The continuation runner. Drives predictor, corrector and bookkeeping;
/// yields one [`StepSummary`] per confirmed point through the [`Iterator`]
/// impl, or runs to completion via [`Continuer::run`].
pub struct Continuer<'a, P, B, E>
where
    P: BifProblem,
{
    problem: &'a mut P,
    bls: B,
    eig: E,
    settings: ContinuationSettings,
    predictor: Predictor,
    dot: ThetaDot<P::Vector>,
    flavor: BifFlavor,
    pub verbosity: usize,
    state: IterState<P::Vector>,
    branch: BranchRecord<P::Vector>,
    arclength: f64,
    p_history: Vec<(f64, f64)>,
    print_solution: Box<dyn Fn(&P::Vector, f64) -> f64 + 'a>,
    finalise: Option<Box<dyn FnMut(&IterState<P::Vector>) -> bool + 'a>>,
    newton_callback:
        Option<Box<dyn FnMut(&BorderedPair<P::Vector>, f64, usize) -> bool + 'a>>,
    plot: Option<Box<dyn FnMut(&P::Vector, f64) + 'a>>,
    done: bool,
}

impl<'a, P, B, E> Continuer<'a, P, B, E>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
    E: EigenSolver<P::Operator>,
{
    /// Validate the configuration, converge the initial guess at `p0` and at
    /// `p0 + ds/50`, and build the starting secant tangent.
    pub fn new(
        problem: &'a mut P,
        x0: P::Vector,
        p0: f64,
        settings: ContinuationSettings,
        predictor: Predictor,
        bls: B,
        eig: E,
    ) -> Result<Self> {
        settings.validate()?;
        let mut bls = bls;
        let mut eig = eig;
        let flavor = problem.flavor();
        let dot = ThetaDot::standard();

        let out0 = solve_equilibrium(problem, &mut bls, x0, p0, &settings.newton)?;
        if !out0.converged {
            return Err(anyhow!("failed to converge initial guess"));
        }
        let p1 = p0 + settings.ds / 50.0;
        let out1 = solve_equilibrium(problem, &mut bls, out0.x.clone(), p1, &settings.newton)?;
        if !out1.converged {
            return Err(anyhow!("failed to converge initial guess"));
        }

        let z0 = BorderedPair::new(out0.x, p0);
        let z1 = BorderedPair::new(out1.x, p1);
        let tau = secant_tangent(&z1, &z0, settings.ds, settings.theta, &dot)
            .ok_or_else(|| anyhow!("initial tangent is degenerate"))?;

        let mut state = IterState {
            z_pred: z0.clone(),
            z_old: z0,
            tau_old: tau,
            converged: true,
            newton_iterations: out0.iterations,
            step: 0,
            ds: settings.ds,
            theta: settings.theta,
            stop: None,
            stepsizecontrol: true,
            n_unstable: (-1, -1),
            n_imag: (-1, -1),
            eigvals: None,
            eigvecs: None,
        };

        let mut branch = BranchRecord::default();

        // Spectrum at the starting point: always computed on step 0 when
        // eigenvalues are wanted at all.
        if settings.compute_eigenvalues || settings.detect_bifurcation > 0 {
            match spectrum_with(
                problem,
                &mut eig,
                settings.nev,
                settings.precision_stability,
                &state.z_old.u,
                state.z_old.p,
            ) {
                Ok(dec) => {
                    let (nu, ni) = count_unstable(&dec.values, settings.precision_stability);
                    state.n_unstable = (nu, nu);
                    state.n_imag = (ni, ni);
                    branch.eigen.push(EigenSnapshot {
                        step: 0,
                        values: dec.values.clone(),
                        vectors: if settings.save_eigenvectors {
                            dec.vectors.clone()
                        } else {
                            None
                        },
                        converged: true,
                    });
                    state.eigvals = Some(dec.values);
                    state.eigvecs = dec.vectors;
                }
                Err(err) => {
                    warn!("eigensolver failed at step 0: {err}");
                    branch.eigen.push(EigenSnapshot {
                        step: 0,
                        values: Vec::new(),
                        vectors: None,
                        converged: false,
                    });
                }
            }
        }

        let mut runner = Self {
            problem,
            bls,
            eig,
            settings,
            predictor,
            dot,
            flavor,
            verbosity: 0,
            state,
            branch,
            arclength: 0.0,
            p_history: Vec::with_capacity(3),
            print_solution: Box::new(|u: &P::Vector, _| u.norm_inf()),
            finalise: None,
            newton_callback: None,
            plot: None,
            done: false,
        };
        runner.p_history.push((0.0, p0));
        let ds0 = runner.settings.ds;
        runner.record_row(out0.iterations, ds0);
        Ok(runner)
    }

    pub fn with_print_solution(
        mut self,
        f: impl Fn(&P::Vector, f64) -> f64 + 'a,
    ) -> Self {
        self.print_solution = Box::new(f);
        self
    }

    pub fn with_finalise(
        mut self,
        f: impl FnMut(&IterState<P::Vector>) -> bool + 'a,
    ) -> Self {
        self.finalise = Some(Box::new(f));
        self
    }

    pub fn with_plot(mut self, f: impl FnMut(&P::Vector, f64) + 'a) -> Self {
        self.plot = Some(Box::new(f));
        self
    }

    /// Observe every corrector iteration as `(z, residual_norm, iteration)`;
    /// returning `false` cancels the run cleanly.
    pub fn with_newton_callback(
        mut self,
        f: impl FnMut(&BorderedPair<P::Vector>, f64, usize) -> bool + 'a,
    ) -> Self {
        self.newton_callback = Some(Box::new(f));
        self
    }

    pub fn with_verbosity(mut self, verbosity: usize) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Replace the state part of the arclength metric with a custom dot
    /// product (the parameter part keeps its `1 - theta` weight).
    pub fn with_theta_dot(mut self, dot: ThetaDot<P::Vector>) -> Self {
        self.dot = dot;
        self
    }

    pub fn state(&self) -> &IterState<P::Vector> {
        &self.state
    }

    pub fn branch(&self) -> &BranchRecord<P::Vector> {
        &self.branch
    }

    pub fn settings(&self) -> &ContinuationSettings {
        &self.settings
    }

    fn finish(&mut self, reason: StopReason) {
        self.state.stop = Some(reason);
        self.branch.stop = Some(reason);
        self.done = true;
        if self.verbosity >= 1 {
            info!("continuation stopped: {reason:?}");
        }
    }

    /// Halve `ds` for a retry; returns false once `dsmin` is exhausted.
    fn shrink_step(&mut self) -> bool {
        let ds = self.state.ds;
        if ds.abs() <= self.settings.dsmin {
            warn!("corrector failed with |ds| already at dsmin");
            self.finish(StopReason::StepFailed);
            return false;
        }
        self.state.ds = ds.signum() * (ds.abs() / 2.0).max(self.settings.dsmin);
        if self.verbosity >= 1 {
            warn!("corrector failed, retrying with ds = {:.3e}", self.state.ds);
        }
        true
    }

    fn record_row(&mut self, newton_iterations: usize, ds_used: f64) {
        let z = &self.state.z_old;
        let printsol = (self.print_solution)(&z.u, z.p);
        self.branch.rows.push(BranchRow {
            step: self.state.step,
            p: z.p,
            printsol,
            newton_iterations,
            ds: ds_used,
            theta: self.state.theta,
            n_unstable: self.state.n_unstable.0,
            n_imag: self.state.n_imag.0,
            stable: self.state.n_unstable.0 == 0,
        });
    }

    /// Attempt (and retry) one continuation step; `None` once the run has
    /// stopped, with the reason recorded on the branch.
    pub fn next_step(&mut self) -> Option<Result<StepSummary>> {
        if self.done {
            return None;
        }
        if self.state.step >= self.settings.max_steps {
            self.finish(StopReason::MaxSteps);
            return None;
        }

        loop {
            let ds = self.state.ds;
            let z_pred = self
                .predictor
                .predict(&self.state.z_old, &self.state.tau_old, ds);
            self.state.z_pred = z_pred.clone();

            let mut aborted = false;
            let corrected = match (self.predictor, self.newton_callback.as_mut()) {
                (Predictor::Natural, _) => {
                    let p = z_pred.p;
                    solve_equilibrium(
                        &mut *self.problem,
                        &mut self.bls,
                        z_pred.u,
                        p,
                        &self.settings.newton,
                    )
                    .map(|out| NewtonOutcome {
                        x: BorderedPair::new(out.x, p),
                        residuals: out.residuals,
                        converged: out.converged,
                        iterations: out.iterations,
                    })
                }
                (_, None) => palc_correct(
                    &mut *self.problem,
                    &mut self.bls,
                    &self.dot,
                    &self.settings.newton,
                    &self.state.z_old,
                    &self.state.tau_old,
                    ds,
                    self.state.theta,
                    self.settings.fin_diff_eps,
                    z_pred,
                ),
                (_, Some(cb)) => {
                    let theta = self.state.theta;
                    let n = self.state.z_old.u.length().max(1) as f64;
                    let mut sys = PalcSystem {
                        problem: &mut *self.problem,
                        bls: &mut self.bls,
                        dot: &self.dot,
                        z_ref: &self.state.z_old,
                        tau: &self.state.tau_old,
                        ds,
                        theta,
                        xi_u: theta / n,
                        xi_p: 1.0 - theta,
                        eps: self.settings.fin_diff_eps,
                    };
                    newton_with_callback(
                        &mut sys,
                        z_pred,
                        &self.settings.newton,
                        |z, res, it| {
                            let keep = cb(z, res, it);
                            if !keep {
                                aborted = true;
                            }
                            keep
                        },
                    )
                }
            };

            if aborted {
                self.finish(StopReason::UserAbort);
                return None;
            }

            let out = match corrected {
                Ok(out) if out.converged => out,
                Ok(_) => {
                    if !self.shrink_step() {
                        return None;
                    }
                    continue;
                }
                Err(err) if is_recoverable(&err) => {
                    if !self.shrink_step() {
                        return None;
                    }
                    continue;
                }
                Err(err) => {
                    self.done = true;
                    self.branch.stop = Some(StopReason::StepFailed);
                    return Some(Err(err));
                }
            };

            return Some(self.accept(out, ds));
        }
    }

    /// Bookkeeping for a confirmed point: tangent update, spectrum, fold and
    /// bifurcation detection, step control, record keeping, halt checks.
    fn accept(
        &mut self,
        out: NewtonOutcome<BorderedPair<P::Vector>>,
        ds_used: f64,
    ) -> Result<StepSummary> {
        let z_new = out.x;
        self.state.converged = true;
        self.state.newton_iterations = out.iterations;
        self.state.step += 1;
        let step = self.state.step;

        let z_prev = self.state.z_old.clone();
        let tau_prev = self.state.tau_old.clone();

        // Tangent update, per the predictor's rule.
        let new_tau = match self.predictor {
            Predictor::Natural => Some(z_new.minus(&z_prev)),
            Predictor::Secant => {
                secant_tangent(&z_new, &z_prev, ds_used, self.state.theta, &self.dot)
            }
            Predictor::Bordered => match bordered_tangent(
                &mut *self.problem,
                &mut self.bls,
                &self.dot,
                &z_new,
                &tau_prev,
                self.state.theta,
                self.settings.fin_diff_eps,
            ) {
                Ok(t) => Some(t),
                Err(err) if is_recoverable(&err) => {
                    warn!("bordered tangent failed ({err}), falling back to secant");
                    secant_tangent(&z_new, &z_prev, ds_used, self.state.theta, &self.dot)
                }
                Err(err) => return Err(err),
            },
        };
        let angle_cos = match self.predictor {
            Predictor::Natural => None,
            _ => new_tau
                .as_ref()
                .map(|t| self.dot.dot(t, &tau_prev, self.state.theta)),
        };
        if let Some(t) = new_tau {
            self.state.tau_old = t;
        }
        self.state.z_old = z_new;

        self.arclength += ds_used.abs();
        self.p_history.push((self.arclength, self.state.z_old.p));
        if self.p_history.len() > 3 {
            self.p_history.remove(0);
        }

        // Spectrum refresh and stability counters.
        self.state.n_unstable.1 = self.state.n_unstable.0;
        self.state.n_imag.1 = self.state.n_imag.0;
        let detect = self.settings.detect_bifurcation > 0;
        if self.settings.compute_eigenvalues || detect {
            let snapshot_due = step % self.settings.save_eig_every.max(1) == 0;
            let spectrum = spectrum_with(
                &mut *self.problem,
                &mut self.eig,
                self.settings.nev,
                self.settings.precision_stability,
                &self.state.z_old.u,
                self.state.z_old.p,
            );
            match spectrum {
                Ok(dec) => {
                    let (nu, ni) =
                        count_unstable(&dec.values, self.settings.precision_stability);
                    self.state.n_unstable.0 = nu;
                    self.state.n_imag.0 = ni;
                    if snapshot_due {
                        self.branch.eigen.push(EigenSnapshot {
                            step,
                            values: dec.values.clone(),
                            vectors: if self.settings.save_eigenvectors {
                                dec.vectors.clone()
                            } else {
                                None
                            },
                            converged: true,
                        });
                    }
                    self.state.eigvals = Some(dec.values);
                    self.state.eigvecs = dec.vectors;
                }
                Err(err) => {
                    warn!("eigensolver failed at step {step}: {err}");
                    self.state.n_unstable.0 = -1;
                    self.state.n_imag.0 = -1;
                    self.state.eigvals = None;
                    self.state.eigvecs = None;
                    if snapshot_due {
                        self.branch.eigen.push(EigenSnapshot {
                            step,
                            values: Vec::new(),
                            vectors: None,
                            converged: false,
                        });
                    }
                }
            }
        }

        // Fold detection: parameter non-monotone across the last three
        // confirmed points flags the middle one.
        let mut fold_here = false;
        if self.settings.detect_fold && self.p_history.len() == 3 {
            let pts = [self.p_history[0], self.p_history[1], self.p_history[2]];
            if (pts[1].1 - pts[0].1) * (pts[2].1 - pts[1].1) < 0.0 {
                fold_here = true;
                let param = quadratic_turning_point(&pts)
                    .map(|(_, p)| p)
                    .unwrap_or(pts[1].1);
                let kind = match self.flavor {
                    BifFlavor::Equilibrium => BifKind::Fold,
                    BifFlavor::PeriodicOrbit => BifKind::CycleFold,
                };
                if self.verbosity >= 1 {
                    info!("{kind:?} detected near p = {param:.6} (step {})", step - 1);
                }
                let printsol = (self.print_solution)(&z_prev.u, z_prev.p);
                self.branch.foldpoints.push(BifPoint {
                    kind,
                    idx: self.branch.rows.len().saturating_sub(1),
                    param,
                    norm: z_prev.u.norm_inf(),
                    printsol,
                    u: z_prev.u.clone(),
                    tau: tau_prev.clone(),
                    ind_bif: 0,
                    step: step - 1,
                    status: BifStatus::Guess,
                    delta: (0, 0),
                });
            }
        }

        // Bifurcation detection from the change in unstable-mode counts.
        if detect {
            let (nu, nu_prev) = self.state.n_unstable;
            let (ni, ni_prev) = self.state.n_imag;
            let skip_as_fold = fold_here && (nu - nu_prev).abs() == 1;
            if nu >= 0 && nu_prev >= 0 && nu != nu_prev && !skip_as_fold {
                let delta = (nu - nu_prev, ni - ni_prev);
                let values = self.state.eigvals.clone().unwrap_or_default();
                let ind_bif = crossing_index(&values, self.settings.precision_stability);
                let kind = match self.flavor {
                    BifFlavor::Equilibrium => classify_equilibrium(delta.0, delta.1),
                    BifFlavor::PeriodicOrbit => {
                        let crossing = values
                            .get(ind_bif)
                            .copied()
                            .unwrap_or_else(|| num_complex::Complex::new(0.0, 0.0));
                        classify_cycle(delta.0, crossing)
                    }
                };
                let printsol =
                    (self.print_solution)(&self.state.z_old.u, self.state.z_old.p);
                let mut point = BifPoint {
                    kind,
                    idx: self.branch.rows.len(),
                    param: self.state.z_old.p,
                    norm: self.state.z_old.u.norm_inf(),
                    printsol,
                    u: self.state.z_old.u.clone(),
                    tau: self.state.tau_old.clone(),
                    ind_bif,
                    step,
                    status: BifStatus::Guess,
                    delta,
                };
                if self.settings.detect_bifurcation >= 2 {
                    match self.bisect_locate(&z_prev, &tau_prev, nu_prev, ds_used, &mut point)
                    {
                        Ok(()) => {}
                        Err(err) => {
                            warn!("bisection failed: {err}");
                            point.status = BifStatus::NotConverged;
                        }
                    }
                }
                if self.verbosity >= 1 {
                    info!(
                        "{:?} detected near p = {:.6} ({:?}, delta = {:?})",
                        point.kind, point.param, point.status, point.delta
                    );
                }
                self.branch.bifpoints.push(point);
            }
        }

        // Step-size and angle control for the next step.
        if self.state.stepsizecontrol {
            let nmax = self.settings.newton.max_iterations.max(1) as f64;
            let frac = (nmax - out.iterations as f64) / nmax;
            let mut grow = 1.0 + self.settings.aggressiveness * frac * frac;
            if let Some(cos) = angle_cos {
                grow *= cos.abs().min(1.0).powf(self.settings.tangent_exponent);
            }
            let new_ds = self.state.ds * grow;
            self.state.ds = new_ds.signum()
                * new_ds
                    .abs()
                    .clamp(self.settings.dsmin, self.settings.dsmax);
        }

        // Arclength scaling: retune theta when the tangent is dominated by
        // its parameter component.
        if self.settings.do_arclength_scaling {
            let tp = self.state.tau_old.p.abs();
            if tp * self.state.theta > self.settings.g_max && tp < 1.0 {
                let g = self.settings.g_goal;
                let theta_new = (g / tp) * ((1.0 - g * g) / (1.0 - tp * tp)).sqrt();
                if theta_new.is_finite() {
                    self.state.theta =
                        theta_new.max(self.settings.theta_min).min(0.999);
                    let norm = self.dot.norm(&self.state.tau_old, self.state.theta);
                    if norm > 0.0 && norm.is_finite() {
                        self.state.tau_old.scale_mut(1.0 / norm);
                    }
                }
            }
        }

        self.record_row(out.iterations, ds_used);
        if self.settings.save_sol_every > 0 && step % self.settings.save_sol_every == 0 {
            self.branch.solutions.push(SavedSolution {
                step,
                u: self.state.z_old.u.clone(),
                p: self.state.z_old.p,
            });
        }
        if self.settings.plot_every > 0 && step % self.settings.plot_every == 0 {
            if let Some(plot) = &mut self.plot {
                plot(&self.state.z_old.u, self.state.z_old.p);
            }
        }
        if self.verbosity >= 1 {
            info!(
                "step {step}: p = {:.6}, newton its = {}, ds = {:.3e}, n_unstable = {}",
                self.state.z_old.p, out.iterations, ds_used, self.state.n_unstable.0
            );
        }

        let summary = StepSummary {
            step,
            param: self.state.z_old.p,
            printsol: (self.print_solution)(&self.state.z_old.u, self.state.z_old.p),
            newton_iterations: out.iterations,
            ds: ds_used,
            n_unstable: self.state.n_unstable.0,
            stable: self.state.n_unstable.0 == 0,
            bifurcations_found: self.branch.bifpoints.len(),
        };

        // Halt checks, in order: parameter window, user hook, step budget.
        let p = self.state.z_old.p;
        if p < self.settings.p_min || p > self.settings.p_max {
            self.finish(StopReason::BoundaryReached);
        } else {
            let abort = match &mut self.finalise {
                Some(f) => !f(&self.state),
                None => false,
            };
            if abort {
                self.finish(StopReason::UserAbort);
            } else if self.state.step >= self.settings.max_steps {
                self.finish(StopReason::MaxSteps);
            }
        }

        Ok(summary)
    }

    /// Run to completion, returning the branch record, the last confirmed
    /// solution and its tangent.
    pub fn run(mut self) -> Result<ContinuationResult<P::Vector>> {
        while let Some(step) = self.next_step() {
            step?;
        }
        let stop = self.state.stop.unwrap_or(StopReason::MaxSteps);
        Ok(ContinuationResult {
            branch: self.branch,
            last: self.state.z_old,
            tangent: self.state.tau_old,
            stop,
        })
    }
}

impl<'a, P, B, E> Iterator for Continuer<'a, P, B, E>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
    E: EigenSolver<P::Operator>,
{
    type Item = Result<StepSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_step()
    }
}

/// Convenience entry point: build a [`Continuer`] and run it to completion.
pub fn continuation<'a, P, B, E>(
    problem: &'a mut P,
    x0: P::Vector,
    p0: f64,
    settings: ContinuationSettings,
    predictor: Predictor,
    bls: B,
    eig: E,
) -> Result<ContinuationResult<P::Vector>>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
    E: EigenSolver<P::Operator>,
{
    Continuer::new(problem, x0, p0, settings, predictor, bls, eig)?.run()
}
