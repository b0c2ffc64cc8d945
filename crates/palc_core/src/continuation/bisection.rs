//! Bisection in arclength to localize a detected bifurcation.
//!
//! Given the two confirmed points straddling a change in the unstable-mode
//! count, the locator keeps a bracket along the branch and repeatedly
//! corrects at its midpoint, halving the bracket each time. The side of the
//! bracket is decided by recounting unstable modes at the midpoint; every
//! observed crossing counts as one sign inversion.

use super::types::{BifPoint, BifStatus};
use super::{palc_correct, spectrum_with, Continuer};
use crate::algebra::{BorderedPair, VectorOps};
use crate::bordered::BorderedSolver;
use crate::error::is_recoverable;
use crate::linear::EigenSolver;
use crate::predictor::secant_tangent;
use crate::problem::BifProblem;
use crate::stability::{count_unstable, crossing_index};
use anyhow::Result;
use log::debug;
use num_complex::Complex;

impl<'a, P, B, E> Continuer<'a, P, B, E>
where
    P: BifProblem,
    B: BorderedSolver<P::Operator, Vector = P::Vector>,
    E: EigenSolver<P::Operator>,
{
    /// Refine `point` between `z_before` (with `n_before` unstable modes)
    /// and the current state, which sits `span0` further along the branch on
    /// the other side of the crossing.
    ///
    /// On success the point is promoted to `Converged` and the live state is
    /// overwritten with the refined solution; on failure the original guess
    /// is kept with status `NotConverged`. Per-step logging stays off here
    /// regardless of the runner's verbosity.
    pub(crate) fn bisect_locate(
        &mut self,
        z_before: &BorderedPair<P::Vector>,
        tau_before: &BorderedPair<P::Vector>,
        n_before: isize,
        span0: f64,
        point: &mut BifPoint<P::Vector>,
    ) -> Result<()> {
        let settings = *self.settings();
        let theta = self.state.theta;

        let mut base = z_before.clone();
        let mut tau = tau_before.clone();
        let mut span = span0;
        let mut inversions = 0usize;
        let mut refined: Option<Refined<P::Vector>> = None;

        for it in 0..settings.max_bisection_steps {
            if span.abs() < settings.dsmin_bisection || inversions >= settings.n_inversion {
                break;
            }
            let ds_b = span / 2.0;
            let z_pred = base.plus_scaled(ds_b, &tau);
            let corrected = palc_correct(
                &mut *self.problem,
                &mut self.bls,
                &self.dot,
                &settings.newton,
                &base,
                &tau,
                ds_b,
                theta,
                settings.fin_diff_eps,
                z_pred,
            );
            let out = match corrected {
                Ok(out) if out.converged => out,
                Ok(_) => {
                    span = ds_b;
                    continue;
                }
                Err(err) if is_recoverable(&err) => {
                    span = ds_b;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let z_mid = out.x;
            let spectrum = spectrum_with(
                &mut *self.problem,
                &mut self.eig,
                settings.nev,
                settings.precision_stability,
                &z_mid.u,
                z_mid.p,
            );
            let dec = match spectrum {
                Ok(dec) => dec,
                Err(_) => {
                    point.status = BifStatus::NotConverged;
                    return Ok(());
                }
            };
            let (nu, ni) = count_unstable(&dec.values, settings.precision_stability);
            let tau_mid =
                secant_tangent(&z_mid, &base, ds_b, theta, &self.dot).unwrap_or_else(|| tau.clone());

            debug!(
                "bisection it {it}: p = {:.8}, n_unstable = {nu}, span = {span:.3e}",
                z_mid.p
            );

            if nu == n_before {
                // Crossing still ahead: advance the lower end.
                base = z_mid;
                tau = tau_mid;
            } else {
                // Crossing behind the midpoint: it becomes the upper end.
                inversions += 1;
                refined = Some(Refined {
                    z: z_mid,
                    tau: tau_mid,
                    n_unstable: nu,
                    n_imag: ni,
                    values: dec.values,
                });
            }
            span = ds_b;
        }

        match refined {
            Some(r) => {
                point.param = r.z.p;
                point.norm = r.z.u.norm_inf();
                point.printsol = (self.print_solution)(&r.z.u, r.z.p);
                point.u = r.z.u.clone();
                point.tau = r.tau.clone();
                point.ind_bif = crossing_index(&r.values, settings.precision_stability);
                point.status = BifStatus::Converged;

                self.state.z_old = r.z;
                self.state.tau_old = r.tau;
                self.state.n_unstable.0 = r.n_unstable;
                self.state.n_imag.0 = r.n_imag;
                self.state.eigvals = Some(r.values);
                self.state.eigvecs = None;
            }
            None => {
                point.status = BifStatus::NotConverged;
            }
        }
        Ok(())
    }
}

struct Refined<V> {
    z: BorderedPair<V>,
    tau: BorderedPair<V>,
    n_unstable: isize,
    n_imag: isize,
    values: Vec<Complex<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bordered::BorderingBls;
    use crate::continuation::{continuation, BifKind, ContinuationSettings};
    use crate::linear::{DenseEigen, DenseLu};
    use crate::predictor::Predictor;
    use crate::problem::FnProblem;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_bisection_localizes_simple_eigenvalue_crossing() {
        // F(x, p) = (p - 1/2) x has the trivial branch x = 0 whose only
        // eigenvalue crosses zero at p = 1/2 exactly.
        let mut problem = FnProblem::new(
            |u: &DVector<f64>, p: f64| DVector::from_vec(vec![(p - 0.5) * u[0]]),
            |_u: &DVector<f64>, p: f64| DMatrix::from_row_slice(1, 1, &[p - 0.5]),
        );

        let dsmin_bisection = 1e-5;
        let settings = ContinuationSettings {
            ds: 0.05,
            dsmax: 0.05,
            p_min: -0.5,
            p_max: 1.5,
            max_steps: 80,
            detect_bifurcation: 2,
            detect_fold: false,
            dsmin_bisection,
            n_inversion: 30,
            max_bisection_steps: 60,
            ..ContinuationSettings::default()
        };
        let result = continuation(
            &mut problem,
            DVector::from_vec(vec![0.0]),
            0.0,
            settings,
            Predictor::Secant,
            BorderingBls::new(DenseLu),
            DenseEigen::default(),
        )
        .expect("continuation");

        assert_eq!(result.branch.bifpoints.len(), 1);
        let point = &result.branch.bifpoints[0];
        assert_eq!(point.kind, BifKind::BranchPoint);
        assert_eq!(point.status, BifStatus::Converged);
        assert_eq!(point.delta, (1, 0));
        assert!(
            (point.param - 0.5).abs() < 2.0 * dsmin_bisection,
            "crossing located at p = {}, error {:.2e}",
            point.param,
            (point.param - 0.5).abs()
        );
    }

    #[test]
    fn test_failed_bisection_keeps_guess() {
        // An eigensolver that starts failing right after the detection step:
        // the guess is still recorded, bisection demotes it to NotConverged.
        struct FailingEigen(usize);
        impl crate::linear::EigenSolver<DMatrix<f64>> for FailingEigen {
            fn eigen(
                &mut self,
                op: &DMatrix<f64>,
                nev: usize,
                which: crate::linear::EigenWhich,
            ) -> anyhow::Result<crate::linear::EigenDecomposition> {
                self.0 += 1;
                if self.0 > 9 {
                    anyhow::bail!("eigensolver exhausted");
                }
                DenseEigen::default().eigen(op, nev, which)
            }
        }

        let mut problem = FnProblem::new(
            |u: &DVector<f64>, p: f64| DVector::from_vec(vec![(p - 0.5) * u[0]]),
            |_u: &DVector<f64>, p: f64| DMatrix::from_row_slice(1, 1, &[p - 0.5]),
        );
        let settings = ContinuationSettings {
            ds: 0.05,
            dsmax: 0.05,
            p_min: -0.5,
            p_max: 1.5,
            max_steps: 80,
            detect_bifurcation: 2,
            detect_fold: false,
            ..ContinuationSettings::default()
        };
        let result = continuation(
            &mut problem,
            DVector::from_vec(vec![0.0]),
            0.0,
            settings,
            Predictor::Secant,
            BorderingBls::new(DenseLu),
            FailingEigen(0),
        )
        .expect("continuation");

        let point = result
            .branch
            .bifpoints
            .first()
            .expect("detection should still record a guess");
        assert_eq!(point.status, BifStatus::NotConverged);
    }
}
