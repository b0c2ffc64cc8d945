//! Predictor strategies for the continuation step.

use crate::algebra::{BorderedPair, ThetaDot, VectorOps};
use serde::{Deserialize, Serialize};

/// How the next point on the branch is guessed from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predictor {
    /// Step the parameter only; the corrector solves at fixed `p`. Cannot
    /// traverse folds but needs no tangent information.
    Natural,
    /// Step along the previous secant tangent.
    Secant,
    /// Step along the null direction of the augmented Jacobian, computed
    /// through the bordered solver.
    Bordered,
}

impl Predictor {
    pub fn predict<V: VectorOps>(
        &self,
        z_old: &BorderedPair<V>,
        tau_old: &BorderedPair<V>,
        ds: f64,
    ) -> BorderedPair<V> {
        match self {
            Predictor::Natural => BorderedPair::new(z_old.u.clone(), z_old.p + ds),
            Predictor::Secant | Predictor::Bordered => z_old.plus_scaled(ds, tau_old),
        }
    }
}

/// Secant tangent through two confirmed points, normalized to unit theta
/// norm. The `sign(ds)` factor keeps the tangent pointing in the canonical
/// direction of travel so `z + ds * tau` always advances.
pub fn secant_tangent<V: VectorOps>(
    z_new: &BorderedPair<V>,
    z_old: &BorderedPair<V>,
    ds: f64,
    theta: f64,
    dot: &ThetaDot<V>,
) -> Option<BorderedPair<V>> {
    let mut tau = z_new.minus(z_old);
    let norm = dot.norm(&tau, theta);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    tau.scale_mut(ds.signum() / norm);
    Some(tau)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::norm_theta;
    use nalgebra::DVector;

    fn pair(u: &[f64], p: f64) -> BorderedPair<DVector<f64>> {
        BorderedPair::new(DVector::from_vec(u.to_vec()), p)
    }

    #[test]
    fn test_natural_prediction_moves_parameter_only() {
        let z = pair(&[1.0, 2.0], 0.5);
        let tau = pair(&[1.0, 0.0], 1.0);
        let zp = Predictor::Natural.predict(&z, &tau, 0.1);
        assert_eq!(zp.u[0], 1.0);
        assert_eq!(zp.u[1], 2.0);
        assert!((zp.p - 0.6).abs() < 1e-14);
    }

    #[test]
    fn test_secant_tangent_is_unit_and_forward() {
        let theta = 0.5;
        let dot = ThetaDot::standard();
        let z_old = pair(&[0.0], 0.0);
        let z_new = pair(&[0.3], -0.1);

        // Backward continuation: ds < 0, yet prediction must advance.
        let ds = -0.05;
        let tau = secant_tangent(&z_new, &z_old, ds, theta, &dot).expect("tangent");
        assert!((norm_theta(&tau, theta) - 1.0).abs() < 1e-12);

        let zp = Predictor::Secant.predict(&z_new, &tau, ds);
        // ds * tau points from z_old through z_new, further along the branch.
        assert!(zp.u[0] > z_new.u[0]);
        assert!(zp.p < z_new.p);
    }
}
