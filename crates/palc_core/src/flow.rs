//! Fixed-step time integration used by the shooting functionals.

use nalgebra::DVector;

/// One explicit step of an autonomous field. The field closure owns the
/// parameter value; steppers never see it.
pub trait TimeStepper {
    fn step(
        &mut self,
        field: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>,
        x: &mut DVector<f64>,
        dt: f64,
    );
}

/// Classic fourth-order Runge-Kutta.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rk4;

impl TimeStepper for Rk4 {
    fn step(
        &mut self,
        field: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>,
        x: &mut DVector<f64>,
        dt: f64,
    ) {
        // k1 = f(y)
        let k1 = field(x);
        // k2 = f(y + dt*k1/2)
        let k2 = field(&(&*x + &k1 * (dt * 0.5)));
        // k3 = f(y + dt*k2/2)
        let k3 = field(&(&*x + &k2 * (dt * 0.5)));
        // k4 = f(y + dt*k3)
        let k4 = field(&(&*x + &k3 * dt));

        *x += (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (dt / 6.0);
    }
}

/// Flow map `phi^t` built from a stepper with a bounded internal step.
#[derive(Debug, Clone, Copy)]
pub struct FlowMap<S> {
    pub stepper: S,
    pub dt_max: f64,
}

impl<S: TimeStepper> FlowMap<S> {
    pub fn new(stepper: S, dt_max: f64) -> Self {
        Self { stepper, dt_max }
    }

    /// Evolve `x0` for time `t` (possibly negative) in uniform substeps.
    pub fn evolve(
        &mut self,
        field: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>,
        x0: &DVector<f64>,
        t: f64,
    ) -> DVector<f64> {
        let mut x = x0.clone();
        if t == 0.0 {
            return x;
        }
        let n_steps = (t.abs() / self.dt_max).ceil().max(1.0) as usize;
        let dt = t / n_steps as f64;
        for _ in 0..n_steps {
            self.stepper.step(field, &mut x, dt);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_rk4_harmonic_oscillator_period() {
        // (x, y)' = (-y, x): solution rotates with period 2 pi.
        let mut flow = FlowMap::new(Rk4, 0.01);
        let mut field = |u: &DVector<f64>| DVector::from_vec(vec![-u[1], u[0]]);
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        let x = flow.evolve(&mut field, &x0, 2.0 * PI);
        assert!((x[0] - 1.0).abs() < 1e-7, "x(T) = {}", x[0]);
        assert!(x[1].abs() < 1e-7, "y(T) = {}", x[1]);
    }

    #[test]
    fn test_negative_time_inverts_the_flow() {
        let mut flow = FlowMap::new(Rk4, 0.01);
        let mut field = |u: &DVector<f64>| DVector::from_vec(vec![u[0]]);
        let x0 = DVector::from_vec(vec![2.0]);
        let fwd = flow.evolve(&mut field, &x0, 1.0);
        let back = flow.evolve(&mut field, &fwd, -1.0);
        assert!((back[0] - 2.0).abs() < 1e-9);
    }
}
