use thiserror::Error;

/// Violations of the `ContinuationSettings` invariants, raised at validation
/// time before any stepping happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("step bounds must satisfy 0 < dsmin <= dsmax, got dsmin={dsmin}, dsmax={dsmax}")]
    StepBounds { dsmin: f64, dsmax: f64 },
    #[error("initial step |ds|={ds} lies outside [{dsmin}, {dsmax}]")]
    InitialStep { ds: f64, dsmin: f64, dsmax: f64 },
    #[error("theta must lie strictly inside (0, 1), got {0}")]
    Theta(f64),
    #[error("parameter window requires p_min <= p_max, got [{p_min}, {p_max}]")]
    ParamWindow { p_min: f64, p_max: f64 },
    #[error("n_inversion must be even, got {0}")]
    OddInversion(usize),
    #[error("nev must be at least 1")]
    Nev,
}

/// Failures of a linear sub-solve. These are the recoverable kinds: the
/// continuation step loop reacts to them by halving the arclength step and
/// retrying, escalating only once `dsmin` is reached.
#[derive(Debug, Error)]
pub enum SolveFailure {
    #[error("bordering denominator {0:.3e} below threshold")]
    BorderingSingular(f64),
    #[error("linear system is singular")]
    Singular,
    #[error("iterative linear solve stalled after {0} iterations")]
    NotConverged(usize),
}

/// True when `err` is a solver breakdown the step loop may retry with a
/// shorter step, as opposed to a failure of the user's own callbacks.
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SolveFailure>().is_some()
}
