pub mod algebra;
pub mod bordered;
pub mod continuation;
pub mod error;
pub mod flow;
pub mod fold;
pub mod hopf;
pub mod linear;
pub mod newton;
pub mod periodic;
pub mod predictor;
pub mod problem;
pub mod stability;
/// The `palc_core` crate is a pseudo-arclength continuation engine for
/// parameter-dependent nonlinear systems `F(x, p) = 0`, polymorphic over the
/// user's vector type, linear solver and eigensolver.
///
/// Key components:
/// - **Algebra**: the `VectorOps` seam and the `(u, p)` `BorderedPair` the
///   engine traverses branches with.
/// - **Bordered solvers**: bordering, full-matrix and matrix-free solutions
///   of the arclength-augmented linear system.
/// - **Continuation**: the predictor/corrector state machine with stability
///   bookkeeping, fold detection and bisection-based bifurcation location.
/// - **Extended systems**: fold and Hopf defining systems with their Newton
///   refiners and two-parameter curve continuations.
/// - **Periodic orbits**: trapezoidal, standard-shooting and
///   Poincaré-shooting functionals with Floquet analysis.
pub use continuation::{continuation, ContinuationResult, ContinuationSettings, Continuer};
pub use newton::{newton, newton_deflated, DeflationOperator, NewtonSettings};
pub use predictor::Predictor;
