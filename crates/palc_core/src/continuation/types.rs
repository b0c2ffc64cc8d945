//! Record types produced by a continuation run.

use crate::algebra::BorderedPair;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Classification of special points detected along a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifKind {
    None,
    /// Parameter turning point; a real eigenvalue crosses zero.
    Fold,
    /// Complex conjugate pair crosses the imaginary axis.
    Hopf,
    /// Single real eigenvalue crossing without a parameter turn.
    BranchPoint,
    /// Floquet pair leaves the unit circle away from the real axis.
    NeimarkSacker,
    /// Real Floquet multiplier crosses -1.
    PeriodDoubling,
    /// Real Floquet multiplier crosses +1.
    CycleFold,
    /// Spectral change the counters cannot attribute.
    Undetermined,
}

/// Lifecycle of a detected point: every detection starts as a guess and is
/// promoted (or demoted) by the bisection locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifStatus {
    Guess,
    Converged,
    NotConverged,
}

/// A detected bifurcation or fold point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BifPoint<V> {
    pub kind: BifKind,
    /// Index of the branch row this point was detected at.
    pub idx: usize,
    pub param: f64,
    pub norm: f64,
    pub printsol: f64,
    pub u: V,
    pub tau: BorderedPair<V>,
    /// Index of the crossing eigenvalue in the snapshot at detection.
    pub ind_bif: usize,
    pub step: usize,
    pub status: BifStatus,
    /// `(delta n_unstable, delta n_imag)` across the detection interval.
    pub delta: (isize, isize),
}

/// One confirmed continuation step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BranchRow {
    pub step: usize,
    pub p: f64,
    pub printsol: f64,
    pub newton_iterations: usize,
    /// The arclength increment used to reach this point.
    pub ds: f64,
    pub theta: f64,
    pub n_unstable: isize,
    pub n_imag: isize,
    pub stable: bool,
}

/// Spectrum computed at a given step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenSnapshot {
    pub step: usize,
    pub values: Vec<Complex<f64>>,
    pub vectors: Option<Vec<Vec<Complex<f64>>>>,
    /// False when the eigensolver failed; stability is unknown here.
    pub converged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSolution<V> {
    pub step: usize,
    pub u: V,
    pub p: f64,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxSteps,
    /// The parameter left `[p_min, p_max]`; not an error.
    BoundaryReached,
    /// A user hook returned false.
    UserAbort,
    /// The corrector kept failing with `|ds|` already at `dsmin`.
    StepFailed,
}

/// Append-only record of a continuation run. Rows, eigen snapshots and
/// detected points are pushed strictly in step order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord<V> {
    pub rows: Vec<BranchRow>,
    pub eigen: Vec<EigenSnapshot>,
    pub bifpoints: Vec<BifPoint<V>>,
    pub foldpoints: Vec<BifPoint<V>>,
    pub solutions: Vec<SavedSolution<V>>,
    pub stop: Option<StopReason>,
}

impl<V> Default for BranchRecord<V> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            eigen: Vec::new(),
            bifpoints: Vec::new(),
            foldpoints: Vec::new(),
            solutions: Vec::new(),
            stop: None,
        }
    }
}

/// Mutable state of the running iterator. Owned exclusively by the
/// [`Continuer`](super::Continuer); snapshots are exposed read-only.
#[derive(Debug, Clone)]
pub struct IterState<V> {
    pub z_pred: BorderedPair<V>,
    pub z_old: BorderedPair<V>,
    pub tau_old: BorderedPair<V>,
    pub converged: bool,
    pub newton_iterations: usize,
    pub step: usize,
    pub ds: f64,
    pub theta: f64,
    pub stop: Option<StopReason>,
    pub stepsizecontrol: bool,
    /// `(current, previous)`; -1 encodes "unknown" after an eigen failure.
    pub n_unstable: (isize, isize),
    pub n_imag: (isize, isize),
    pub eigvals: Option<Vec<Complex<f64>>>,
    pub eigvecs: Option<Vec<Vec<Complex<f64>>>>,
}

/// Per-step progress summary yielded by the iterator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub param: f64,
    pub printsol: f64,
    pub newton_iterations: usize,
    pub ds: f64,
    pub n_unstable: isize,
    pub stable: bool,
    pub bifurcations_found: usize,
}
