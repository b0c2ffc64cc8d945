//! Vector algebra shim for the continuation engine.
//!
//! The engine never indexes into user state: everything it needs is the
//! small algebra below (`axpy`, `dot`, norms, sizing). Dense nalgebra
//! vectors implement it out of the box; GPU or sparse state only has to
//! provide these same operations.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Minimal algebra a state type must support.
///
/// `norm_inf` is the default norm used for residual checks; the weighted
/// arclength norm lives on [`BorderedPair`] instead.
pub trait VectorOps: Clone {
    /// Number of scalar components.
    fn length(&self) -> usize;

    /// A zero vector of the same shape.
    fn zero_like(&self) -> Self;

    fn dot(&self, other: &Self) -> f64;

    fn norm_inf(&self) -> f64;

    fn scale_mut(&mut self, a: f64);

    /// `self <- self + a * x`
    fn axpy(&mut self, a: f64, x: &Self);

    /// `self <- a * x + b * self`
    fn axpby(&mut self, a: f64, x: &Self, b: f64);

    /// `self - other`, out of place.
    fn minus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.axpy(-1.0, other);
        out
    }

    /// `self + a * x`, out of place.
    fn plus_scaled(&self, a: f64, x: &Self) -> Self {
        let mut out = self.clone();
        out.axpy(a, x);
        out
    }
}

impl VectorOps for f64 {
    fn length(&self) -> usize {
        1
    }

    fn zero_like(&self) -> Self {
        0.0
    }

    fn dot(&self, other: &Self) -> f64 {
        self * other
    }

    fn norm_inf(&self) -> f64 {
        self.abs()
    }

    fn scale_mut(&mut self, a: f64) {
        *self *= a;
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        *self += a * x;
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        *self = a * x + b * *self;
    }
}

impl VectorOps for DVector<f64> {
    fn length(&self) -> usize {
        self.len()
    }

    fn zero_like(&self) -> Self {
        DVector::zeros(self.len())
    }

    fn dot(&self, other: &Self) -> f64 {
        DVector::dot(self, other)
    }

    fn norm_inf(&self) -> f64 {
        if self.len() == 0 {
            0.0
        } else {
            self.amax()
        }
    }

    fn scale_mut(&mut self, a: f64) {
        *self *= a;
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        nalgebra::Matrix::axpy(self, a, x, 1.0);
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        nalgebra::Matrix::axpy(self, a, x, b);
    }
}

/// State-parameter pair `(u, p)` traversed by the continuation engine.
///
/// Deliberately a plain aggregate rather than a flat array: `u` may live
/// anywhere (dense, sparse, device memory) and is only touched through
/// [`VectorOps`]. The pair itself implements [`VectorOps`] componentwise, so
/// downstream code is agnostic between `V` and `BorderedPair<V>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorderedPair<V> {
    pub u: V,
    pub p: f64,
}

impl<V: VectorOps> BorderedPair<V> {
    pub fn new(u: V, p: f64) -> Self {
        Self { u, p }
    }
}

impl<V: VectorOps> VectorOps for BorderedPair<V> {
    fn length(&self) -> usize {
        self.u.length() + 1
    }

    fn zero_like(&self) -> Self {
        Self {
            u: self.u.zero_like(),
            p: 0.0,
        }
    }

    fn dot(&self, other: &Self) -> f64 {
        self.u.dot(&other.u) + self.p * other.p
    }

    /// Max of the component norms.
    fn norm_inf(&self) -> f64 {
        self.u.norm_inf().max(self.p.abs())
    }

    fn scale_mut(&mut self, a: f64) {
        self.u.scale_mut(a);
        self.p *= a;
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        self.u.axpy(a, &x.u);
        self.p += a * x.p;
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        self.u.axpby(a, &x.u, b);
        self.p = a * x.p + b * self.p;
    }
}

/// Weighted dot product used by the pseudo-arclength constraint.
///
/// The default state weighting `theta / len(u)` can be replaced by a custom
/// dot product (e.g. a mesh-aware inner product); the parameter part is
/// always weighted by `1 - theta`.
#[derive(Clone, Default)]
pub struct ThetaDot<V> {
    pub custom: Option<Rc<dyn Fn(&V, &V) -> f64>>,
}

impl<V: VectorOps> ThetaDot<V> {
    pub fn standard() -> Self {
        Self { custom: None }
    }

    pub fn with_dot(dot: Rc<dyn Fn(&V, &V) -> f64>) -> Self {
        Self { custom: Some(dot) }
    }

    pub fn dot(&self, a: &BorderedPair<V>, b: &BorderedPair<V>, theta: f64) -> f64 {
        let state = match &self.custom {
            Some(f) => f(&a.u, &b.u),
            None => a.u.dot(&b.u) / a.u.length().max(1) as f64,
        };
        theta * state + (1.0 - theta) * a.p * b.p
    }

    pub fn norm(&self, a: &BorderedPair<V>, theta: f64) -> f64 {
        self.dot(a, a, theta).sqrt()
    }
}

/// `⟨a, b⟩_θ` with the standard `θ/len(u)` state weighting.
pub fn dot_theta<V: VectorOps>(a: &BorderedPair<V>, b: &BorderedPair<V>, theta: f64) -> f64 {
    let n = a.u.length().max(1) as f64;
    theta * a.u.dot(&b.u) / n + (1.0 - theta) * a.p * b.p
}

/// `sqrt(⟨a, a⟩_θ)`.
pub fn norm_theta<V: VectorOps>(a: &BorderedPair<V>, theta: f64) -> f64 {
    dot_theta(a, a, theta).sqrt()
}
