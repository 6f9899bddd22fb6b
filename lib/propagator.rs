//! Matrix exponentials of Liouvillians via eigendecomposition.
//!
//! One decomposition `L = V diag(s) V^-1` serves any number of delays:
//! `exp(L t) = V diag(exp(s t)) V^-1`. Liouvillians are general real matrices,
//! so the eigenproblem is solved over the complex numbers and the real part of
//! the reconstruction is kept.

use std::sync::Arc;
use ndarray as nd;
use ndarray_linalg::{ Eig, EigVals, InverseInto };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::{
    cache::SharedPropagatorCache,
    ensemble::Propagators,
    error::Result,
};

/// Eigenmodes whose eigenvalue has an imaginary part at least this large are
/// discarded in dephasing mode.
pub const DEPHASING_TOL: f64 = 1e-6;

/// Eigendecomposition of a single generator.
#[derive(Clone, Debug)]
pub struct Eigen {
    values: nd::Array1<C64>,
    vectors: nd::Array2<C64>,
    inverse: nd::Array2<C64>,
}

impl Eigen {
    /// Decompose a square generator.
    ///
    /// An ill-conditioned eigenvector matrix is not detected; only outright
    /// LAPACK failures are reported.
    pub fn decompose(generator: nd::ArrayView2<f64>) -> Result<Self> {
        let (values, vectors) = generator.mapv(|x| C64::new(x, 0.0)).eig()?;
        let inverse = vectors.clone().inv_into()?;
        Ok(Self { values, vectors, inverse })
    }

    /// Eigenvalues.
    pub fn values(&self) -> &nd::Array1<C64> { &self.values }

    /// Dimension of the generator.
    pub fn size(&self) -> usize { self.values.len() }

    /// Compute `Re(V diag(exp(s t)) V^-1)`.
    ///
    /// With `dephase` set, oscillating modes (|Im s| >= [`DEPHASING_TOL`]) are
    /// removed from the sum.
    pub fn propagator(&self, t: f64, dephase: bool) -> nd::Array2<f64> {
        let exp: nd::Array1<C64>
            = self.values.mapv(|s| {
                if dephase && s.im.abs() >= DEPHASING_TOL {
                    C64::zero()
                } else {
                    (s * t).exp()
                }
            });
        let scaled = &self.vectors * &exp.view().insert_axis(nd::Axis(0));
        scaled.dot(&self.inverse).mapv(|z| z.re)
    }
}

/// Imaginary parts of the eigenvalues of a generator; these are the
/// precession frequencies (rad/s) of its modes.
pub fn frequencies(generator: nd::ArrayView2<f64>) -> Result<nd::Array1<f64>> {
    let values = generator.mapv(|x| C64::new(x, 0.0)).eigvals()?;
    Ok(values.mapv(|s| s.im))
}

/// Decompose every replica of a generator stack, through the cache if one is
/// given.
///
/// The shared cache is locked only for lookup and insertion, never during a
/// decomposition.
pub fn decompose_stack(
    generators: nd::ArrayView3<f64>,
    cache: Option<&SharedPropagatorCache>,
) -> Result<Vec<Arc<Eigen>>>
{
    generators.outer_iter()
        .map(|g| {
            match cache {
                Some(cache) => {
                    let lock = || {
                        cache.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                    };
                    if let Some(eigen) = lock().lookup(g) {
                        return Ok(eigen);
                    }
                    // the guard is released while the eigensolver runs
                    let eigen = Arc::new(Eigen::decompose(g)?);
                    Ok(lock().insert(g, eigen))
                },
                None => Eigen::decompose(g).map(Arc::new),
            }
        })
        .collect()
}

/// Evaluate decomposed generators at each delay.
///
/// The result has shape `(delays, replicas, n, n)`.
pub fn propagate(eigens: &[Arc<Eigen>], delays: &[f64], dephase: bool)
    -> Propagators
{
    let n = eigens.first().map(|e| e.size()).unwrap_or(0);
    let mut out: Propagators
        = nd::Array4::zeros((delays.len(), eigens.len(), n, n));
    for (mut out_t, &t) in out.outer_iter_mut().zip(delays) {
        for (mut out_tr, eigen) in out_t.outer_iter_mut().zip(eigens) {
            out_tr.assign(&eigen.propagator(t, dephase));
        }
    }
    out
}

/// Compute `exp(L t)` for every replica `L` of `generators` and every delay
/// `t`, giving shape `(delays, replicas, n, n)`.
pub fn calculate_propagators(
    generators: nd::ArrayView3<f64>,
    delays: &[f64],
    dephase: bool,
) -> Result<Propagators>
{
    calculate_propagators_with(generators, delays, dephase, None)
}

/// Like [`calculate_propagators`], reusing eigendecompositions from `cache`.
pub fn calculate_propagators_with(
    generators: nd::ArrayView3<f64>,
    delays: &[f64],
    dephase: bool,
    cache: Option<&SharedPropagatorCache>,
) -> Result<Propagators>
{
    let eigens = decompose_stack(generators, cache)?;
    Ok(propagate(&eigens, delays, dephase))
}

/// Single-matrix, single-delay case of [`calculate_propagators`].
pub fn calculate_propagator(
    generator: nd::ArrayView2<f64>,
    delay: f64,
    dephase: bool,
) -> Result<nd::Array2<f64>>
{
    Ok(Eigen::decompose(generator)?.propagator(delay, dephase))
}
