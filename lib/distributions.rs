//! Models of RF-field (B1) inhomogeneity across the sample.

use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use crate::{
    constants::Distribution,
    error::{ Error, Result },
};

/// How the nominal B1 field is spread over the sample.
#[derive(Clone, Debug, PartialEq)]
pub enum B1Inhomogeneity {
    /// Gaussian profile sampled on a linear grid spanning ±2 standard
    /// deviations.
    ///
    /// `scale` is the standard deviation as a fraction of the nominal value and
    /// `res` the number of grid points. A zero scale or a single grid point
    /// gives the nominal value alone.
    Gaussian { scale: f64, res: usize },
    /// Gaussian profile sampled at the `res` Gauss-Hermite nodes.
    ///
    /// Values are `value·(1 + √2·scale·x_k)` with the quadrature weights of the
    /// nodes `x_k`. Degenerates to the nominal value like `Gaussian`.
    Hermite { scale: f64, res: usize },
    /// User-supplied field scaling factors and their weights.
    Custom { scales: Vec<f64>, weights: Vec<f64> },
    /// Extreme inhomogeneity: only magnetization along the effective field
    /// survives a pulse. Pulses on the affected spin use dephased propagators.
    Dephasing,
}

impl Default for B1Inhomogeneity {
    fn default() -> Self { Self::Gaussian { scale: 0.1, res: 11 } }
}

fn check_width(scale: f64, res: usize) -> Result<()> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(Error::Distribution(format!(
            "B1 inhomogeneity scale must be finite and non-negative, got {}",
            scale
        )));
    }
    if res == 0 {
        return Err(Error::Distribution(
            "B1 inhomogeneity resolution must be at least 1".to_string()));
    }
    Ok(())
}

/// Nodes and normalized weights of the `n`-point Gauss-Hermite rule.
///
/// The nodes are the eigenvalues of the symmetric tridiagonal Jacobi matrix
/// of the Hermite recurrence; each weight is the squared first component of
/// the matching eigenvector.
fn hermite_nodes(n: usize) -> Result<(nd::Array1<f64>, nd::Array1<f64>)> {
    let mut jacobi: nd::Array2<f64> = nd::Array2::zeros((n, n));
    for k in 1..n {
        let b = (k as f64 / 2.0).sqrt();
        jacobi[[k, k - 1]] = b;
        jacobi[[k - 1, k]] = b;
    }
    let (nodes, vectors) = jacobi.eigh(UPLO::Lower)?;
    let weights = vectors.row(0).mapv(|v| v * v);
    Ok((nodes, weights))
}

impl B1Inhomogeneity {
    /// A perfectly homogeneous field.
    pub fn homogeneous() -> Self { Self::Gaussian { scale: 0.0, res: 1 } }

    /// Check that the parameters describe a valid distribution.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Gaussian { scale, res } | Self::Hermite { scale, res }
                => check_width(*scale, *res),
            Self::Custom { scales, weights } => {
                if scales.is_empty() || scales.len() != weights.len() {
                    return Err(Error::Distribution(format!(
                        "custom B1 profile has {} scales for {} weights",
                        scales.len(), weights.len(),
                    )));
                }
                if scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                    return Err(Error::Distribution(
                        "custom B1 scales must be finite and positive"
                        .to_string()));
                }
                if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                    return Err(Error::Distribution(
                        "custom B1 weights must be finite and positive"
                        .to_string()));
                }
                Ok(())
            },
            Self::Dephasing => Ok(()),
        }
    }

    /// Return `true` if pulses should use the dephased propagator path.
    pub fn is_dephasing(&self) -> bool { matches!(self, Self::Dephasing) }

    /// Relative field profile, i.e. the distribution around a nominal field
    /// of 1.
    pub fn profile(&self) -> Result<Distribution> {
        self.validate()?;
        match self {
            Self::Gaussian { scale, res } if *scale > 0.0 && *res > 1 => {
                let grid: nd::Array1<f64>
                    = nd::Array1::linspace(-2.0, 2.0, *res);
                let weights = grid.mapv(|g| (-0.5 * g * g).exp());
                let values = grid.mapv(|g| 1.0 + scale * g);
                Distribution::new(values, weights)
            },
            Self::Hermite { scale, res } if *scale > 0.0 && *res > 1 => {
                let (nodes, weights) = hermite_nodes(*res)?;
                let values
                    = nodes.mapv(|x| 1.0 + std::f64::consts::SQRT_2 * scale * x);
                Distribution::new(values, weights)
            },
            Self::Custom { scales, weights } => {
                Distribution::new(
                    nd::Array1::from_vec(scales.clone()),
                    nd::Array1::from_vec(weights.clone()),
                )
            },
            _ => Ok(Distribution::point(1.0)),
        }
    }

    /// Sample the distribution of field strengths around `value`.
    pub fn distribution(&self, value: f64) -> Result<Distribution> {
        Ok(self.profile()?.scaled(value))
    }
}
