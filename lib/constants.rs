//! Nuclear constants and discrete distributions of coupling values.

use std::str::FromStr;
use ndarray as nd;
use crate::error::{ Error, Result };

/// Nuclei that can make up an IS spin pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Nucleus {
    H1,
    N15,
    C13,
    F19,
    P31,
}

impl Nucleus {
    /// Gyromagnetic ratio in rad s^-1 T^-1.
    pub fn gamma(self) -> f64 {
        match self {
            Self::H1  =>  26.752_212_8e07,
            Self::N15 => -2.712_618_04e07,
            Self::C13 =>  6.728_284e07,
            Self::F19 =>  25.18148e07,
            Self::P31 =>  10.8394e07,
        }
    }

    /// Resonance frequency ratio with respect to 1H (IUPAC values).
    pub fn xi_ratio(self) -> f64 {
        match self {
            Self::H1  => 100.000_000_0e-02,
            Self::N15 => 10.132_911_8e-02,
            Self::C13 => 25.144_953_0e-02,
            Self::F19 => 94.094_011e-02,
            Self::P31 => 40.480_863_6e-02,
        }
    }

    /// [`Self::xi_ratio`] carrying the sign of the gyromagnetic ratio.
    pub fn signed_xi_ratio(self) -> f64 {
        self.gamma().signum() * self.xi_ratio()
    }

    /// Nucleus designated by a single spin-system letter.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'h' => Some(Self::H1),
            'n' => Some(Self::N15),
            'c' => Some(Self::C13),
            'f' => Some(Self::F19),
            'p' => Some(Self::P31),
            _ => None,
        }
    }
}

impl FromStr for Nucleus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "h" | "1h" | "h1" => Ok(Self::H1),
            "n" | "15n" | "n15" => Ok(Self::N15),
            "c" | "13c" | "c13" => Ok(Self::C13),
            "f" | "19f" | "f19" => Ok(Self::F19),
            "p" | "31p" | "p31" => Ok(Self::P31),
            _ => Err(Error::UnknownSpinSystem(s.to_string())),
        }
    }
}

/// Residue-independent couplings (Hz) of a backbone nucleus to its carbon
/// neighbours; these are the couplings that broaden a 13C-labelled sample's
/// lines into multiplets.
pub fn neighbour_couplings(nucleus: &str) -> Option<&'static [f64]> {
    match nucleus {
        "n" => Some(&[-7.7, -10.7, -14.4]),
        "c" => Some(&[52.5, -14.4]),
        "ca" => Some(&[52.5, 35.0, -10.7, -7.7]),
        _ => None,
    }
}

/// A discrete distribution of values with associated weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Distribution {
    values: nd::Array1<f64>,
    weights: nd::Array1<f64>,
}

impl Distribution {
    /// Create a new distribution, normalizing the weights to unit sum.
    ///
    /// Fails if the arrays are empty, of unequal length, or if the weights are
    /// negative, non-finite, or sum to zero.
    pub fn new(values: nd::Array1<f64>, weights: nd::Array1<f64>)
        -> Result<Self>
    {
        if values.is_empty() || values.len() != weights.len() {
            return Err(Error::Distribution(format!(
                "{} values for {} weights", values.len(), weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Distribution(
                "weights must be finite and non-negative".to_string()));
        }
        let total = weights.sum();
        if total <= 0.0 {
            return Err(Error::Distribution(
                "weights sum to zero".to_string()));
        }
        Ok(Self { values, weights: weights / total })
    }

    /// A single value with unit weight.
    pub fn point(value: f64) -> Self {
        Self {
            values: nd::array![value],
            weights: nd::array![1.0],
        }
    }

    pub fn values(&self) -> &nd::Array1<f64> { &self.values }

    pub fn weights(&self) -> &nd::Array1<f64> { &self.weights }

    /// Number of points.
    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Return `true` if the distribution holds a single point.
    pub fn is_point(&self) -> bool { self.values.len() == 1 }

    /// Multiply every value by `factor`, keeping the weights.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            values: &self.values * factor,
            weights: self.weights.clone(),
        }
    }
}

/// Compute the multiplet pattern generated by a series of scalar couplings.
///
/// Each coupling splits every existing line into a doublet at `±J/2`. Lines
/// that fall on the same frequency are merged and their intensities summed.
pub fn multiplet(couplings: &[f64]) -> Distribution {
    let mut lines: Vec<f64> = vec![0.0];
    for &j in couplings {
        lines = lines.iter()
            .flat_map(|&v| [v - 0.5 * j, v + 0.5 * j])
            .collect();
    }
    lines.sort_by(f64::total_cmp);
    let mut values: Vec<f64> = Vec::with_capacity(lines.len());
    let mut weights: Vec<f64> = Vec::with_capacity(lines.len());
    for v in lines {
        match values.last() {
            Some(last) if (v - last).abs() < 1e-9 => {
                if let Some(w) = weights.last_mut() { *w += 1.0; }
            },
            _ => {
                values.push(v);
                weights.push(1.0);
            },
        }
    }
    let total: f64 = weights.iter().sum();
    Distribution {
        values: values.into(),
        weights: nd::Array1::from(weights) / total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn nitrogen_has_negative_signed_ratio() {
        assert!(Nucleus::N15.signed_xi_ratio() < 0.0);
        assert_relative_eq!(Nucleus::H1.signed_xi_ratio(), 1.0);
    }

    #[test]
    fn doublet_of_doublets() {
        let d = multiplet(&[10.0, 10.0]);
        assert_eq!(d.values().to_vec(), vec![-10.0, 0.0, 10.0]);
        assert_relative_eq!(d.weights()[1], 0.5);
        assert_relative_eq!(d.weights().sum(), 1.0);
    }

    #[test]
    fn no_coupling_is_a_point() {
        let d = multiplet(&[]);
        assert!(d.is_point());
        assert_eq!(d.values()[0], 0.0);
    }

    #[test]
    fn rejects_bad_weights() {
        assert!(Distribution::new(nd::array![1.0], nd::array![0.0]).is_err());
        assert!(Distribution::new(nd::array![1.0, 2.0], nd::array![1.0]).is_err());
    }
}
