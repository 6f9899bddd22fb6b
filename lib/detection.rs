//! Detection expressions: signed, optionally scaled sums of basis components,
//! e.g. `[2izsz_a] - [iz_a]` or `0.5 * [iz_a] + 0.5 * [iz_b]`.

use std::sync::OnceLock;
use ndarray as nd;
use regex::Regex;
use crate::{
    basis::Basis,
    error::{ Error, Result },
};

fn term_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>>
        = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([+-]?)\s*(?:(\d+(?:\.\d*)?)\s*\*\s*)?\[(\w+)\]")
    })
    .as_ref()
    .map_err(|err| Error::Detection(err.to_string()))
}

/// A parsed detection expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    expr: String,
    terms: Vec<(f64, String)>,
}

impl Detection {
    /// Parse an expression into `(coefficient, component)` terms.
    ///
    /// Everything outside the recognised terms must be whitespace, and every
    /// term after the first must carry an explicit sign.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut terms: Vec<(f64, String)> = Vec::new();
        let mut last = 0;
        for cap in term_pattern()?.captures_iter(expr) {
            let Some(whole) = cap.get(0) else { continue; };
            if !expr[last..whole.start()].trim().is_empty() {
                return Err(Error::Detection(expr.to_string()));
            }
            let sign = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            if sign.is_empty() && !terms.is_empty() {
                return Err(Error::Detection(expr.to_string()));
            }
            let scale: f64
                = match cap.get(2) {
                    Some(m) => m.as_str().parse()
                        .map_err(|_| Error::Detection(expr.to_string()))?,
                    None => 1.0,
                };
            let coeff = if sign == "-" { -scale } else { scale };
            terms.push((coeff, cap[3].to_string()));
            last = whole.end();
        }
        if terms.is_empty() || !expr[last..].trim().is_empty() {
            return Err(Error::Detection(expr.to_string()));
        }
        Ok(Self { expr: expr.to_string(), terms })
    }

    /// The expression as given.
    pub fn expr(&self) -> &str { &self.expr }

    pub fn terms(&self) -> &[(f64, String)] { &self.terms }

    /// Build the row vector of the expression in `basis`.
    pub fn vector(&self, basis: &Basis) -> Result<nd::Array1<f64>> {
        self.terms.iter()
            .try_fold(nd::Array1::zeros(basis.size()), |acc, (coeff, comp)| {
                basis.vector(comp)
                    .map(|v| acc + v * *coeff)
                    .ok_or_else(|| Error::UnknownComponent(comp.clone()))
            })
    }
}
