//! Assembly of the evolution generator from a basis and parameter values.
//!
//! The free generator is
//!
//! ```text
//! L = Σ_k c_k M_k + carrier_i C_i + carrier_s C_s
//!     + sign(ppm_i) offset_i O_i + sign(ppm_s) offset_s O_s + j J
//! ```
//!
//! where `M_k` runs over every basis matrix, `c_k` is the matching parameter
//! value (zero if absent) times a per-matrix unit scale, and `j` runs over the
//! effective-coupling distribution. Pulses add the RF terms, one replica per
//! (coupling, field strength) pair, ordered coupling-major.

use std::{ fmt, sync::Arc };
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray as nd;
use crate::{
    basis::Basis,
    constants::{ Distribution, Nucleus },
    detection::Detection,
    distributions::B1Inhomogeneity,
    ensemble::{ self, Magnetization, Operator },
    error::{ Error, Result },
};

/// Parameter values by name, e.g. `r2_i_a`, `cs_i_b`, `kab`, `pb`.
pub type ParValues = IndexMap<String, f64>;

/// Collect `(name, value)` pairs into [`ParValues`].
pub fn par_values<'a, I>(pairs: I) -> ParValues
where I: IntoIterator<Item = (&'a str, f64)>
{
    pairs.into_iter().map(|(name, value)| (name.to_string(), value)).collect()
}

/// Called with the name of every parameter that has no counterpart in the
/// basis.
pub type IgnoredCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Static experimental conditions.
#[derive(Clone, Debug, PartialEq)]
pub struct Conditions {
    /// 1H Larmor frequency in MHz.
    pub h_larmor_frq: f64,
    /// Sample temperature in K.
    pub temperature: Option<f64>,
    pub label: Option<String>,
}

impl Conditions {
    pub fn new(h_larmor_frq: f64) -> Self {
        Self { h_larmor_frq, temperature: None, label: None }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

// state-independent unit terms, zero when absent from the basis
#[derive(Clone, Debug)]
struct Terms {
    carrier_i: nd::Array2<f64>,
    carrier_s: nd::Array2<f64>,
    offset_i: nd::Array2<f64>,
    offset_s: nd::Array2<f64>,
    jeff_i: nd::Array2<f64>,
    b1x_i: nd::Array2<f64>,
    b1y_i: nd::Array2<f64>,
    b1x_s: nd::Array2<f64>,
    b1y_s: nd::Array2<f64>,
}

impl Terms {
    fn new(basis: &Basis, ppm_i: f64, ppm_s: f64) -> Self {
        Self {
            carrier_i: basis.matrix_or_zeros("carrier_i") * ppm_i,
            carrier_s: basis.matrix_or_zeros("carrier_s") * ppm_s,
            offset_i: basis.matrix_or_zeros("offset_i"),
            offset_s: basis.matrix_or_zeros("offset_s"),
            jeff_i: basis.matrix_or_zeros("jeff_i"),
            b1x_i: basis.matrix_or_zeros("b1x_i"),
            b1y_i: basis.matrix_or_zeros("b1y_i"),
            b1x_s: basis.matrix_or_zeros("b1x_s"),
            b1y_s: basis.matrix_or_zeros("b1y_s"),
        }
    }
}

fn unit_scale(name: &str, ppm_i: f64, ppm_s: f64, gradient_dephasing: f64)
    -> f64
{
    if name.starts_with("cs_i_") || name == "carrier_i" {
        ppm_i
    } else if name.starts_with("cs_s_") || name == "carrier_s" {
        ppm_s
    } else if name.starts_with("d_") {
        gradient_dephasing
    } else {
        1.0
    }
}

// RF direction for a phase in units of 90°
fn rf(x: &nd::Array2<f64>, y: &nd::Array2<f64>, phase: f64, scale: f64)
    -> nd::Array2<f64>
{
    let rad = phase * std::f64::consts::FRAC_PI_2;
    x * (scale * rad.cos()) + y * (scale * rad.sin())
}

/// The evolution generator of one spin system.
pub struct Liouvillian {
    basis: Arc<Basis>,
    conditions: Conditions,
    ppm_i: f64,
    ppm_s: f64,
    gradient_dephasing: f64,
    terms: Terms,
    scales: nd::Array1<f64>,
    coeffs: nd::Array1<f64>,
    par_values: ParValues,
    ignored: Vec<String>,
    on_ignored: Option<IgnoredCallback>,
    l_base: nd::Array2<f64>,
    carrier_i: f64,
    carrier_s: f64,
    offset_i: f64,
    offset_s: f64,
    b1_i: f64,
    b1_s: f64,
    b1_i_inh: B1Inhomogeneity,
    b1_i_profile: Distribution,
    b1_i_dist: Distribution,
    jeff_i: Distribution,
    detection: Option<(Detection, nd::Array1<f64>)>,
}

impl fmt::Debug for Liouvillian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Liouvillian")
            .field("basis", &self.basis.key().name())
            .field("n_states", &self.basis.n_states())
            .field("conditions", &self.conditions)
            .field("par_values", &self.par_values)
            .field("carrier_i", &self.carrier_i)
            .field("offset_i", &self.offset_i)
            .field("b1_i", &self.b1_i)
            .field("b1_i_inh", &self.b1_i_inh)
            .field("detection", &self.detection.as_ref().map(|(d, _)| d.expr()))
            .finish_non_exhaustive()
    }
}

impl Liouvillian {
    /// Create a new generator with all parameters zero except `pa = 1`.
    pub fn new(basis: Arc<Basis>, conditions: Conditions) -> Result<Self> {
        let atoms = basis.atoms();
        let ppm = |letter: char| {
            let ratio
                = atoms.iter()
                .find(|(l, _)| *l == letter)
                .map(|(_, nucleus)| nucleus.signed_xi_ratio())
                .unwrap_or(1.0);
            -std::f64::consts::TAU * conditions.h_larmor_frq * ratio
        };
        let ppm_i = ppm('i');
        let ppm_s = ppm('s');
        let terms = Terms::new(&basis, ppm_i, ppm_s);
        let n = basis.size();
        let b1_i_inh = B1Inhomogeneity::default();
        let b1_i_profile = b1_i_inh.profile()?;
        let mut new = Self {
            conditions,
            ppm_i,
            ppm_s,
            gradient_dephasing: 0.0,
            terms,
            scales: nd::Array1::zeros(0),
            coeffs: nd::Array1::zeros(0),
            par_values: ParValues::new(),
            ignored: Vec::new(),
            on_ignored: None,
            l_base: nd::Array2::zeros((n, n)),
            carrier_i: 0.0,
            carrier_s: 0.0,
            offset_i: 0.0,
            offset_s: 0.0,
            b1_i: 0.0,
            b1_s: 0.0,
            b1_i_dist: b1_i_profile.scaled(0.0),
            b1_i_profile,
            b1_i_inh,
            jeff_i: Distribution::point(0.0),
            detection: None,
            basis,
        };
        new.rescale();
        new.update(&par_values([("pa", 1.0)]))?;
        Ok(new)
    }

    fn rescale(&mut self) {
        let (ppm_i, ppm_s, grad) = (self.ppm_i, self.ppm_s, self.gradient_dephasing);
        self.scales
            = self.basis.matrix_names()
            .map(|name| unit_scale(name, ppm_i, ppm_s, grad))
            .collect();
    }

    fn is_known(&self, name: &str) -> bool {
        self.basis.matrix_index(name).is_some()
            || name.strip_prefix('p')
                .is_some_and(|s| {
                    let mut chars = s.chars();
                    matches!(
                        (chars.next(), chars.next()),
                        (Some(c), None) if self.basis.states().contains(&c)
                    )
                })
    }

    /// Store new parameter values and rebuild the parameter-weighted part of
    /// the generator.
    ///
    /// Names with no matching basis matrix or state population are ignored;
    /// they are listed by [`Self::ignored_names`] and passed to the callback
    /// set with [`Self::set_on_ignored`].
    pub fn update(&mut self, par_values: &ParValues) -> Result<()> {
        self.ignored
            = par_values.keys()
            .filter(|name| !self.is_known(name))
            .cloned()
            .collect();
        if !self.ignored.is_empty() {
            log::debug!(
                "{}: ignoring parameters not in basis: {}",
                self.basis.key().name(),
                self.ignored.join(", "),
            );
            if let Some(callback) = self.on_ignored.as_ref() {
                self.ignored.iter().for_each(|name| callback(name));
            }
        }
        self.coeffs
            = self.basis.matrix_names()
            .map(|name| par_values.get(name).copied().unwrap_or(0.0))
            .collect();
        self.par_values = par_values.clone();
        self.rebuild_base()
    }

    /// Replace every basis coefficient at once, skipping name lookups.
    ///
    /// `coeffs` is ordered like [`Basis::matrix_names`] and holds values in
    /// the same units as [`Self::update`]. State populations, and the mapping
    /// returned by [`Self::par_values`], stay those of the last `update`.
    pub fn update_dense(&mut self, coeffs: nd::ArrayView1<f64>) -> Result<()> {
        if coeffs.len() != self.scales.len() {
            return Err(Error::Dimension {
                expected: self.scales.len(),
                got: coeffs.len(),
            });
        }
        self.coeffs = coeffs.to_owned();
        self.rebuild_base()
    }

    /// Basis coefficients ordered like [`Basis::matrix_names`].
    pub fn coefficients(&self) -> &nd::Array1<f64> { &self.coeffs }

    fn rebuild_base(&mut self) -> Result<()> {
        let n = self.basis.size();
        let coeffs = &self.coeffs * &self.scales;
        let flat
            = self.basis.matrices().view()
            .into_shape((coeffs.len(), n * n))?;
        self.l_base = coeffs.dot(&flat).into_shape((n, n))?;
        Ok(())
    }

    /// Set the callback receiving ignored parameter names.
    pub fn set_on_ignored(&mut self, callback: Option<IgnoredCallback>) {
        self.on_ignored = callback;
    }

    /// Parameter names dropped by the last [`Self::update`].
    pub fn ignored_names(&self) -> &[String] { &self.ignored }

    pub fn par_values(&self) -> &ParValues { &self.par_values }

    pub fn basis(&self) -> &Arc<Basis> { &self.basis }

    pub fn conditions(&self) -> &Conditions { &self.conditions }

    /// Dimension of the generator.
    pub fn size(&self) -> usize { self.basis.size() }

    /// Conversion factor from ppm to rad/s for spin I.
    pub fn ppm_i(&self) -> f64 { self.ppm_i }

    /// Conversion factor from ppm to rad/s for spin S.
    pub fn ppm_s(&self) -> f64 { self.ppm_s }

    pub fn carrier_i(&self) -> f64 { self.carrier_i }

    /// Set the I carrier position (ppm).
    pub fn set_carrier_i(&mut self, value: f64) { self.carrier_i = value; }

    pub fn carrier_s(&self) -> f64 { self.carrier_s }

    /// Set the S carrier position (ppm).
    pub fn set_carrier_s(&mut self, value: f64) { self.carrier_s = value; }

    pub fn offset_i(&self) -> f64 { self.offset_i }

    /// Set the RF offset from the I carrier (Hz).
    pub fn set_offset_i(&mut self, value: f64) { self.offset_i = value; }

    pub fn offset_s(&self) -> f64 { self.offset_s }

    /// Set the RF offset from the S carrier (Hz).
    pub fn set_offset_s(&mut self, value: f64) { self.offset_s = value; }

    pub fn b1_i(&self) -> f64 { self.b1_i }

    /// Set the nominal RF field strength on I (Hz).
    pub fn set_b1_i(&mut self, value: f64) {
        self.b1_i = value;
        self.b1_i_dist = self.b1_i_profile.scaled(value);
    }

    pub fn b1_s(&self) -> f64 { self.b1_s }

    /// Set the RF field strength on S (Hz).
    pub fn set_b1_s(&mut self, value: f64) { self.b1_s = value; }

    pub fn b1_i_inhomogeneity(&self) -> &B1Inhomogeneity { &self.b1_i_inh }

    /// Set the inhomogeneity model of the I field.
    pub fn set_b1_i_inhomogeneity(&mut self, inh: B1Inhomogeneity)
        -> Result<()>
    {
        let profile = inh.profile()?;
        self.b1_i_dist = profile.scaled(self.b1_i);
        self.b1_i_profile = profile;
        self.b1_i_inh = inh;
        Ok(())
    }

    /// Sampled I field strengths and their weights.
    pub fn b1_i_distribution(&self) -> &Distribution { &self.b1_i_dist }

    /// Return `true` if pulses on I should discard oscillating modes.
    pub fn is_dephasing(&self) -> bool { self.b1_i_inh.is_dephasing() }

    pub fn jeff_i(&self) -> &Distribution { &self.jeff_i }

    /// Set the effective-coupling distribution (Hz).
    pub fn set_jeff_i(&mut self, jeff: Distribution) { self.jeff_i = jeff; }

    pub fn gradient_dephasing(&self) -> f64 { self.gradient_dephasing }

    /// Set the gradient dephasing rate scaling the diffusion terms.
    pub fn set_gradient_dephasing(&mut self, value: f64) -> Result<()> {
        self.gradient_dephasing = value;
        self.rescale();
        self.rebuild_base()
    }

    /// Number of replicas in pulse generators.
    pub fn n_replicas(&self) -> usize { self.jeff_i.len() * self.b1_i_dist.len() }

    /// Replica weights, coupling-major.
    pub fn weights(&self) -> nd::Array1<f64> {
        self.jeff_i.weights().iter()
            .cartesian_product(self.b1_i_dist.weights().iter())
            .map(|(wj, wb)| wj * wb)
            .collect()
    }

    /// The free-evolution generator, one replica per effective coupling.
    pub fn free_generator(&self) -> Operator {
        let n = self.size();
        let mut fixed = self.l_base.clone();
        fixed.scaled_add(self.carrier_i, &self.terms.carrier_i);
        fixed.scaled_add(self.carrier_s, &self.terms.carrier_s);
        fixed.scaled_add(self.offset_i * self.ppm_i.signum(), &self.terms.offset_i);
        fixed.scaled_add(self.offset_s * self.ppm_s.signum(), &self.terms.offset_s);
        let mut out: Operator = nd::Array3::zeros((self.jeff_i.len(), n, n));
        for (mut o, j) in out.outer_iter_mut().zip(self.jeff_i.values()) {
            o.assign(&fixed);
            o.scaled_add(*j, &self.terms.jeff_i);
        }
        out
    }

    // free generator plus `rf * b1` for every field strength, coupling-major
    fn with_b1_i(&self, rf_i: &nd::Array2<f64>, extra: Option<&nd::Array2<f64>>)
        -> Operator
    {
        let free = self.free_generator();
        let n = self.size();
        let b1 = self.b1_i_dist.values();
        let replicas = free.len_of(nd::Axis(0)) * b1.len();
        let mut out: Operator = nd::Array3::zeros((replicas, n, n));
        let pairs = free.outer_iter().cartesian_product(b1.iter());
        for (mut o, (l, b)) in out.outer_iter_mut().zip(pairs) {
            o.assign(&l);
            o.scaled_add(*b, rf_i);
            if let Some(extra) = extra { o += extra; }
        }
        out
    }

    /// Generator during a pulse on I; `phase` is in units of 90°.
    pub fn pulse_i_generator(&self, phase: f64, scale: f64) -> Operator {
        let rf_i = rf(&self.terms.b1x_i, &self.terms.b1y_i, phase, scale);
        self.with_b1_i(&rf_i, None)
    }

    /// Generator during a pulse on S; `phase` is in units of 90°.
    pub fn pulse_s_generator(&self, phase: f64, scale: f64) -> Operator {
        let rf_s
            = rf(&self.terms.b1x_s, &self.terms.b1y_s, phase, scale * self.b1_s);
        let mut out = self.free_generator();
        out.outer_iter_mut().for_each(|mut o| { o += &rf_s; });
        out
    }

    /// Generator during simultaneous pulses on I and S.
    pub fn pulse_is_generator(&self, phase_i: f64, phase_s: f64) -> Operator {
        let rf_i = rf(&self.terms.b1x_i, &self.terms.b1y_i, phase_i, 1.0);
        let rf_s = rf(&self.terms.b1x_s, &self.terms.b1y_s, phase_s, self.b1_s);
        self.with_b1_i(&rf_i, Some(&rf_s))
    }

    fn population(&self, state: char) -> f64 {
        self.par_values.get(&format!("p{}", state)).copied().unwrap_or(0.0)
    }

    /// Equilibrium magnetization: every state's population times the
    /// resonance-frequency ratio of each nucleus, on its `e` and `z`
    /// components.
    pub fn equilibrium(&self) -> Magnetization {
        let mut mag: nd::Array1<f64> = nd::Array1::zeros(self.size());
        let atoms = self.basis.atoms();
        let pairs = self.basis.states().iter().cartesian_product(atoms.iter());
        for (state, (letter, atom)) in pairs {
            let scale = self.population(*state) * atom.xi_ratio();
            for comp in ["e", "z"] {
                let name = format!("{}{}_{}", letter, comp, state);
                if let Some(v) = self.basis.vector(&name) {
                    mag.scaled_add(scale, v);
                }
            }
        }
        mag.insert_axis(nd::Axis(0))
    }

    // sum of `weight(state) * vector` over per-state vectors whose component
    // starts with `term`; `None` if nothing matches
    fn gather<F>(&self, term: &str, weight: F) -> Option<nd::Array1<f64>>
    where F: Fn(char) -> f64
    {
        let mut found = false;
        let mut acc: nd::Array1<f64> = nd::Array1::zeros(self.size());
        for (state, comp) in self.basis.states().iter()
            .cartesian_product(self.basis.components().iter())
            .filter(|(_, comp)| comp.starts_with(term))
        {
            if let Some(v) = self.basis.vector(&format!("{}_{}", comp, state)) {
                acc.scaled_add(weight(*state), v);
                found = true;
            }
        }
        found.then_some(acc)
    }

    /// Magnetization on every component starting with one of `terms`,
    /// weighted by the state populations and by the frequency ratio of `atom`
    /// (1 if `None`).
    pub fn start_magnetization(&self, terms: &[&str], atom: Option<Nucleus>)
        -> Result<Magnetization>
    {
        let ratio = atom.map(|a| a.xi_ratio()).unwrap_or(1.0);
        let mut mag: nd::Array1<f64> = nd::Array1::zeros(self.size());
        for term in terms {
            let v
                = self.gather(term, |state| self.population(state) * ratio)
                .ok_or_else(|| Error::UnknownComponent(term.to_string()))?;
            mag += &v;
        }
        Ok(mag.insert_axis(nd::Axis(0)))
    }

    /// 0/1 mask over the components starting with one of `terms`; unmatched
    /// terms select nothing.
    pub fn keep_mask(&self, terms: &[&str]) -> nd::Array1<f64> {
        let mut mask: nd::Array1<f64> = nd::Array1::zeros(self.size());
        for term in terms {
            if let Some(v) = self.gather(term, |_| 1.0) { mask += &v; }
        }
        mask.mapv_inplace(|x| x.min(1.0));
        mask
    }

    /// Zero every component of `mag` not selected by `terms`.
    pub fn keep(&self, mag: nd::ArrayView2<f64>, terms: &[&str]) -> Magnetization {
        let mask = self.keep_mask(terms);
        &mag * &mask.view().insert_axis(nd::Axis(0))
    }

    /// Convert I offsets from the carrier (Hz) to chemical shifts (ppm).
    pub fn offsets_to_ppms(&self, offsets: &nd::Array1<f64>) -> nd::Array1<f64> {
        offsets.mapv(|o| {
            self.carrier_i + std::f64::consts::TAU * o / self.ppm_i.abs()
        })
    }

    /// Convert I chemical shifts (ppm) to offsets from the carrier (Hz).
    pub fn ppms_to_offsets(&self, ppms: &nd::Array1<f64>) -> nd::Array1<f64> {
        ppms.mapv(|p| {
            (p - self.carrier_i) * self.ppm_i.abs() / std::f64::consts::TAU
        })
    }

    /// Set the detection expression, e.g. `[iz_a]` or `[2izsz_a] - [iz_a]`.
    pub fn set_detection(&mut self, expr: &str) -> Result<()> {
        let detection = Detection::parse(expr)?;
        let vector = detection.vector(&self.basis)?;
        self.detection = Some((detection, vector));
        Ok(())
    }

    pub fn detection(&self) -> Option<&str> {
        self.detection.as_ref().map(|(d, _)| d.expr())
    }

    /// Collapse a magnetization stack with the replica weights and project it
    /// onto the detection vector.
    pub fn detect(&self, mag: nd::ArrayView2<f64>) -> Result<f64> {
        let (_, vector)
            = self.detection.as_ref()
            .ok_or_else(|| Error::Detection("no detection expression set".into()))?;
        if mag.ncols() != vector.len() {
            return Err(Error::Dimension { expected: vector.len(), got: mag.ncols() });
        }
        let collapsed = ensemble::collapse(mag, self.weights().view())?;
        Ok(vector.dot(&collapsed))
    }
}
