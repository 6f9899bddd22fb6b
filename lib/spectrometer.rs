//! The public face of the engine: delays, pulses and detection on one spin
//! system.
//!
//! Pulse-sequence code composes the operators returned here. Propagator sets
//! have shape `(k, replicas, n, n)`, where `k` runs over the requested delays
//! for [`Spectrometer::delays`] and the pulse methods, and over the four phases
//! (x, y, -x, -y) for the phased hard and ideal pulses.

use std::sync::Arc;
use ndarray as nd;
use rustc_hash::FxHashMap as HashMap;
use crate::{
    basis::BasisKey,
    cache::{ CacheStats, EngineCaches, SharedPropagatorCache },
    constants::{ Distribution, Nucleus },
    distributions::B1Inhomogeneity,
    ensemble::{ self, Magnetization, Operator, Propagators },
    error::{ Error, Result },
    liouvillian::{ Conditions, IgnoredCallback, Liouvillian, ParValues },
    propagator::{ calculate_propagators_with, frequencies },
    pulses::{ FixedPulses, Spin },
};

// phase orders used by the composite pulses
const PHASES_BACK: [usize; 4] = [3, 0, 1, 2];
const PHASES_FORWARD: [usize; 4] = [1, 2, 3, 0];

#[derive(Clone, Debug)]
struct HardPulses {
    p90: Propagators,
    p180: Propagators,
    p240: Propagators,
}

/// Delays, pulses and detection for a single spin system.
///
/// Hard pulses are computed lazily and kept until the next parameter or
/// condition change.
#[derive(Debug)]
pub struct Spectrometer {
    liouvillian: Liouvillian,
    fixed: Arc<FixedPulses>,
    propagator_cache: Option<SharedPropagatorCache>,
    pw90_i: f64,
    pw90_s: f64,
    hard_i: Option<HardPulses>,
    p180_s: Option<Propagators>,
}

impl Spectrometer {
    /// Create a new spectrometer with private caches and no propagator cache.
    pub fn new(key: BasisKey, conditions: Conditions) -> Result<Self> {
        Self::new_with(key, conditions, &EngineCaches::default())
    }

    /// Create a new spectrometer drawing from shared caches.
    pub fn new_with(key: BasisKey, conditions: Conditions, caches: &EngineCaches)
        -> Result<Self>
    {
        let basis = caches.bases.get(key)?;
        let fixed = caches.pulses.get(&basis)?;
        let liouvillian = Liouvillian::new(basis, conditions)?;
        Ok(Self {
            liouvillian,
            fixed,
            propagator_cache: caches.propagators.clone(),
            pw90_i: 0.0,
            pw90_s: 0.0,
            hard_i: None,
            p180_s: None,
        })
    }

    fn invalidate(&mut self) {
        self.hard_i = None;
        self.p180_s = None;
    }

    pub fn liouvillian(&self) -> &Liouvillian { &self.liouvillian }

    /// Dimension of the operators.
    pub fn size(&self) -> usize { self.liouvillian.size() }

    /// Statistics of the propagator cache, if one is attached.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.propagator_cache.as_ref()
            .map(|cache| {
                cache.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .stats()
            })
    }

    /// Set new parameter values; see [`Liouvillian::update`].
    pub fn update(&mut self, par_values: &ParValues) -> Result<()> {
        self.invalidate();
        self.liouvillian.update(par_values)
    }

    /// Replace the basis coefficients by position; see
    /// [`Liouvillian::update_dense`].
    pub fn update_dense(&mut self, coeffs: nd::ArrayView1<f64>) -> Result<()> {
        self.invalidate();
        self.liouvillian.update_dense(coeffs)
    }

    pub fn par_values(&self) -> &ParValues { self.liouvillian.par_values() }

    pub fn set_on_ignored(&mut self, callback: Option<IgnoredCallback>) {
        self.liouvillian.set_on_ignored(callback);
    }

    pub fn set_carrier_i(&mut self, value: f64) {
        self.liouvillian.set_carrier_i(value);
        self.invalidate();
    }

    pub fn set_carrier_s(&mut self, value: f64) {
        self.liouvillian.set_carrier_s(value);
        self.invalidate();
    }

    pub fn set_offset_i(&mut self, value: f64) {
        self.liouvillian.set_offset_i(value);
        self.invalidate();
    }

    pub fn set_offset_s(&mut self, value: f64) {
        self.liouvillian.set_offset_s(value);
        self.invalidate();
    }

    /// Set the I field strength (Hz); also fixes the 90° pulse width.
    pub fn set_b1_i(&mut self, value: f64) {
        self.pw90_i = if value != 0.0 { 1.0 / (4.0 * value) } else { 0.0 };
        self.liouvillian.set_b1_i(value);
        self.invalidate();
    }

    /// Set the S field strength (Hz); also fixes the 90° pulse width.
    pub fn set_b1_s(&mut self, value: f64) {
        self.pw90_s = if value != 0.0 { 1.0 / (4.0 * value) } else { 0.0 };
        self.liouvillian.set_b1_s(value);
        self.invalidate();
    }

    pub fn set_b1_i_inhomogeneity(&mut self, inh: B1Inhomogeneity) -> Result<()> {
        self.invalidate();
        self.liouvillian.set_b1_i_inhomogeneity(inh)
    }

    pub fn set_jeff_i(&mut self, jeff: Distribution) {
        self.liouvillian.set_jeff_i(jeff);
        self.invalidate();
    }

    pub fn set_gradient_dephasing(&mut self, value: f64) -> Result<()> {
        self.invalidate();
        self.liouvillian.set_gradient_dephasing(value)
    }

    /// 90° pulse width on I (s).
    pub fn pw90_i(&self) -> f64 { self.pw90_i }

    /// 90° pulse width on S (s).
    pub fn pw90_s(&self) -> f64 { self.pw90_s }

    pub fn identity(&self) -> Operator { ensemble::identity(self.size()) }

    pub fn equilibrium(&self) -> Magnetization { self.liouvillian.equilibrium() }

    pub fn start_magnetization(&self, terms: &[&str], atom: Option<Nucleus>)
        -> Result<Magnetization>
    {
        self.liouvillian.start_magnetization(terms, atom)
    }

    pub fn keep(&self, mag: nd::ArrayView2<f64>, terms: &[&str]) -> Magnetization {
        self.liouvillian.keep(mag, terms)
    }

    /// Projector onto ie, se, iz, sz and 2izsz.
    pub fn zfilter(&self) -> &Operator { self.fixed.zfilter() }

    pub fn set_detection(&mut self, expr: &str) -> Result<()> {
        self.liouvillian.set_detection(expr)
    }

    pub fn detect(&self, mag: nd::ArrayView2<f64>) -> Result<f64> {
        self.liouvillian.detect(mag)
    }

    fn propagators(&self, generators: &Operator, times: &[f64], dephase: bool)
        -> Result<Propagators>
    {
        calculate_propagators_with(
            generators.view(), times, dephase, self.propagator_cache.as_ref())
    }

    /// Free evolution for each delay.
    pub fn delays(&self, times: &[f64]) -> Result<Propagators> {
        self.propagators(&self.liouvillian.free_generator(), times, false)
    }

    /// Free evolution for a single delay.
    pub fn delay(&self, time: f64) -> Result<Operator> {
        Ok(self.delays(&[time])?.index_axis_move(nd::Axis(0), 0))
    }

    /// Pulse on I for each duration; `phase` is in units of 90° and `scale`
    /// multiplies the field strength.
    pub fn pulse_i(&self, times: &[f64], phase: f64, scale: f64)
        -> Result<Propagators>
    {
        let dephase = self.liouvillian.is_dephasing();
        if dephase { log::trace!("dephased pulse on I"); }
        let generators = self.liouvillian.pulse_i_generator(phase, scale);
        self.propagators(&generators, times, dephase)
    }

    /// Pulse on S for each duration.
    pub fn pulse_s(&self, times: &[f64], phase: f64, scale: f64)
        -> Result<Propagators>
    {
        let generators = self.liouvillian.pulse_s_generator(phase, scale);
        self.propagators(&generators, times, false)
    }

    /// Simultaneous pulses on I and S for each duration.
    pub fn pulse_is(&self, times: &[f64], phase_i: f64, phase_s: f64)
        -> Result<Propagators>
    {
        let dephase = self.liouvillian.is_dephasing();
        let generators = self.liouvillian.pulse_is_generator(phase_i, phase_s);
        self.propagators(&generators, times, dephase)
    }

    /// Piecewise-constant pulse on I of total width `pw`, then phased.
    ///
    /// Each (amplitude, phase) step lasts `pw / amplitudes.len()`; repeated
    /// steps are computed once.
    pub fn shaped_pulse_i(&self, pw: f64, amplitudes: &[f64], phases: &[f64])
        -> Result<Propagators>
    {
        if amplitudes.len() != phases.len() {
            return Err(Error::Dimension {
                expected: amplitudes.len(),
                got: phases.len(),
            });
        }
        if amplitudes.is_empty() {
            return self.fixed.add_phases(self.identity().view(), Spin::I);
        }
        let time = pw / amplitudes.len() as f64;
        let mut steps: HashMap<(u64, u64), Operator> = HashMap::default();
        for (amp, ph) in amplitudes.iter().zip(phases) {
            let key = (amp.to_bits(), ph.to_bits());
            if !steps.contains_key(&key) {
                let step
                    = self.pulse_i(&[time], *ph, *amp)?
                    .index_axis_move(nd::Axis(0), 0);
                steps.insert(key, step);
            }
        }
        let ops: Vec<nd::ArrayView3<f64>>
            = amplitudes.iter().zip(phases).rev()
            .filter_map(|(amp, ph)| steps.get(&(amp.to_bits(), ph.to_bits())))
            .map(|op| op.view())
            .collect();
        let base = ensemble::chain(&ops)?;
        self.fixed.add_phases(base.view(), Spin::I)
    }

    fn hard_pulses_i(&mut self) -> Result<&HardPulses> {
        let hard
            = match self.hard_i.take() {
                Some(hard) => hard,
                None => {
                    let pws = [1.0, 2.0, 8.0 / 3.0].map(|k| k * self.pw90_i);
                    let base = self.pulse_i(&pws, 0.0, 1.0)?;
                    let phased = |k: usize| {
                        self.fixed.add_phases(base.index_axis(nd::Axis(0), k), Spin::I)
                    };
                    HardPulses { p90: phased(0)?, p180: phased(1)?, p240: phased(2)? }
                },
            };
        Ok(self.hard_i.insert(hard))
    }

    /// Hard 90° pulse on I for each phase.
    pub fn p90_i(&mut self) -> Result<&Propagators> {
        Ok(&self.hard_pulses_i()?.p90)
    }

    /// Hard 180° pulse on I for each phase.
    pub fn p180_i(&mut self) -> Result<&Propagators> {
        Ok(&self.hard_pulses_i()?.p180)
    }

    /// Hard 240° pulse on I for each phase.
    pub fn p240_i(&mut self) -> Result<&Propagators> {
        Ok(&self.hard_pulses_i()?.p240)
    }

    fn composite(&mut self, order: [usize; 4], center_240: bool)
        -> Result<Propagators>
    {
        let hard = self.hard_pulses_i()?;
        let outer = hard.p90.select(nd::Axis(0), &order);
        let center = if center_240 { &hard.p240 } else { &hard.p180 };
        let inner = ensemble::dot_sets(center.view(), outer.view())?;
        ensemble::dot_sets(outer.view(), inner.view())
    }

    /// Composite 90-180-90 pulse on I, flanking pulses phase-shifted by -90°.
    pub fn p9018090_i_1(&mut self) -> Result<Propagators> {
        self.composite(PHASES_BACK, false)
    }

    /// Composite 90-180-90 pulse on I, flanking pulses phase-shifted by +90°.
    pub fn p9018090_i_2(&mut self) -> Result<Propagators> {
        self.composite(PHASES_FORWARD, false)
    }

    /// Composite 90-240-90 pulse on I, flanking pulses phase-shifted by -90°.
    pub fn p9024090_i_1(&mut self) -> Result<Propagators> {
        self.composite(PHASES_BACK, true)
    }

    /// Composite 90-240-90 pulse on I, flanking pulses phase-shifted by +90°.
    pub fn p9024090_i_2(&mut self) -> Result<Propagators> {
        self.composite(PHASES_FORWARD, true)
    }

    /// Hard 180° pulse on S for each phase.
    pub fn p180_s(&mut self) -> Result<&Propagators> {
        let p180
            = match self.p180_s.take() {
                Some(p180) => p180,
                None => {
                    let base
                        = self.pulse_s(&[2.0 * self.pw90_s], 0.0, 1.0)?
                        .index_axis_move(nd::Axis(0), 0);
                    self.fixed.add_phases(base.view(), Spin::S)?
                },
            };
        Ok(self.p180_s.insert(p180))
    }

    fn single(p: Result<Propagators>) -> Result<Operator> {
        Ok(p?.index_axis_move(nd::Axis(0), 0))
    }

    /// Simultaneous composite 90-240-90 pulses on I (15N) and S (1H), centred
    /// on each other.
    ///
    /// The result has shape `(4, 4, replicas, n, n)`, indexed by I phase then
    /// S phase. `reverse` swaps the phase shifts of the flanking pulses.
    pub fn p9024090_nh(&self, reverse: bool) -> Result<nd::Array5<f64>> {
        let (ph_n, ph_h) = if reverse { (1.0, 3.0) } else { (3.0, 1.0) };
        let pw240i = 8.0 * self.pw90_i / 3.0;
        let pw9024090i = 14.0 * self.pw90_i / 3.0;
        let pw240s = 8.0 * self.pw90_s / 3.0;
        let pw9024090s = 14.0 * self.pw90_s / 3.0;
        let mut edges = [pw240i, pw240s, pw9024090i, pw9024090s];
        edges.sort_by(f64::total_cmp);
        let t0 = 0.5 * edges[0];
        let t1 = 0.5 * (edges[1] - edges[0]);
        let t2 = 0.5 * (edges[2] - edges[1]);
        let t3 = 0.5 * (edges[3] - edges[2]);
        let p0 = Self::single(self.pulse_is(&[2.0 * t0], 0.0, 0.0))?;
        let (p1, p2, p3)
            = if pw9024090i <= pw9024090s {
                let p1 = Self::single(self.pulse_is(&[t1], ph_n, 0.0))?;
                let p2
                    = if pw9024090i > pw240s {
                        Self::single(self.pulse_is(&[t2], ph_n, ph_h))?
                    } else {
                        Self::single(self.pulse_s(&[t2], 0.0, 1.0))?
                    };
                let p3 = Self::single(self.pulse_s(&[t3], ph_h, 1.0))?;
                (p1, p2, p3)
            } else {
                let p1 = Self::single(self.pulse_is(&[t1], 0.0, ph_h))?;
                let p2
                    = if pw9024090s > pw240i {
                        Self::single(self.pulse_is(&[t2], ph_n, ph_h))?
                    } else {
                        Self::single(self.pulse_i(&[t2], 0.0, 1.0))?
                    };
                let p3 = Self::single(self.pulse_i(&[t3], ph_n, 1.0))?;
                (p1, p2, p3)
            };
        let xx = ensemble::chain(&[
            p3.view(), p2.view(), p1.view(), p0.view(),
            p1.view(), p2.view(), p3.view(),
        ])?;
        let by_s = self.fixed.add_phases(xx.view(), Spin::S)?;
        let by_s_i: Vec<Propagators>
            = by_s.outer_iter()
            .map(|p| self.fixed.add_phases(p, Spin::I))
            .collect::<Result<_>>()?;
        let views: Vec<nd::ArrayView4<f64>>
            = by_s_i.iter().map(|p| p.view()).collect();
        Ok(nd::stack(nd::Axis(1), &views)?)
    }

    /// Ideal 90° pulse on I for each phase.
    pub fn perfect90_i(&self) -> &Propagators { self.fixed.perfect90_i() }

    /// Ideal 90° pulse on S for each phase.
    pub fn perfect90_s(&self) -> &Propagators { self.fixed.perfect90_s() }

    /// Ideal 180° pulse on I for each phase.
    pub fn perfect180_i(&self) -> &Propagators { self.fixed.perfect180_i() }

    /// Ideal 180° pulse on S for each phase.
    pub fn perfect180_s(&self) -> &Propagators { self.fixed.perfect180_s() }

    /// Precession frequencies (rad/s) of the free generator's modes, one row
    /// per replica.
    pub fn calculate_shifts(&self) -> Result<nd::Array2<f64>> {
        let generators = self.liouvillian.free_generator();
        let rows: Vec<nd::Array1<f64>>
            = generators.outer_iter()
            .map(frequencies)
            .collect::<Result<_>>()?;
        let views: Vec<nd::ArrayView1<f64>>
            = rows.iter().map(|r| r.view()).collect();
        Ok(nd::stack(nd::Axis(0), &views)?)
    }

    pub fn offsets_to_ppms(&self, offsets: &nd::Array1<f64>) -> nd::Array1<f64> {
        self.liouvillian.offsets_to_ppms(offsets)
    }

    pub fn ppms_to_offsets(&self, ppms: &nd::Array1<f64>) -> nd::Array1<f64> {
        self.liouvillian.ppms_to_offsets(ppms)
    }
}
