//! Parameter-independent operators: phase rotations, ideal pulses and the z
//! filter.
//!
//! These depend only on the basis, so they are built once per [`BasisKey`] and
//! shared through a [`PulseCache`]. All of them are closed-form: the rotation
//! generators involved (`rotz_*`, `b1x_*`) couple disjoint pairs of
//! components, so `J^3 = -J` and `exp(θJ) = I + sin(θ) J + (1 - cos(θ)) J^2`
//! holds exactly.

use std::sync::{ Arc, Mutex, MutexGuard };
use ndarray as nd;
use rustc_hash::FxHashMap as HashMap;
use crate::{
    basis::{ Basis, BasisKey },
    ensemble::{ self, Propagators },
    error::Result,
};

/// Spin addressed by a pulse.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Spin {
    I,
    S,
}

impl Spin {
    pub fn letter(self) -> char {
        match self {
            Self::I => 'i',
            Self::S => 's',
        }
    }
}

// (sin, cos) of n * π/2
const QUARTER_TURNS: [(f64, f64); 4]
    = [(0.0, 1.0), (1.0, 0.0), (0.0, -1.0), (-1.0, 0.0)];

// exp(θJ) for J with J^3 = -J
fn rotation(j: &nd::Array2<f64>, (sin, cos): (f64, f64)) -> nd::Array2<f64> {
    let n = j.nrows();
    let j2 = j.dot(j);
    nd::Array2::eye(n) + j * sin + j2 * (1.0 - cos)
}

/// Fixed operators for one basis.
#[derive(Clone, Debug)]
pub struct FixedPulses {
    phases_i: nd::Array3<f64>,
    phases_s: nd::Array3<f64>,
    perfect90_i: Propagators,
    perfect90_s: Propagators,
    perfect180_i: Propagators,
    perfect180_s: Propagators,
    zfilter: ensemble::Operator,
}

impl FixedPulses {
    /// Build all fixed operators for `basis`.
    pub fn build(basis: &Basis) -> Result<Self> {
        let phases_i = Self::phase_rotations(basis, Spin::I)?;
        let phases_s = Self::phase_rotations(basis, Spin::S)?;
        let mut pulses = Self {
            perfect90_i: nd::Array4::zeros((0, 0, 0, 0)),
            perfect90_s: nd::Array4::zeros((0, 0, 0, 0)),
            perfect180_i: Self::perfect180(basis, Spin::I)?,
            perfect180_s: Self::perfect180(basis, Spin::S)?,
            zfilter: Self::build_zfilter(basis),
            phases_i,
            phases_s,
        };
        pulses.perfect90_i = pulses.perfect90(basis, Spin::I)?;
        pulses.perfect90_s = pulses.perfect90(basis, Spin::S)?;
        Ok(pulses)
    }

    // exp(n π/2 rotz) for n = 0..4
    fn phase_rotations(basis: &Basis, spin: Spin) -> Result<nd::Array3<f64>> {
        let rotz = basis.matrix_or_zeros(&format!("rotz_{}", spin.letter()));
        let rots: Vec<nd::Array2<f64>>
            = QUARTER_TURNS.iter()
            .map(|sc| rotation(&rotz, *sc))
            .collect();
        let views: Vec<nd::ArrayView2<f64>>
            = rots.iter().map(|r| r.view()).collect();
        Ok(nd::stack(nd::Axis(0), &views)?)
    }

    // exp(b1x / 4), i.e. a π/2 rotation about x, then phased
    fn perfect90(&self, basis: &Basis, spin: Spin) -> Result<Propagators> {
        let j = basis.matrix_or_zeros(&format!("b1x_{}", spin.letter()))
            / std::f64::consts::TAU;
        let base = ensemble::single(rotation(&j, QUARTER_TURNS[1]));
        self.add_phases(base.view(), spin)
    }

    // sign flips of the components orthogonal to the rotation axis, phases
    // (x, y, -x, -y)
    fn perfect180(basis: &Basis, spin: Spin) -> Result<Propagators> {
        let n = basis.size();
        let l = spin.letter();
        let (cx, cy, cz) = (format!("{}x", l), format!("{}y", l), format!("{}z", l));
        let mut about_x: nd::Array2<f64> = nd::Array2::eye(n);
        let mut about_y: nd::Array2<f64> = nd::Array2::eye(n);
        for comp in basis.components() {
            let Some(v) = basis.vector(comp) else { continue; };
            let flip = nd::Array2::from_diag(v) * 2.0;
            if comp.contains(&cx) || comp.contains(&cz) { about_y -= &flip; }
            if comp.contains(&cy) || comp.contains(&cz) { about_x -= &flip; }
        }
        let views = [about_x.view(), about_y.view(), about_x.view(), about_y.view()];
        Ok(nd::stack(nd::Axis(0), &views)?.insert_axis(nd::Axis(1)))
    }

    fn build_zfilter(basis: &Basis) -> ensemble::Operator {
        let mask: nd::Array1<f64>
            = ["ie", "se", "iz", "sz", "2izsz"].into_iter()
            .filter_map(|comp| basis.vector(comp))
            .fold(nd::Array1::zeros(basis.size()), |acc, v| acc + v);
        ensemble::single(nd::Array2::from_diag(&mask))
    }

    /// Phase rotations `exp(n·π/2·rotz)`, `n = 0..4`, shape `(4, n, n)`.
    pub fn phases(&self, spin: Spin) -> &nd::Array3<f64> {
        match spin {
            Spin::I => &self.phases_i,
            Spin::S => &self.phases_s,
        }
    }

    /// Conjugate an operator stack by each phase rotation, giving
    /// `phase[k] · op · phase[-k]` with shape `(4, replicas, n, n)`.
    pub fn add_phases(&self, op: nd::ArrayView3<f64>, spin: Spin)
        -> Result<Propagators>
    {
        let phases = self.phases(spin);
        let phased: Vec<ensemble::Operator>
            = (0..4)
            .map(|k| {
                let fwd = phases.slice(nd::s![k..k + 1, .., ..]);
                let bwd = (4 - k) % 4;
                let bwd = phases.slice(nd::s![bwd..bwd + 1, .., ..]);
                ensemble::chain(&[fwd, op.view(), bwd])
            })
            .collect::<Result<_>>()?;
        let views: Vec<nd::ArrayView3<f64>>
            = phased.iter().map(|p| p.view()).collect();
        Ok(nd::stack(nd::Axis(0), &views)?)
    }

    /// Ideal 90° pulse on I for each of the four phases.
    pub fn perfect90_i(&self) -> &Propagators { &self.perfect90_i }

    /// Ideal 90° pulse on S for each of the four phases.
    pub fn perfect90_s(&self) -> &Propagators { &self.perfect90_s }

    /// Ideal 180° pulse on I for each of the four phases.
    pub fn perfect180_i(&self) -> &Propagators { &self.perfect180_i }

    /// Ideal 180° pulse on S for each of the four phases.
    pub fn perfect180_s(&self) -> &Propagators { &self.perfect180_s }

    /// Projector onto the longitudinal components present in the basis.
    pub fn zfilter(&self) -> &ensemble::Operator { &self.zfilter }
}

/// Memoizes [`FixedPulses`] by basis key; cloning yields a handle to the same
/// storage.
#[derive(Clone, Debug, Default)]
pub struct PulseCache {
    inner: Arc<Mutex<HashMap<BasisKey, Arc<FixedPulses>>>>,
}

impl PulseCache {
    pub fn new() -> Self { Self::default() }

    /// Get the fixed pulses for `basis`, building them on first request.
    pub fn get(&self, basis: &Basis) -> Result<Arc<FixedPulses>> {
        let key = basis.key();
        if let Some(pulses) = self.lock().get(&key) {
            return Ok(Arc::clone(pulses));
        }
        log::debug!("building fixed pulses for {}", key.name());
        let pulses = Arc::new(FixedPulses::build(basis)?);
        Ok(Arc::clone(self.lock().entry(key).or_insert(pulses)))
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn clear(&self) { self.lock().clear(); }

    fn lock(&self) -> MutexGuard<'_, HashMap<BasisKey, Arc<FixedPulses>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::basis::Topology;

    fn basis() -> Basis {
        Basis::build(BasisKey::new(Topology::Ixyz, 2)).unwrap()
    }

    fn act(p: &Propagators, k: usize, basis: &Basis, comp: &str)
        -> nd::Array1<f64>
    {
        let m: nd::ArrayView2<f64> = p.slice(nd::s![k, 0, .., ..]);
        m.dot(basis.vector(comp).unwrap())
    }

    #[test]
    fn perfect180_flips() {
        let b = basis();
        let fixed = FixedPulses::build(&b).unwrap();
        let p = fixed.perfect180_i();
        assert_eq!(p.shape(), &[4, 1, 6, 6]);
        // about x: z -> -z, x unchanged
        assert_eq!(act(p, 0, &b, "iz_a"), -b.vector("iz_a").unwrap());
        assert_eq!(&act(p, 0, &b, "ix_b"), b.vector("ix_b").unwrap());
        // about y: x -> -x
        assert_eq!(act(p, 1, &b, "ix_a"), -b.vector("ix_a").unwrap());
        assert_eq!(&act(p, 1, &b, "iy_a"), b.vector("iy_a").unwrap());
    }

    #[test]
    fn perfect90_rotates_z_into_transverse_plane() {
        let b = basis();
        let fixed = FixedPulses::build(&b).unwrap();
        let p = fixed.perfect90_i();
        let iz = b.vector("iz_a").unwrap();
        // phase x sends z to ±y, phase y sends it to ±x
        let after_x = act(p, 0, &b, "iz_a");
        assert_abs_diff_eq!(after_x.dot(iz), 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(
            after_x.dot(b.vector("iy_a").unwrap()).abs(), 1.0, epsilon = 1e-15);
        let after_y = act(p, 1, &b, "iz_a");
        assert_abs_diff_eq!(
            after_y.dot(b.vector("ix_a").unwrap()).abs(), 1.0, epsilon = 1e-15);
        // opposite phases rotate the opposite way
        let after_mx = act(p, 2, &b, "iz_a");
        after_x.iter().zip(after_mx.iter())
            .for_each(|(a, b)| assert_abs_diff_eq!(*a, -*b, epsilon = 1e-15));
    }

    #[test]
    fn full_phase_cycle_is_identity() {
        let b = basis();
        let fixed = FixedPulses::build(&b).unwrap();
        let ph = fixed.phases(Spin::I);
        let full = ph.index_axis(nd::Axis(0), 1).dot(&ph.index_axis(nd::Axis(0), 3));
        full.iter().zip(nd::Array2::<f64>::eye(6).iter())
            .for_each(|(a, b)| assert_abs_diff_eq!(*a, *b, epsilon = 1e-15));
    }

    #[test]
    fn zfilter_keeps_longitudinal() {
        let b = basis();
        let fixed = FixedPulses::build(&b).unwrap();
        let z = fixed.zfilter().index_axis(nd::Axis(0), 0).to_owned();
        assert_eq!(z.diag().sum(), 2.0);
        assert_eq!(&z.dot(b.vector("iz").unwrap()), b.vector("iz").unwrap());
    }

    #[test]
    fn cache_shares() {
        let cache = PulseCache::new();
        let b = basis();
        let p1 = cache.get(&b).unwrap();
        let p2 = cache.get(&b).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(cache.len(), 1);
    }
}
