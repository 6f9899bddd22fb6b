//! Conversion of fitted exchange parameters into basis parameter names.

use crate::liouvillian::ParValues;

/// Two-site exchange A <-> B described by the total rate and the minor
/// population.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TwoStateExchange {
    /// `kab + kba` (s^-1).
    pub kex_ab: f64,
    /// Population of state B.
    pub pb: f64,
}

impl TwoStateExchange {
    pub fn new(kex_ab: f64, pb: f64) -> Self { Self { kex_ab, pb } }

    /// Population of state A.
    pub fn pa(&self) -> f64 { 1.0 - self.pb }

    /// Forward rate A -> B.
    pub fn kab(&self) -> f64 { self.kex_ab * self.pb }

    /// Backward rate B -> A.
    pub fn kba(&self) -> f64 { self.kex_ab * self.pa() }

    /// Write `pa`, `pb`, `kab` and `kba` into `par_values`.
    pub fn write(&self, par_values: &mut ParValues) {
        par_values.insert("pa".into(), self.pa());
        par_values.insert("pb".into(), self.pb);
        par_values.insert("kab".into(), self.kab());
        par_values.insert("kba".into(), self.kba());
    }

    /// Set `cs_i_b = cs_i_a + dw_i_ab` (ppm); a missing `cs_i_a` counts as 0.
    pub fn write_shift(par_values: &mut ParValues, dw_i_ab: f64) {
        let cs_a = par_values.get("cs_i_a").copied().unwrap_or(0.0);
        par_values.insert("cs_i_b".into(), cs_a + dw_i_ab);
    }
}
