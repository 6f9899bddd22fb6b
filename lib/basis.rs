//! Operator bases for one- and two-spin systems and the superoperator matrices
//! describing every physical interaction within them.
//!
//! A basis is fixed by a [`BasisKey`]: a [`Topology`] naming the Cartesian and
//! product operators that are tracked, an [`Extension`], the [`SpinSystem`]
//! letters identifying the nuclei, and the number of exchanging states. Every
//! component is replicated once per state, so a basis of `n` components and
//! `m` states acts on vectors of length `n * m`, state-major.
//!
//! Matrix and vector names are resolved to fixed indices once at construction.
//! Names follow the parameter vocabulary, e.g. `r2_i_a`, `cs_i_b`, `kab`.

use std::{
    fmt,
    str::FromStr,
    sync::{ Arc, Mutex },
};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{ self as nd, linalg::kron };
use rustc_hash::FxHashMap as HashMap;
use crate::{
    constants::Nucleus,
    error::{ Error, Result },
};

/// Letters labelling the exchanging states, in order.
pub const STATE_NAMES: [char; 4] = ['a', 'b', 'c', 'd'];

/* Topologies *****************************************************************/

/// The set of operators tracked for a spin system.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Ixy,
    Iz,
    Izsz,
    IzEq,
    Ixyz,
    IxyzEq,
    Ixysxy,
    IxyIxysxy,
    Ixyzsz,
    IxyzszDiff,
    IxyzszEq,
    Ixyzsxyz,
    IxyzsxyzEq,
}

const IXYZSXYZ: [&str; 15] = [
    "ix", "iy", "iz", "sx", "sy", "sz",
    "2ixsz", "2iysz", "2izsx", "2izsy",
    "2ixsx", "2ixsy", "2iysx", "2iysy",
    "2izsz",
];

const IXYZSXYZ_EQ: [&str; 17] = [
    "ie", "se",
    "ix", "iy", "iz", "sx", "sy", "sz",
    "2ixsz", "2iysz", "2izsx", "2izsy",
    "2ixsx", "2ixsy", "2iysx", "2iysy",
    "2izsz",
];

impl Topology {
    /// Every topology, in table order.
    pub const ALL: [Self; 13] = [
        Self::Ixy,
        Self::Iz,
        Self::Izsz,
        Self::IzEq,
        Self::Ixyz,
        Self::IxyzEq,
        Self::Ixysxy,
        Self::IxyIxysxy,
        Self::Ixyzsz,
        Self::IxyzszDiff,
        Self::IxyzszEq,
        Self::Ixyzsxyz,
        Self::IxyzsxyzEq,
    ];

    /// String identifier.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ixy        => "ixy",
            Self::Iz         => "iz",
            Self::Izsz       => "izsz",
            Self::IzEq       => "iz_eq",
            Self::Ixyz       => "ixyz",
            Self::IxyzEq     => "ixyz_eq",
            Self::Ixysxy     => "ixysxy",
            Self::IxyIxysxy  => "ixy_ixysxy",
            Self::Ixyzsz     => "ixyzsz",
            Self::IxyzszDiff => "ixyzsz_diff",
            Self::IxyzszEq   => "ixyzsz_eq",
            Self::Ixyzsxyz   => "ixyzsxyz",
            Self::IxyzsxyzEq => "ixyzsxyz_eq",
        }
    }

    /// Ordered component names for a single state.
    pub fn components(self) -> &'static [&'static str] {
        match self {
            Self::Ixy => &["ix", "iy"],
            Self::Iz => &["iz"],
            Self::Izsz => &["iz", "2izsz"],
            Self::IzEq => &["ie", "iz"],
            Self::Ixyz => &["ix", "iy", "iz"],
            Self::IxyzEq => &["ie", "ix", "iy", "iz"],
            Self::Ixysxy => &["2ixsx", "2ixsy", "2iysx", "2iysy"],
            Self::IxyIxysxy
                => &["ix", "iy", "2ixsx", "2ixsy", "2iysx", "2iysy"],
            Self::Ixyzsz | Self::IxyzszDiff
                => &["ix", "iy", "iz", "2ixsz", "2iysz", "2izsz"],
            Self::IxyzszEq
                => &["ie", "ix", "iy", "iz", "2ixsz", "2iysz", "2izsz"],
            Self::Ixyzsxyz => &IXYZSXYZ,
            Self::IxyzsxyzEq => &IXYZSXYZ_EQ,
        }
    }

    /// Return `true` if gradient-diffusion terms are part of the basis.
    pub fn has_diffusion(self) -> bool { matches!(self, Self::IxyzszDiff) }
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::UnknownTopology(s.to_string()))
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Multiple-quantum extension of a basis.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Extension {
    #[default]
    None,
    Dq,
    Tq,
}

impl Extension {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Dq => "dq",
            Self::Tq => "tq",
        }
    }
}

impl FromStr for Extension {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::None),
            "dq" => Ok(Self::Dq),
            "tq" => Ok(Self::Tq),
            _ => Err(Error::UnknownExtension(s.to_string())),
        }
    }
}

/// Spin-pair letters: the first letter names the I nucleus, the second the S
/// nucleus.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SpinSystem {
    #[default]
    None,
    HN,
    HC,
    NH,
    CH,
    CN,
}

impl SpinSystem {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "",
            Self::HN => "hn",
            Self::HC => "hc",
            Self::NH => "nh",
            Self::CH => "ch",
            Self::CN => "cn",
        }
    }

    /// Nuclei of the I and S spins.
    pub fn nuclei(self) -> Option<(Nucleus, Nucleus)> {
        let mut letters = self.name().chars();
        let i = Nucleus::from_letter(letters.next()?)?;
        let s = Nucleus::from_letter(letters.next()?)?;
        Some((i, s))
    }
}

impl FromStr for SpinSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::None),
            "hn" => Ok(Self::HN),
            "hc" => Ok(Self::HC),
            "nh" => Ok(Self::NH),
            "ch" => Ok(Self::CH),
            "cn" => Ok(Self::CN),
            _ => Err(Error::UnknownSpinSystem(s.to_string())),
        }
    }
}

/// Everything a [`Basis`] depends on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BasisKey {
    pub topology: Topology,
    pub extension: Extension,
    pub spin_system: SpinSystem,
    pub n_states: usize,
}

impl BasisKey {
    /// Create a new key with no extension and no spin-system letters.
    pub fn new(topology: Topology, n_states: usize) -> Self {
        Self {
            topology,
            extension: Extension::None,
            spin_system: SpinSystem::None,
            n_states,
        }
    }

    /// Parse a key from its string identifiers.
    pub fn parse(
        topology: &str,
        extension: &str,
        spin_system: &str,
        n_states: usize,
    ) -> Result<Self>
    {
        let key = Self {
            topology: topology.parse()?,
            extension: extension.parse()?,
            spin_system: spin_system.parse()?,
            n_states,
        };
        key.validate()?;
        Ok(key)
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    pub fn with_spin_system(mut self, spin_system: SpinSystem) -> Self {
        self.spin_system = spin_system;
        self
    }

    /// Check the exchange-state count.
    pub fn validate(&self) -> Result<()> {
        if (1..=STATE_NAMES.len()).contains(&self.n_states) {
            Ok(())
        } else {
            Err(Error::StateCount(self.n_states))
        }
    }

    /// Dotted name, `topology.extension.spin_system`.
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.topology.name(),
            self.extension.name(),
            self.spin_system.name(),
        )
    }
}

/* Transition table ***********************************************************/

const TAU: f64 = std::f64::consts::TAU;
const PI: f64 = std::f64::consts::PI;

// (row component, column component, coefficient): `d(row)/dt += coeff * col`
type Transition = (&'static str, &'static str, f64);

struct Rule {
    name: &'static str,
    per_state: bool,
    entries: &'static [Transition],
}

// in-phase and antiphase rotations about z used by cs_i, rotz_i, carrier_i ...
const ROT_I: [Transition; 8] = [
    ("ix", "iy", -1.0),
    ("iy", "ix", 1.0),
    ("2ixsx", "2iysx", -1.0),
    ("2iysx", "2ixsx", 1.0),
    ("2ixsy", "2iysy", -1.0),
    ("2iysy", "2ixsy", 1.0),
    ("2ixsz", "2iysz", -1.0),
    ("2iysz", "2ixsz", 1.0),
];

const ROT_S: [Transition; 8] = [
    ("sx", "sy", -1.0),
    ("sy", "sx", 1.0),
    ("2ixsx", "2ixsy", -1.0),
    ("2ixsy", "2ixsx", 1.0),
    ("2iysx", "2iysy", -1.0),
    ("2iysy", "2iysx", 1.0),
    ("2izsx", "2izsy", -1.0),
    ("2izsy", "2izsx", 1.0),
];

const fn scaled<const N: usize>(rot: [Transition; N], by: f64)
    -> [Transition; N]
{
    let mut out = rot;
    let mut k = 0;
    while k < N {
        out[k].2 = rot[k].2 * by;
        k += 1;
    }
    out
}

const CARRIER_I: [Transition; 8] = scaled(ROT_I, -1.0);
const CARRIER_S: [Transition; 8] = scaled(ROT_S, -1.0);
const OFFSET_I: [Transition; 8] = scaled(ROT_I, -TAU);
const OFFSET_S: [Transition; 8] = scaled(ROT_S, -TAU);
const JEFF_I: [Transition; 8] = scaled(ROT_I, TAU);

static RULES: &[Rule] = &[
    Rule {
        name: "r2_i",
        per_state: true,
        entries: &[("ix", "ix", -1.0), ("iy", "iy", -1.0)],
    },
    Rule {
        name: "r2_s",
        per_state: true,
        entries: &[("sx", "sx", -1.0), ("sy", "sy", -1.0)],
    },
    Rule {
        name: "r1_i",
        per_state: true,
        entries: &[("iz", "iz", -1.0), ("iz", "ie", 1.0)],
    },
    Rule {
        name: "r1_s",
        per_state: true,
        entries: &[("sz", "sz", -1.0), ("sz", "se", 1.0)],
    },
    Rule {
        name: "r2a_i",
        per_state: true,
        entries: &[("2ixsz", "2ixsz", -1.0), ("2iysz", "2iysz", -1.0)],
    },
    Rule {
        name: "r2a_s",
        per_state: true,
        entries: &[("2izsx", "2izsx", -1.0), ("2izsy", "2izsy", -1.0)],
    },
    Rule {
        name: "r2mq_is",
        per_state: true,
        entries: &[
            ("2ixsx", "2ixsx", -1.0),
            ("2ixsy", "2ixsy", -1.0),
            ("2iysx", "2iysx", -1.0),
            ("2iysy", "2iysy", -1.0),
        ],
    },
    Rule {
        name: "r1a_is",
        per_state: true,
        entries: &[("2izsz", "2izsz", -1.0)],
    },
    Rule {
        name: "etaxy_i",
        per_state: true,
        entries: &[
            ("ix", "2ixsz", -1.0),
            ("iy", "2iysz", -1.0),
            ("2ixsz", "ix", -1.0),
            ("2iysz", "iy", -1.0),
        ],
    },
    Rule {
        name: "etaxy_s",
        per_state: true,
        entries: &[
            ("sx", "2izsx", -1.0),
            ("sy", "2izsy", -1.0),
            ("2izsx", "sx", -1.0),
            ("2izsy", "sy", -1.0),
        ],
    },
    Rule {
        name: "etaz_i",
        per_state: true,
        entries: &[
            ("iz", "2izsz", -1.0),
            ("2izsz", "iz", -1.0),
            ("2izsz", "ie", 1.0),
        ],
    },
    Rule {
        name: "etaz_s",
        per_state: true,
        entries: &[
            ("sz", "2izsz", -1.0),
            ("2izsz", "sz", -1.0),
            ("2izsz", "se", 1.0),
        ],
    },
    Rule {
        name: "sigma_is",
        per_state: true,
        entries: &[
            ("iz", "sz", -1.0),
            ("sz", "iz", -1.0),
            ("sz", "ie", 1.0),
            ("iz", "se", 1.0),
        ],
    },
    Rule {
        name: "mu_is",
        per_state: true,
        entries: &[
            ("2ixsx", "2iysy", 1.0),
            ("2ixsy", "2iysx", -1.0),
            ("2iysx", "2ixsy", -1.0),
            ("2iysy", "2ixsx", 1.0),
        ],
    },
    Rule { name: "rotz_i", per_state: false, entries: &ROT_I },
    Rule { name: "rotz_s", per_state: false, entries: &ROT_S },
    Rule { name: "cs_i", per_state: true, entries: &ROT_I },
    Rule { name: "cs_s", per_state: true, entries: &ROT_S },
    Rule { name: "carrier_i", per_state: false, entries: &CARRIER_I },
    Rule { name: "carrier_s", per_state: false, entries: &CARRIER_S },
    Rule { name: "offset_i", per_state: false, entries: &OFFSET_I },
    Rule { name: "offset_s", per_state: false, entries: &OFFSET_S },
    Rule { name: "jeff_i", per_state: false, entries: &JEFF_I },
    Rule {
        name: "j_is",
        per_state: true,
        entries: &[
            ("ix", "2iysz", -PI),
            ("2iysz", "ix", PI),
            ("2ixsz", "iy", -PI),
            ("iy", "2ixsz", PI),
            ("sx", "2izsy", -PI),
            ("2izsy", "sx", PI),
            ("2izsx", "sy", -PI),
            ("sy", "2izsx", PI),
        ],
    },
    Rule {
        name: "d",
        per_state: true,
        entries: &[
            ("ix", "ix", -1.0),
            ("iy", "iy", -1.0),
            ("iz", "iz", -1.0),
            ("sx", "sx", -1.0),
            ("sy", "sy", -1.0),
            ("sz", "sz", -1.0),
            ("2ixsz", "2ixsz", -1.0),
            ("2iysz", "2iysz", -1.0),
            ("2izsx", "2izsx", -1.0),
            ("2izsy", "2izsy", -1.0),
            ("2ixsx", "2ixsx", -1.0),
            ("2ixsy", "2ixsy", -1.0),
            ("2iysx", "2iysx", -1.0),
            ("2iysy", "2iysy", -1.0),
            ("2izsz", "2izsz", -1.0),
        ],
    },
    Rule {
        name: "b1x_i",
        per_state: false,
        entries: &[
            ("iy", "iz", -TAU),
            ("iz", "iy", TAU),
            ("2iysx", "2izsx", -TAU),
            ("2izsx", "2iysx", TAU),
            ("2iysy", "2izsy", -TAU),
            ("2izsy", "2iysy", TAU),
            ("2iysz", "2izsz", -TAU),
            ("2izsz", "2iysz", TAU),
        ],
    },
    Rule {
        name: "b1y_i",
        per_state: false,
        entries: &[
            ("iz", "ix", -TAU),
            ("ix", "iz", TAU),
            ("2izsx", "2ixsx", -TAU),
            ("2ixsx", "2izsx", TAU),
            ("2izsy", "2ixsy", -TAU),
            ("2ixsy", "2izsy", TAU),
            ("2izsz", "2ixsz", -TAU),
            ("2ixsz", "2izsz", TAU),
        ],
    },
    Rule {
        name: "b1x_s",
        per_state: false,
        entries: &[
            ("sy", "sz", -TAU),
            ("sz", "sy", TAU),
            ("2ixsy", "2ixsz", -TAU),
            ("2ixsz", "2ixsy", TAU),
            ("2iysy", "2iysz", -TAU),
            ("2iysz", "2iysy", TAU),
            ("2izsy", "2izsz", -TAU),
            ("2izsz", "2izsy", TAU),
        ],
    },
    Rule {
        name: "b1y_s",
        per_state: false,
        entries: &[
            ("sz", "sx", -TAU),
            ("sx", "sz", TAU),
            ("2ixsz", "2ixsx", -TAU),
            ("2ixsx", "2ixsz", TAU),
            ("2iysz", "2iysx", -TAU),
            ("2iysx", "2iysz", TAU),
            ("2izsz", "2izsx", -TAU),
            ("2izsx", "2izsz", TAU),
        ],
    },
];

/* Basis **********************************************************************/

/// Superoperator matrices and projection vectors for a particular
/// [`BasisKey`].
///
/// Matrices are stored as one dense stack indexed by name; vectors are unit
/// projections onto a single `{component}_{state}` or, under the bare component
/// name, the sum over states.
#[derive(Clone, Debug)]
pub struct Basis {
    key: BasisKey,
    names: IndexMap<String, usize>,
    matrices: nd::Array3<f64>,
    vectors: IndexMap<String, nd::Array1<f64>>,
}

impl Basis {
    /// Build the basis described by `key`.
    ///
    /// Interactions whose components are all absent from the topology are
    /// omitted rather than reported.
    pub fn build(key: BasisKey) -> Result<Self> {
        key.validate()?;
        log::debug!(
            "building basis {} with {} state(s)", key.name(), key.n_states);
        let components = key.topology.components();
        let n_comp = components.len();
        let size = n_comp * key.n_states;
        let states = &STATE_NAMES[..key.n_states];
        let index_of = |c: &str| components.iter().position(|x| *x == c);

        let mut names: IndexMap<String, usize> = IndexMap::new();
        let mut mats: Vec<nd::Array2<f64>> = Vec::new();

        for pair in states.iter().enumerate().permutations(2) {
            let (i1, s1) = pair[0];
            let (i2, s2) = pair[1];
            let mut k: nd::Array2<f64>
                = nd::Array2::zeros((key.n_states, key.n_states));
            k[[i1, i1]] = -1.0;
            k[[i2, i1]] = 1.0;
            names.insert(format!("k{}{}", s1, s2), mats.len());
            mats.push(kron(&k, &nd::Array2::eye(n_comp)));
        }

        let rules
            = RULES.iter()
            .filter(|rule| rule.name != "d" || key.topology.has_diffusion());
        for (rule, (k, state)) in rules.cartesian_product(states.iter().enumerate()) {
            let offset = k * n_comp;
            let entries: Vec<(usize, usize, f64)>
                = rule.entries.iter()
                .filter_map(|(row, col, value)| {
                    Some((index_of(row)? + offset, index_of(col)? + offset, *value))
                })
                .collect();
            if entries.is_empty() { continue; }
            let name
                = if rule.per_state {
                    format!("{}_{}", rule.name, state)
                } else {
                    rule.name.to_string()
                };
            let idx
                = *names.entry(name)
                .or_insert_with(|| {
                    mats.push(nd::Array2::zeros((size, size)));
                    mats.len() - 1
                });
            for (row, col, value) in entries {
                mats[idx][[row, col]] = value;
            }
        }

        let matrices: nd::Array3<f64>
            = if mats.is_empty() {
                nd::Array3::zeros((0, size, size))
            } else {
                let views: Vec<nd::ArrayView2<f64>>
                    = mats.iter().map(|m| m.view()).collect();
                nd::stack(nd::Axis(0), &views)?
            };

        let mut vectors: IndexMap<String, nd::Array1<f64>> = IndexMap::new();
        for ((k, state), (j, comp)) in states.iter().enumerate()
            .cartesian_product(components.iter().enumerate())
        {
            let mut unit: nd::Array1<f64> = nd::Array1::zeros(size);
            unit[k * n_comp + j] = 1.0;
            *vectors.entry(comp.to_string())
                .or_insert_with(|| nd::Array1::zeros(size)) += &unit;
            vectors.insert(format!("{}_{}", comp, state), unit);
        }

        Ok(Self { key, names, matrices, vectors })
    }

    /// Return the key the basis was built from.
    pub fn key(&self) -> BasisKey { self.key }

    pub fn topology(&self) -> Topology { self.key.topology }

    /// Component names for a single state.
    pub fn components(&self) -> &'static [&'static str] {
        self.key.topology.components()
    }

    /// Number of components per state.
    pub fn len(&self) -> usize { self.components().len() }

    pub fn is_empty(&self) -> bool { self.components().is_empty() }

    pub fn n_states(&self) -> usize { self.key.n_states }

    /// State letters in use.
    pub fn states(&self) -> &'static [char] { &STATE_NAMES[..self.key.n_states] }

    /// Dimension of the full Liouville-space representation.
    pub fn size(&self) -> usize { self.len() * self.key.n_states }

    /// Names of all matrices, in stack order.
    pub fn matrix_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.keys().map(|s| s.as_str())
    }

    /// Index of a named matrix in [`Self::matrices`].
    pub fn matrix_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// The full matrix stack, shape `(n_names, size, size)`.
    pub fn matrices(&self) -> &nd::Array3<f64> { &self.matrices }

    /// Get a single matrix by name.
    pub fn matrix(&self, name: &str) -> Option<nd::ArrayView2<'_, f64>> {
        self.matrix_index(name)
            .map(|k| self.matrices.index_axis(nd::Axis(0), k))
    }

    /// Get a matrix by name, or a zero matrix if it is absent from the basis.
    pub fn matrix_or_zeros(&self, name: &str) -> nd::Array2<f64> {
        self.matrix(name)
            .map(|m| m.to_owned())
            .unwrap_or_else(|| nd::Array2::zeros((self.size(), self.size())))
    }

    /// Get a projection vector by name.
    pub fn vector(&self, name: &str) -> Option<&nd::Array1<f64>> {
        self.vectors.get(name)
    }

    /// All projection vectors, keyed by name.
    pub fn vectors(&self) -> &IndexMap<String, nd::Array1<f64>> {
        &self.vectors
    }

    /// Nuclei of the spins present in the topology, keyed by spin letter.
    pub fn atoms(&self) -> Vec<(char, Nucleus)> {
        let Some((i, s)) = self.key.spin_system.nuclei() else {
            return Vec::new();
        };
        let topology = self.key.topology.name();
        [('i', i), ('s', s)].into_iter()
            .filter(|(letter, _)| topology.contains(*letter))
            .collect()
    }

    /// Every parameter name the basis consumes: all matrix names plus the
    /// state populations.
    pub fn required_names(&self) -> Vec<String> {
        self.names.keys().cloned()
            .chain(self.states().iter().map(|s| format!("p{}", s)))
            .collect()
    }
}

/* Cache **********************************************************************/

/// Memoizes bases by key; cloning yields a handle to the same storage.
#[derive(Clone, Debug, Default)]
pub struct BasisCache {
    inner: Arc<Mutex<HashMap<BasisKey, Arc<Basis>>>>,
}

impl BasisCache {
    pub fn new() -> Self { Self::default() }

    /// Get the basis for `key`, building it on first request.
    ///
    /// The lock is not held while building, so concurrent first requests may
    /// build the same basis twice; only one copy is kept.
    pub fn get(&self, key: BasisKey) -> Result<Arc<Basis>> {
        if let Some(basis) = self.lock().get(&key) {
            return Ok(Arc::clone(basis));
        }
        let basis = Arc::new(Basis::build(key)?);
        Ok(Arc::clone(self.lock().entry(key).or_insert(basis)))
    }

    /// Number of distinct bases held.
    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn clear(&self) { self.lock().clear(); }

    fn lock(&self)
        -> std::sync::MutexGuard<'_, HashMap<BasisKey, Arc<Basis>>>
    {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(topology: Topology, n_states: usize) -> Basis {
        Basis::build(BasisKey::new(topology, n_states)).unwrap()
    }

    #[test]
    fn sizes() {
        let b = basis(Topology::Ixyz, 2);
        assert_eq!(b.len(), 3);
        assert_eq!(b.size(), 6);
        assert_eq!(b.matrices().shape(), &[b.matrix_names().count(), 6, 6]);
        assert_eq!(basis(Topology::IxyzsxyzEq, 3).size(), 51);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            "ixyzw".parse::<Topology>(), Err(Error::UnknownTopology(_))));
        assert!(matches!(
            Basis::build(BasisKey::new(Topology::Ixyz, 0)),
            Err(Error::StateCount(0)),
        ));
        assert!(matches!(
            Basis::build(BasisKey::new(Topology::Ixyz, 5)),
            Err(Error::StateCount(5)),
        ));
        assert!(BasisKey::parse("ixyz", "qq", "", 2).is_err());
        assert!(BasisKey::parse("ixyz", "", "xy", 2).is_err());
    }

    #[test]
    fn exchange_matrix_conserves_magnetization() {
        let b = basis(Topology::Ixyz, 2);
        let kab = b.matrix("kab").unwrap();
        // columns sum to zero: what leaves state a arrives in state b
        for col in kab.columns() {
            assert_eq!(col.sum(), 0.0);
        }
        let iz_a = b.vector("iz_a").unwrap();
        let iz_b = b.vector("iz_b").unwrap();
        let flow = kab.dot(iz_a);
        assert_eq!(flow.dot(iz_a), -1.0);
        assert_eq!(flow.dot(iz_b), 1.0);
        assert!(b.matrix("kba").is_some());
        assert!(b.matrix("kaa").is_none());
    }

    #[test]
    fn state_independent_terms_fill_all_blocks() {
        let b = basis(Topology::Ixyz, 3);
        let carrier = b.matrix("carrier_i").unwrap();
        for state in b.states() {
            let ix = b.vector(&format!("ix_{}", state)).unwrap();
            let iy = b.vector(&format!("iy_{}", state)).unwrap();
            assert_eq!(iy.dot(&carrier.dot(ix)), -1.0);
        }
        let cs_b = b.matrix("cs_i_b").unwrap();
        let ix_a = b.vector("ix_a").unwrap();
        assert_eq!(cs_b.dot(ix_a).sum(), 0.0);
    }

    #[test]
    fn absent_terms_are_omitted() {
        let b = basis(Topology::Ixyz, 1);
        assert!(b.matrix("r2_s_a").is_none());
        assert!(b.matrix("j_is_a").is_none());
        assert!(b.matrix("d_a").is_none());
        assert!(basis(Topology::IxyzszDiff, 1).matrix("d_a").is_some());
        assert!(basis(Topology::Ixyzsz, 1).matrix("d_a").is_none());
    }

    #[test]
    fn summed_vectors() {
        let b = basis(Topology::Ixyz, 2);
        let iz = b.vector("iz").unwrap();
        assert_eq!(iz.sum(), 2.0);
        assert_eq!(iz, &(b.vector("iz_a").unwrap() + b.vector("iz_b").unwrap()));
    }

    #[test]
    fn atoms_follow_topology() {
        let key = BasisKey::new(Topology::Ixyz, 1)
            .with_spin_system(SpinSystem::NH);
        let b = Basis::build(key).unwrap();
        assert_eq!(b.atoms(), vec![('i', Nucleus::N15)]);
        let key = BasisKey::new(Topology::Ixyzsz, 1)
            .with_spin_system(SpinSystem::NH);
        let b = Basis::build(key).unwrap();
        assert_eq!(b.atoms(), vec![('i', Nucleus::N15), ('s', Nucleus::H1)]);
    }

    #[test]
    fn required_names_include_populations() {
        let names = basis(Topology::Ixyz, 2).required_names();
        assert!(names.iter().any(|n| n == "pa"));
        assert!(names.iter().any(|n| n == "pb"));
        assert!(names.iter().any(|n| n == "r2_i_b"));
    }

    #[test]
    fn cache_returns_shared_instances() {
        let cache = BasisCache::new();
        let key = BasisKey::new(Topology::Ixyz, 2);
        let b1 = cache.get(key).unwrap();
        let b2 = cache.get(key).unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(cache.len(), 1);
        cache.get(BasisKey::new(Topology::Ixyz, 3)).unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
