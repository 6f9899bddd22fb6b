//! Content-keyed memoization of eigendecompositions and the bundle of caches an
//! engine instance draws from.

use std::{
    fmt,
    hash::{ Hash, Hasher },
    sync::{ Arc, Mutex },
};
use indexmap::IndexMap;
use ndarray as nd;
use rustc_hash::FxHasher;
use crate::{
    basis::BasisCache,
    config::Config,
    error::Result,
    propagator::Eigen,
    pulses::PulseCache,
};

/// Fingerprint of a matrix: its shape and the bit pattern of every element.
pub fn fingerprint(matrix: nd::ArrayView2<f64>) -> u64 {
    let mut hasher = FxHasher::default();
    matrix.shape().hash(&mut hasher);
    matrix.iter().for_each(|x| x.to_bits().hash(&mut hasher));
    hasher.finish()
}

fn bitwise_eq(a: nd::ArrayView2<f64>, b: nd::ArrayView2<f64>) -> bool {
    a.shape() == b.shape()
        && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
}

#[derive(Clone, Debug)]
struct Entry {
    generator: nd::Array2<f64>,
    eigen: Arc<Eigen>,
}

/// Counters describing cache performance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub collisions: usize,
    pub evictions: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache; zero before any lookup.
    ///
    /// Collisions are already included in `misses`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits: {}, misses: {}, collisions: {}, evictions: {}, \
            size: {}/{}, hit rate: {:.1}%",
            self.hits,
            self.misses,
            self.collisions,
            self.evictions,
            self.size,
            self.capacity,
            100.0 * self.hit_rate(),
        )
    }
}

/// Least-recently-used store of eigendecompositions keyed by generator
/// content.
///
/// Every entry keeps a copy of its generator. A lookup whose fingerprint
/// matches but whose content differs is counted as a collision and recomputed,
/// so the cache never changes results.
///
/// Lookup and insertion are separate steps so that a shared cache can be
/// unlocked while a decomposition is computed.
#[derive(Clone, Debug)]
pub struct PropagatorCache {
    capacity: usize,
    entries: IndexMap<u64, Entry>,
    hits: usize,
    misses: usize,
    collisions: usize,
    evictions: usize,
}

/// A [`PropagatorCache`] shared between spectrometers or threads.
pub type SharedPropagatorCache = Arc<Mutex<PropagatorCache>>;

impl PropagatorCache {
    /// Default maximum number of stored decompositions.
    pub const DEFAULT_CAPACITY: usize = 512;

    /// Create a new cache holding at most `capacity` decompositions (at least
    /// one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
            hits: 0,
            misses: 0,
            collisions: 0,
            evictions: 0,
        }
    }

    /// Wrap in a [`SharedPropagatorCache`].
    pub fn shared(self) -> SharedPropagatorCache { Arc::new(Mutex::new(self)) }

    /// Find the stored decomposition of `generator`, marking it as most
    /// recently used.
    ///
    /// A fingerprint collision is counted both as a collision and as a miss.
    pub fn lookup(&mut self, generator: nd::ArrayView2<f64>)
        -> Option<Arc<Eigen>>
    {
        let key = fingerprint(generator);
        let Some(index) = self.entries.get_index_of(&key) else {
            self.misses += 1;
            return None;
        };
        if !bitwise_eq(self.entries[index].generator.view(), generator) {
            self.collisions += 1;
            self.misses += 1;
            log::warn!(
                "propagator cache: fingerprint collision on key {:#018x}; \
                recomputing",
                key,
            );
            return None;
        }
        self.hits += 1;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        Some(Arc::clone(&self.entries[last].eigen))
    }

    /// Store the decomposition of `generator`, evicting the least recently
    /// used entries beyond capacity.
    ///
    /// If an entry for the same generator was stored in the meantime, that
    /// entry is kept and returned instead.
    pub fn insert(&mut self, generator: nd::ArrayView2<f64>, eigen: Arc<Eigen>)
        -> Arc<Eigen>
    {
        let key = fingerprint(generator);
        if let Some(entry) = self.entries.shift_remove(&key) {
            if bitwise_eq(entry.generator.view(), generator) {
                let stored = Arc::clone(&entry.eigen);
                self.entries.insert(key, entry);
                return stored;
            }
        }
        self.entries.insert(
            key,
            Entry { generator: generator.to_owned(), eigen: Arc::clone(&eigen) },
        );
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
            self.evictions += 1;
            log::trace!("propagator cache: evicted least recently used entry");
        }
        eigen
    }

    /// Look up the decomposition of `generator`, computing and storing it on a
    /// miss.
    pub fn get_or_decompose(&mut self, generator: nd::ArrayView2<f64>)
        -> Result<Arc<Eigen>>
    {
        if let Some(eigen) = self.lookup(generator) {
            return Ok(eigen);
        }
        let eigen = Arc::new(Eigen::decompose(generator)?);
        Ok(self.insert(generator, eigen))
    }

    /// Drop all entries and reset the counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
        self.collisions = 0;
        self.evictions = 0;
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            collisions: self.collisions,
            evictions: self.evictions,
            size: self.entries.len(),
            capacity: self.capacity,
        }
    }
}

impl Default for PropagatorCache {
    fn default() -> Self { Self::new(Self::DEFAULT_CAPACITY) }
}

/// The caches a [`Spectrometer`][crate::spectrometer::Spectrometer] draws
/// from.
///
/// Cloning yields handles to the same storage, so spectrometers built from
/// clones of one `EngineCaches` share bases, fixed pulses and (when enabled)
/// eigendecompositions.
#[derive(Clone, Debug, Default)]
pub struct EngineCaches {
    pub bases: BasisCache,
    pub pulses: PulseCache,
    pub propagators: Option<SharedPropagatorCache>,
}

impl EngineCaches {
    /// Fresh caches with the propagator cache disabled.
    pub fn new() -> Self { Self::default() }

    /// Fresh caches with a propagator cache of the given capacity.
    pub fn with_propagator_cache(capacity: usize) -> Self {
        Self {
            propagators: Some(PropagatorCache::new(capacity).shared()),
            ..Self::default()
        }
    }

    /// Build caches as described by the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let settings = &config.propagator_cache;
        if settings.enabled {
            log::debug!(
                "propagator cache enabled with capacity {}", settings.capacity);
            Ok(Self::with_propagator_cache(settings.capacity))
        } else {
            Ok(Self::new())
        }
    }

    /// Statistics of the propagator cache, if enabled.
    pub fn propagator_stats(&self) -> Option<CacheStats> {
        self.propagators.as_ref()
            .map(|cache| {
                cache.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .stats()
            })
    }

    /// Empty every cache.
    pub fn clear(&self) {
        self.bases.clear();
        self.pulses.clear();
        if let Some(cache) = self.propagators.as_ref() {
            cache.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(x: f64) -> nd::Array2<f64> {
        nd::array![[-1.0, x], [-x, -2.0]]
    }

    #[test]
    fn hits_and_misses() {
        let mut cache = PropagatorCache::new(4);
        let g = generator(1.0);
        let a = cache.get_or_decompose(g.view()).unwrap();
        let b = cache.get_or_decompose(g.view()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn content_not_identity() {
        let mut cache = PropagatorCache::new(4);
        let g1 = generator(1.0);
        let g2 = g1.clone();
        cache.get_or_decompose(g1.view()).unwrap();
        cache.get_or_decompose(g2.view()).unwrap();
        assert_eq!(cache.stats().hits, 1);
        cache.get_or_decompose(generator(1.0 + 1e-15).view()).unwrap();
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn lru_eviction() {
        let mut cache = PropagatorCache::new(2);
        for x in [1.0, 2.0, 1.0, 3.0] {
            cache.get_or_decompose(generator(x).view()).unwrap();
        }
        // 2.0 was least recently used when 3.0 arrived
        assert_eq!(cache.stats().evictions, 1);
        cache.get_or_decompose(generator(1.0).view()).unwrap();
        assert_eq!(cache.stats().hits, 2);
        cache.get_or_decompose(generator(2.0).view()).unwrap();
        assert_eq!(cache.stats().misses, 4);
    }

    #[test]
    fn collisions_count_as_misses() {
        let mut cache = PropagatorCache::new(4);
        let stored = generator(2.0);
        let wanted = generator(1.0);
        let eigen = Arc::new(Eigen::decompose(stored.view()).unwrap());
        cache.entries.insert(
            fingerprint(wanted.view()),
            Entry { generator: stored, eigen },
        );
        assert!(cache.lookup(wanted.view()).is_none());
        let stats = cache.stats();
        assert_eq!((stats.collisions, stats.misses, stats.hits), (1, 1, 0));
        assert_eq!(stats.hit_rate(), 0.0);

        let fresh = cache.get_or_decompose(wanted.view()).unwrap();
        let direct = Eigen::decompose(wanted.view()).unwrap();
        assert_eq!(fresh.propagator(0.1, false), direct.propagator(0.1, false));
        assert!(cache.lookup(wanted.view()).is_some());
        assert_eq!(cache.stats().collisions, 2);
    }

    #[test]
    fn insert_keeps_earlier_entry() {
        let mut cache = PropagatorCache::new(4);
        let g = generator(1.0);
        let first = Arc::new(Eigen::decompose(g.view()).unwrap());
        let second = Arc::new(Eigen::decompose(g.view()).unwrap());
        let a = cache.insert(g.view(), Arc::clone(&first));
        let b = cache.insert(g.view(), second);
        assert!(Arc::ptr_eq(&a, &first));
        assert!(Arc::ptr_eq(&b, &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_resets() {
        let mut cache = PropagatorCache::default();
        cache.get_or_decompose(generator(1.0).view()).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats { capacity: 512, ..CacheStats::default() });
    }

    #[test]
    fn caches_from_config() {
        let mut config = Config::default();
        assert!(EngineCaches::from_config(&config).unwrap().propagators.is_none());
        config.propagator_cache.enabled = true;
        config.propagator_cache.capacity = 8;
        let caches = EngineCaches::from_config(&config).unwrap();
        assert_eq!(caches.propagator_stats().unwrap().capacity, 8);
    }
}
