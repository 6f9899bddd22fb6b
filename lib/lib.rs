#![allow(non_snake_case, non_upper_case_globals)]

//! Liouville-space simulation of nuclear-spin relaxation and chemical exchange
//! during CPMG and CEST experiments.

pub mod error;
pub mod utils;
pub mod config;
pub mod constants;
pub mod distributions;
pub mod basis;
pub mod ensemble;
pub mod propagator;
pub mod cache;
pub mod pulses;
pub mod detection;
pub mod liouvillian;
pub mod model;
pub mod spectrometer;

pub use error::{ Error, Result };
pub use basis::{ Basis, BasisCache, BasisKey, Extension, SpinSystem, Topology };
pub use cache::{ CacheStats, EngineCaches, PropagatorCache, SharedPropagatorCache };
pub use config::Config;
pub use liouvillian::{ Conditions, Liouvillian, ParValues, par_values };
pub use spectrometer::Spectrometer;
