#![allow(non_snake_case, non_upper_case_globals)]

//! 15N CEST profile for a two-state exchanging spin.
//!
//! The propagator cache is configured from `relaxsim.toml` (if present) and
//! the `RELAXSIM_CACHE_*` environment variables; its statistics are printed at
//! the end. Writes `output/cest_15n.npz`.

use std::path::{ Path, PathBuf };
use ndarray as nd;
use relaxsim::{
    mkdir,
    write_npz,
    basis::{ BasisKey, SpinSystem, Topology },
    cache::EngineCaches,
    config::Config,
    ensemble,
    liouvillian::{ Conditions, ParValues },
    model::TwoStateExchange,
    spectrometer::Spectrometer,
};

const H_LARMOR_FRQ: f64 = 800.0; // MHz
const TIME_T1: f64 = 0.5; // s
const B1: f64 = 25.0; // Hz
const CARRIER: f64 = 118.0; // ppm
const DW: f64 = 2.0; // ppm
const REFERENCE_OFFSET: f64 = -1e5; // Hz

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let outdir = PathBuf::from("output");
    mkdir!(outdir)?;

    let config_path = Path::new("relaxsim.toml");
    let config = Config::load(config_path.is_file().then_some(config_path))?;
    let caches = EngineCaches::from_config(&config)?;

    let key
        = BasisKey::new(Topology::IxyzEq, 2)
        .with_spin_system(SpinSystem::NH);
    let mut spectrometer
        = Spectrometer::new_with(key, Conditions::new(H_LARMOR_FRQ), &caches)?;

    let mut par_values = ParValues::new();
    TwoStateExchange::new(200.0, 0.05).write(&mut par_values);
    par_values.insert("r2_i_a".into(), 10.0);
    par_values.insert("r2_i_b".into(), 10.0);
    par_values.insert("r1_i_a".into(), 1.5);
    par_values.insert("r1_i_b".into(), 1.5);
    par_values.insert("cs_i_a".into(), CARRIER);
    TwoStateExchange::write_shift(&mut par_values, DW);
    spectrometer.update(&par_values)?;
    spectrometer.set_carrier_i(CARRIER);
    spectrometer.set_b1_i(B1);
    spectrometer.set_detection("[iz_a]")?;

    let ppms: nd::Array1<f64> = nd::Array1::linspace(112.0, 124.0, 121);
    let offsets = spectrometer.ppms_to_offsets(&ppms);
    let start = spectrometer.equilibrium();
    let mut saturate = |offset: f64| -> anyhow::Result<f64> {
        spectrometer.set_offset_i(offset);
        let pulse
            = spectrometer.pulse_i(&[TIME_T1], 0.0, 1.0)?
            .index_axis_move(nd::Axis(0), 0);
        let mag = ensemble::apply(pulse.view(), start.view())?;
        Ok(spectrometer.detect(mag.view())?)
    };

    let i0 = saturate(REFERENCE_OFFSET)?;
    log::info!("reference intensity at {} Hz: {:.6e}", REFERENCE_OFFSET, i0);

    let mut intensities: nd::Array1<f64> = nd::Array1::zeros(offsets.len());
    for (k, offset) in offsets.iter().enumerate() {
        intensities[k] = saturate(*offset)? / i0;
    }

    let (k_min, i_min)
        = intensities.iter().copied().enumerate()
        .fold((0, f64::INFINITY), |acc, (k, i)| if i < acc.1 { (k, i) } else { acc });
    println!("deepest dip: {:.3} at {:.2} ppm", i_min, ppms[k_min]);
    if let Some(stats) = spectrometer.cache_stats() {
        println!("propagator cache: {}", stats);
    }

    write_npz!(
        outdir.join("cest_15n.npz"),
        arrays: {
            "ppms" => &ppms,
            "offsets" => &offsets,
            "intensities" => &intensities,
        }
    ).map_err(anyhow::Error::msg)?;

    println!("done");
    Ok(())
}
