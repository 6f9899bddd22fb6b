#![allow(non_snake_case, non_upper_case_globals)]

//! 15N in-phase CPMG relaxation dispersion for a two-state exchanging spin.
//!
//! Writes `output/cpmg_15n.npz` with the CPMG frequencies, the intensities
//! relative to the reference plane and the matching effective R2 rates.

use std::path::PathBuf;
use ndarray as nd;
use relaxsim::{
    mkdir,
    write_npz,
    basis::{ BasisKey, SpinSystem, Topology },
    ensemble::{ self, Operator },
    liouvillian::{ Conditions, ParValues },
    model::TwoStateExchange,
    spectrometer::Spectrometer,
};

const H_LARMOR_FRQ: f64 = 800.0; // MHz
const TIME_T2: f64 = 0.04; // s
const B1: f64 = 6000.0; // Hz
const CARRIER: f64 = 118.0; // ppm
const DW: f64 = 2.0; // ppm
const NCYCS: [usize; 14] = [1, 2, 3, 4, 5, 6, 8, 10, 13, 16, 20, 25, 30, 40];

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let outdir = PathBuf::from("output");
    mkdir!(outdir)?;

    let key
        = BasisKey::new(Topology::Ixyz, 2)
        .with_spin_system(SpinSystem::NH);
    let mut spectrometer = Spectrometer::new(key, Conditions::new(H_LARMOR_FRQ))?;

    let mut par_values = ParValues::new();
    TwoStateExchange::new(800.0, 0.05).write(&mut par_values);
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

    let pw90 = spectrometer.pw90_i();
    let t_neg = -2.0 * pw90 / std::f64::consts::PI;
    let taus: Vec<f64>
        = NCYCS.iter()
        .map(|ncyc| TIME_T2 / (4.0 * *ncyc as f64) - pw90)
        .collect();
    let d_neg = spectrometer.delay(t_neg)?;
    let d_cp = spectrometer.delays(&taus)?;

    let p90: Operator
        = spectrometer.p90_i()?.index_axis(nd::Axis(0), 0).to_owned();
    let p180 = spectrometer.p180_i()?.clone();
    // +x/-x phase cycle of the central refocusing pulse
    let p180pmx: Operator
        = (&p180.index_axis(nd::Axis(0), 0) + &p180.index_axis(nd::Axis(0), 2))
        * 0.5;
    let p180y = p180.index_axis(nd::Axis(0), 1);

    let start = spectrometer.equilibrium();
    let part1 = ensemble::chain(&[d_neg.view(), p90.view()])?;
    let part2 = ensemble::chain(&[p90.view(), d_neg.view()])?;

    let reference = ensemble::chain(&[p90.view(), p180pmx.view(), p90.view()])?;
    let i0 = spectrometer.detect(ensemble::apply(reference.view(), start.view())?.view())?;
    log::info!("reference intensity: {:.6e}", i0);

    let mut intensities: nd::Array1<f64> = nd::Array1::zeros(NCYCS.len());
    for (k, ncyc) in NCYCS.iter().enumerate() {
        let d = d_cp.index_axis(nd::Axis(0), k);
        let echo = ensemble::chain(&[d, p180y, d])?;
        let cpmg = ensemble::power(echo.view(), *ncyc);
        let sequence = ensemble::chain(&[
            part2.view(), cpmg.view(), p180pmx.view(), cpmg.view(), part1.view(),
        ])?;
        let mag = ensemble::apply(sequence.view(), start.view())?;
        intensities[k] = spectrometer.detect(mag.view())? / i0;
    }

    let nu_cpmg: nd::Array1<f64>
        = NCYCS.iter().map(|ncyc| *ncyc as f64 / TIME_T2).collect();
    let r2eff: nd::Array1<f64>
        = intensities.mapv(|i| -i.abs().ln() / TIME_T2);
    for (nu, r2) in nu_cpmg.iter().zip(r2eff.iter()) {
        println!("{:8.1} Hz  R2eff = {:8.3} s^-1", nu, r2);
    }

    write_npz!(
        outdir.join("cpmg_15n.npz"),
        arrays: {
            "nu_cpmg" => &nu_cpmg,
            "intensities" => &intensities,
            "r2eff" => &r2eff,
        }
    ).map_err(anyhow::Error::msg)?;

    println!("done");
    Ok(())
}
