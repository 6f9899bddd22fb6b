//! Criterion benchmarks of generator assembly and of delay propagators with
//! and without the shared eigendecomposition cache.

use std::sync::Arc;
use criterion::{ BenchmarkId, Criterion, black_box, criterion_group, criterion_main };
use ndarray as nd;
use relaxsim::{
    basis::{ Basis, BasisKey, SpinSystem, Topology },
    cache::EngineCaches,
    liouvillian::{ Conditions, Liouvillian, ParValues },
    model::TwoStateExchange,
    spectrometer::Spectrometer,
};

fn key(topology: Topology, n_states: usize) -> BasisKey {
    BasisKey::new(topology, n_states).with_spin_system(SpinSystem::NH)
}

fn exchange_params() -> ParValues {
    let mut params = ParValues::new();
    TwoStateExchange::new(500.0, 0.05).write(&mut params);
    params.insert("r2_i_a".into(), 10.0);
    params.insert("r2_i_b".into(), 12.0);
    params.insert("r1_i_a".into(), 1.5);
    params.insert("r1_i_b".into(), 1.5);
    params.insert("cs_i_a".into(), 118.0);
    TwoStateExchange::write_shift(&mut params, 2.0);
    params
}

fn bench_delays(c: &mut Criterion) {
    let params = exchange_params();
    let mut uncached = Spectrometer::new(key(Topology::Ixyzsz, 2), Conditions::new(800.0))
        .unwrap();
    uncached.update(&params).unwrap();
    let caches = EngineCaches::with_propagator_cache(64);
    let mut cached
        = Spectrometer::new_with(key(Topology::Ixyzsz, 2), Conditions::new(800.0), &caches)
        .unwrap();
    cached.update(&params).unwrap();

    let mut group = c.benchmark_group("delays");
    for n_delays in [1, 14, 64] {
        let times: Vec<f64> = (1..=n_delays).map(|k| k as f64 * 2.5e-4).collect();
        group.bench_with_input(BenchmarkId::new("uncached", n_delays), &times, |b, t| {
            b.iter(|| black_box(uncached.delays(t).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("cached", n_delays), &times, |b, t| {
            b.iter(|| black_box(cached.delays(t).unwrap()));
        });
    }
    group.finish();
    if let Some(stats) = caches.propagator_stats() {
        eprintln!("propagator cache: {}", stats);
    }
}

fn bench_update(c: &mut Criterion) {
    let params = exchange_params();
    let mut group = c.benchmark_group("liouvillian_update");
    for topology in [Topology::Ixyz, Topology::Ixyzsz, Topology::Ixyzsxyz] {
        let basis = Arc::new(Basis::build(key(topology, 2)).unwrap());
        let mut liouvillian
            = Liouvillian::new(basis.clone(), Conditions::new(800.0)).unwrap();
        liouvillian.update(&params).unwrap();
        let coeffs: nd::Array1<f64> = liouvillian.coefficients().clone();

        group.bench_with_input(BenchmarkId::new("named", topology), &params, |b, p| {
            b.iter(|| liouvillian.update(black_box(p)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("dense", topology), &coeffs, |b, x| {
            b.iter(|| liouvillian.update_dense(black_box(x.view())).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_delays, bench_update);
criterion_main!(benches);
