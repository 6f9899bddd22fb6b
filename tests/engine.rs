use std::sync::Arc;
use approx::assert_abs_diff_eq;
use ndarray as nd;
use rand::{ Rng, SeedableRng, rngs::StdRng };
use relaxsim::{
    basis::{ Basis, BasisKey, SpinSystem, Topology },
    cache::PropagatorCache,
    ensemble::Operator,
    liouvillian::{ Conditions, Liouvillian, ParValues },
    propagator::{ calculate_propagators, calculate_propagators_with, decompose_stack },
};

const RELAXATION: [&str; 8] = [
    "r2_i", "r2_s", "r1_i", "r1_s", "r2a_i", "r2a_s", "r2mq_is", "r1a_is",
];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(topology: Topology, n_states: usize) -> BasisKey {
    BasisKey::new(topology, n_states).with_spin_system(SpinSystem::NH)
}

fn random_par_values(basis: &Basis, rng: &mut StdRng) -> ParValues {
    let mut par_values = ParValues::new();
    for name in basis.required_names() {
        let value
            = if name.starts_with("rotz")
                || name.starts_with("carrier")
                || name.starts_with("offset")
                || name.starts_with("jeff")
                || name.starts_with("b1")
                || name.starts_with("d_")
                || name.starts_with('p')
            {
                continue;
            } else if name.starts_with("cs_") {
                rng.gen_range(-2.0..2.0)
            } else if name.starts_with("j_is") {
                rng.gen_range(-100.0..100.0)
            } else if name.starts_with('k') {
                rng.gen_range(0.0..200.0)
            } else if name.starts_with('r') {
                rng.gen_range(0.0..10.0)
            } else {
                rng.gen_range(-2.0..2.0)
            };
        par_values.insert(name, value);
    }
    let pops: Vec<f64>
        = basis.states().iter().map(|_| rng.gen_range(0.1..1.0)).collect();
    let total: f64 = pops.iter().sum();
    for (state, p) in basis.states().iter().zip(pops) {
        par_values.insert(format!("p{}", state), p / total);
    }
    par_values
}

fn random_generator(topology: Topology, rng: &mut StdRng) -> Operator {
    let basis = Arc::new(Basis::build(key(topology, 2)).unwrap());
    let par_values = random_par_values(&basis, rng);
    let mut liouvillian
        = Liouvillian::new(basis, Conditions::new(600.0)).unwrap();
    liouvillian.update(&par_values).unwrap();
    liouvillian.free_generator()
}

#[test]
fn relaxation_is_pure_decay() {
    init_logging();
    for topology in Topology::ALL {
        let basis = Basis::build(key(topology, 2)).unwrap();
        let equilibrium: Vec<usize>
            = ["ie", "se"].iter()
            .filter_map(|comp| basis.vector(comp))
            .flat_map(|v| {
                v.iter().enumerate()
                    .filter(|(_, x)| **x != 0.0)
                    .map(|(k, _)| k)
                    .collect::<Vec<_>>()
            })
            .collect();
        let names: Vec<String>
            = basis.matrix_names()
            .filter(|name| {
                RELAXATION.iter()
                    .any(|r| name.strip_prefix(r)
                        .is_some_and(|rest| rest.len() == 2 && rest.starts_with('_')))
            })
            .map(|name| name.to_string())
            .collect();
        assert!(!names.is_empty(), "{} has no relaxation terms", topology);
        for name in names {
            let m = basis.matrix(&name).unwrap();
            let mut decays = false;
            for ((i, j), x) in m.indexed_iter() {
                if equilibrium.contains(&i) || equilibrium.contains(&j) {
                    continue;
                }
                if i == j {
                    assert!(*x <= 0.0, "{} grows on the diagonal", name);
                    decays |= *x < 0.0;
                } else {
                    assert_eq!(*x, 0.0, "{} mixes components", name);
                }
            }
            assert!(decays, "{} is empty", name);
        }
    }
}

#[test]
fn propagator_at_zero_is_identity() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(10546);
    for topology in Topology::ALL {
        let generators = random_generator(topology, &mut rng);
        let n = generators.shape()[1];
        let props = calculate_propagators(generators.view(), &[0.0], false).unwrap();
        let eye: nd::Array2<f64> = nd::Array2::eye(n);
        for p in props.index_axis(nd::Axis(0), 0).outer_iter() {
            for (x, e) in p.iter().zip(eye.iter()) {
                assert_abs_diff_eq!(x, e, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn propagators_compose_additively() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(31415);
    let topologies = [
        Topology::Ixy,
        Topology::Iz,
        Topology::Izsz,
        Topology::Ixyz,
        Topology::Ixysxy,
        Topology::IxyIxysxy,
        Topology::Ixyzsz,
        Topology::Ixyzsxyz,
    ];
    for k in 0..24 {
        let generators = random_generator(topologies[k % topologies.len()], &mut rng);
        let t1: f64 = rng.gen_range(1e-4..5e-3);
        let t2: f64 = rng.gen_range(1e-4..5e-3);
        let props
            = calculate_propagators(generators.view(), &[t1, t2, t1 + t2], false)
            .unwrap();
        let u1 = props.index_axis(nd::Axis(0), 0);
        let u2 = props.index_axis(nd::Axis(0), 1);
        let u12 = props.index_axis(nd::Axis(0), 2);
        for ((a, b), ab) in u1.outer_iter().zip(u2.outer_iter()).zip(u12.outer_iter()) {
            let composed = b.dot(&a);
            for (x, y) in ab.iter().zip(composed.iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-10);
            }
        }
    }
}

#[test]
fn cache_is_transparent() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(2718);
    let generators = random_generator(Topology::IxyzszEq, &mut rng);
    let delays: Vec<f64> = (1..=10).map(|k| k as f64 * 1.7e-3).collect();
    let cache = PropagatorCache::new(8).shared();

    let direct = calculate_propagators(generators.view(), &delays, false).unwrap();
    let first
        = calculate_propagators_with(generators.view(), &delays, false, Some(&cache))
        .unwrap();
    let second
        = calculate_propagators_with(generators.view(), &delays[..5], false, Some(&cache))
        .unwrap();

    assert_eq!(direct, first);
    assert_eq!(direct.slice(nd::s![..5, .., .., ..]), second);
    let stats = cache.lock().unwrap().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.collisions, 0);
    assert_eq!(stats.size, 1);
}

#[test]
fn shared_cache_across_threads() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(1618);
    let generators: Vec<Operator>
        = (0..3).map(|_| random_generator(Topology::Ixyzsz, &mut rng)).collect();
    let delays = [1e-3, 4e-3];
    let cache = PropagatorCache::new(16).shared();
    let n_threads = 4;

    let run = || {
        generators.iter()
            .map(|g| {
                calculate_propagators_with(g.view(), &delays, false, Some(&cache))
                    .unwrap()
            })
            .collect::<Vec<_>>()
    };
    let results: Vec<Vec<nd::Array4<f64>>>
        = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..n_threads {
                handles.push(scope.spawn(run));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

    for (k, g) in generators.iter().enumerate() {
        let direct = calculate_propagators(g.view(), &delays, false).unwrap();
        for per_thread in results.iter() {
            assert_eq!(per_thread[k], direct);
        }
    }
    let replicas: usize = generators.iter().map(|g| g.len_of(nd::Axis(0))).sum();
    let stats = cache.lock().unwrap().stats();
    assert_eq!(stats.hits + stats.misses, n_threads * replicas);
    assert!(stats.misses >= replicas);
    assert_eq!(stats.collisions, 0);
    assert_eq!(stats.size, replicas);

    // every later lookup is served from the stored entries
    let eigens = decompose_stack(generators[0].view(), Some(&cache)).unwrap();
    let again = decompose_stack(generators[0].view(), Some(&cache)).unwrap();
    assert!(eigens.iter().zip(again.iter()).all(|(a, b)| Arc::ptr_eq(a, b)));
}

#[test]
fn dephased_propagators_keep_only_static_modes() {
    init_logging();
    let basis = Arc::new(Basis::build(key(Topology::Ixyz, 1)).unwrap());
    let mut liouvillian = Liouvillian::new(basis.clone(), Conditions::new(600.0)).unwrap();
    liouvillian.set_b1_i(500.0);
    liouvillian.set_offset_i(500.0);
    let generators = liouvillian.pulse_i_generator(0.0, 1.0);
    let props = calculate_propagators(generators.view(), &[0.013, 0.029], true).unwrap();
    // with no relaxation, only the projection onto the effective field survives
    let iz = basis.vector("iz_a").unwrap();
    for p in props.index_axis(nd::Axis(0), 0).outer_iter() {
        let out = p.dot(iz);
        let again = p.dot(&out);
        for (x, y) in out.iter().zip(again.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
    }
    let early = props.index_axis(nd::Axis(0), 0);
    let late = props.index_axis(nd::Axis(0), 1);
    for (x, y) in early.iter().zip(late.iter()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-10);
    }
}
