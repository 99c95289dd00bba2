use criterion::{black_box, criterion_group, criterion_main, Criterion};
use deep_poisson::config::{PgbnConfig, Priors};
use deep_poisson::pgbn::Pgbn;
use deep_poisson::sampler;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_counts(v: usize, n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((v, n), |_| rng.gen_range(0..8) as f64)
}

fn benchmark_sampler_primitives(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sampler");
    let mut rng = StdRng::seed_from_u64(0);

    group.bench_function("Gamma draw", |bencher| {
        bencher.iter(|| black_box(sampler::gamma(&mut rng, 2.5, 0.5)));
    });

    let weights: Vec<f64> = (1..=64).map(|k| k as f64).collect();
    group.bench_function("Multinomial split (64 bins, 100 trials)", |bencher| {
        bencher.iter(|| black_box(sampler::multinomial(&mut rng, 100, &weights).unwrap()));
    });

    group.bench_function("CRT (count 50)", |bencher| {
        bencher.iter(|| black_box(sampler::crt(&mut rng, 50, 1.5)));
    });

    group.bench_function("Dirichlet (dim 64)", |bencher| {
        bencher.iter(|| black_box(sampler::dirichlet(&mut rng, &weights)));
    });
    group.finish();
}

fn benchmark_pgbn_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("PGBN");
    group.sample_size(10);

    let sizes = [(20, 16), (50, 32)];
    for &(v, n) in &sizes {
        let data = random_counts(v, n, 7);
        group.bench_with_input(
            format!("Train sweep {}x{}", v, n),
            &data,
            |bencher, data_ref| {
                bencher.iter(|| {
                    let config = PgbnConfig {
                        layer_widths: vec![8, 4],
                        priors: Priors::default(),
                        burn_in: 0.0,
                    };
                    let mut model = Pgbn::new(config, 3).unwrap();
                    model.initial(data_ref).unwrap();
                    black_box(model.train(data_ref, 1).unwrap());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_sampler_primitives, benchmark_pgbn_sweep);
criterion_main!(benches);
