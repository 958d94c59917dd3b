use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;

use diffimrs::basis::{alard_lupton_basis, delta_function_basis};
use diffimrs::kernel::KernelBasis;
use diffimrs::solver::StaticKernelSolution;
use diffimrs::spatial::SpatialKernelSolution;
use diffimrs::spatial_fn::SpatialFunction;

fn stamp(size: usize) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let template = Array2::random((size, size), Uniform::new(100.0, 1100.0));
    let science = template.clone();
    let variance = Array2::ones((size, size));
    (template, science, variance)
}

fn single_kernel_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_kernel");
    group.sample_size(20);

    let (template, science, variance) = stamp(31);

    let delta = delta_function_basis(7, 7).unwrap();
    group.bench_function("delta 7x7", |b| {
        b.iter(|| {
            StaticKernelSolution::build(
                template.view(),
                science.view(),
                variance.view(),
                &delta,
                None,
            )
            .unwrap()
        })
    });

    let alard = alard_lupton_basis(9, &[0.7, 1.5, 3.0], &[4, 3, 2]).unwrap();
    let (template, science, variance) = stamp(45);
    group.bench_function("alard-lupton 19x19", |b| {
        b.iter(|| {
            StaticKernelSolution::build(
                template.view(),
                science.view(),
                variance.view(),
                &alard,
                None,
            )
            .unwrap()
        })
    });
}

fn spatial_fit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_fit");
    group.sample_size(20);

    let basis: KernelBasis = delta_function_basis(7, 7).unwrap();
    let (template, science, variance) = stamp(31);
    let solution = StaticKernelSolution::build(
        template.view(),
        science.view(),
        variance.view(),
        &basis,
        None,
    )
    .unwrap();

    let positions: Vec<(f64, f64)> = (0..100)
        .map(|i| (20.0 * (i % 10) as f64, 20.0 * (i / 10) as f64))
        .collect();

    group.bench_function("100 candidates, order 2", |b| {
        b.iter_batched(
            || {
                SpatialKernelSolution::new(
                    basis.clone(),
                    SpatialFunction::polynomial(2),
                    SpatialFunction::polynomial(1),
                    false,
                    true,
                )
            },
            |mut fit| {
                for &(x, y) in &positions {
                    fit.add_constraint(x, y, solution.m(), solution.b()).unwrap();
                }
                fit.solve().unwrap();
                fit.solution_pair().unwrap()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, single_kernel_benchmark, spatial_fit_benchmark);
criterion_main!(benches);
