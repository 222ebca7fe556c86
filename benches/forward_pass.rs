use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rvsplit::component::{Basis, ComponentKind, OrderState, Template, log_uniform_grid};
use rvsplit::model::ComponentSettings;
use rvsplit::optimize::{Penalties, evaluate};
use rvsplit::spectra::OrderData;

struct Problem {
    xs: Array2<f64>,
    ys: Array2<f64>,
    ivars: Array2<f64>,
    bervs: Array1<f64>,
    airms: Array1<f64>,
    settings: Vec<ComponentSettings>,
    states: Vec<OrderState>,
}

fn random_problem(n_epochs: usize, n_pixels: usize) -> Problem {
    let mut rng = StdRng::seed_from_u64(0x5EED_F64 + n_pixels as u64);
    let xs = Array2::from_shape_fn((n_epochs, n_pixels), |(_, m)| 8.5 + m as f64 * 3e-6);
    let ys = Array2::from_shape_fn((n_epochs, n_pixels), |_| -0.1 * rng.sample::<f64, _>(Standard));
    let grid = log_uniform_grid(8.5, 8.5 + (n_pixels - 1) as f64 * 3e-6);

    let settings: Vec<ComponentSettings> = [(ComponentKind::Star, 0), (ComponentKind::Telluric, 3)]
        .into_iter()
        .map(|(kind, variable_bases)| ComponentSettings {
            name: kind.to_string(),
            kind,
            variable_bases,
            learning_rates: kind.default_learning_rates(),
            rvs_fixed: kind.rvs_fixed_by_default(),
        })
        .collect();
    let states = settings
        .iter()
        .map(|setting| {
            let mut state = OrderState::new(Array1::from_shape_fn(n_epochs, |n| n as f64 * 50.0));
            let ys = grid.mapv(|_| -0.1 * rng.sample::<f64, _>(Standard));
            state.template = Template::new(grid.clone(), ys).ok();
            if setting.variable_bases > 0 {
                state.basis = Some(Basis {
                    vectors: Array2::from_shape_fn((setting.variable_bases, grid.len()), |_| {
                        0.01 * rng.sample::<f64, _>(Standard)
                    }),
                    weights: Array2::from_elem((n_epochs, setting.variable_bases), 0.1),
                });
            }
            state
        })
        .collect();

    Problem {
        xs,
        ys,
        ivars: Array2::from_elem((n_epochs, n_pixels), 1e4),
        bervs: Array1::zeros(n_epochs),
        airms: Array1::ones(n_epochs),
        settings,
        states,
    }
}

fn benchmark_forward_pass(c: &mut Criterion) {
    let shapes = [(20_usize, 512_usize), (50, 2048)];
    let problems: Vec<_> = shapes
        .iter()
        .map(|&(n, m)| ((n, m), random_problem(n, m)))
        .collect();

    let mut group = c.benchmark_group("forward_pass");
    for ((n, m), problem) in problems.iter() {
        group.throughput(Throughput::Elements((*n * *m) as u64));
        let data = OrderData {
            order: 0,
            xs: problem.xs.view(),
            ys: problem.ys.view(),
            ivars: problem.ivars.view(),
            bervs: problem.bervs.view(),
            airms: problem.airms.view(),
        };
        let penalties = Penalties::default();
        group.bench_with_input(
            BenchmarkId::new("evaluate", format!("{n}x{m}")),
            problem,
            |b, input| {
                b.iter(|| {
                    let evaluation =
                        evaluate(black_box(&data), &input.settings, &input.states, &penalties);
                    black_box(evaluation.map(|e| e.nll).unwrap_or(f64::NAN));
                });
            },
        );
    }
    group.finish();
}

criterion_group!(forward_pass, benchmark_forward_pass);
criterion_main!(forward_pass);
