use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rvsplit::history::History;
use rvsplit::optimize::{CheckpointSink, OptimizeOptions, OrderCheckpoint};
use rvsplit::progress::NoopProgress;
use rvsplit::{Model, Spectra};
use tempfile::tempdir;

/// Two orders of noisy absorption spectra with moving stellar lines.
fn noisy_dataset(seed: u64) -> Spectra {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.01).unwrap();
    let (n_epochs, n_pixels) = (4, 40);
    let bervs = ndarray::array![-900.0, -300.0, 300.0, 900.0];
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut ivars = Vec::new();
    for r in 0..2 {
        let start = 8.5 + r as f64 * 1e-3;
        let x = Array2::from_shape_fn((n_epochs, n_pixels), |(_, m)| start + m as f64 * 3e-6);
        let y = Array2::from_shape_fn((n_epochs, n_pixels), |(n, m)| {
            let shift = bervs[n] / 2.997_924_58e8;
            let z = (x[[n, m]] - shift - (start + 20.0 * 3e-6)) / 6e-6;
            -0.5 * (-0.5 * z * z).exp() + noise.sample(&mut rng)
        });
        xs.push(x);
        ys.push(y);
        ivars.push(Array2::from_elem((n_epochs, n_pixels), 1e4));
    }
    Spectra::from_arrays(xs, ys, ivars, bervs, Array1::from_elem(n_epochs, 1.1)).unwrap()
}

fn fitted_model(data: &Spectra, options: &OptimizeOptions) -> Model {
    let mut model = Model::new(data);
    model.add_star("star", 0).unwrap();
    model.add_telluric("tellurics", 1).unwrap();
    for r in 0..data.n_orders() {
        model
            .optimize_order(data, r, options, &mut NoopProgress)
            .unwrap();
    }
    model
}

#[test]
fn saved_model_synthesizes_bit_identically() {
    let data = noisy_dataset(11);
    let options = OptimizeOptions {
        niter: 15,
        save_every: 0,
        ..Default::default()
    };
    let model = fitted_model(&data, &options);

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let restored = Model::load(&path).unwrap();
    assert_eq!(restored, model);
    for r in 0..data.n_orders() {
        assert_eq!(
            restored.synthesize(&data, r).unwrap(),
            model.synthesize(&data, r).unwrap()
        );
    }
}

#[test]
fn checkpoints_and_histories_land_in_the_output_directory() {
    let data = noisy_dataset(12);
    let dir = tempdir().unwrap();
    let sink = CheckpointSink::new(dir.path(), "run");
    let options = OptimizeOptions {
        niter: 6,
        save_every: 3,
        record_history: true,
        checkpoint: Some(sink.clone()),
        ..Default::default()
    };
    let mut model = Model::new(&data);
    model.add_star("star", 0).unwrap();
    model.add_telluric("tellurics", 1).unwrap();
    let report = model
        .optimize_order(&data, 1, &options, &mut NoopProgress)
        .unwrap();

    assert!(dir.path().join("run_o1_model.toml").exists());
    assert!(dir.path().join("run_o1_history.toml").exists());
    assert!(!dir.path().join("run_o0_model.toml").exists());

    let checkpoint = OrderCheckpoint::load(sink.model_path(1)).unwrap();
    assert_eq!(checkpoint.order, 1);
    assert_eq!(checkpoint.iteration, 6);
    let star = model.component("star").unwrap().order(1).unwrap();
    assert_eq!(&checkpoint.components[0].state, star);

    let history = History::read(sink.history_path(1)).unwrap();
    assert_eq!(Some(history), report.history);
}

#[test]
fn prepared_dataset_survives_a_write_read_cycle() {
    let data = noisy_dataset(13);
    let dir = tempdir().unwrap();
    let path = dir.path().join("spectra.toml");
    data.write(&path).unwrap();

    let restored = Spectra::read(&path, Some(&[1]), None).unwrap();
    assert_eq!(restored.n_orders(), 1);
    assert_eq!(restored.orders, vec![1]);
    assert_eq!(restored.xs[0], data.xs[1]);
    assert_eq!(restored.ys[0], data.ys[1]);
    assert_eq!(restored.bervs, data.bervs);
    assert!(restored.log_flux);
}
