//! # Per-Order Optimization
//!
//! Jointly fits the velocities, templates, and variable bases of every
//! component on one echelle order by minimizing the penalized negative log
//! likelihood
//!
//! ```text
//! NLL = ½ Σ (y - synth)² · ivar
//!     + L1  Σ_c Σ |template_c|
//!     + L2v Σ_c Σ vectors_c²
//!     + L2w Σ_c Σ weights_c²
//! ```
//!
//! with Adam. Each iteration is two-phase: one forward pass yields the
//! objective and the analytic gradient of every parameter, then every
//! parameter block is updated from that same gradient.
//!
//! The forward model is linear interpolation of a per-epoch rest-frame row
//! (template plus basis correction) at Doppler-shifted wavelengths, so the
//! backward pass is a scatter of bracket weights plus the local slope for the
//! velocities.

use crate::adam::Adam;
use crate::component::{ComponentError, ComponentKind, FitStage, LearningRates, OrderState, split_others};
use crate::doppler::{ln_doppler_derivative, to_rest_frame};
use crate::history::{History, HistoryError};
use crate::interp::{Bracket, Interpolator};
use crate::model::{ComponentSettings, Model, ModelError};
use crate::progress::OptimizeObserver;
use crate::spectra::{OrderData, Spectra, SpectraError};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2, Zip};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Regularization strengths of the objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Penalties {
    /// L1 on template log fluxes, pulling the continuum-normalized template
    /// towards zero where the data are uninformative.
    pub l1_template: f64,
    pub l2_basis_vectors: f64,
    pub l2_basis_weights: f64,
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            l1_template: 1e4,
            l2_basis_vectors: 1e4,
            l2_basis_weights: 1.0,
        }
    }
}

/// Where checkpoints of an order go: `<dir>/<basename>_o<r>_{model,history}.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSink {
    pub dir: PathBuf,
    pub basename: String,
}

impl CheckpointSink {
    pub fn new(dir: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
        }
    }

    pub fn model_path(&self, order: usize) -> PathBuf {
        self.dir
            .join(format!("{}_o{}_model.toml", self.basename, order))
    }

    pub fn history_path(&self, order: usize) -> PathBuf {
        self.dir
            .join(format!("{}_o{}_history.toml", self.basename, order))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeOptions {
    pub niter: usize,
    pub penalties: Penalties,
    /// Checkpoint after every `save_every` iterations; 0 disables.
    pub save_every: usize,
    pub record_history: bool,
    pub checkpoint: Option<CheckpointSink>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            niter: 100,
            penalties: Penalties::default(),
            save_every: 100,
            record_history: false,
            checkpoint: None,
        }
    }
}

/// True when a checkpoint is due after (0-based) iteration `i`.
pub fn should_checkpoint(i: usize, save_every: usize) -> bool {
    save_every > 0 && (i + 1) % save_every == 0
}

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Failed to write checkpoint: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML checkpoint file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize checkpoint to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("{settings} component settings were supplied for {states} component states.")]
    ComponentCountMismatch { settings: usize, states: usize },

    #[error("Component '{name}': {source}")]
    Component {
        name: String,
        #[source]
        source: ComponentError,
    },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Spectra(#[from] SpectraError),
}

fn component_error(name: &str) -> impl FnOnce(ComponentError) -> OptimizeError + '_ {
    move |source| OptimizeError::Component {
        name: name.to_string(),
        source,
    }
}

/// Gradient of the objective with respect to one component's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentGradient {
    pub rvs: Array1<f64>,
    pub template: Array1<f64>,
    pub basis_vectors: Option<Array2<f64>>,
    pub basis_weights: Option<Array2<f64>>,
}

/// Result of one forward/backward pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub synth: Array2<f64>,
    pub nll: f64,
    /// `(y - synth) * sqrt(ivar)`, zero on masked pixels.
    pub chis: Array2<f64>,
    pub gradients: Vec<ComponentGradient>,
}

/// Cached forward quantities of one component.
struct Forward {
    brackets: Array2<Bracket>,
    rows: Array2<f64>,
    scale: Array1<f64>,
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Computes the synthesized spectrum, objective, chi residuals, and the full
/// analytic gradient for the current parameters. Every state must have an
/// initialized template.
pub fn evaluate(
    data: &OrderData<'_>,
    settings: &[ComponentSettings],
    states: &[OrderState],
    penalties: &Penalties,
) -> Result<Evaluation, OptimizeError> {
    check_counts(settings, states)?;
    let (n_epochs, n_pixels) = data.xs.dim();

    // --- 1. Forward pass ---
    let mut synth = Array2::<f64>::zeros((n_epochs, n_pixels));
    let mut forwards = Vec::with_capacity(states.len());
    for (setting, state) in settings.iter().zip(states) {
        let forward = forward(data, setting.kind, state).map_err(component_error(&setting.name))?;
        Zip::indexed(&mut synth)
            .and(&forward.brackets)
            .for_each(|(n, _), s, bracket| {
                *s += forward.scale[n] * bracket.apply(forward.rows.row(n));
            });
        forwards.push(forward);
    }

    // --- 2. Data term and its adjoint ---
    let mut nll = 0.0;
    let mut chis = Array2::<f64>::zeros((n_epochs, n_pixels));
    let mut adjoint = Array2::<f64>::zeros((n_epochs, n_pixels));
    Zip::from(&mut chis)
        .and(&mut adjoint)
        .and(&data.ys)
        .and(&data.ivars)
        .and(&synth)
        .for_each(|chi, g, &y, &ivar, &s| {
            if ivar > 0.0 {
                let resid = y - s;
                nll += 0.5 * resid * resid * ivar;
                *chi = resid * ivar.sqrt();
                *g = -resid * ivar;
            }
        });

    // --- 3. Backward pass and penalties, per component ---
    let mut gradients = Vec::with_capacity(states.len());
    for ((setting, state), forward) in settings.iter().zip(states).zip(&forwards) {
        let template = state.template().map_err(component_error(&setting.name))?;
        let grid = template.xs.view();

        let mut row_adjoints = Array2::<f64>::zeros(forward.rows.raw_dim());
        let mut grad_rvs = Array1::<f64>::zeros(n_epochs);
        for n in 0..n_epochs {
            let values = forward.rows.row(n);
            let mut target = row_adjoints.row_mut(n);
            let mut along_shift = 0.0;
            for m in 0..n_pixels {
                let g = adjoint[[n, m]] * forward.scale[n];
                if g == 0.0 {
                    continue;
                }
                let bracket = &forward.brackets[[n, m]];
                bracket.scatter(g, &mut target);
                along_shift += g * bracket.slope(grid, values);
            }
            grad_rvs[n] = along_shift * ln_doppler_derivative(state.rvs[n]);
        }

        let mut grad_template = row_adjoints.sum_axis(Axis(0));
        Zip::from(&mut grad_template)
            .and(&template.ys)
            .for_each(|g, &t| *g += penalties.l1_template * sign(t));
        nll += penalties.l1_template * template.ys.iter().map(|t| t.abs()).sum::<f64>();

        let (grad_vectors, grad_weights) = match &state.basis {
            Some(basis) => {
                nll += penalties.l2_basis_vectors * basis.vectors.iter().map(|v| v * v).sum::<f64>();
                nll += penalties.l2_basis_weights * basis.weights.iter().map(|w| w * w).sum::<f64>();
                let grad_weights = row_adjoints.dot(&basis.vectors.t())
                    + &(2.0 * penalties.l2_basis_weights * &basis.weights);
                let grad_vectors = basis.weights.t().dot(&row_adjoints)
                    + &(2.0 * penalties.l2_basis_vectors * &basis.vectors);
                (Some(grad_vectors), Some(grad_weights))
            }
            None => (None, None),
        };

        gradients.push(ComponentGradient {
            rvs: grad_rvs,
            template: grad_template,
            basis_vectors: grad_vectors,
            basis_weights: grad_weights,
        });
    }

    Ok(Evaluation {
        synth,
        nll,
        chis,
        gradients,
    })
}

fn forward(
    data: &OrderData<'_>,
    kind: ComponentKind,
    state: &OrderState,
) -> Result<Forward, ComponentError> {
    let n_epochs = data.n_epochs();
    if state.rvs.len() != n_epochs {
        return Err(ComponentError::LengthMismatch {
            attribute: "rvs",
            expected: n_epochs,
            found: state.rvs.len(),
        });
    }
    let template = state.template()?;
    let interp = Interpolator::new(template.xs.view())?;
    let rows = state.row_values(n_epochs)?;
    let shifted = to_rest_frame(data.xs, state.rvs.view());
    let scale = if kind.scales_by_airmass() {
        if data.airms.len() != n_epochs {
            return Err(ComponentError::LengthMismatch {
                attribute: "airms",
                expected: n_epochs,
                found: data.airms.len(),
            });
        }
        data.airms.to_owned()
    } else {
        Array1::ones(n_epochs)
    };
    Ok(Forward {
        brackets: interp.brackets(shifted.view()),
        rows,
        scale,
    })
}

fn check_counts(settings: &[ComponentSettings], states: &[OrderState]) -> Result<(), OptimizeError> {
    if settings.len() != states.len() {
        return Err(OptimizeError::ComponentCountMismatch {
            settings: settings.len(),
            states: states.len(),
        });
    }
    Ok(())
}

/// Adam state for every parameter block of one component.
struct ComponentOptimizers {
    rvs: Option<Adam<Ix1>>,
    template: Option<Adam<Ix1>>,
    basis_vectors: Option<Adam<Ix2>>,
    basis_weights: Option<Adam<Ix2>>,
}

impl ComponentOptimizers {
    fn new(setting: &ComponentSettings, state: &OrderState) -> Self {
        let rates = setting.learning_rates;
        Self {
            rvs: (!setting.rvs_fixed).then(|| Adam::new(state.rvs.raw_dim(), rates.rvs)),
            template: state
                .template
                .as_ref()
                .map(|t| Adam::new(t.ys.raw_dim(), rates.template)),
            basis_vectors: state
                .basis
                .as_ref()
                .map(|b| Adam::new(b.vectors.raw_dim(), rates.basis)),
            basis_weights: state
                .basis
                .as_ref()
                .map(|b| Adam::new(b.weights.raw_dim(), rates.basis)),
        }
    }

    fn apply(&mut self, state: &mut OrderState, gradient: &ComponentGradient) {
        if let Some(adam) = self.rvs.as_mut() {
            adam.step(state.rvs.view_mut(), gradient.rvs.view());
        }
        if let (Some(adam), Some(template)) = (self.template.as_mut(), state.template.as_mut()) {
            adam.step(template.ys.view_mut(), gradient.template.view());
        }
        if let Some(basis) = state.basis.as_mut() {
            if let (Some(adam), Some(grad)) = (self.basis_vectors.as_mut(), &gradient.basis_vectors) {
                adam.step(basis.vectors.view_mut(), grad.view());
            }
            if let (Some(adam), Some(grad)) = (self.basis_weights.as_mut(), &gradient.basis_weights) {
                adam.step(basis.weights.view_mut(), grad.view());
            }
        }
    }
}

/// Outcome of optimizing one order.
#[derive(Debug, Clone)]
pub struct OrderReport {
    pub order: usize,
    /// Iterations actually completed; less than `niter` after a stop request.
    pub iterations: usize,
    pub stopped: bool,
    /// Objective after the last update.
    pub final_nll: f64,
    pub history: Option<History>,
}

/// One component of an order checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub name: String,
    pub kind: ComponentKind,
    pub rvs_fixed: bool,
    pub variable_bases: usize,
    pub learning_rates: LearningRates,
    pub state: OrderState,
}

/// The model parameters of a single order, written during optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCheckpoint {
    pub order: usize,
    /// Iterations completed when the checkpoint was taken.
    pub iteration: usize,
    pub components: Vec<CheckpointEntry>,
}

impl OrderCheckpoint {
    pub fn new(
        order: usize,
        iteration: usize,
        settings: &[ComponentSettings],
        states: &[OrderState],
    ) -> Self {
        let components = settings
            .iter()
            .zip(states)
            .map(|(setting, state)| CheckpointEntry {
                name: setting.name.clone(),
                kind: setting.kind,
                rvs_fixed: setting.rvs_fixed,
                variable_bases: setting.variable_bases,
                learning_rates: setting.learning_rates,
                state: state.clone(),
            })
            .collect();
        Self {
            order,
            iteration,
            components,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OptimizeError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptimizeError> {
        let toml_string = fs::read_to_string(path)?;
        let checkpoint = toml::from_str(&toml_string)?;
        Ok(checkpoint)
    }
}

/// Optimizes one order in place.
///
/// Uninitialized templates are built first, in component order, each one
/// from the data minus the components initialized before it. Then `niter`
/// Adam iterations run unless the observer asks to stop earlier.
pub fn optimize_order(
    data: &OrderData<'_>,
    settings: &[ComponentSettings],
    states: &mut [OrderState],
    options: &OptimizeOptions,
    observer: &mut dyn OptimizeObserver,
) -> Result<OrderReport, OptimizeError> {
    check_counts(settings, states)?;
    data.check_weights()?;
    let r = data.order;

    // --- 1. Lazy template initialization ---
    for index in 0..states.len() {
        if states[index].is_initialized() {
            continue;
        }
        let setting = &settings[index];
        let (current, others) = split_others(states, index);
        current
            .initialize_template(data, setting.variable_bases, &others)
            .map_err(component_error(&setting.name))?;
        log::info!(
            "Order {r}: initialized template of '{}' ({} nodes, K = {}).",
            setting.name,
            current.template.as_ref().map_or(0, |t| t.len()),
            current.rank()
        );
    }

    // --- 2. Optimizer state and history storage ---
    let mut optimizers: Vec<ComponentOptimizers> = settings
        .iter()
        .zip(states.iter())
        .map(|(setting, state)| ComponentOptimizers::new(setting, state))
        .collect();
    let names: Vec<String> = settings.iter().map(|s| s.name.clone()).collect();
    let mut history = options
        .record_history
        .then(|| History::new(r, options.niter, data.n_pixels(), &names, states));
    for state in states.iter_mut() {
        state.advance(FitStage::Optimizing);
    }

    // --- 3. Iterate ---
    observer.on_order_start(r, options.niter);
    let mut completed = 0;
    for i in 0..options.niter {
        if observer.should_stop() {
            log::warn!(
                "Order {r}: stop requested after {i} of {} iterations.",
                options.niter
            );
            break;
        }
        let evaluation = evaluate(data, settings, states, &options.penalties)?;
        if let Some(history) = history.as_mut() {
            history.record_iteration(i, evaluation.nll, evaluation.chis.view(), states)?;
        }
        for ((optimizer, state), gradient) in optimizers
            .iter_mut()
            .zip(states.iter_mut())
            .zip(&evaluation.gradients)
        {
            optimizer.apply(state, gradient);
        }
        completed = i + 1;
        observer.on_iteration(r, i, evaluation.nll);

        if let Some(sink) = &options.checkpoint {
            if should_checkpoint(i, options.save_every) {
                OrderCheckpoint::new(r, completed, settings, states).save(sink.model_path(r))?;
                if let Some(history) = &history {
                    history.write(sink.history_path(r))?;
                }
                log::debug!("Order {r}: checkpoint written after iteration {completed}.");
            }
        }
    }

    // --- 4. Wrap up ---
    let stopped = completed < options.niter;
    if !stopped {
        for state in states.iter_mut() {
            state.advance(FitStage::Finished);
        }
    }
    let final_nll = evaluate(data, settings, states, &options.penalties)?.nll;
    if let (Some(sink), Some(history)) = (&options.checkpoint, &history) {
        history.write(sink.history_path(r))?;
    }
    observer.on_order_finish(r, completed);
    Ok(OrderReport {
        order: r,
        iterations: completed,
        stopped,
        final_nll,
        history,
    })
}

impl Model {
    /// Optimizes order `r` of `data` and writes the result back into the model,
    /// also when the optimization fails part-way.
    pub fn optimize_order(
        &mut self,
        data: &Spectra,
        r: usize,
        options: &OptimizeOptions,
        observer: &mut dyn OptimizeObserver,
    ) -> Result<OrderReport, OptimizeError> {
        self.check_dataset(data)?;
        let order = data.order(r)?;
        let settings = self.component_settings();
        let mut states = self.take_order(r)?;
        let result = optimize_order(&order, &settings, &mut states, options, observer);
        self.restore_order(r, states)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Basis, Template};
    use crate::progress::NoopProgress;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    const N: usize = 3;
    const M: usize = 60;

    struct Fixture {
        xs: Array2<f64>,
        ys: Array2<f64>,
        ivars: Array2<f64>,
        bervs: Array1<f64>,
        airms: Array1<f64>,
    }

    impl Fixture {
        fn new(rng: &mut StdRng) -> Self {
            let xs = Array2::from_shape_fn((N, M), |(_, m)| 8.5 + m as f64 * 3e-6);
            let ys = Array2::from_shape_fn((N, M), |_| rng.gen_range(-0.3..0.0));
            let mut ivars = Array2::from_elem((N, M), 100.0);
            ivars[[1, 10]] = 0.0;
            ivars[[2, 40]] = 0.0;
            Self {
                xs,
                ys,
                ivars,
                bervs: Array1::zeros(N),
                airms: ndarray::array![1.0, 1.3, 1.7],
            }
        }

        fn order(&self) -> OrderData<'_> {
            OrderData {
                order: 0,
                xs: self.xs.view(),
                ys: self.ys.view(),
                ivars: self.ivars.view(),
                bervs: self.bervs.view(),
                airms: self.airms.view(),
            }
        }
    }

    fn settings() -> Vec<ComponentSettings> {
        [ComponentKind::Star, ComponentKind::Telluric]
            .into_iter()
            .map(|kind| ComponentSettings {
                name: kind.to_string(),
                kind,
                variable_bases: usize::from(kind == ComponentKind::Telluric),
                learning_rates: kind.default_learning_rates(),
                rvs_fixed: kind.rvs_fixed_by_default(),
            })
            .collect()
    }

    fn random_states(rng: &mut StdRng) -> Vec<OrderState> {
        let grid = Array1::from_shape_fn(70, |k| 8.5 - 20e-6 + k as f64 * 3.3e-6);
        let mut template_values =
            || Array1::from_shape_fn(grid.len(), |_| rng.gen_range(-0.5..-0.05));
        let star_ys = template_values();
        let telluric_ys = template_values();

        let mut star = OrderState::new(Array1::from_shape_fn(N, |n| -400.0 + 350.0 * n as f64));
        star.template = Some(Template::new(grid.clone(), star_ys).unwrap());

        let mut telluric = OrderState::new(Array1::from_shape_fn(N, |n| 15.0 * n as f64));
        telluric.template = Some(Template::new(grid.clone(), telluric_ys).unwrap());
        telluric.basis = Some(Basis {
            vectors: Array2::from_shape_fn((1, grid.len()), |(_, k)| 0.1 * (k as f64 * 0.7).sin()),
            weights: ndarray::array![[0.3], [-0.2], [0.5]],
        });
        vec![star, telluric]
    }

    fn assert_close(analytic: f64, numeric: f64, label: &str) {
        let tolerance = 1e-5 * analytic.abs().max(1.0);
        assert!(
            (analytic - numeric).abs() <= tolerance,
            "{label}: analytic {analytic:e} vs numeric {numeric:e}"
        );
    }

    #[test]
    fn checkpoint_cadence() {
        assert!(!should_checkpoint(0, 0));
        assert!(!should_checkpoint(9, 0));
        assert!(should_checkpoint(0, 1));
        assert!(!should_checkpoint(0, 10));
        assert!(should_checkpoint(9, 10));
        assert!(!should_checkpoint(10, 10));
        assert!(should_checkpoint(19, 10));
        let due: Vec<usize> = (0..25).filter(|&i| should_checkpoint(i, 10)).collect();
        assert_eq!(due, vec![9, 19]);
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(42);
        let fixture = Fixture::new(&mut rng);
        let data = fixture.order();
        let settings = settings();
        let states = random_states(&mut rng);
        let penalties = Penalties {
            l1_template: 0.5,
            l2_basis_vectors: 2.0,
            l2_basis_weights: 0.25,
        };
        let evaluation = evaluate(&data, &settings, &states, &penalties).unwrap();
        let nll_at = |states: &[OrderState]| evaluate(&data, &settings, states, &penalties).unwrap().nll;

        for c in 0..states.len() {
            let gradient = &evaluation.gradients[c];
            for n in 0..N {
                let h = 1e-3;
                let mut plus = states.clone();
                plus[c].rvs[n] += h;
                let mut minus = states.clone();
                minus[c].rvs[n] -= h;
                let numeric = (nll_at(&plus) - nll_at(&minus)) / (2.0 * h);
                assert_close(gradient.rvs[n], numeric, &format!("rvs[{c}][{n}]"));
            }
            for k in (0..70).step_by(3) {
                let h = 1e-6;
                let mut plus = states.clone();
                plus[c].template.as_mut().unwrap().ys[k] += h;
                let mut minus = states.clone();
                minus[c].template.as_mut().unwrap().ys[k] -= h;
                let numeric = (nll_at(&plus) - nll_at(&minus)) / (2.0 * h);
                assert_close(gradient.template[k], numeric, &format!("template[{c}][{k}]"));
            }
        }

        let gradient = &evaluation.gradients[1];
        let grad_vectors = gradient.basis_vectors.as_ref().unwrap();
        let grad_weights = gradient.basis_weights.as_ref().unwrap();
        for k in (0..70).step_by(5) {
            let h = 1e-6;
            let mut plus = states.clone();
            plus[1].basis.as_mut().unwrap().vectors[[0, k]] += h;
            let mut minus = states.clone();
            minus[1].basis.as_mut().unwrap().vectors[[0, k]] -= h;
            let numeric = (nll_at(&plus) - nll_at(&minus)) / (2.0 * h);
            assert_close(grad_vectors[[0, k]], numeric, &format!("vectors[{k}]"));
        }
        for n in 0..N {
            let h = 1e-6;
            let mut plus = states.clone();
            plus[1].basis.as_mut().unwrap().weights[[n, 0]] += h;
            let mut minus = states.clone();
            minus[1].basis.as_mut().unwrap().weights[[n, 0]] -= h;
            let numeric = (nll_at(&plus) - nll_at(&minus)) / (2.0 * h);
            assert_close(grad_weights[[n, 0]], numeric, &format!("weights[{n}]"));
        }
        assert!(gradient.basis_vectors.is_some());
        assert!(evaluation.gradients[0].basis_vectors.is_none());
    }

    #[test]
    fn masked_pixels_do_not_contribute() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut fixture = Fixture::new(&mut rng);
        let states = random_states(&mut rng);
        let settings = settings();
        let penalties = Penalties::default();
        let before = evaluate(&fixture.order(), &settings, &states, &penalties).unwrap();
        fixture.ys[[1, 10]] = f64::NAN;
        let after = evaluate(&fixture.order(), &settings, &states, &penalties).unwrap();
        assert_eq!(before.nll, after.nll);
        assert_eq!(after.chis[[1, 10]], 0.0);
    }

    #[test]
    fn fixed_velocities_and_frozen_templates_do_not_move() {
        let mut rng = StdRng::seed_from_u64(5);
        let fixture = Fixture::new(&mut rng);
        let mut settings = settings();
        settings[0].learning_rates.template = 0.0;
        let mut states = random_states(&mut rng);
        let original = states.clone();
        let options = OptimizeOptions {
            niter: 5,
            ..Default::default()
        };
        let report =
            optimize_order(&fixture.order(), &settings, &mut states, &options, &mut NoopProgress).unwrap();
        assert_eq!(report.iterations, 5);
        assert!(!report.stopped);
        assert_eq!(states[1].rvs, original[1].rvs);
        assert_eq!(states[0].template, original[0].template);
        assert_ne!(states[0].rvs, original[0].rvs);
        assert_ne!(states[1].template, original[1].template);
        assert!(states.iter().all(|s| s.stage == FitStage::Finished));
    }

    struct StopAfter(usize);

    impl OptimizeObserver for StopAfter {
        fn on_iteration(&mut self, order: usize, iteration: usize, nll: f64) {
            let _ = (order, iteration, nll);
            self.0 = self.0.saturating_sub(1);
        }
        fn should_stop(&self) -> bool {
            self.0 == 0
        }
    }

    #[test]
    fn stop_requests_end_the_order_early_and_checkpoints_are_written() {
        let mut rng = StdRng::seed_from_u64(9);
        let fixture = Fixture::new(&mut rng);
        let settings = settings();
        let mut states = random_states(&mut rng);
        let dir = tempdir().unwrap();
        let sink = CheckpointSink::new(dir.path(), "run");
        let options = OptimizeOptions {
            niter: 10,
            save_every: 2,
            record_history: true,
            checkpoint: Some(sink.clone()),
            ..Default::default()
        };
        let report =
            optimize_order(&fixture.order(), &settings, &mut states, &options, &mut StopAfter(5))
                .unwrap();
        assert_eq!(report.iterations, 5);
        assert!(report.stopped);
        assert!(states.iter().all(|s| s.stage == FitStage::Optimizing));

        let checkpoint = OrderCheckpoint::load(sink.model_path(0)).unwrap();
        assert_eq!(checkpoint.iteration, 4);
        assert_eq!(checkpoint.components.len(), 2);
        assert_eq!(checkpoint.components[1].name, "telluric");

        let history = History::read(sink.history_path(0)).unwrap();
        assert_eq!(history.recorded, 5);
        assert_eq!(history.niter, 10);
        assert_eq!(history, report.history.unwrap());
    }

    #[test]
    fn mismatched_settings_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let fixture = Fixture::new(&mut rng);
        let states = random_states(&mut rng);
        let err = evaluate(&fixture.order(), &settings()[..1], &states, &Penalties::default())
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizeError::ComponentCountMismatch {
                settings: 1,
                states: 2
            }
        ));
    }
}
