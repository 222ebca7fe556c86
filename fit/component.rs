//! # Additive Spectral Components
//!
//! A component is one physical contributor to the observed log flux: the star
//! itself or the telluric absorption of Earth's atmosphere. Per echelle order it
//! owns a velocity per epoch, a rest-frame template on its own log-wavelength
//! grid, and optionally a rank-K basis that lets the template vary from epoch
//! to epoch.
//!
//! Per-order state lives in [`OrderState`] so that the optimizer can move a
//! whole order out of the model, work on it, and move it back.

use crate::doppler::to_rest_frame;
use crate::interp::{InterpError, Interpolator};
use crate::spectra::OrderData;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{QR, SVD};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Spacing of the log-uniform template grid, about 0.5 km/s per node.
pub fn template_grid_step() -> f64 {
    2.0 * (6000.01_f64.ln() - 6000.0_f64.ln())
}

/// Grid nodes added beyond the data range on each side.
pub const TEMPLATE_GRID_MARGIN: f64 = 10.0;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Component '{name}' has no order {order}; the model has {available} orders.")]
    OrderOutOfRange {
        name: String,
        order: usize,
        available: usize,
    },

    #[error("The template has not been initialized for this order.")]
    TemplateNotInitialized,

    #[error("Order {order}: no unmasked pixels are available to build a template.")]
    NoUsablePixels { order: usize },

    #[error("'{attribute}' has length {found}, but {expected} was expected.")]
    LengthMismatch {
        attribute: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid template grid: {0}")]
    Interp(#[from] InterpError),

    #[error("Singular value decomposition failed: {0}")]
    Linalg(#[from] LinalgError),

    #[error("Singular value decomposition did not return singular vectors.")]
    SvdIncomplete,
}

/// The kind of physical contributor a component models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Star,
    Telluric,
}

impl ComponentKind {
    /// Telluric absorption deepens with airmass; the synthesized spectrum of
    /// such a component is multiplied by each epoch's airmass.
    pub fn scales_by_airmass(self) -> bool {
        matches!(self, ComponentKind::Telluric)
    }

    /// Telluric lines are fixed in the observatory frame.
    pub fn rvs_fixed_by_default(self) -> bool {
        matches!(self, ComponentKind::Telluric)
    }

    pub fn default_learning_rates(self) -> LearningRates {
        match self {
            ComponentKind::Star => LearningRates {
                rvs: 10.0,
                template: 0.01,
                basis: 0.01,
            },
            ComponentKind::Telluric => LearningRates {
                rvs: 10.0,
                template: 0.1,
                basis: 0.01,
            },
        }
    }

    /// Starting velocities: the star moves with the (mean-subtracted)
    /// barycentric correction, the atmosphere sits at rest.
    pub fn initial_rvs(self, bervs: ArrayView1<f64>) -> Array1<f64> {
        match self {
            ComponentKind::Star => {
                let mean = bervs.mean().unwrap_or(0.0);
                bervs.mapv(|b| b - mean)
            }
            ComponentKind::Telluric => Array1::zeros(bervs.len()),
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Star => write!(f, "star"),
            ComponentKind::Telluric => write!(f, "telluric"),
        }
    }
}

/// Adam step sizes of the three parameter groups of a component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub rvs: f64,
    pub template: f64,
    pub basis: f64,
}

/// Lifecycle of one component on one order. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum FitStage {
    #[default]
    Uninitialized,
    TemplateInitialized,
    Optimizing,
    Finished,
}

/// A rest-frame spectrum sampled on a strictly increasing log-wavelength grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub xs: Array1<f64>,
    pub ys: Array1<f64>,
}

impl Template {
    /// Checks the grid and the value count.
    pub fn new(xs: Array1<f64>, ys: Array1<f64>) -> Result<Self, ComponentError> {
        let interp = Interpolator::new(xs.view())?;
        if ys.len() != interp.len() {
            return Err(InterpError::LengthMismatch {
                grid: interp.len(),
                values: ys.len(),
            }
            .into());
        }
        Ok(Self { xs, ys })
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

/// Rank-K time-variable correction living on the template grid: epoch `n`
/// sees the template plus `weights[n] · vectors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basis {
    /// Eigen-spectra, `(K × template length)`.
    pub vectors: Array2<f64>,
    /// Per-epoch amplitudes, `(N × K)`.
    pub weights: Array2<f64>,
}

impl Basis {
    pub fn rank(&self) -> usize {
        self.vectors.nrows()
    }

    /// The `(N × template length)` correction `weights · vectors`.
    pub fn correction(&self) -> Array2<f64> {
        self.weights.dot(&self.vectors)
    }
}

/// Parameters of one component on one order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderState {
    pub rvs: Array1<f64>,
    pub template: Option<Template>,
    pub basis: Option<Basis>,
    pub stage: FitStage,
}

impl OrderState {
    pub fn new(rvs: Array1<f64>) -> Self {
        Self {
            rvs,
            ..Default::default()
        }
    }

    pub fn template(&self) -> Result<&Template, ComponentError> {
        self.template
            .as_ref()
            .ok_or(ComponentError::TemplateNotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.template.is_some()
    }

    /// Moves the lifecycle forward; requests to go back are ignored.
    pub fn advance(&mut self, stage: FitStage) {
        self.stage = self.stage.max(stage);
    }

    /// Number of active basis vectors.
    pub fn rank(&self) -> usize {
        self.basis.as_ref().map_or(0, Basis::rank)
    }

    /// Per-epoch rest-frame spectra `(N × template length)`: the template, plus
    /// the basis correction when there is one.
    pub fn row_values(&self, n_epochs: usize) -> Result<Array2<f64>, ComponentError> {
        let template = self.template()?;
        let mut rows = Array2::zeros((n_epochs, template.len()));
        rows.assign(&template.ys);
        if let Some(basis) = self.basis.as_ref().filter(|b| b.rank() > 0) {
            check_len("basis weights", n_epochs, basis.weights.nrows())?;
            check_len("basis vectors", template.len(), basis.vectors.ncols())?;
            rows += &basis.correction();
        }
        Ok(rows)
    }

    /// Evaluates the bare template at `xs` shifted into the rest frame of
    /// velocities `rvs`.
    pub fn shift_and_interp(
        &self,
        xs: ArrayView2<f64>,
        rvs: ArrayView1<f64>,
    ) -> Result<Array2<f64>, ComponentError> {
        check_len("rvs", xs.nrows(), rvs.len())?;
        let template = self.template()?;
        let interp = Interpolator::new(template.xs.view())?;
        let shifted = to_rest_frame(xs, rvs);
        Ok(interp.evaluate(template.ys.view(), shifted.view())?)
    }

    /// The component's full contribution to the log flux at `xs`.
    pub fn synthesize(
        &self,
        kind: ComponentKind,
        xs: ArrayView2<f64>,
        rvs: ArrayView1<f64>,
        airms: ArrayView1<f64>,
    ) -> Result<Array2<f64>, ComponentError> {
        let mut synth = if self.rank() == 0 {
            self.shift_and_interp(xs, rvs)?
        } else {
            check_len("rvs", xs.nrows(), rvs.len())?;
            let template = self.template()?;
            let interp = Interpolator::new(template.xs.view())?;
            let rows = self.row_values(xs.nrows())?;
            let shifted = to_rest_frame(xs, rvs);
            let mut synth = Array2::zeros(xs.raw_dim());
            for ((mut out, values), queries) in synth
                .rows_mut()
                .into_iter()
                .zip(rows.rows())
                .zip(shifted.rows())
            {
                out.assign(&interp.evaluate_row(values, queries)?);
            }
            synth
        };
        if kind.scales_by_airmass() {
            check_len("airms", xs.nrows(), airms.len())?;
            Zip::from(synth.rows_mut())
                .and(&airms)
                .for_each(|mut row, &a| row *= a);
        }
        Ok(synth)
    }

    /// Builds the template (and basis, for `variable_bases > 0`) from the
    /// residual of the data after subtracting the already-initialized
    /// templates in `others`.
    pub fn initialize_template(
        &mut self,
        data: &OrderData<'_>,
        variable_bases: usize,
        others: &[&OrderState],
    ) -> Result<(), ComponentError> {
        check_len("rvs", data.n_epochs(), self.rvs.len())?;

        // --- 1. Data in the component rest frame ---
        let shifted = to_rest_frame(data.xs, self.rvs.view());
        let mut resids = data.ys.to_owned();
        for other in others.iter().filter(|o| o.is_initialized()) {
            resids -= &other.shift_and_interp(data.xs, other.rvs.view())?;
        }
        let usable = Zip::from(&data.ivars)
            .and(&shifted)
            .and(&resids)
            .map_collect(|&ivar, &x, &y| {
                ivar > 0.0 && ivar.is_finite() && x.is_finite() && y.is_finite()
            });

        // --- 2. Bin the residual onto a fresh log-uniform grid ---
        let (lo, hi) = shifted
            .indexed_iter()
            .filter(|(idx, _)| usable[*idx])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, &x)| {
                (lo.min(x), hi.max(x))
            });
        if lo > hi {
            return Err(ComponentError::NoUsablePixels { order: data.order });
        }
        let grid = log_uniform_grid(lo, hi);
        let samples = shifted
            .indexed_iter()
            .filter(|(idx, _)| usable[*idx])
            .map(|(idx, &x)| (x, resids[idx]));
        let ys = bin_onto_grid(grid.view(), samples)
            .ok_or(ComponentError::NoUsablePixels { order: data.order })?;
        self.template = Some(Template { xs: grid, ys });
        self.basis = None;

        // --- 3. Optional rank-K basis from the leftover residual ---
        if variable_bases > 0 {
            resids -= &self.shift_and_interp(data.xs, self.rvs.view())?;
            let template = self.template()?;
            let mut binned = Array2::zeros((data.n_epochs(), template.len()));
            for (n, mut row) in binned.rows_mut().into_iter().enumerate() {
                let samples = (0..data.n_pixels())
                    .filter(|&m| usable[[n, m]])
                    .map(|m| (shifted[[n, m]], resids[[n, m]]));
                if let Some(values) = bin_onto_grid(template.xs.view(), samples) {
                    row.assign(&values);
                }
            }
            match truncated_svd(binned.view(), variable_bases) {
                Ok(basis) => self.basis = Some(basis),
                Err(err) => {
                    log::warn!(
                        "Order {}: basis initialization failed ({err}); continuing without variable bases.",
                        data.order
                    );
                }
            }
        }
        self.advance(FitStage::TemplateInitialized);
        Ok(())
    }
}

fn check_len(attribute: &'static str, expected: usize, found: usize) -> Result<(), ComponentError> {
    if expected != found {
        return Err(ComponentError::LengthMismatch {
            attribute,
            expected,
            found,
        });
    }
    Ok(())
}

/// Log-uniform nodes covering `[lo, hi]` with [`TEMPLATE_GRID_MARGIN`] extra
/// steps on each side.
pub fn log_uniform_grid(lo: f64, hi: f64) -> Array1<f64> {
    let dx = template_grid_step();
    let start = lo - TEMPLATE_GRID_MARGIN * dx;
    let end = hi + TEMPLATE_GRID_MARGIN * dx;
    let n_nodes = ((end - start) / dx).ceil() as usize;
    Array1::from_iter((0..n_nodes).map(|k| start + k as f64 * dx))
}

/// Averages `(x, y)` samples into the nearest grid node. Nodes without samples
/// are linearly interpolated from the nearest filled nodes and held constant
/// beyond the outermost ones. Returns `None` when there are no samples.
pub fn bin_onto_grid(
    grid: ArrayView1<f64>,
    samples: impl Iterator<Item = (f64, f64)>,
) -> Option<Array1<f64>> {
    let len = grid.len();
    let mut sums = vec![0.0; len];
    let mut counts = vec![0usize; len];
    let nodes = grid.to_vec();
    let nearest = |x: f64| {
        let upper = nodes.partition_point(|&g| g < x);
        if upper == 0 {
            0
        } else if upper == len {
            len - 1
        } else if x - nodes[upper - 1] < nodes[upper] - x {
            upper - 1
        } else {
            upper
        }
    };
    for (x, y) in samples {
        let k = nearest(x);
        sums[k] += y;
        counts[k] += 1;
    }

    let filled: Vec<usize> = (0..len).filter(|&k| counts[k] > 0).collect();
    let (&first, &last) = (filled.first()?, filled.last()?);
    let mut values = Array1::zeros(len);
    for &k in &filled {
        values[k] = sums[k] / counts[k] as f64;
    }
    for k in 0..first {
        values[k] = values[first];
    }
    for k in last + 1..len {
        values[k] = values[last];
    }
    for pair in filled.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        for k in a + 1..b {
            let w = (grid[k] - grid[a]) / (grid[b] - grid[a]);
            values[k] = (1.0 - w) * values[a] + w * values[b];
        }
    }
    Some(values)
}

/// Best rank-`rank` approximation of `matrix` (N × M) as `weights · vectors`
/// with `weights = U_K S_K` and `vectors = V_Kᵀ`. Ranks beyond `min(N, M)` are
/// padded with zeros.
pub fn truncated_svd(matrix: ArrayView2<f64>, rank: usize) -> Result<Basis, ComponentError> {
    let (n_rows, n_cols) = matrix.dim();
    let (u, sigma, vt) = if n_rows < n_cols {
        // Thin factorization: Mᵀ = Q R, so M = Rᵀ Qᵀ and only the small Rᵀ
        // needs a full SVD.
        let (q, r) = matrix.t().qr()?;
        let (u, sigma, vt_small) = r.t().svd(true, true)?;
        let vt_small = vt_small.ok_or(ComponentError::SvdIncomplete)?;
        (u, sigma, Some(vt_small.dot(&q.t())))
    } else {
        matrix.svd(true, true)?
    };
    let u = u.ok_or(ComponentError::SvdIncomplete)?;
    let vt = vt.ok_or(ComponentError::SvdIncomplete)?;

    let kept = rank.min(sigma.len());
    let mut weights = Array2::zeros((n_rows, rank));
    let mut vectors = Array2::zeros((rank, n_cols));
    for k in 0..kept {
        weights
            .column_mut(k)
            .assign(&(&u.column(k) * sigma[k]));
        vectors.row_mut(k).assign(&vt.row(k));
    }
    Ok(Basis { vectors, weights })
}

/// One additive component across all orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub kind: ComponentKind,
    /// Number of variable basis vectors (K).
    pub variable_bases: usize,
    pub learning_rates: LearningRates,
    pub orders: Vec<OrderState>,
}

impl Component {
    /// A component with kind-default learning rates and starting velocities on
    /// every order.
    pub fn new(
        name: impl Into<String>,
        kind: ComponentKind,
        variable_bases: usize,
        n_orders: usize,
        bervs: ArrayView1<f64>,
    ) -> Self {
        let rvs = kind.initial_rvs(bervs);
        Self {
            name: name.into(),
            kind,
            variable_bases,
            learning_rates: kind.default_learning_rates(),
            orders: vec![OrderState::new(rvs); n_orders],
        }
    }

    pub fn order(&self, r: usize) -> Result<&OrderState, ComponentError> {
        self.orders.get(r).ok_or_else(|| self.out_of_range(r))
    }

    pub fn order_mut(&mut self, r: usize) -> Result<&mut OrderState, ComponentError> {
        let available = self.orders.len();
        let name = &self.name;
        self.orders
            .get_mut(r)
            .ok_or_else(|| ComponentError::OrderOutOfRange {
                name: name.clone(),
                order: r,
                available,
            })
    }

    fn out_of_range(&self, r: usize) -> ComponentError {
        ComponentError::OrderOutOfRange {
            name: self.name.clone(),
            order: r,
            available: self.orders.len(),
        }
    }

    pub fn shift_and_interp(
        &self,
        r: usize,
        xs: ArrayView2<f64>,
        rvs: ArrayView1<f64>,
    ) -> Result<Array2<f64>, ComponentError> {
        self.order(r)?.shift_and_interp(xs, rvs)
    }

    pub fn synthesize(
        &self,
        r: usize,
        xs: ArrayView2<f64>,
        rvs: ArrayView1<f64>,
        airms: ArrayView1<f64>,
    ) -> Result<Array2<f64>, ComponentError> {
        self.order(r)?.synthesize(self.kind, xs, rvs, airms)
    }

    /// See [`OrderState::initialize_template`].
    pub fn initialize_template(
        &mut self,
        data: &OrderData<'_>,
        others: &[&Component],
    ) -> Result<(), ComponentError> {
        let r = data.order;
        let other_states = others
            .iter()
            .map(|c| c.order(r))
            .collect::<Result<Vec<_>, _>>()?;
        let variable_bases = self.variable_bases;
        self.order_mut(r)?
            .initialize_template(data, variable_bases, &other_states)
    }

    /// Installs a known template on order `r`, dropping any basis.
    pub fn set_template(&mut self, r: usize, template: Template) -> Result<(), ComponentError> {
        let template = Template::new(template.xs, template.ys)?;
        let state = self.order_mut(r)?;
        state.template = Some(template);
        state.basis = None;
        state.advance(FitStage::TemplateInitialized);
        Ok(())
    }

    /// Overwrites the velocities of order `r`.
    pub fn set_rvs(&mut self, r: usize, rvs: Array1<f64>) -> Result<(), ComponentError> {
        let state = self.order_mut(r)?;
        check_len("rvs", state.rvs.len(), rvs.len())?;
        state.rvs = rvs;
        Ok(())
    }
}

/// Splits `states` into the entry at `index` and shared references to every
/// other entry, in list order.
pub fn split_others(states: &mut [OrderState], index: usize) -> (&mut OrderState, Vec<&OrderState>) {
    let (before, rest) = states.split_at_mut(index);
    let (current, after) = rest.split_at_mut(1);
    let others = before.iter().chain(after.iter()).collect();
    (&mut current[0], others)
}
