use crate::component::{Component, ComponentError, ComponentKind, LearningRates, OrderState};
use crate::spectra::{SpectraError, Spectra};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the persisted form of a fitted model.

/// What the optimizer needs to know about a component besides its per-order
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSettings {
    pub name: String,
    pub kind: ComponentKind,
    pub variable_bases: usize,
    pub learning_rates: LearningRates,
    pub rvs_fixed: bool,
}

/// The ordered set of additive components for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub n_orders: usize,
    pub n_epochs: usize,
    /// Indices of components whose velocities are not optimized.
    pub rvs_fixed: BTreeSet<usize>,
    /// Barycentric velocities used to seed new components.
    pub bervs: Array1<f64>,
    pub components: Vec<Component>,
}

/// A comprehensive error type for model assembly, synthesis, and persistence.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("A component named '{0}' already exists; component names must be unique.")]
    DuplicateComponentName(String),

    #[error("No component named '{0}' exists in the model.")]
    UnknownComponent(String),

    #[error("Order {order} is out of range; the model has {available} orders.")]
    OrderOutOfRange { order: usize, available: usize },

    #[error(
        "The model was built for {model_orders} orders x {model_epochs} epochs, but the dataset has {data_orders} x {data_epochs}."
    )]
    DatasetMismatch {
        model_orders: usize,
        model_epochs: usize,
        data_orders: usize,
        data_epochs: usize,
    },

    #[error("Restoring order {order}: expected state for {expected} components, got {found}.")]
    StateCountMismatch {
        order: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Spectra(#[from] SpectraError),
}

impl Model {
    /// An empty model shaped for `data`.
    pub fn new(data: &Spectra) -> Self {
        Self {
            n_orders: data.n_orders(),
            n_epochs: data.n_epochs(),
            rvs_fixed: BTreeSet::new(),
            bervs: data.bervs.clone(),
            components: Vec::new(),
        }
    }

    /// Appends a component and returns its index.
    pub fn add_component(
        &mut self,
        kind: ComponentKind,
        name: &str,
        rvs_fixed: bool,
        variable_bases: usize,
    ) -> Result<usize, ModelError> {
        if self.components.iter().any(|c| c.name == name) {
            return Err(ModelError::DuplicateComponentName(name.to_string()));
        }
        let index = self.components.len();
        self.components.push(Component::new(
            name,
            kind,
            variable_bases,
            self.n_orders,
            self.bervs.view(),
        ));
        if rvs_fixed {
            self.rvs_fixed.insert(index);
        }
        log::debug!("Added {kind} component '{name}' (K = {variable_bases}).");
        Ok(index)
    }

    /// Adds a star with free velocities.
    pub fn add_star(&mut self, name: &str, variable_bases: usize) -> Result<usize, ModelError> {
        let kind = ComponentKind::Star;
        self.add_component(kind, name, kind.rvs_fixed_by_default(), variable_bases)
    }

    /// Adds a telluric component with velocities fixed at zero.
    pub fn add_telluric(&mut self, name: &str, variable_bases: usize) -> Result<usize, ModelError> {
        let kind = ComponentKind::Telluric;
        self.add_component(kind, name, kind.rvs_fixed_by_default(), variable_bases)
    }

    pub fn component(&self, name: &str) -> Result<&Component, ModelError> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ModelError::UnknownComponent(name.to_string()))
    }

    pub fn component_mut(&mut self, name: &str) -> Result<&mut Component, ModelError> {
        self.components
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ModelError::UnknownComponent(name.to_string()))
    }

    pub fn is_rvs_fixed(&self, index: usize) -> bool {
        self.rvs_fixed.contains(&index)
    }

    /// Everything but the per-order parameters, in component order.
    pub fn component_settings(&self) -> Vec<ComponentSettings> {
        self.components
            .iter()
            .enumerate()
            .map(|(index, c)| ComponentSettings {
                name: c.name.clone(),
                kind: c.kind,
                variable_bases: c.variable_bases,
                learning_rates: c.learning_rates,
                rvs_fixed: self.is_rvs_fixed(index),
            })
            .collect()
    }

    /// Fails unless `data` has the shape the model was built for.
    pub fn check_dataset(&self, data: &Spectra) -> Result<(), ModelError> {
        if data.n_orders() != self.n_orders || data.n_epochs() != self.n_epochs {
            return Err(ModelError::DatasetMismatch {
                model_orders: self.n_orders,
                model_epochs: self.n_epochs,
                data_orders: data.n_orders(),
                data_epochs: data.n_epochs(),
            });
        }
        Ok(())
    }

    fn check_order(&self, r: usize) -> Result<(), ModelError> {
        if r >= self.n_orders {
            return Err(ModelError::OrderOutOfRange {
                order: r,
                available: self.n_orders,
            });
        }
        Ok(())
    }

    /// The predicted log flux of order `r`: the sum of every initialized
    /// component evaluated at the observed wavelengths with its current
    /// velocities. All zeros when no component contributes.
    pub fn synthesize(&self, data: &Spectra, r: usize) -> Result<Array2<f64>, ModelError> {
        self.check_dataset(data)?;
        let order = data.order(r)?;
        let mut synth = Array2::zeros(order.xs.raw_dim());
        for component in &self.components {
            let state = component.order(r)?;
            if state.is_initialized() {
                synth += &state.synthesize(component.kind, order.xs, state.rvs.view(), order.airms)?;
            }
        }
        Ok(synth)
    }

    /// Moves the parameters of order `r` out of every component, leaving
    /// defaults behind until [`Model::restore_order`] puts them back.
    pub fn take_order(&mut self, r: usize) -> Result<Vec<OrderState>, ModelError> {
        self.check_order(r)?;
        Ok(self
            .components
            .iter_mut()
            .map(|c| std::mem::take(&mut c.orders[r]))
            .collect())
    }

    pub fn restore_order(&mut self, r: usize, states: Vec<OrderState>) -> Result<(), ModelError> {
        self.check_order(r)?;
        if states.len() != self.components.len() {
            return Err(ModelError::StateCountMismatch {
                order: r,
                expected: self.components.len(),
                found: states.len(),
            });
        }
        for (component, state) in self.components.iter_mut().zip(states) {
            component.orders[r] = state;
        }
        Ok(())
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model consisting of the following components:")?;
        for (index, c) in self.components.iter().enumerate() {
            let rvs = if self.is_rvs_fixed(index) {
                "RVs fixed"
            } else {
                "RVs variable"
            };
            write!(
                f,
                "\n{}: {} ({}); {} variable basis components",
                c.name, c.kind, rvs, c.variable_bases
            )?;
        }
        Ok(())
    }
}
