//! # Optimization History
//!
//! A per-order record of every iteration: the objective, the chi residuals,
//! and a snapshot of each component's parameters. All storage is allocated up
//! front for the full iteration budget; recording only copies into slices.

use crate::component::OrderState;
use ndarray::{Array1, Array2, Array3, ArrayView2, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to read or write history file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML history file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize history to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Iteration {index} is out of range for a history of {niter} iterations.")]
    IterationOutOfRange { index: usize, niter: usize },

    #[error("History tracks {expected} components, but {found} were supplied.")]
    ComponentCountMismatch { expected: usize, found: usize },

    #[error("'{attribute}' has shape {found:?}, but the history stores {expected:?}.")]
    ShapeMismatch {
        attribute: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Per-iteration parameter snapshots of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTrace {
    /// Position of the component in the model.
    pub index: usize,
    pub name: String,
    /// `(niter × N)`
    pub rvs: Array2<f64>,
    /// `(niter × template length)`
    pub template: Array2<f64>,
    /// `(niter × K × template length)`
    pub basis_vectors: Array3<f64>,
    /// `(niter × N × K)`
    pub basis_weights: Array3<f64>,
}

/// The optimization record of one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub order: usize,
    pub niter: usize,
    /// Number of iterations actually recorded.
    pub recorded: usize,
    pub nll_history: Array1<f64>,
    /// `(niter × N × M)` chi residuals `(y - synth) * sqrt(ivar)`.
    pub chis_history: Array3<f64>,
    pub components: Vec<ComponentTrace>,
}

impl History {
    /// Allocates zeroed storage sized from the current (initialized) states.
    pub fn new(
        order: usize,
        niter: usize,
        n_pixels: usize,
        names: &[String],
        states: &[OrderState],
    ) -> Self {
        let components = names
            .iter()
            .zip(states)
            .enumerate()
            .map(|(index, (name, state))| {
                let n_epochs = state.rvs.len();
                let template_len = state.template.as_ref().map_or(0, |t| t.len());
                let rank = state.rank();
                ComponentTrace {
                    index,
                    name: name.clone(),
                    rvs: Array2::zeros((niter, n_epochs)),
                    template: Array2::zeros((niter, template_len)),
                    basis_vectors: Array3::zeros((niter, rank, template_len)),
                    basis_weights: Array3::zeros((niter, n_epochs, rank)),
                }
            })
            .collect();
        let n_epochs = states.first().map_or(0, |s| s.rvs.len());
        Self {
            order,
            niter,
            recorded: 0,
            nll_history: Array1::zeros(niter),
            chis_history: Array3::zeros((niter, n_epochs, n_pixels)),
            components,
        }
    }

    /// Stores the state at the start of iteration `i`.
    pub fn record_iteration(
        &mut self,
        i: usize,
        nll: f64,
        chis: ArrayView2<f64>,
        states: &[OrderState],
    ) -> Result<(), HistoryError> {
        if i >= self.niter {
            return Err(HistoryError::IterationOutOfRange {
                index: i,
                niter: self.niter,
            });
        }
        if states.len() != self.components.len() {
            return Err(HistoryError::ComponentCountMismatch {
                expected: self.components.len(),
                found: states.len(),
            });
        }
        check_shape("chis", &self.chis_history.shape()[1..], chis.shape())?;
        for (trace, state) in self.components.iter().zip(states) {
            check_shape(
                &format!("{} rvs", trace.name),
                &trace.rvs.shape()[1..],
                state.rvs.shape(),
            )?;
            if let Some(template) = &state.template {
                check_shape(
                    &format!("{} template", trace.name),
                    &trace.template.shape()[1..],
                    template.ys.shape(),
                )?;
            }
            if let Some(basis) = &state.basis {
                check_shape(
                    &format!("{} basis vectors", trace.name),
                    &trace.basis_vectors.shape()[1..],
                    basis.vectors.shape(),
                )?;
                check_shape(
                    &format!("{} basis weights", trace.name),
                    &trace.basis_weights.shape()[1..],
                    basis.weights.shape(),
                )?;
            }
        }

        self.nll_history[i] = nll;
        self.chis_history.slice_mut(s![i, .., ..]).assign(&chis);
        for (trace, state) in self.components.iter_mut().zip(states) {
            trace.rvs.row_mut(i).assign(&state.rvs);
            if let Some(template) = &state.template {
                trace.template.row_mut(i).assign(&template.ys);
            }
            if let Some(basis) = &state.basis {
                trace
                    .basis_vectors
                    .slice_mut(s![i, .., ..])
                    .assign(&basis.vectors);
                trace
                    .basis_weights
                    .slice_mut(s![i, .., ..])
                    .assign(&basis.weights);
            }
        }
        self.recorded = self.recorded.max(i + 1);
        Ok(())
    }

    /// The objective at the last recorded iteration.
    pub fn final_nll(&self) -> Option<f64> {
        self.recorded.checked_sub(1).map(|i| self.nll_history[i])
    }

    /// The `(recorded × N)` velocity trace of the named component.
    pub fn rv_trace(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.rvs.slice(s![..self.recorded, ..]))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), HistoryError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let toml_string = fs::read_to_string(path)?;
        let history = toml::from_str(&toml_string)?;
        Ok(history)
    }
}

fn check_shape(attribute: &str, expected: &[usize], found: &[usize]) -> Result<(), HistoryError> {
    if expected != found {
        return Err(HistoryError::ShapeMismatch {
            attribute: attribute.to_string(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Basis, Template};
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn states() -> Vec<OrderState> {
        let mut star = OrderState::new(array![1.5, -2.25]);
        star.template = Some(Template::new(array![0.0, 1.0, 2.0], array![-0.1, -0.2, 0.3]).unwrap());
        let mut telluric = OrderState::new(array![0.0, 0.0]);
        telluric.template = Some(Template::new(array![0.0, 0.5], array![0.01, 0.02]).unwrap());
        telluric.basis = Some(Basis {
            vectors: array![[0.6, -0.8]],
            weights: array![[2.0], [-1.0 / 3.0]],
        });
        vec![star, telluric]
    }

    fn names() -> Vec<String> {
        vec!["star".to_string(), "tellurics".to_string()]
    }

    #[test]
    fn recording_fills_preallocated_slices() {
        let mut states = states();
        let mut history = History::new(4, 3, 5, &names(), &states);
        assert_eq!(history.chis_history.dim(), (3, 2, 5));
        assert_eq!(history.components[1].basis_vectors.dim(), (3, 1, 2));
        assert_eq!(history.final_nll(), None);

        let chis = Array2::from_elem((2, 5), 0.5);
        history.record_iteration(0, 10.0, chis.view(), &states).unwrap();
        states[0].rvs[0] = 3.0;
        history.record_iteration(1, 7.5, chis.view(), &states).unwrap();

        assert_eq!(history.final_nll(), Some(7.5));
        let trace = history.rv_trace("star").unwrap();
        assert_eq!(trace, array![[1.5, -2.25], [3.0, -2.25]]);
        assert_eq!(history.components[1].basis_weights[[1, 1, 0]], -1.0 / 3.0);
        assert!(history.rv_trace("missing").is_none());
    }

    #[test]
    fn out_of_range_or_misshapen_records_are_rejected() {
        let states = states();
        let mut history = History::new(0, 2, 5, &names(), &states);
        let chis = Array2::zeros((2, 5));
        assert!(matches!(
            history.record_iteration(2, 0.0, chis.view(), &states),
            Err(HistoryError::IterationOutOfRange { index: 2, niter: 2 })
        ));
        let wrong = Array2::zeros((2, 4));
        match history.record_iteration(0, 0.0, wrong.view(), &states).unwrap_err() {
            HistoryError::ShapeMismatch { attribute, .. } => assert_eq!(attribute, "chis"),
            other => panic!("Expected ShapeMismatch, got {other:?}"),
        }
        assert!(matches!(
            history.record_iteration(0, 0.0, chis.view(), &states[..1]),
            Err(HistoryError::ComponentCountMismatch { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn write_then_read_is_exact() {
        let states = states();
        let mut history = History::new(7, 2, 3, &names(), &states);
        let chis = array![[0.1, -0.7, 1.0 / 7.0], [2.5e-12, 0.0, -3.0]];
        history.record_iteration(0, 123.456_789, chis.view(), &states).unwrap();
        history.record_iteration(1, 1.0 / 3.0, chis.view(), &states).unwrap();

        let file = NamedTempFile::new().unwrap();
        history.write(file.path()).unwrap();
        let restored = History::read(file.path()).unwrap();
        assert_eq!(restored, history);
    }
}
