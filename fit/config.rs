//! # Run Configuration
//!
//! A TOML file describing one fitting run: the components to fit, iteration
//! budget, penalties, checkpoint cadence, and preprocessing. Every field has a
//! default, so an empty file describes a star plus a rank-0 telluric component.
//!
//! ```toml
//! niter = 200
//! save_every = 50
//! record_history = true
//!
//! [penalties]
//! l1_template = 1e4
//!
//! [[components]]
//! kind = "Star"
//! name = "star"
//!
//! [[components]]
//! kind = "Telluric"
//! name = "tellurics"
//! variable_bases = 2
//! ```

use crate::component::{ComponentKind, LearningRates};
use crate::model::{Model, ModelError};
use crate::optimize::{CheckpointSink, OptimizeOptions, Penalties};
use crate::session::SessionOptions;
use crate::spectra::{PreprocessConfig, Spectra};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("The configuration lists no components.")]
    NoComponents,

    #[error("Component names must be unique; repeated: {0}")]
    DuplicateNames(String),

    #[error("'threads' must be at least 1 when set.")]
    ZeroThreads,

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Per-component learning-rate overrides; unset fields keep the kind's default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRateOverrides {
    pub rvs: Option<f64>,
    pub template: Option<f64>,
    pub basis: Option<f64>,
}

impl LearningRateOverrides {
    fn apply(&self, defaults: LearningRates) -> LearningRates {
        LearningRates {
            rvs: self.rvs.unwrap_or(defaults.rvs),
            template: self.template.unwrap_or(defaults.template),
            basis: self.basis.unwrap_or(defaults.basis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub kind: ComponentKind,
    pub name: String,
    /// Defaults to the kind's convention (telluric fixed, star free).
    #[serde(default)]
    pub rvs_fixed: Option<bool>,
    #[serde(default)]
    pub variable_bases: usize,
    #[serde(default)]
    pub learning_rates: LearningRateOverrides,
}

impl ComponentConfig {
    pub fn new(kind: ComponentKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            rvs_fixed: None,
            variable_bases: 0,
            learning_rates: LearningRateOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub niter: usize,
    pub save_every: usize,
    pub record_history: bool,
    pub threads: Option<usize>,
    pub basename: String,
    /// Restrict the fit to these dataset orders; all orders when unset.
    pub orders: Option<Vec<usize>>,
    pub penalties: Penalties,
    pub components: Vec<ComponentConfig>,
    /// Applied by `rvsplit prepare`, and by `rvsplit fit` to data that are
    /// not yet in log units.
    pub preprocess: PreprocessConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        let optimize = OptimizeOptions::default();
        Self {
            niter: optimize.niter,
            save_every: optimize.save_every,
            record_history: optimize.record_history,
            threads: None,
            basename: "rvsplit".to_string(),
            orders: None,
            penalties: optimize.penalties,
            components: vec![
                ComponentConfig::new(ComponentKind::Star, "star"),
                ComponentConfig::new(ComponentKind::Telluric, "tellurics"),
            ],
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl FitConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.components.is_empty() {
            return Err(ConfigError::NoComponents);
        }
        let repeated = self
            .components
            .iter()
            .map(|c| c.name.as_str())
            .duplicates()
            .join(", ");
        if !repeated.is_empty() {
            return Err(ConfigError::DuplicateNames(repeated));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        Ok(())
    }

    /// A fresh model over `data` with the configured components, in order.
    pub fn build_model(&self, data: &Spectra) -> Result<Model, ConfigError> {
        self.validate()?;
        let mut model = Model::new(data);
        for c in &self.components {
            let rvs_fixed = c.rvs_fixed.unwrap_or(c.kind.rvs_fixed_by_default());
            let index = model.add_component(c.kind, &c.name, rvs_fixed, c.variable_bases)?;
            let defaults = model.components[index].learning_rates;
            model.components[index].learning_rates = c.learning_rates.apply(defaults);
        }
        log::info!("{model}");
        Ok(model)
    }

    /// Session settings writing checkpoints into `output_dir`, if given.
    pub fn session_options(&self, output_dir: Option<&Path>, hide_progress: bool) -> SessionOptions {
        SessionOptions {
            threads: self.threads,
            hide_progress,
            optimize: OptimizeOptions {
                niter: self.niter,
                penalties: self.penalties,
                save_every: self.save_every,
                record_history: self.record_history,
                checkpoint: output_dir.map(|dir| CheckpointSink::new(dir, self.basename.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::NamedTempFile;

    fn dataset() -> Spectra {
        let xs = vec![Array2::from_shape_fn((2, 4), |(_, m)| 8.5 + m as f64 * 1e-5)];
        let ys = vec![Array2::zeros((2, 4))];
        let ivars = vec![Array2::ones((2, 4))];
        Spectra::from_arrays(xs, ys, ivars, ndarray::array![1.0, 2.0], ndarray::array![1.0, 1.2])
            .unwrap()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: FitConfig = toml::from_str("").unwrap();
        assert_eq!(config, FitConfig::default());
        assert_eq!(config.niter, 100);
        assert_eq!(config.penalties, Penalties::default());
        assert_eq!(config.components.len(), 2);
    }

    #[test]
    fn components_and_overrides_reach_the_model() {
        let text = r#"
            niter = 7

            [[components]]
            kind = "Star"
            name = "sun"
            variable_bases = 1
            learning_rates = { rvs = 3.0 }

            [[components]]
            kind = "Telluric"
            name = "air"
            rvs_fixed = false
        "#;
        let config: FitConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        let model = config.build_model(&dataset()).unwrap();

        let sun = model.component("sun").unwrap();
        assert_eq!(sun.variable_bases, 1);
        assert_eq!(sun.learning_rates.rvs, 3.0);
        assert_eq!(
            sun.learning_rates.template,
            ComponentKind::Star.default_learning_rates().template
        );
        assert!(!model.is_rvs_fixed(0));
        assert!(!model.is_rvs_fixed(1));

        let options = config.session_options(None, true);
        assert_eq!(options.optimize.niter, 7);
        assert!(options.optimize.checkpoint.is_none());
    }

    #[test]
    fn duplicate_names_and_zero_threads_are_rejected() {
        let mut config = FitConfig::default();
        config.components.push(ComponentConfig::new(ComponentKind::Star, "star"));
        match config.validate().unwrap_err() {
            ConfigError::DuplicateNames(names) => assert_eq!(names, "star"),
            other => panic!("Expected DuplicateNames, got {other:?}"),
        }

        let config = FitConfig {
            threads: Some(0),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroThreads)));

        let config = FitConfig {
            components: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoComponents)));
    }

    #[test]
    fn save_then_load() {
        let mut config = FitConfig::default();
        config.orders = Some(vec![0, 3]);
        config.components[1].variable_bases = 2;
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        assert_eq!(FitConfig::load(file.path()).unwrap(), config);
    }
}
