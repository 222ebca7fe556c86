//! # Time-Series Echelle Spectra
//!
//! This module owns everything that happens to the observations before the
//! optimizer sees them: assembling epochs into a dataset, masking unusable pixels,
//! moving into log space, removing the continuum, quality cuts, and the on-disk
//! container.
//!
//! - Data-quality problems (NaNs, empty orders, failed continuum fits) are
//!   repaired locally by masking and reported with `log::warn!`.
//! - Configuration problems (mismatched order counts, out-of-range indices,
//!   inconsistent shapes) are returned as [`SpectraError`] naming the offender.
//! - Inverse variances must be finite and non-negative. Noiseless data is
//!   expressed with a large finite weight, never `inf`.

use thiserror::Error;

pub mod continuum;
pub mod dataset;
pub mod io;
pub mod preprocess;

pub use continuum::{ContinuumError, ContinuumOptions, fit_continuum};
pub use dataset::{EpochMetadata, OrderData, Spectra, Spectrum};
pub use preprocess::{EdgeTrim, PreprocessConfig};

/// A comprehensive error type for dataset assembly, validation, and I/O.
#[derive(Error, Debug)]
pub enum SpectraError {
    #[error("Failed to read or write spectra file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML spectra file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize spectra to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Echelle orders do not match: the dataset has {expected} orders, but the spectrum has {found}.")]
    MismatchedOrderCount { expected: usize, found: usize },

    #[error("Order index {order} is out of range; the dataset has {available} orders.")]
    OrderOutOfRange { order: usize, available: usize },

    #[error("Epoch index {epoch} is out of range; the dataset has {available} epochs.")]
    EpochOutOfRange { epoch: usize, available: usize },

    #[error(
        "Order {order}: '{attribute}' has shape {found:?}, but {expected:?} was expected."
    )]
    ShapeMismatch {
        order: usize,
        attribute: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "Order {order}, epoch {epoch}, pixel {pixel}: inverse variance {value} is not a finite, non-negative weight."
    )]
    InvalidInverseVariance {
        order: usize,
        epoch: usize,
        pixel: usize,
        value: f64,
    },

    #[error("Per-epoch attribute '{attribute}' has {found} entries, but the dataset has {expected} epochs.")]
    EpochCountMismatch {
        attribute: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Cannot combine spectra in different units: dataset log_wavelength={dataset_log_wavelength}, log_flux={dataset_log_flux}; spectrum log_wavelength={spectrum_log_wavelength}, log_flux={spectrum_log_flux}."
    )]
    UnitMismatch {
        dataset_log_wavelength: bool,
        dataset_log_flux: bool,
        spectrum_log_wavelength: bool,
        spectrum_log_flux: bool,
    },
}
