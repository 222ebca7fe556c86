//! On-disk container for [`Spectra`].
//!
//! The file is TOML with one entry per attribute: the per-order `xs`, `ys`,
//! `ivars` matrices, the required per-epoch `bervs` and `airms`, and the
//! optional per-epoch `pipeline_rvs`, `pipeline_sigmas`, `dates`, `drifts`,
//! `filelist`. Unknown dates are stored as NaN.

use super::SpectraError;
use super::dataset::{EpochMetadata, Spectra};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct SpectraFile {
    #[serde(default = "linear_units")]
    log_wavelength: bool,
    #[serde(default = "linear_units")]
    log_flux: bool,
    #[serde(default)]
    orders: Option<Vec<usize>>,
    #[serde(default)]
    epochs: Option<Vec<usize>>,
    #[serde(default)]
    bervs: Option<Vec<f64>>,
    #[serde(default)]
    airms: Option<Vec<f64>>,
    #[serde(default)]
    pipeline_rvs: Option<Vec<f64>>,
    #[serde(default)]
    pipeline_sigmas: Option<Vec<f64>>,
    #[serde(default)]
    dates: Option<Vec<f64>>,
    #[serde(default)]
    drifts: Option<Vec<f64>>,
    #[serde(default)]
    filelist: Option<Vec<String>>,
    xs: Vec<Array2<f64>>,
    ys: Vec<Array2<f64>>,
    ivars: Vec<Array2<f64>>,
}

fn linear_units() -> bool {
    false
}

impl Spectra {
    /// Reads a dataset, optionally restricted to a subset of order and epoch
    /// positions in the file.
    ///
    /// Missing `bervs` or `airms` are filled with 1.0 and a warning. Missing
    /// optional vectors fall back to their defaults silently.
    pub fn read(
        path: impl AsRef<Path>,
        orders: Option<&[usize]>,
        epochs: Option<&[usize]>,
    ) -> Result<Self, SpectraError> {
        let path = path.as_ref();
        let toml_string = fs::read_to_string(path)?;
        let file: SpectraFile = toml::from_str(&toml_string)?;

        let n_file_orders = file.xs.len();
        let n_file_epochs = file.xs.first().map_or(0, |x| x.nrows());

        let order_positions: Vec<usize> = match orders {
            Some(subset) => {
                for &order in subset {
                    if order >= n_file_orders {
                        return Err(SpectraError::OrderOutOfRange {
                            order,
                            available: n_file_orders,
                        });
                    }
                }
                subset.to_vec()
            }
            None => (0..n_file_orders).collect(),
        };
        let epoch_positions: Vec<usize> = match epochs {
            Some(subset) => {
                for &epoch in subset {
                    if epoch >= n_file_epochs {
                        return Err(SpectraError::EpochOutOfRange {
                            epoch,
                            available: n_file_epochs,
                        });
                    }
                }
                subset.to_vec()
            }
            None => (0..n_file_epochs).collect(),
        };

        let bervs = required_vector(file.bervs, "bervs", n_file_epochs, path)?;
        let airms = required_vector(file.airms, "airms", n_file_epochs, path)?;
        let pipeline_rvs = optional_vector(file.pipeline_rvs, 0.0, "pipeline_rvs", n_file_epochs)?;
        let pipeline_sigmas =
            optional_vector(file.pipeline_sigmas, 0.0, "pipeline_sigmas", n_file_epochs)?;
        let dates = optional_vector(file.dates, f64::NAN, "dates", n_file_epochs)?;
        let drifts = optional_vector(file.drifts, 0.0, "drifts", n_file_epochs)?;
        let filelist = file
            .filelist
            .unwrap_or_else(|| vec![String::new(); n_file_epochs]);
        check_epoch_count(&filelist, "filelist", n_file_epochs)?;

        let metadata = epoch_positions
            .iter()
            .map(|&n| EpochMetadata {
                pipeline_rv: pipeline_rvs[n],
                pipeline_sigma: pipeline_sigmas[n],
                date: Some(dates[n]).filter(|d| !d.is_nan()),
                drift: drifts[n],
                filename: filelist[n].clone(),
            })
            .collect();

        let order_ids = file.orders.unwrap_or_else(|| (0..n_file_orders).collect());
        let epoch_ids = file.epochs.unwrap_or_else(|| (0..n_file_epochs).collect());
        check_epoch_count(&epoch_ids, "epochs", n_file_epochs)?;
        if order_ids.len() != n_file_orders {
            return Err(SpectraError::MismatchedOrderCount {
                expected: n_file_orders,
                found: order_ids.len(),
            });
        }

        let pick = |matrices: &[Array2<f64>]| -> Vec<Array2<f64>> {
            order_positions
                .iter()
                .map(|&r| matrices[r].select(Axis(0), &epoch_positions))
                .collect()
        };
        for matrices in [&file.ys, &file.ivars] {
            if matrices.len() != n_file_orders {
                return Err(SpectraError::MismatchedOrderCount {
                    expected: n_file_orders,
                    found: matrices.len(),
                });
            }
        }
        // Row selection below indexes every matrix by epoch position.
        for (order, x) in file.xs.iter().enumerate() {
            let expected = (n_file_epochs, x.ncols());
            for (attribute, matrix) in [
                ("xs", x),
                ("ys", &file.ys[order]),
                ("ivars", &file.ivars[order]),
            ] {
                if matrix.dim() != expected {
                    return Err(SpectraError::ShapeMismatch {
                        order,
                        attribute,
                        expected,
                        found: matrix.dim(),
                    });
                }
            }
        }

        let spectra = Spectra {
            xs: pick(&file.xs),
            ys: pick(&file.ys),
            ivars: pick(&file.ivars),
            bervs: epoch_positions.iter().map(|&n| bervs[n]).collect(),
            airms: epoch_positions.iter().map(|&n| airms[n]).collect(),
            metadata,
            orders: order_positions.iter().map(|&r| order_ids[r]).collect(),
            epochs: epoch_positions.iter().map(|&n| epoch_ids[n]).collect(),
            log_wavelength: file.log_wavelength,
            log_flux: file.log_flux,
        };
        spectra.validate()?;
        log::info!(
            "Loaded {} orders x {} epochs from {}.",
            spectra.n_orders(),
            spectra.n_epochs(),
            path.display()
        );
        Ok(spectra)
    }

    /// Writes the dataset so that [`Spectra::read`] restores it exactly.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), SpectraError> {
        self.validate()?;
        let file = SpectraFile {
            log_wavelength: self.log_wavelength,
            log_flux: self.log_flux,
            orders: Some(self.orders.clone()),
            epochs: Some(self.epochs.clone()),
            bervs: Some(self.bervs.to_vec()),
            airms: Some(self.airms.to_vec()),
            pipeline_rvs: Some(self.metadata.iter().map(|m| m.pipeline_rv).collect()),
            pipeline_sigmas: Some(self.metadata.iter().map(|m| m.pipeline_sigma).collect()),
            dates: Some(
                self.metadata
                    .iter()
                    .map(|m| m.date.unwrap_or(f64::NAN))
                    .collect(),
            ),
            drifts: Some(self.metadata.iter().map(|m| m.drift).collect()),
            filelist: Some(self.metadata.iter().map(|m| m.filename.clone()).collect()),
            xs: self.xs.clone(),
            ys: self.ys.clone(),
            ivars: self.ivars.clone(),
        };
        let toml_string = toml::to_string_pretty(&file)?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

fn required_vector(
    values: Option<Vec<f64>>,
    attribute: &'static str,
    n_epochs: usize,
    path: &Path,
) -> Result<Vec<f64>, SpectraError> {
    let values = values.unwrap_or_else(|| {
        log::warn!(
            "Key '{attribute}' missing from {}; resulting solutions may be non-optimal.",
            path.display()
        );
        vec![1.0; n_epochs]
    });
    check_epoch_count(&values, attribute, n_epochs)?;
    Ok(values)
}

fn optional_vector(
    values: Option<Vec<f64>>,
    fallback: f64,
    attribute: &'static str,
    n_epochs: usize,
) -> Result<Vec<f64>, SpectraError> {
    let values = values.unwrap_or_else(|| vec![fallback; n_epochs]);
    check_epoch_count(&values, attribute, n_epochs)?;
    Ok(values)
}

fn check_epoch_count<T>(
    values: &[T],
    attribute: &'static str,
    expected: usize,
) -> Result<(), SpectraError> {
    if values.len() != expected {
        return Err(SpectraError::EpochCountMismatch {
            attribute,
            expected,
            found: values.len(),
        });
    }
    Ok(())
}
