//! In-memory dataset: per-order `(epochs × pixels)` matrices plus per-epoch scalars.

use super::SpectraError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Optional per-epoch bookkeeping. Every field has a neutral default so a
/// spectrum without pipeline metadata is still a valid epoch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochMetadata {
    /// Pipeline RV estimate (m/s), used only for comparison.
    pub pipeline_rv: f64,
    /// Uncertainty of `pipeline_rv` (m/s).
    pub pipeline_sigma: f64,
    /// Observation date (e.g. BJD).
    pub date: Option<f64>,
    /// Instrumental drift (m/s).
    pub drift: f64,
    /// Source file of the observation.
    pub filename: String,
}

/// A single epoch across all echelle orders.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub xs: Vec<Array1<f64>>,
    pub ys: Vec<Array1<f64>>,
    pub ivars: Vec<Array1<f64>>,
    /// Barycentric Earth radial velocity (m/s). Required by the model; a
    /// missing value is replaced by 1.0 with a warning when appended.
    pub berv: Option<f64>,
    /// Airmass. Required by the model; a missing value is replaced by 1.0
    /// with a warning when appended.
    pub airmass: Option<f64>,
    pub metadata: EpochMetadata,
    pub log_wavelength: bool,
    pub log_flux: bool,
}

impl Spectrum {
    /// Builds a spectrum in linear units from per-order arrays.
    pub fn new(
        xs: Vec<Array1<f64>>,
        ys: Vec<Array1<f64>>,
        ivars: Vec<Array1<f64>>,
    ) -> Result<Self, SpectraError> {
        if ys.len() != xs.len() {
            return Err(SpectraError::MismatchedOrderCount {
                expected: xs.len(),
                found: ys.len(),
            });
        }
        if ivars.len() != xs.len() {
            return Err(SpectraError::MismatchedOrderCount {
                expected: xs.len(),
                found: ivars.len(),
            });
        }
        for (order, ((x, y), ivar)) in xs.iter().zip(&ys).zip(&ivars).enumerate() {
            for (attribute, len) in [("ys", y.len()), ("ivars", ivar.len())] {
                if len != x.len() {
                    return Err(SpectraError::ShapeMismatch {
                        order,
                        attribute,
                        expected: (1, x.len()),
                        found: (1, len),
                    });
                }
            }
        }
        Ok(Self {
            xs,
            ys,
            ivars,
            berv: None,
            airmass: None,
            metadata: EpochMetadata::default(),
            log_wavelength: false,
            log_flux: false,
        })
    }

    pub fn with_berv(mut self, berv: f64) -> Self {
        self.berv = Some(berv);
        self
    }

    pub fn with_airmass(mut self, airmass: f64) -> Self {
        self.airmass = Some(airmass);
        self
    }

    pub fn with_metadata(mut self, metadata: EpochMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn n_orders(&self) -> usize {
        self.xs.len()
    }
}

/// Read-only view of one order, the unit of work for the optimizer.
#[derive(Debug, Clone, Copy)]
pub struct OrderData<'a> {
    pub order: usize,
    pub xs: ArrayView2<'a, f64>,
    pub ys: ArrayView2<'a, f64>,
    pub ivars: ArrayView2<'a, f64>,
    pub bervs: ArrayView1<'a, f64>,
    pub airms: ArrayView1<'a, f64>,
}

impl OrderData<'_> {
    pub fn n_epochs(&self) -> usize {
        self.xs.nrows()
    }

    pub fn n_pixels(&self) -> usize {
        self.xs.ncols()
    }

    /// Rejects NaN, infinite, or negative inverse variances.
    pub fn check_weights(&self) -> Result<(), SpectraError> {
        check_inverse_variances(self.order, 0, self.ivars)
    }
}

fn check_inverse_variances(
    order: usize,
    first_epoch: usize,
    ivars: ArrayView2<f64>,
) -> Result<(), SpectraError> {
    match ivars
        .indexed_iter()
        .find(|(_, ivar)| !(ivar.is_finite() && **ivar >= 0.0))
    {
        Some(((epoch, pixel), &value)) => Err(SpectraError::InvalidInverseVariance {
            order,
            epoch: first_epoch + epoch,
            pixel,
            value,
        }),
        None => Ok(()),
    }
}

/// Time-series spectra: R orders of `(N × M_r)` log-wavelength, log-flux, and
/// inverse-variance matrices, plus N-length per-epoch vectors.
#[derive(Debug, Clone, Default)]
pub struct Spectra {
    pub xs: Vec<Array2<f64>>,
    pub ys: Vec<Array2<f64>>,
    pub ivars: Vec<Array2<f64>>,
    /// Barycentric Earth radial velocities (m/s).
    pub bervs: Array1<f64>,
    /// Airmasses.
    pub airms: Array1<f64>,
    pub metadata: Vec<EpochMetadata>,
    /// Instrument order ids of the loaded orders.
    pub orders: Vec<usize>,
    /// File epoch ids of the loaded epochs.
    pub epochs: Vec<usize>,
    pub log_wavelength: bool,
    pub log_flux: bool,
}

impl Spectra {
    /// An empty dataset, to be filled with [`Spectra::append`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps matrices that are already in log-wavelength / log-flux space.
    ///
    /// All three matrices of an order must share a shape, and every order must
    /// have one row per entry of `bervs` and `airms`.
    pub fn from_arrays(
        xs: Vec<Array2<f64>>,
        ys: Vec<Array2<f64>>,
        ivars: Vec<Array2<f64>>,
        bervs: Array1<f64>,
        airms: Array1<f64>,
    ) -> Result<Self, SpectraError> {
        let n_epochs = bervs.len();
        let spectra = Self {
            orders: (0..xs.len()).collect(),
            epochs: (0..n_epochs).collect(),
            metadata: vec![EpochMetadata::default(); n_epochs],
            xs,
            ys,
            ivars,
            bervs,
            airms,
            log_wavelength: true,
            log_flux: true,
        };
        spectra.validate()?;
        Ok(spectra)
    }

    /// Marks the arrays as linear wavelength and flux, so that
    /// [`Spectra::transform_log`] will convert them.
    pub fn in_linear_units(mut self) -> Self {
        self.log_wavelength = false;
        self.log_flux = false;
        self
    }

    pub fn n_orders(&self) -> usize {
        self.xs.len()
    }

    pub fn n_epochs(&self) -> usize {
        self.bervs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_epochs() == 0
    }

    /// Checks the shape invariants of the dataset.
    pub fn validate(&self) -> Result<(), SpectraError> {
        let n_orders = self.xs.len();
        for found in [self.ys.len(), self.ivars.len()] {
            if found != n_orders {
                return Err(SpectraError::MismatchedOrderCount {
                    expected: n_orders,
                    found,
                });
            }
        }
        let n_epochs = self.n_epochs();
        for (attribute, found) in [
            ("airms", self.airms.len()),
            ("metadata", self.metadata.len()),
            ("epochs", self.epochs.len()),
        ] {
            if found != n_epochs {
                return Err(SpectraError::EpochCountMismatch {
                    attribute,
                    expected: n_epochs,
                    found,
                });
            }
        }
        if self.orders.len() != n_orders {
            return Err(SpectraError::MismatchedOrderCount {
                expected: n_orders,
                found: self.orders.len(),
            });
        }
        for order in 0..n_orders {
            let expected = (n_epochs, self.xs[order].ncols());
            for (attribute, matrix) in [
                ("xs", &self.xs[order]),
                ("ys", &self.ys[order]),
                ("ivars", &self.ivars[order]),
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
            check_inverse_variances(order, 0, self.ivars[order].view())?;
        }
        Ok(())
    }

    /// A view of order `r` for the optimizer.
    pub fn order(&self, r: usize) -> Result<OrderData<'_>, SpectraError> {
        if r >= self.n_orders() {
            return Err(SpectraError::OrderOutOfRange {
                order: r,
                available: self.n_orders(),
            });
        }
        Ok(OrderData {
            order: r,
            xs: self.xs[r].view(),
            ys: self.ys[r].view(),
            ivars: self.ivars[r].view(),
            bervs: self.bervs.view(),
            airms: self.airms.view(),
        })
    }

    /// Appends one epoch.
    ///
    /// The first spectrum fixes the number of orders, their pixel counts, and
    /// the units. Missing barycentric velocity or airmass degrade to 1.0 with
    /// a warning since the model can still run, just less well.
    pub fn append(&mut self, spectrum: Spectrum) -> Result<(), SpectraError> {
        for (order, ivars) in spectrum.ivars.iter().enumerate() {
            check_inverse_variances(order, self.n_epochs(), ivars.view().insert_axis(Axis(0)))?;
        }
        if self.is_empty() {
            self.log_wavelength = spectrum.log_wavelength;
            self.log_flux = spectrum.log_flux;
            self.orders = (0..spectrum.n_orders()).collect();
            self.xs = spectrum.xs.iter().map(row_matrix).collect();
            self.ys = spectrum.ys.iter().map(row_matrix).collect();
            self.ivars = spectrum.ivars.iter().map(row_matrix).collect();
        } else {
            if spectrum.n_orders() != self.n_orders() {
                return Err(SpectraError::MismatchedOrderCount {
                    expected: self.n_orders(),
                    found: spectrum.n_orders(),
                });
            }
            if spectrum.log_wavelength != self.log_wavelength || spectrum.log_flux != self.log_flux
            {
                return Err(SpectraError::UnitMismatch {
                    dataset_log_wavelength: self.log_wavelength,
                    dataset_log_flux: self.log_flux,
                    spectrum_log_wavelength: spectrum.log_wavelength,
                    spectrum_log_flux: spectrum.log_flux,
                });
            }
            for order in 0..self.n_orders() {
                let expected = self.xs[order].ncols();
                for (attribute, row) in [
                    ("xs", &spectrum.xs[order]),
                    ("ys", &spectrum.ys[order]),
                    ("ivars", &spectrum.ivars[order]),
                ] {
                    if row.len() != expected {
                        return Err(SpectraError::ShapeMismatch {
                            order,
                            attribute,
                            expected: (1, expected),
                            found: (1, row.len()),
                        });
                    }
                }
            }
            for order in 0..self.n_orders() {
                push_row(&mut self.xs[order], spectrum.xs[order].view(), order, "xs")?;
                push_row(&mut self.ys[order], spectrum.ys[order].view(), order, "ys")?;
                push_row(
                    &mut self.ivars[order],
                    spectrum.ivars[order].view(),
                    order,
                    "ivars",
                )?;
            }
        }

        let epoch = self.n_epochs();
        let berv = spectrum.berv.unwrap_or_else(|| {
            log::warn!("Epoch {epoch}: bervs missing; resulting solutions may be non-optimal.");
            1.0
        });
        let airmass = spectrum.airmass.unwrap_or_else(|| {
            log::warn!("Epoch {epoch}: airms missing; resulting solutions may be non-optimal.");
            1.0
        });
        self.bervs = append_scalar(&self.bervs, berv);
        self.airms = append_scalar(&self.airms, airmass);
        self.metadata.push(spectrum.metadata);
        let next_id = self.epochs.iter().max().map_or(0, |id| id + 1);
        self.epochs.push(next_id);
        Ok(())
    }

    /// Removes and returns epoch `i`.
    pub fn pop(&mut self, i: usize) -> Result<Spectrum, SpectraError> {
        if i >= self.n_epochs() {
            return Err(SpectraError::EpochOutOfRange {
                epoch: i,
                available: self.n_epochs(),
            });
        }
        let keep: Vec<usize> = (0..self.n_epochs()).filter(|&n| n != i).collect();

        let spectrum = Spectrum {
            xs: self.xs.iter().map(|m| m.row(i).to_owned()).collect(),
            ys: self.ys.iter().map(|m| m.row(i).to_owned()).collect(),
            ivars: self.ivars.iter().map(|m| m.row(i).to_owned()).collect(),
            berv: Some(self.bervs[i]),
            airmass: Some(self.airms[i]),
            metadata: self.metadata[i].clone(),
            log_wavelength: self.log_wavelength,
            log_flux: self.log_flux,
        };
        self.select_epochs(&keep);
        self.epochs.remove(i);
        Ok(spectrum)
    }

    /// Restricts the dataset to the given order indices (positions, not ids).
    pub fn select_orders(&mut self, keep: &[usize]) -> Result<(), SpectraError> {
        for &order in keep {
            if order >= self.n_orders() {
                return Err(SpectraError::OrderOutOfRange {
                    order,
                    available: self.n_orders(),
                });
            }
        }
        self.keep_orders(keep);
        Ok(())
    }

    fn keep_orders(&mut self, keep: &[usize]) {
        self.xs = keep.iter().map(|&r| self.xs[r].clone()).collect();
        self.ys = keep.iter().map(|&r| self.ys[r].clone()).collect();
        self.ivars = keep.iter().map(|&r| self.ivars[r].clone()).collect();
        self.orders = keep.iter().map(|&r| self.orders[r]).collect();
    }

    /// Restricts all per-epoch arrays to `keep` (positions). Does not touch
    /// `self.epochs`, which the callers maintain.
    fn select_epochs(&mut self, keep: &[usize]) {
        for matrix in self
            .xs
            .iter_mut()
            .chain(self.ys.iter_mut())
            .chain(self.ivars.iter_mut())
        {
            *matrix = matrix.select(Axis(0), keep);
        }
        self.bervs = self.bervs.select(Axis(0), keep);
        self.airms = self.airms.select(Axis(0), keep);
        self.metadata = keep.iter().map(|&n| self.metadata[n].clone()).collect();
    }

    /// Restricts the dataset to the given epoch positions.
    pub fn retain_epochs(&mut self, keep: &[usize]) -> Result<(), SpectraError> {
        for &epoch in keep {
            if epoch >= self.n_epochs() {
                return Err(SpectraError::EpochOutOfRange {
                    epoch,
                    available: self.n_epochs(),
                });
            }
        }
        let ids: Vec<usize> = keep.iter().map(|&n| self.epochs[n]).collect();
        self.select_epochs(keep);
        self.epochs = ids;
        Ok(())
    }

    /// Average SNR of every order, `sqrt(mean(ivar))` ignoring NaNs.
    pub fn order_snrs(&self) -> Vec<f64> {
        self.ivars
            .iter()
            .map(|ivar| nan_mean(ivar.iter().copied()).sqrt())
            .collect()
    }

    /// Average SNR of every epoch across all orders.
    pub fn epoch_snrs(&self) -> Vec<f64> {
        (0..self.n_epochs())
            .map(|n| {
                nan_mean(self.ivars.iter().flat_map(|ivar| ivar.row(n).to_vec())).sqrt()
            })
            .collect()
    }

    /// Drops orders whose average SNR is below `min_snr`. Returns the ids of the
    /// dropped orders.
    pub fn drop_bad_orders(&mut self, min_snr: f64) -> Vec<usize> {
        let snrs = self.order_snrs();
        let (keep, dropped): (Vec<usize>, Vec<usize>) =
            (0..self.n_orders()).partition(|&r| snrs[r] >= min_snr);
        let dropped_ids: Vec<usize> = dropped.iter().map(|&r| self.orders[r]).collect();
        if !dropped_ids.is_empty() {
            log::info!(
                "Dropping orders {dropped_ids:?} because they have average SNR < {min_snr:.0}"
            );
            self.keep_orders(&keep);
        }
        if self.n_orders() == 0 {
            log::warn!("All orders failed the quality cuts with min_snr={min_snr:.0}.");
        }
        dropped_ids
    }

    /// Drops epochs whose average SNR is below `min_snr`. Returns the ids of the
    /// dropped epochs.
    pub fn drop_bad_epochs(&mut self, min_snr: f64) -> Vec<usize> {
        let snrs = self.epoch_snrs();
        let (keep, dropped): (Vec<usize>, Vec<usize>) =
            (0..self.n_epochs()).partition(|&n| snrs[n] >= min_snr);
        let dropped_ids: Vec<usize> = dropped.iter().map(|&n| self.epochs[n]).collect();
        if !dropped_ids.is_empty() {
            log::info!(
                "Dropping epochs {dropped_ids:?} because they have average SNR < {min_snr:.0}"
            );
            let ids: Vec<usize> = keep.iter().map(|&n| self.epochs[n]).collect();
            self.select_epochs(&keep);
            self.epochs = ids;
        }
        if self.n_epochs() == 0 {
            log::warn!("All epochs failed the quality cuts with min_snr={min_snr:.0}.");
        }
        dropped_ids
    }
}

fn row_matrix(row: &Array1<f64>) -> Array2<f64> {
    row.clone().insert_axis(Axis(0))
}

fn push_row(
    matrix: &mut Array2<f64>,
    row: ArrayView1<f64>,
    order: usize,
    attribute: &'static str,
) -> Result<(), SpectraError> {
    let expected = (matrix.nrows() + 1, matrix.ncols());
    matrix
        .push_row(row)
        .map_err(|_| SpectraError::ShapeMismatch {
            order,
            attribute,
            expected,
            found: (expected.0, row.len()),
        })
}

fn append_scalar(values: &Array1<f64>, value: f64) -> Array1<f64> {
    values.iter().copied().chain(std::iter::once(value)).collect()
}

/// Mean of the non-NaN values, NaN when there are none.
pub(crate) fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}
