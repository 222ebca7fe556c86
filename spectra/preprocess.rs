//! Pixel masking, log transform, and edge trimming.
//!
//! All routines work row by row (one epoch of one order) and never fail: bad
//! pixels are clamped and their inverse variance is zeroed.

use super::continuum::ContinuumOptions;
use super::dataset::{Spectra, Spectrum, nan_mean};
use ndarray::{ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};

/// Window-based trimming of low-information row edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeTrim {
    /// Number of pixels averaged for the local SNR.
    pub window_width: usize,
    /// SNR threshold below which edge pixels are discarded.
    pub min_snr: f64,
}

impl Default for EdgeTrim {
    fn default() -> Self {
        Self {
            window_width: 128,
            min_snr: 5.0,
        }
    }
}

/// Settings of the standard preprocessing chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Flux floor (linear units) for `mask_low_pixels`.
    pub min_flux: f64,
    /// Ceiling (continuum-normalized log flux) for `mask_high_pixels`.
    pub max_flux: f64,
    /// Neighbors on each side of a flagged pixel that are masked as well.
    pub padding: usize,
    pub continuum: ContinuumOptions,
    pub trim_edges: Option<EdgeTrim>,
    /// Orders and epochs with a lower average SNR are dropped.
    pub min_snr: Option<f64>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            min_flux: 1.0,
            max_flux: 2.0,
            padding: 2,
            continuum: ContinuumOptions::default(),
            trim_edges: None,
            min_snr: None,
        }
    }
}

/// Expands a pixel mask by `padding` pixels on each side, without wrapping
/// around the ends of the row.
pub fn pad_mask(bad: &[bool], padding: usize) -> Vec<bool> {
    let len = bad.len();
    let mut padded = vec![false; len];
    for (index, _) in bad.iter().enumerate().filter(|(_, flagged)| **flagged) {
        let start = index.saturating_sub(padding);
        let end = (index + padding + 1).min(len);
        padded[start..end].fill(true);
    }
    padded
}

/// Masks pixels with flux below `min_flux` or NaN. Returns the number of
/// flagged pixels (before padding).
pub fn mask_low_row(
    mut ys: ArrayViewMut1<f64>,
    mut ivars: ArrayViewMut1<f64>,
    min_flux: f64,
    padding: usize,
) -> usize {
    let bad: Vec<bool> = ys.iter().map(|&y| y.is_nan() || y < min_flux).collect();
    for (y, &flagged) in ys.iter_mut().zip(&bad) {
        if flagged {
            *y = min_flux;
        }
    }
    apply_mask(&mut ivars, &pad_mask(&bad, padding));
    bad.iter().filter(|&&b| b).count()
}

/// Masks pixels above `max_flux` (cosmic rays). Returns the number of flagged
/// pixels (before padding).
pub fn mask_high_row(
    mut ys: ArrayViewMut1<f64>,
    mut ivars: ArrayViewMut1<f64>,
    max_flux: f64,
    padding: usize,
) -> usize {
    let bad: Vec<bool> = ys.iter().map(|&y| y > max_flux).collect();
    for (y, &flagged) in ys.iter_mut().zip(&bad) {
        if flagged {
            *y = max_flux;
        }
    }
    apply_mask(&mut ivars, &pad_mask(&bad, padding));
    bad.iter().filter(|&&b| b).count()
}

fn apply_mask(ivars: &mut ArrayViewMut1<f64>, mask: &[bool]) {
    for (ivar, &masked) in ivars.iter_mut().zip(mask) {
        if masked {
            *ivar = 0.0;
        }
    }
}

/// Zeroes the inverse variance outside the first and last windows whose mean
/// SNR exceeds `trim.min_snr`. Rows shorter than the window are left alone.
pub fn trim_edges_row(mut ivars: ArrayViewMut1<f64>, trim: &EdgeTrim) {
    let n_pix = ivars.len();
    let width = trim.window_width;
    if width == 0 || n_pix <= width {
        return;
    }
    let window_snr = |ivars: &ArrayViewMut1<f64>, start: usize| {
        nan_mean((start..start + width).map(|m| ivars[m])).sqrt()
    };

    if let Some(start) = (0..n_pix - width).find(|&s| window_snr(&ivars, s) > trim.min_snr) {
        for m in 0..start {
            ivars[m] = 0.0;
        }
    }
    if let Some(start) = (0..n_pix - width)
        .rev()
        .find(|&s| window_snr(&ivars, s) > trim.min_snr)
    {
        for m in start + width..n_pix {
            ivars[m] = 0.0;
        }
    }
}

/// Converts a row to log space in place, rescaling the inverse variance by
/// `flux²` first. Pixels whose logarithm is not finite are masked.
fn log_flux_row(mut ys: ArrayViewMut1<f64>, mut ivars: ArrayViewMut1<f64>) -> usize {
    let mut invalid = 0;
    Zip::from(&mut ys).and(&mut ivars).for_each(|y, ivar| {
        *ivar *= *y * *y;
        *y = y.ln();
        if !y.is_finite() {
            *y = 0.0;
            *ivar = 0.0;
            invalid += 1;
        }
    });
    invalid
}

impl Spectra {
    /// Floors low or NaN flux at `min_flux` and masks it with `padding` neighbors.
    pub fn mask_low_pixels(&mut self, min_flux: f64, padding: usize) {
        let mut flagged = 0;
        for (ys, ivars) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
            Zip::from(ys.rows_mut())
                .and(ivars.rows_mut())
                .for_each(|y, ivar| flagged += mask_low_row(y, ivar, min_flux, padding));
        }
        log::debug!("Masked {flagged} pixels below flux {min_flux}.");
    }

    /// Caps flux above `max_flux` and masks it with `padding` neighbors.
    pub fn mask_high_pixels(&mut self, max_flux: f64, padding: usize) {
        let mut flagged = 0;
        for (ys, ivars) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
            Zip::from(ys.rows_mut())
                .and(ivars.rows_mut())
                .for_each(|y, ivar| flagged += mask_high_row(y, ivar, max_flux, padding));
        }
        log::debug!("Masked {flagged} pixels above flux {max_flux}.");
    }

    /// Moves wavelengths and/or fluxes into natural-log space. Each conversion
    /// happens at most once per dataset.
    pub fn transform_log(&mut self, xs: bool, ys: bool) {
        if xs && !self.log_wavelength {
            for x in self.xs.iter_mut() {
                x.mapv_inplace(f64::ln);
            }
            self.log_wavelength = true;
        }
        if ys && !self.log_flux {
            let mut invalid = 0;
            for (y, ivar) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
                Zip::from(y.rows_mut())
                    .and(ivar.rows_mut())
                    .for_each(|y_row, ivar_row| invalid += log_flux_row(y_row, ivar_row));
            }
            if invalid > 0 {
                log::warn!("{invalid} pixels had non-positive flux and were masked.");
            }
            self.log_flux = true;
        }
    }

    /// Trims low-SNR edges of every row.
    pub fn trim_bad_edges(&mut self, trim: &EdgeTrim) {
        for ivar in self.ivars.iter_mut() {
            for row in ivar.rows_mut() {
                trim_edges_row(row, trim);
            }
        }
    }

    /// Runs the standard chain: mask low → log → continuum → mask high, then the
    /// optional edge trimming and SNR quality cuts.
    pub fn prepare(&mut self, config: &PreprocessConfig) {
        if !self.log_flux {
            self.mask_low_pixels(config.min_flux, config.padding);
        }
        self.transform_log(true, true);
        self.continuum_normalize(&config.continuum);
        self.mask_high_pixels(config.max_flux, config.padding);
        if let Some(trim) = &config.trim_edges {
            self.trim_bad_edges(trim);
        }
        if let Some(min_snr) = config.min_snr {
            self.drop_bad_orders(min_snr);
            self.drop_bad_epochs(min_snr);
        }
    }
}

impl Spectrum {
    pub fn mask_low_pixels(&mut self, min_flux: f64, padding: usize) {
        for (y, ivar) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
            mask_low_row(y.view_mut(), ivar.view_mut(), min_flux, padding);
        }
    }

    pub fn mask_high_pixels(&mut self, max_flux: f64, padding: usize) {
        for (y, ivar) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
            mask_high_row(y.view_mut(), ivar.view_mut(), max_flux, padding);
        }
    }

    pub fn transform_log(&mut self, xs: bool, ys: bool) {
        if xs && !self.log_wavelength {
            for x in self.xs.iter_mut() {
                x.mapv_inplace(f64::ln);
            }
            self.log_wavelength = true;
        }
        if ys && !self.log_flux {
            for (y, ivar) in self.ys.iter_mut().zip(self.ivars.iter_mut()) {
                log_flux_row(y.view_mut(), ivar.view_mut());
            }
            self.log_flux = true;
        }
    }

    pub fn trim_bad_edges(&mut self, trim: &EdgeTrim) {
        for ivar in self.ivars.iter_mut() {
            trim_edges_row(ivar.view_mut(), trim);
        }
    }

    /// The single-epoch version of [`Spectra::prepare`] (without quality cuts).
    pub fn prepare(&mut self, config: &PreprocessConfig) {
        if !self.log_flux {
            self.mask_low_pixels(config.min_flux, config.padding);
        }
        self.transform_log(true, true);
        self.continuum_normalize(&config.continuum);
        self.mask_high_pixels(config.max_flux, config.padding);
        if let Some(trim) = &config.trim_edges {
            self.trim_bad_edges(trim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn low_pixel_and_padding_neighbors_get_zero_ivar() {
        let mut ys = array![5.0, 5.0, 5.0, 5.0, 0.2, 5.0, 5.0, 5.0, 5.0];
        let mut ivars = Array1::from_elem(9, 2.0);
        let flagged = mask_low_row(ys.view_mut(), ivars.view_mut(), 1.0, 2);
        assert_eq!(flagged, 1);
        assert_eq!(ys[4], 1.0);
        assert_eq!(
            ivars,
            array![2.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0]
        );
    }

    #[test]
    fn nan_flux_is_floored_and_masked() {
        let mut ys = array![f64::NAN, 3.0, 3.0, 3.0];
        let mut ivars = Array1::from_elem(4, 1.0);
        mask_low_row(ys.view_mut(), ivars.view_mut(), 1.0, 1);
        assert_eq!(ys[0], 1.0);
        assert_eq!(ivars, array![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn padding_does_not_wrap_around_row_ends() {
        let bad = [false, false, false, false, true];
        assert_eq!(pad_mask(&bad, 2), vec![false, false, true, true, true]);
        assert_eq!(pad_mask(&[true, false, false], 0), vec![true, false, false]);
    }

    #[test]
    fn high_pixels_are_capped_and_masked() {
        let mut ys = array![0.0, 0.1, 9.0, 0.0, 0.0];
        let mut ivars = Array1::from_elem(5, 3.0);
        mask_high_row(ys.view_mut(), ivars.view_mut(), 2.0, 1);
        assert_eq!(ys[2], 2.0);
        assert_eq!(ivars, array![3.0, 0.0, 0.0, 0.0, 3.0]);
    }

    #[test]
    fn log_transform_rescales_ivar_once() {
        let mut spectra = Spectra::from_arrays(
            vec![array![[5000.0, 5001.0]]],
            vec![array![[2.0, 4.0]]],
            vec![array![[1.0, 0.5]]],
            array![0.0],
            array![1.0],
        )
        .unwrap()
        .in_linear_units();

        spectra.transform_log(true, true);
        spectra.transform_log(true, true);

        assert_abs_diff_eq!(spectra.xs[0][[0, 0]], 5000.0_f64.ln(), epsilon = 1e-15);
        assert_abs_diff_eq!(spectra.ys[0][[0, 1]], 4.0_f64.ln(), epsilon = 1e-15);
        assert_eq!(spectra.ivars[0], array![[4.0, 8.0]]);
    }

    #[test]
    fn non_positive_flux_is_masked_by_log_transform() {
        let mut ys = array![0.0, 1.0];
        let mut ivars = array![1.0, 1.0];
        assert_eq!(log_flux_row(ys.view_mut(), ivars.view_mut()), 1);
        assert_eq!(ys, array![0.0, 0.0]);
        assert_eq!(ivars, array![0.0, 1.0]);
    }

    #[test]
    fn edge_trimming_zeroes_low_snr_ends() {
        let mut ivars = Array1::from_elem(20, 100.0);
        for m in 0..4 {
            ivars[m] = 0.0;
        }
        for m in 17..20 {
            ivars[m] = 0.0;
        }
        let trim = EdgeTrim {
            window_width: 4,
            min_snr: 9.0,
        };
        trim_edges_row(ivars.view_mut(), &trim);
        assert!(ivars.iter().take(4).all(|&v| v == 0.0));
        assert!(ivars.iter().skip(4).take(13).all(|&v| v == 100.0));
        assert!(ivars.iter().skip(17).all(|&v| v == 0.0));
    }

    #[test]
    fn dataset_masking_covers_every_epoch() {
        let mut ys = Array2::from_elem((2, 6), 10.0);
        ys[[1, 0]] = -4.0;
        let mut spectra = Spectra::from_arrays(
            vec![Array2::zeros((2, 6))],
            vec![ys],
            vec![Array2::ones((2, 6))],
            array![0.0, 0.0],
            array![1.0, 1.0],
        )
        .unwrap();
        spectra.mask_low_pixels(1.0, 1);
        assert_eq!(spectra.ivars[0].row(0).sum(), 6.0);
        assert_eq!(spectra.ivars[0].row(1).to_vec(), vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(spectra.ys[0][[1, 0]], 1.0);
    }
}
