//! # Robust Polynomial Continuum Removal
//!
//! Each row (one epoch of one order) is fitted with a low-degree polynomial in
//! log-wavelength by weighted least squares, iteratively discarding pixels that
//! sit far from the current fit. The clipping window is asymmetric: absorption
//! lines pull flux below the continuum, so the lower bound is much tighter than
//! the upper one. The fitted continuum is then subtracted from the log flux.

use super::dataset::{Spectra, Spectrum};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Axis, Zip};
use ndarray_linalg::LeastSquaresSvd;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContinuumError {
    #[error("Only {usable} usable pixels remain, but a fit of this degree needs {required}.")]
    InsufficientPixels { usable: usize, required: usize },

    #[error("Least-squares solve for the continuum failed: {0}")]
    Linalg(#[from] LinalgError),
}

/// Settings of the robust continuum fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuumOptions {
    /// Polynomial degree; the fit has `degree + 1` coefficients.
    pub degree: usize,
    /// Clipping thresholds `(below, above)` in units of the residual scale.
    pub nsigma: (f64, f64),
    pub max_iterations: usize,
}

impl Default for ContinuumOptions {
    fn default() -> Self {
        Self {
            degree: 6,
            nsigma: (0.3, 3.0),
            max_iterations: 50,
        }
    }
}

/// Fits the continuum of one row and returns it evaluated at every pixel.
///
/// Pixels with zero inverse variance never enter the fit.
pub fn fit_continuum(
    xs: ArrayView1<f64>,
    ys: ArrayView1<f64>,
    ivars: ArrayView1<f64>,
    options: &ContinuumOptions,
) -> Result<Array1<f64>, ContinuumError> {
    let n_coef = options.degree + 1;
    let design = vandermonde(xs, options.degree);
    let usable: Vec<bool> = ivars
        .iter()
        .zip(ys.iter())
        .map(|(&ivar, &y)| ivar > 0.0 && ivar.is_finite() && y.is_finite())
        .collect();

    let mut mask = usable.clone();
    let mut kept = mask.iter().filter(|&&m| m).count();
    if kept < n_coef {
        return Err(ContinuumError::InsufficientPixels {
            usable: kept,
            required: n_coef,
        });
    }

    let mut continuum = solve_masked(&design, ys, ivars, &mask)?;
    for _ in 0..options.max_iterations {
        let resid = &ys - &continuum;
        let sigma = median(
            resid
                .iter()
                .zip(&mask)
                .filter(|(_, m)| **m)
                .map(|(r, _)| r * r)
                .collect(),
        )
        .sqrt();
        if !(sigma > 0.0) {
            break;
        }

        let (low, high) = (-options.nsigma.0 * sigma, options.nsigma.1 * sigma);
        let next: Vec<bool> = resid
            .iter()
            .zip(&usable)
            .map(|(&r, &ok)| ok && r > low && r < high)
            .collect();
        let next_kept = next.iter().filter(|&&m| m).count();
        if next_kept < n_coef {
            log::debug!("Continuum clipping left {next_kept} pixels; keeping the previous fit.");
            break;
        }
        if next_kept == kept {
            break;
        }
        mask = next;
        kept = next_kept;
        continuum = solve_masked(&design, ys, ivars, &mask)?;
    }
    Ok(continuum)
}

/// Vandermonde matrix (highest power first) of `x` centered on its mean and
/// scaled into `[-1, 1]` for conditioning.
fn vandermonde(xs: ArrayView1<f64>, degree: usize) -> Array2<f64> {
    let mean = xs.mean().unwrap_or(0.0);
    let half_range = xs.iter().fold(0.0_f64, |acc, &x| acc.max((x - mean).abs()));
    let scale = if half_range > 0.0 { half_range } else { 1.0 };

    let mut design = Array2::zeros((xs.len(), degree + 1));
    Zip::from(design.rows_mut()).and(&xs).for_each(|mut row, &x| {
        let t = (x - mean) / scale;
        for (power, value) in row.iter_mut().rev().enumerate() {
            *value = t.powi(power as i32);
        }
    });
    design
}

fn solve_masked(
    design: &Array2<f64>,
    ys: ArrayView1<f64>,
    ivars: ArrayView1<f64>,
    mask: &[bool],
) -> Result<Array1<f64>, ContinuumError> {
    let rows: Vec<usize> = (0..mask.len()).filter(|&m| mask[m]).collect();
    let weights = rows.iter().map(|&m| ivars[m].sqrt()).collect::<Array1<f64>>();
    let mut a = design.select(Axis(0), &rows);
    for (mut row, &w) in a.rows_mut().into_iter().zip(&weights) {
        row *= w;
    }
    let b: Array1<f64> = rows.iter().zip(&weights).map(|(&m, &w)| ys[m] * w).collect();
    let coefficients = a.least_squares(&b)?.solution;
    Ok(design.dot(&coefficients))
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Subtracts the fitted continuum from one row, or zeroes the row when the
/// fit fails.
fn normalize_row(
    xs: ArrayView1<f64>,
    mut ys: ArrayViewMut1<f64>,
    mut ivars: ArrayViewMut1<f64>,
    options: &ContinuumOptions,
) -> Result<(), ContinuumError> {
    match fit_continuum(xs, ys.view(), ivars.view(), options) {
        Ok(continuum) => {
            ys -= &continuum;
            Ok(())
        }
        Err(err) => {
            ys.fill(0.0);
            ivars.fill(0.0);
            Err(err)
        }
    }
}

impl Spectra {
    /// Continuum-normalizes every epoch of every order in parallel. Rows whose
    /// fit fails are zeroed (flux and inverse variance) with a warning.
    pub fn continuum_normalize(&mut self, options: &ContinuumOptions) {
        for r in 0..self.n_orders() {
            let order_id = self.orders[r];
            let xs = &self.xs[r];
            let failures = Zip::indexed(xs.rows())
                .and(self.ys[r].rows_mut())
                .and(self.ivars[r].rows_mut())
                .par_map_collect(|n, x, y, ivar| {
                    normalize_row(x, y, ivar, options).err().map(|err| (n, err))
                });
            for (n, err) in failures.into_iter().flatten() {
                log::warn!(
                    "Continuum normalization failed for order {order_id}, epoch {}: {err}. The row has been masked.",
                    self.epochs[n]
                );
            }
        }
    }
}

impl Spectrum {
    pub fn continuum_normalize(&mut self, options: &ContinuumOptions) {
        for (r, ((x, y), ivar)) in self
            .xs
            .iter()
            .zip(self.ys.iter_mut())
            .zip(self.ivars.iter_mut())
            .enumerate()
        {
            if let Err(err) = normalize_row(x.view(), y.view_mut(), ivar.view_mut(), options) {
                log::warn!("Continuum normalization failed for order {r}: {err}. The row has been masked.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn smooth_row(n: usize) -> (Array1<f64>, Array1<f64>) {
        let xs = Array1::linspace(8.5, 8.52, n);
        let ys = xs.mapv(|x: f64| 2.0 + 30.0 * (x - 8.51) - 500.0 * (x - 8.51).powi(2));
        (xs, ys)
    }

    #[test]
    fn polynomial_continuum_is_recovered() {
        let (xs, ys) = smooth_row(200);
        let ivars = Array1::from_elem(200, 1.0);
        let options = ContinuumOptions {
            degree: 2,
            ..Default::default()
        };
        let continuum = fit_continuum(xs.view(), ys.view(), ivars.view(), &options).unwrap();
        for (c, y) in continuum.iter().zip(ys.iter()) {
            assert_abs_diff_eq!(*c, *y, epsilon = 1e-8);
        }
    }

    #[test]
    fn absorption_lines_do_not_drag_the_continuum_down() {
        let (xs, mut ys) = smooth_row(300);
        let clean = ys.clone();
        for m in (20..300).step_by(25) {
            for k in 0..4 {
                ys[m + k - 2] -= 0.4;
            }
        }
        let ivars = Array1::from_elem(300, 1.0);
        let continuum =
            fit_continuum(xs.view(), ys.view(), ivars.view(), &ContinuumOptions::default())
                .unwrap();
        let worst = continuum
            .iter()
            .zip(clean.iter())
            .map(|(c, y)| (c - y).abs())
            .fold(0.0, f64::max);
        assert!(worst < 0.05, "continuum deviates by {worst}");
    }

    #[test]
    fn masked_pixels_are_ignored() {
        let (xs, mut ys) = smooth_row(100);
        let mut ivars = Array1::from_elem(100, 1.0);
        ys[40] = 1e6;
        ivars[40] = 0.0;
        let options = ContinuumOptions {
            degree: 2,
            ..Default::default()
        };
        let continuum = fit_continuum(xs.view(), ys.view(), ivars.view(), &options).unwrap();
        assert!(continuum[40] < 3.0);
    }

    #[test]
    fn too_few_pixels_is_an_error() {
        let xs = array![1.0, 2.0, 3.0];
        let ys = array![1.0, 1.0, 1.0];
        let ivars = array![1.0, 0.0, 0.0];
        match fit_continuum(xs.view(), ys.view(), ivars.view(), &ContinuumOptions::default())
            .unwrap_err()
        {
            ContinuumError::InsufficientPixels { usable, required } => {
                assert_eq!((usable, required), (1, 7));
            }
            other => panic!("Expected InsufficientPixels, got {other:?}"),
        }
    }

    #[test]
    fn failed_fit_zeroes_the_row() {
        let (xs, ys) = smooth_row(20);
        let good_ivars = Array1::from_elem(20, 1.0);
        let mut spectra = Spectra::from_arrays(
            vec![ndarray::stack(Axis(0), &[xs.view(), xs.view()]).unwrap()],
            vec![ndarray::stack(Axis(0), &[ys.view(), ys.view()]).unwrap()],
            vec![ndarray::stack(Axis(0), &[good_ivars.view(), Array1::zeros(20).view()]).unwrap()],
            array![0.0, 0.0],
            array![1.0, 1.0],
        )
        .unwrap();

        spectra.continuum_normalize(&ContinuumOptions::default());

        assert!(spectra.ys[0].row(1).iter().all(|&y| y == 0.0));
        assert!(spectra.ivars[0].row(1).iter().all(|&v| v == 0.0));
        assert!(spectra.ys[0].row(0).iter().all(|y| y.abs() < 1e-6));
        assert_eq!(spectra.ivars[0].row(0).sum(), 20.0);
    }
}
