//! Relativistic Doppler factors in log-wavelength space.
//!
//! A component moving with radial velocity `v` (positive = receding) is observed
//! at `λ_obs = λ_rest / D(v)` with `D(v) = sqrt((1 - v/c) / (1 + v/c))`. Working
//! in natural-log wavelength the shift becomes additive:
//! `ln λ_rest = ln λ_obs + ln D(v)`.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 2.997_924_58e8;

/// The relativistic Doppler factor `sqrt((1 - v/c) / (1 + v/c))`.
pub fn doppler(v: f64) -> f64 {
    let beta = v / SPEED_OF_LIGHT;
    ((1.0 - beta) / (1.0 + beta)).sqrt()
}

/// `ln D(v)`, evaluated with `ln_1p` so that metre-per-second velocities keep
/// full precision. Odd in `v`: `ln_doppler(-v) == -ln_doppler(v)`.
pub fn ln_doppler(v: f64) -> f64 {
    let beta = v / SPEED_OF_LIGHT;
    0.5 * ((-beta).ln_1p() - beta.ln_1p())
}

/// Derivative of `ln D(v)` with respect to `v`: `-(1/c) / (1 - v²/c²)`.
pub fn ln_doppler_derivative(v: f64) -> f64 {
    let beta = v / SPEED_OF_LIGHT;
    -1.0 / (SPEED_OF_LIGHT * (1.0 - beta * beta))
}

/// Maps observed log-wavelengths (one row per epoch) into the rest frame of a
/// source with per-epoch velocities `rvs`.
///
/// Panics if `rvs.len() != xs.nrows()`; callers validate shapes first.
pub fn to_rest_frame(xs: ArrayView2<f64>, rvs: ArrayView1<f64>) -> Array2<f64> {
    assert_eq!(xs.nrows(), rvs.len(), "one velocity per epoch row");
    let mut shifted = xs.to_owned();
    Zip::from(shifted.axis_iter_mut(Axis(0)))
        .and(&rvs)
        .for_each(|mut row, &v| {
            let offset = ln_doppler(v);
            row.mapv_inplace(|x| x + offset);
        });
    shifted
}
