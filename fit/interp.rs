//! # Piecewise-Linear Template Interpolation
//!
//! Templates are sampled on their own strictly increasing log-wavelength grid and
//! must be evaluated at Doppler-shifted observed wavelengths. Every query resolves
//! to a [`Bracket`]: the two template nodes that enclose it and the fractional
//! position between them. The interpolated value is the convex combination
//! `(1 - w) * f[lower] + w * f[upper]`, which makes the operation linear in the
//! template values and gives the optimizer its gradients for free:
//!
//! - the adjoint w.r.t. template values is a scatter of `(1 - w, w)` weights,
//! - the derivative w.r.t. the query position is the local segment slope.
//!
//! Queries outside the grid are clamped to the boundary value. A clamped bracket
//! has `lower == upper` and zero slope, so extreme velocities never extrapolate.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Zip};
use thiserror::Error;

/// Errors raised while validating a template grid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("Template grid must contain at least 2 nodes, but has {0}.")]
    GridTooShort(usize),

    #[error("Template grid node {index} ({value}) is not finite.")]
    NonFiniteNode { index: usize, value: f64 },

    #[error(
        "Template grid must be strictly increasing, but node {index} ({value}) does not exceed the node before it."
    )]
    NotIncreasing { index: usize, value: f64 },

    #[error("Template grid has {grid} nodes, but {values} values were supplied.")]
    LengthMismatch { grid: usize, values: usize },
}

/// The two grid nodes enclosing a query and the query's fractional position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub lower: usize,
    pub upper: usize,
    pub weight: f64,
}

impl Bracket {
    /// A bracket pinned to a single boundary node.
    fn clamped(index: usize) -> Self {
        Self {
            lower: index,
            upper: index,
            weight: 0.0,
        }
    }

    /// True when the query fell outside the grid and was clamped.
    pub fn is_clamped(&self) -> bool {
        self.lower == self.upper
    }

    /// Interpolated value for `values` sampled on the bracket's grid.
    #[inline]
    pub fn apply(&self, values: ArrayView1<f64>) -> f64 {
        (1.0 - self.weight) * values[self.lower] + self.weight * values[self.upper]
    }

    /// Derivative of the interpolated value with respect to the query position.
    #[inline]
    pub fn slope(&self, grid: ArrayView1<f64>, values: ArrayView1<f64>) -> f64 {
        if self.is_clamped() {
            return 0.0;
        }
        (values[self.upper] - values[self.lower]) / (grid[self.upper] - grid[self.lower])
    }

    /// Adds `adjoint * d(value)/d(values)` into `target`.
    #[inline]
    pub fn scatter(&self, adjoint: f64, target: &mut ArrayViewMut1<f64>) {
        target[self.lower] += adjoint * (1.0 - self.weight);
        target[self.upper] += adjoint * self.weight;
    }
}

/// Evaluates functions sampled on a fixed, validated grid.
#[derive(Debug, Clone, Copy)]
pub struct Interpolator<'a> {
    grid: ArrayView1<'a, f64>,
}

impl<'a> Interpolator<'a> {
    /// Validates `grid` (at least two finite, strictly increasing nodes).
    pub fn new(grid: ArrayView1<'a, f64>) -> Result<Self, InterpError> {
        if grid.len() < 2 {
            return Err(InterpError::GridTooShort(grid.len()));
        }
        for (index, &value) in grid.iter().enumerate() {
            if !value.is_finite() {
                return Err(InterpError::NonFiniteNode { index, value });
            }
            if index > 0 && value <= grid[index - 1] {
                return Err(InterpError::NotIncreasing { index, value });
            }
        }
        Ok(Self { grid })
    }

    pub fn grid(&self) -> ArrayView1<'a, f64> {
        self.grid
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Finds the bracket of a single query by bisection.
    ///
    /// NaN queries are pinned to the lower boundary.
    pub fn locate(&self, query: f64) -> Bracket {
        let last = self.grid.len() - 1;
        if !(query > self.grid[0]) {
            return Bracket::clamped(0);
        }
        if query >= self.grid[last] {
            return Bracket::clamped(last);
        }

        // Invariant: grid[lo] <= query < grid[hi].
        let (mut lo, mut hi) = (0, last);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.grid[mid] <= query {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let weight = (query - self.grid[lo]) / (self.grid[hi] - self.grid[lo]);
        Bracket {
            lower: lo,
            upper: hi,
            weight,
        }
    }

    /// Brackets for a batch of queries, one row per epoch.
    pub fn brackets(&self, queries: ArrayView2<f64>) -> Array2<Bracket> {
        queries.map(|&q| self.locate(q))
    }

    fn check_values(&self, values: ArrayView1<f64>) -> Result<(), InterpError> {
        if values.len() != self.grid.len() {
            return Err(InterpError::LengthMismatch {
                grid: self.grid.len(),
                values: values.len(),
            });
        }
        Ok(())
    }

    /// Interpolates `values` at every query.
    pub fn evaluate(
        &self,
        values: ArrayView1<f64>,
        queries: ArrayView2<f64>,
    ) -> Result<Array2<f64>, InterpError> {
        self.check_values(values)?;
        Ok(queries.map(|&q| self.locate(q).apply(values)))
    }

    /// Interpolates `values` along a single row of queries.
    pub fn evaluate_row(
        &self,
        values: ArrayView1<f64>,
        queries: ArrayView1<f64>,
    ) -> Result<Array1<f64>, InterpError> {
        self.check_values(values)?;
        Ok(queries.map(|&q| self.locate(q).apply(values)))
    }

    /// The dense `(queries × nodes)` weight matrix `A` such that the
    /// interpolated values are `A · values`. Each row holds at most two
    /// non-zero entries summing to one.
    pub fn weight_matrix(&self, queries: ArrayView1<f64>) -> Array2<f64> {
        let mut weights = Array2::zeros((queries.len(), self.grid.len()));
        Zip::from(weights.rows_mut())
            .and(&queries)
            .for_each(|mut row, &q| self.locate(q).scatter(1.0, &mut row));
        weights
    }
}
