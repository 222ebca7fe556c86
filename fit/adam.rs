//! First-order adaptive-moment (Adam) updates for ndarray parameter blocks.
//!
//! Each parameter block owns its own moment estimates. The step follows the
//! bias-corrected form `lr_t = lr * sqrt(1 - β2^t) / (1 - β1^t)`,
//! `θ ← θ - lr_t * m / (sqrt(v) + ε)`.

use ndarray::{Array, ArrayView, ArrayViewMut, Dimension, Zip};

pub const DEFAULT_BETA1: f64 = 0.9;
pub const DEFAULT_BETA2: f64 = 0.999;
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// Moment state for one parameter block.
#[derive(Debug, Clone)]
pub struct Adam<D: Dimension> {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    first_moment: Array<f64, D>,
    second_moment: Array<f64, D>,
    steps: i32,
}

impl<D: Dimension> Adam<D> {
    /// Creates zeroed moments shaped like the parameter block.
    pub fn new(shape: D, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: DEFAULT_BETA1,
            beta2: DEFAULT_BETA2,
            epsilon: DEFAULT_EPSILON,
            first_moment: Array::zeros(shape.clone()),
            second_moment: Array::zeros(shape),
            steps: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn steps(&self) -> i32 {
        self.steps
    }

    /// Applies one update to `param` using `grad`. Shapes must match the
    /// block the optimizer was created for.
    pub fn step(&mut self, param: ArrayViewMut<f64, D>, grad: ArrayView<f64, D>) {
        self.steps += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let corrected_rate = self.learning_rate * (1.0 - beta2.powi(self.steps)).sqrt()
            / (1.0 - beta1.powi(self.steps));

        Zip::from(param)
            .and(&mut self.first_moment)
            .and(&mut self.second_moment)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= corrected_rate * *m / (v.sqrt() + epsilon);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Ix1, array};

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient() {
        let mut theta = array![1.0, -2.0, 0.5];
        let mut adam = Adam::new(theta.raw_dim(), 0.1);
        let grad = array![4.0, -0.01, 0.0];
        adam.step(theta.view_mut(), grad.view());
        // With bias correction the first step is lr * g / (|g| + ε).
        assert_abs_diff_eq!(theta[0], 0.9, epsilon = 1e-7);
        assert_abs_diff_eq!(theta[1], -1.9, epsilon = 1e-5);
        assert_eq!(theta[2], 0.5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn zero_learning_rate_freezes_parameters() {
        let mut theta = array![[1.0, 2.0], [3.0, 4.0]];
        let original = theta.clone();
        let mut adam = Adam::new(theta.raw_dim(), 0.0);
        for _ in 0..10 {
            adam.step(theta.view_mut(), array![[1.0, -1.0], [0.5, 2.0]].view());
        }
        assert_eq!(theta, original);
    }

    #[test]
    fn minimizes_a_quadratic_bowl() {
        let target = array![3.0, -7.0];
        let mut theta: Array1<f64> = Array1::zeros(2);
        let mut adam: Adam<Ix1> = Adam::new(theta.raw_dim(), 0.5);
        for _ in 0..2000 {
            let grad = 2.0 * (&theta - &target);
            adam.step(theta.view_mut(), grad.view());
        }
        assert_abs_diff_eq!(theta[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(theta[1], -7.0, epsilon = 1e-6);
    }
}
