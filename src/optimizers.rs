use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use std::collections::HashMap;

use crate::params::ParamKey;

/// Optimizer trait for parameter updates during `finish_update`.
///
/// Implementations may update `param` in place; the caller zeroes the
/// gradient afterwards.
pub trait Optimizer {
    fn update(&mut self, key: ParamKey, param: ArrayViewMutD<'_, f64>, gradient: ArrayViewD<'_, f64>);
    fn reset(&mut self);
}

/// Stochastic Gradient Descent: θ = θ - η∇θ
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        SGD { learning_rate }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, _key: ParamKey, mut param: ArrayViewMutD<'_, f64>, gradient: ArrayViewD<'_, f64>) {
        param.scaled_add(-self.learning_rate, &gradient);
    }

    fn reset(&mut self) {
        // SGD has no state to reset
    }
}

struct Moments {
    m: ArrayD<f64>,
    v: ArrayD<f64>,
    t: i32,
}

/// Adam optimizer with adaptive learning rates
///
/// Implements: m_t = β₁m_{t-1} + (1-β₁)g_t
///             v_t = β₂v_{t-1} + (1-β₂)g_t²
///             θ_t = θ_{t-1} - η * m̂_t / (√v̂_t + ε)
/// where m̂_t and v̂_t are bias-corrected estimates, tracked per parameter.
/// Keys carry the owning tree, so one instance can serve several layers.
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    moments: HashMap<ParamKey, Moments>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Adam::with_params(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_params(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            moments: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn update(&mut self, key: ParamKey, mut param: ArrayViewMutD<'_, f64>, gradient: ArrayViewD<'_, f64>) {
        let state = self.moments.entry(key).or_insert_with(|| Moments {
            m: ArrayD::zeros(param.raw_dim()),
            v: ArrayD::zeros(param.raw_dim()),
            t: 0,
        });
        state.t += 1;

        state.m = &state.m * self.beta1 + &gradient * (1.0 - self.beta1);
        state.v = &state.v * self.beta2 + gradient.mapv(|g| g * g) * (1.0 - self.beta2);

        let m_hat = &state.m / (1.0 - self.beta1.powi(state.t));
        let v_hat = &state.v / (1.0 - self.beta2.powi(state.t));

        let step = m_hat * self.learning_rate / (v_hat.mapv(f64::sqrt) + self.epsilon);
        param -= &step;
    }

    fn reset(&mut self) {
        self.moments.clear();
    }
}

/// Rescales `gradient` in place so its L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_gradient(mut gradient: ArrayViewMutD<'_, f64>, max_norm: f64) -> f64 {
    let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
    if norm > max_norm {
        gradient *= max_norm / norm;
    }
    norm
}
