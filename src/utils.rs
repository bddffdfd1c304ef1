//! Activation functions shared by the recurrent cell.

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Hyperbolic tangent activation: tanh(x) = (e^x - e^(-x)) / (e^x + e^(-x))
pub fn tanh(x: f64) -> f64 {
    x.tanh()
}

/// Derivative of the sigmoid expressed through its output `s = σ(x)`.
pub fn dsigmoid(s: f64) -> f64 {
    s * (1.0 - s)
}

/// Derivative of tanh expressed through its output `t = tanh(x)`.
pub fn dtanh(t: f64) -> f64 {
    1.0 - t * t
}
