use ndarray::Array2;

use crate::error::{LstmError, Result};

/// Loss over a batch of predicted sequences and their targets.
pub trait LossFunction {
    /// Compute the loss between predictions and targets
    fn compute_loss(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<f64>;

    /// Compute the gradient of the loss with respect to each prediction
    fn compute_gradient(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<Vec<Array2<f64>>>;
}

fn check_pairs(predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<()> {
    if predictions.len() != targets.len() {
        return Err(LstmError::BatchSizeMismatch {
            expected: predictions.len(),
            got: targets.len(),
        });
    }
    for (prediction, target) in predictions.iter().zip(targets) {
        if prediction.dim() != target.dim() {
            return Err(LstmError::ShapeMismatch {
                context: "loss target",
                expected: prediction.shape().to_vec(),
                got: target.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Sum of squared errors: Σ(ŷ - y)².
///
/// The reported gradient is (ŷ - y), the gradient of ½Σ(ŷ - y)².
pub struct SumSquaredError;

impl LossFunction for SumSquaredError {
    fn compute_loss(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<f64> {
        check_pairs(predictions, targets)?;
        Ok(predictions
            .iter()
            .zip(targets)
            .map(|(p, t)| (p - t).mapv(|d| d * d).sum())
            .sum())
    }

    fn compute_gradient(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        check_pairs(predictions, targets)?;
        Ok(predictions.iter().zip(targets).map(|(p, t)| p - t).collect())
    }
}

/// Mean Squared Error over every element of every sequence.
pub struct MSELoss;

impl MSELoss {
    fn count(predictions: &[Array2<f64>]) -> usize {
        predictions.iter().map(|p| p.len()).sum()
    }
}

impl LossFunction for MSELoss {
    fn compute_loss(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<f64> {
        let total = SumSquaredError.compute_loss(predictions, targets)?;
        let count = MSELoss::count(predictions);
        Ok(if count == 0 { 0.0 } else { total / count as f64 })
    }

    fn compute_gradient(&self, predictions: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        check_pairs(predictions, targets)?;
        let scale = 2.0 / MSELoss::count(predictions).max(1) as f64;
        Ok(predictions
            .iter()
            .zip(targets)
            .map(|(p, t)| (p - t) * scale)
            .collect())
    }
}
