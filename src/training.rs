use ndarray::Array2;
use std::time::Instant;

use crate::error::Result;
use crate::layers::lstm::Lstm;
use crate::loss::{LossFunction, MSELoss};
use crate::optimizers::{clip_gradient, Optimizer, SGD};

/// A batch of input sequences paired with their target sequences.
pub type SequenceBatch = (Vec<Array2<f64>>, Vec<Array2<f64>>);

/// Configuration for training hyperparameters
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Log progress every this many epochs; 0 disables progress logging.
    pub log_every: usize,
    /// Maximum L2 norm of each parameter's gradient before the update.
    pub clip_gradient: Option<f64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 100,
            log_every: 10,
            clip_gradient: Some(5.0),
        }
    }
}

/// Training metrics tracked during training
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub time_elapsed: f64,
}

/// Drives begin_update / backprop / finish_update over batches of sequences.
pub struct Trainer<L: LossFunction, O: Optimizer> {
    pub layer: Lstm,
    pub loss_function: L,
    pub optimizer: O,
    pub config: TrainingConfig,
    pub metrics_history: Vec<TrainingMetrics>,
}

impl<L: LossFunction, O: Optimizer> Trainer<L, O> {
    pub fn new(layer: Lstm, loss_function: L, optimizer: O) -> Self {
        Trainer {
            layer,
            loss_function,
            optimizer,
            config: TrainingConfig::default(),
            metrics_history: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: TrainingConfig) -> Self {
        self.config = config;
        self
    }

    /// Clears the metric history and the optimizer state. Layer weights are
    /// left as they are.
    pub fn reset(&mut self) {
        self.metrics_history.clear();
        self.optimizer.reset();
    }

    /// One update on a single batch. Returns the loss before the update.
    pub fn train_batch(&mut self, inputs: &[Array2<f64>], targets: &[Array2<f64>]) -> Result<f64> {
        let (outputs, backprop) = self.layer.begin_update(inputs)?;
        let loss = self.loss_function.compute_loss(&outputs, targets)?;
        let d_outputs = self.loss_function.compute_gradient(&outputs, targets)?;
        backprop.backprop(&mut self.layer, &d_outputs)?;

        let clip = self.config.clip_gradient;
        let optimizer = &mut self.optimizer;
        self.layer.finish_update(|key, param, mut grad| {
            if let Some(max_norm) = clip {
                clip_gradient(grad.view_mut(), max_norm);
            }
            optimizer.update(key, param, grad.view());
        });

        Ok(loss)
    }

    /// Train for `config.epochs` passes over `data`.
    pub fn train(&mut self, data: &[SequenceBatch]) -> Result<()> {
        log::info!("starting training for {} epochs", self.config.epochs);

        for epoch in 0..self.config.epochs {
            let start_time = Instant::now();
            let mut epoch_loss = 0.0;
            for (inputs, targets) in data {
                epoch_loss += self.train_batch(inputs, targets)?;
            }
            if !data.is_empty() {
                epoch_loss /= data.len() as f64;
            }

            let metrics = TrainingMetrics {
                epoch,
                train_loss: epoch_loss,
                time_elapsed: start_time.elapsed().as_secs_f64(),
            };
            if self.config.log_every > 0 && epoch % self.config.log_every == 0 {
                log::info!(
                    "epoch {}: train loss {:.6}, {:.3}s",
                    epoch,
                    metrics.train_loss,
                    metrics.time_elapsed
                );
            }
            self.metrics_history.push(metrics);
        }

        log::info!("training completed");
        Ok(())
    }

    /// Mean loss over `data` without updating the layer.
    pub fn evaluate(&self, data: &[SequenceBatch]) -> Result<f64> {
        if data.is_empty() {
            return Ok(0.0);
        }
        let mut total_loss = 0.0;
        for (inputs, targets) in data {
            let outputs = self.layer.predict(inputs)?;
            total_loss += self.loss_function.compute_loss(&outputs, targets)?;
        }
        Ok(total_loss / data.len() as f64)
    }

    pub fn predict(&self, inputs: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        self.layer.predict(inputs)
    }

    pub fn get_latest_metrics(&self) -> Option<&TrainingMetrics> {
        self.metrics_history.last()
    }

    pub fn get_metrics_history(&self) -> &[TrainingMetrics] {
        &self.metrics_history
    }
}

/// Create a basic trainer with SGD optimizer and MSE loss
pub fn create_basic_trainer(layer: Lstm, learning_rate: f64) -> Trainer<MSELoss, SGD> {
    Trainer::new(layer, MSELoss, SGD::new(learning_rate))
}
