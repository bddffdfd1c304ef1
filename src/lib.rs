//! # LSTM over variable-length sequences
//!
//! A batched LSTM layer that consumes lists of variable-length sequences,
//! together with the pieces it is built from.
//!
//! ## Core Components
//!
//! - **Batching**: pads sequences into a time-major tensor sorted by length,
//!   with a per-timestep active count and an exact inverse
//! - **Parameter tree**: named parameters with gradient accumulators,
//!   arranged in a walkable tree of nodes
//! - **LSTM cell**: batched single-step forward and backward
//! - **LSTM layer**: `begin_update` / backprop / `finish_update` over whole
//!   batches, with backpropagation through time
//! - **Optimizers**, **loss functions** and a small **trainer**
//!
//! ## Quick Start
//!
//! ```rust
//! use lstm_seqpack::{Lstm, SGD};
//! use ndarray::arr2;
//!
//! let mut lstm = Lstm::new(2, 3).unwrap();
//! let xs = vec![arr2(&[[0.1, 0.2, 0.3], [0.0, 0.1, 0.0]]), arr2(&[[1.0, 0.0, 0.0]])];
//!
//! let (ys, backprop) = lstm.begin_update(&xs).unwrap();
//! assert_eq!(ys[0].shape(), &[2, 2]);
//!
//! let dxs = backprop.backprop(&mut lstm, &ys).unwrap();
//! assert_eq!(dxs[1].shape(), &[1, 3]);
//!
//! lstm.finish_update_with(&mut SGD::new(0.01));
//! ```

pub mod error;
pub mod utils;
pub mod batching;
pub mod params;
pub mod layers;
pub mod loss;
pub mod optimizers;
pub mod training;

// Re-export commonly used items
pub use error::{LstmError, Result};
pub use batching::{square_sequences, PaddedBatch, Unpadder};
pub use params::{NodeId, ParamKey, ParamName, ParamNode, ParamTree, Parameter};
pub use layers::lstm::{Backprop, Lstm, LstmConfig};
pub use layers::lstm_cell::LstmCell;
pub use training::{Trainer, TrainingConfig};
pub use optimizers::{Adam, Optimizer, SGD};
pub use loss::{LossFunction, MSELoss, SumSquaredError};
