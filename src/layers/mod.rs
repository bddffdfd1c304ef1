/// Single-step LSTM cell with batched forward/backward.
pub mod lstm_cell;

/// LSTM layer over padded batches of variable-length sequences.
pub mod lstm;
