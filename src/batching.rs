//! Packing of variable-length sequences into a time-major batch.
//!
//! Sequences are sorted by descending length (ties keep their original
//! order) so that the live sequences at any timestep form a prefix of the
//! batch axis. The [`Unpadder`] remembers that ordering and maps any tensor
//! aligned to the batch back to the caller's ordering, or re-pads
//! caller-ordered sequences (such as output gradients) into it.

use ndarray::{s, Array2, Array3};

use crate::error::{LstmError, Result};

/// A rectangular, time-major view of a batch of sequences.
#[derive(Clone, Debug)]
pub struct PaddedBatch {
    /// Shape (T_max, N, I). Rows past a sequence's own length are zero.
    pub data: Array3<f64>,
    /// `size_at_t[t]` is the number of sequences longer than `t`.
    pub size_at_t: Vec<usize>,
}

/// Inverse of [`square_sequences`] for one particular batch.
///
/// Pure: it can be applied to the layer outputs of the batch, to gradients
/// flowing back through it, or to anything else laid out the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unpadder {
    /// `order[slot]` is the caller index stored at batch slot `slot`.
    order: Vec<usize>,
    /// Sequence length per batch slot, non-increasing.
    lengths: Vec<usize>,
}

impl Unpadder {
    /// Builds the sorted layout for a batch with the given per-sequence lengths.
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut order: Vec<usize> = (0..lengths.len()).collect();
        // Stable: equal lengths keep their original relative order.
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        let sorted = order.iter().map(|&i| lengths[i]).collect();
        Unpadder {
            order,
            lengths: sorted,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.order.len()
    }

    /// Longest sequence length, i.e. the time axis of the padded tensor.
    pub fn max_len(&self) -> usize {
        self.lengths.first().copied().unwrap_or(0)
    }

    /// Lengths in batch-slot order (non-increasing).
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Caller index held by each batch slot.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Number of live sequences at every timestep.
    pub fn size_at_t(&self) -> Vec<usize> {
        let t_max = self.max_len();
        let mut size_at_t = Vec::with_capacity(t_max);
        let mut active = self.lengths.len();
        for t in 0..t_max {
            while active > 0 && self.lengths[active - 1] <= t {
                active -= 1;
            }
            size_at_t.push(active);
        }
        size_at_t
    }

    /// Pads caller-ordered sequences into this batch's sorted time-major layout.
    ///
    /// Every sequence must have the length recorded for its position and all
    /// must share one feature width.
    pub fn pad(&self, sequences: &[Array2<f64>]) -> Result<Array3<f64>> {
        if sequences.len() != self.batch_size() {
            return Err(LstmError::BatchSizeMismatch {
                expected: self.batch_size(),
                got: sequences.len(),
            });
        }
        let width = sequences.first().map_or(0, |seq| seq.ncols());

        let mut data = Array3::zeros((self.max_len(), self.batch_size(), width));
        for (slot, (&orig, &len)) in self.order.iter().zip(&self.lengths).enumerate() {
            let seq = &sequences[orig];
            if seq.dim() != (len, width) {
                return Err(LstmError::ShapeMismatch {
                    context: "padding sequence",
                    expected: vec![len, width],
                    got: seq.shape().to_vec(),
                });
            }
            data.slice_mut(s![..len, slot, ..]).assign(seq);
        }
        log::trace!(
            "padded {} sequences into {:?}",
            sequences.len(),
            data.shape()
        );
        Ok(data)
    }

    /// Slices a batch-aligned tensor back into per-sequence arrays in caller order.
    ///
    /// The feature axis may have any width; only the time and batch axes are
    /// checked against the batch.
    pub fn unpad(&self, padded: &Array3<f64>) -> Result<Vec<Array2<f64>>> {
        let (t_max, n, width) = padded.dim();
        if t_max != self.max_len() || n != self.batch_size() {
            return Err(LstmError::ShapeMismatch {
                context: "unpadding batch",
                expected: vec![self.max_len(), self.batch_size(), width],
                got: padded.shape().to_vec(),
            });
        }

        let mut sequences = vec![Array2::zeros((0, width)); n];
        for (slot, (&orig, &len)) in self.order.iter().zip(&self.lengths).enumerate() {
            sequences[orig] = padded.slice(s![..len, slot, ..]).to_owned();
        }
        Ok(sequences)
    }
}

/// Pads `sequences` into one zero-filled (T_max, N, I) tensor.
///
/// Returns the padded batch with its active schedule and the [`Unpadder`]
/// that undoes the transformation. An empty list yields a (0, 0, 0) tensor
/// and an empty schedule.
pub fn square_sequences(sequences: &[Array2<f64>]) -> Result<(PaddedBatch, Unpadder)> {
    let lengths: Vec<usize> = sequences.iter().map(|seq| seq.nrows()).collect();
    let unpadder = Unpadder::from_lengths(&lengths);
    let data = unpadder.pad(sequences)?;
    let size_at_t = unpadder.size_at_t();
    Ok((PaddedBatch { data, size_at_t }, unpadder))
}
