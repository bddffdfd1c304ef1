use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{s, Array2, Array3, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batching::{square_sequences, Unpadder};
use crate::error::{LstmError, Result};
use crate::layers::lstm_cell::{LstmCell, LstmCellCache};
use crate::optimizers::Optimizer;
use crate::params::{ParamKey, ParamNode, ParamTree, Walk};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(0);

/// Construction parameters for an [`Lstm`].
#[derive(Clone, Debug, PartialEq)]
pub struct LstmConfig {
    pub n_out: usize,
    pub n_in: usize,
    /// Number of stacked recurrent layers.
    pub depth: usize,
    /// Weights are drawn uniformly from `[-init_scale, init_scale]`.
    pub init_scale: f64,
    /// Seed for weight initialisation; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl LstmConfig {
    pub fn new(n_out: usize, n_in: usize) -> Self {
        LstmConfig {
            n_out,
            n_in,
            depth: 1,
            init_scale: 0.1,
            seed: None,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_init_scale(mut self, init_scale: f64) -> Self {
        self.init_scale = init_scale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_out == 0 || self.n_in == 0 {
            return Err(LstmError::InvalidConfig(format!(
                "sizes must be positive, got nO={} nI={}",
                self.n_out, self.n_in
            )));
        }
        if self.depth == 0 {
            return Err(LstmError::InvalidConfig("depth must be at least 1".into()));
        }
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(LstmError::InvalidConfig(format!(
                "init_scale must be positive and finite, got {}",
                self.init_scale
            )));
        }
        Ok(())
    }
}

/// LSTM layer over batches of variable-length sequences.
///
/// Inputs are padded into a time-major batch sorted by length, every
/// stacked cell is run across all timesteps with rows masked out once
/// their sequence has ended, and the final hidden states are unpadded back
/// into the caller's order. Parameters live in a [`ParamTree`] rooted at a
/// node named `lstm` with one child node per stacked cell.
pub struct Lstm {
    config: LstmConfig,
    tree: ParamTree,
    cells: Vec<LstmCell>,
    instance: u64,
    generation: u64,
}

impl Lstm {
    /// Creates a single-layer LSTM mapping `n_in` features to `n_out`.
    pub fn new(n_out: usize, n_in: usize) -> Result<Self> {
        Lstm::from_config(LstmConfig::new(n_out, n_in))
    }

    pub fn from_config(config: LstmConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut tree = ParamTree::new("lstm");
        let root = tree.root();
        let cells = (0..config.depth)
            .map(|k| {
                let input_size = if k == 0 { config.n_in } else { config.n_out };
                LstmCell::new(
                    &mut tree,
                    root,
                    &format!("lstm_cell_{}", k),
                    input_size,
                    config.n_out,
                    config.init_scale,
                    &mut rng,
                )
            })
            .collect();

        Ok(Lstm {
            config,
            tree,
            cells,
            instance: NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
        })
    }

    pub fn n_out(&self) -> usize {
        self.config.n_out
    }

    pub fn n_in(&self) -> usize {
        self.config.n_in
    }

    pub fn depth(&self) -> usize {
        self.config.depth
    }

    pub fn config(&self) -> &LstmConfig {
        &self.config
    }

    pub fn params(&self) -> &ParamTree {
        &self.tree
    }

    /// Pre-order traversal of the parameter nodes.
    pub fn walk(&self) -> Walk<'_> {
        self.tree.walk()
    }

    /// Forward pass. Returns one (L, nO) output per input sequence, in input
    /// order, and the tape needed to backpropagate through this pass.
    pub fn begin_update(&self, xs: &[Array2<f64>]) -> Result<(Vec<Array2<f64>>, Backprop)> {
        for x in xs {
            if x.ncols() != self.config.n_in {
                return Err(LstmError::ShapeMismatch {
                    context: "lstm input",
                    expected: vec![x.nrows(), self.config.n_in],
                    got: x.shape().to_vec(),
                });
            }
        }

        let (batch, unpadder) = square_sequences(xs)?;
        log::debug!(
            "lstm forward: {} sequences padded to {:?}",
            xs.len(),
            batch.data.shape()
        );

        let mut current = batch.data;
        let mut tapes = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let (outputs, caches) = forward_layer(cell, &self.tree[cell.node], &current, &batch.size_at_t)?;
            tapes.push(caches);
            current = outputs;
        }

        let ys = unpadder.unpad(&current)?;
        let backprop = Backprop {
            instance: self.instance,
            generation: self.generation,
            n_out: self.config.n_out,
            unpadder,
            size_at_t: batch.size_at_t,
            tapes,
        };
        Ok((ys, backprop))
    }

    /// Forward pass without keeping the tape.
    pub fn predict(&self, xs: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        self.begin_update(xs).map(|(ys, _)| ys)
    }

    /// Hands every accumulated (parameter, gradient) pair to `callback` once
    /// and leaves all gradients zeroed. Returns the number of pairs visited.
    ///
    /// Tapes recorded before this call can no longer be backpropagated.
    pub fn finish_update<F>(&mut self, callback: F) -> usize
    where
        F: FnMut(ParamKey, ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    {
        let drained = self.tree.finish_update(callback);
        self.generation += 1;
        log::debug!("lstm finish_update: drained {} parameters", drained);
        drained
    }

    /// [`finish_update`](Lstm::finish_update) driven by an [`Optimizer`].
    pub fn finish_update_with<O: Optimizer>(&mut self, optimizer: &mut O) -> usize {
        self.finish_update(|key, param, grad| optimizer.update(key, param, grad.view()))
    }
}

/// Runs one cell over every timestep of a padded batch.
fn forward_layer(
    cell: &LstmCell,
    params: &ParamNode,
    inputs: &Array3<f64>,
    size_at_t: &[usize],
) -> Result<(Array3<f64>, Vec<LstmCellCache>)> {
    let (t_max, n, _) = inputs.dim();
    let (mut hx, mut cx) = cell.initial_state(params, n)?;
    let mut outputs = Array3::zeros((t_max, n, cell.hidden_size));
    let mut caches = Vec::with_capacity(t_max);

    for (t, &active) in size_at_t.iter().enumerate() {
        let (hy, cy, cache) = cell.forward_with_cache(
            params,
            inputs.slice(s![t, ..active, ..]),
            hx.slice(s![..active, ..]),
            cx.slice(s![..active, ..]),
        )?;
        outputs.slice_mut(s![t, ..active, ..]).assign(&hy);
        hx.slice_mut(s![..active, ..]).assign(&hy);
        cx.slice_mut(s![..active, ..]).assign(&cy);
        caches.push(cache);
    }

    Ok((outputs, caches))
}

/// Backpropagation through time for one cell. Returns the gradient with
/// respect to the cell's padded inputs.
fn backward_layer(
    cell: &LstmCell,
    params: &mut ParamNode,
    caches: &[LstmCellCache],
    size_at_t: &[usize],
    d_outputs: &Array3<f64>,
) -> Result<Array3<f64>> {
    let (t_max, n, _) = d_outputs.dim();
    let h = cell.hidden_size;
    let mut d_inputs = Array3::zeros((t_max, n, cell.input_size));
    let mut dh_carry = Array2::<f64>::zeros((n, h));
    let mut dc_carry = Array2::<f64>::zeros((n, h));

    for (t, cache) in caches.iter().enumerate().rev() {
        let active = size_at_t[t];
        let dhy = &d_outputs.slice(s![t, ..active, ..]) + &dh_carry.slice(s![..active, ..]);
        let (dx, dhx, dcx) = cell.backward(params, dhy.view(), dc_carry.slice(s![..active, ..]), cache)?;
        d_inputs.slice_mut(s![t, ..active, ..]).assign(&dx);
        dh_carry.slice_mut(s![..active, ..]).assign(&dhx);
        dc_carry.slice_mut(s![..active, ..]).assign(&dcx);
    }

    // Whatever is left in the carries reached the learned initial states.
    cell.accumulate_initial_grads(params, dh_carry.view(), dc_carry.view())?;
    Ok(d_inputs)
}

/// Forward tape of one [`Lstm::begin_update`] call.
///
/// Consumed by [`Backprop::backprop`], so each forward pass can be
/// backpropagated at most once.
#[derive(Debug)]
pub struct Backprop {
    instance: u64,
    generation: u64,
    n_out: usize,
    unpadder: Unpadder,
    size_at_t: Vec<usize>,
    tapes: Vec<Vec<LstmCellCache>>,
}

impl Backprop {
    /// Computes input gradients from output gradients `dys` (one per output,
    /// same shapes, caller order) and adds the parameter gradients into
    /// `layer`'s tree.
    pub fn backprop(self, layer: &mut Lstm, dys: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        if self.instance != layer.instance {
            return Err(LstmError::ForeignTape);
        }
        if self.generation != layer.generation {
            return Err(LstmError::StaleTape);
        }
        for dy in dys {
            if dy.ncols() != self.n_out {
                return Err(LstmError::ShapeMismatch {
                    context: "lstm output gradient",
                    expected: vec![dy.nrows(), self.n_out],
                    got: dy.shape().to_vec(),
                });
            }
        }

        let mut grad = self.unpadder.pad(dys)?;
        log::debug!("lstm backprop: gradient batch {:?}", grad.shape());

        for (cell, caches) in layer.cells.iter().zip(&self.tapes).rev() {
            grad = backward_layer(cell, &mut layer.tree[cell.node], caches, &self.size_at_t, &grad)?;
        }

        self.unpadder.unpad(&grad)
    }
}
