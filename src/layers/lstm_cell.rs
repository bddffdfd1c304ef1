use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use crate::error::{LstmError, Result};
use crate::params::{NodeId, ParamName, ParamNode, ParamTree};
use crate::utils::{dsigmoid, dtanh, sigmoid, tanh};

/// Caches intermediate values of one timestep for the backward pass.
///
/// Every array has one row per sequence that was live at that timestep.
#[derive(Clone, Debug)]
pub struct LstmCellCache {
    /// Concatenated `[h_prev, x]`, shape (n, nO + nI).
    pub z: Array2<f64>,
    pub cx: Array2<f64>,
    pub forget_gate: Array2<f64>,
    pub input_gate: Array2<f64>,
    pub output_gate: Array2<f64>,
    pub cell_gate: Array2<f64>,
    pub cy: Array2<f64>,
}

/// One LSTM step over a batch of rows, with its parameters held by a node
/// of a [`ParamTree`].
///
/// Gate pre-activations are `a = [h_prev, x] · Wᵀ + b`, split into four
/// `hidden_size` chunks in the order forget, input, output, candidate:
/// - f_t = σ(a_f), i_t = σ(a_i), o_t = σ(a_o), g_t = tanh(a_g)
/// - c_t = f_t ⊙ c_t-1 + i_t ⊙ g_t
/// - h_t = o_t ⊙ tanh(c_t)
#[derive(Clone, Debug)]
pub struct LstmCell {
    pub node: NodeId,
    pub input_size: usize,
    pub hidden_size: usize,
}

impl LstmCell {
    /// Declares a new cell node under `parent` with uniform weights in
    /// `[-init_scale, init_scale]` and zeroed bias and initial states.
    pub fn new(
        tree: &mut ParamTree,
        parent: NodeId,
        name: &str,
        input_size: usize,
        hidden_size: usize,
        init_scale: f64,
        rng: &mut StdRng,
    ) -> Self {
        let node = tree.add_child(parent, name);
        let dist = Uniform::new_inclusive(-init_scale, init_scale);
        let w = Array2::random_using((4 * hidden_size, hidden_size + input_size), dist, rng);

        let params = &mut tree[node];
        params.declare(ParamName::W, w.into_dyn());
        params.declare(ParamName::B, Array1::<f64>::zeros(4 * hidden_size).into_dyn());
        params.declare(ParamName::InitialHiddens, Array1::<f64>::zeros(hidden_size).into_dyn());
        params.declare(ParamName::InitialCells, Array1::<f64>::zeros(hidden_size).into_dyn());

        LstmCell {
            node,
            input_size,
            hidden_size,
        }
    }

    /// Learned initial hidden and cell states broadcast to `batch_size` rows.
    pub fn initial_state(&self, params: &ParamNode, batch_size: usize) -> Result<(Array2<f64>, Array2<f64>)> {
        let shape = (batch_size, self.hidden_size);
        let broadcast = |name: ParamName| -> Result<Array2<f64>> {
            let v = params.vector(name)?;
            v.broadcast(shape)
                .map(|view| view.to_owned())
                .ok_or_else(|| LstmError::ShapeMismatch {
                    context: "initial state",
                    expected: vec![self.hidden_size],
                    got: v.shape().to_vec(),
                })
        };
        Ok((broadcast(ParamName::InitialHiddens)?, broadcast(ParamName::InitialCells)?))
    }

    pub fn forward(
        &self,
        params: &ParamNode,
        input: ArrayView2<f64>,
        hx: ArrayView2<f64>,
        cx: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let (hy, cy, _) = self.forward_with_cache(params, input, hx, cx)?;
        Ok((hy, cy))
    }

    pub fn forward_with_cache(
        &self,
        params: &ParamNode,
        input: ArrayView2<f64>,
        hx: ArrayView2<f64>,
        cx: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>, LstmCellCache)> {
        let n = input.nrows();
        let h = self.hidden_size;
        check_dim("cell input", input, (n, self.input_size))?;
        check_dim("hidden state", hx, (n, h))?;
        check_dim("cell state", cx, (n, h))?;

        let w = params.matrix(ParamName::W)?;
        let b = params.vector(ParamName::B)?;

        let z = concatenate(Axis(1), &[hx.view(), input.view()]).map_err(|_| LstmError::ShapeMismatch {
            context: "concatenating hidden state and input",
            expected: vec![n, h + self.input_size],
            got: vec![hx.nrows(), hx.ncols() + input.ncols()],
        })?;
        let gates = z.dot(&w.t()) + &b;

        let forget_gate = gates.slice(s![.., 0..h]).mapv(sigmoid);
        let input_gate = gates.slice(s![.., h..2 * h]).mapv(sigmoid);
        let output_gate = gates.slice(s![.., 2 * h..3 * h]).mapv(sigmoid);
        let cell_gate = gates.slice(s![.., 3 * h..4 * h]).mapv(tanh);

        // c_t = f_t ⊙ c_t-1 + i_t ⊙ g_t
        let cy = &forget_gate * &cx + &input_gate * &cell_gate;
        // h_t = o_t ⊙ tanh(c_t)
        let hy = &output_gate * &cy.mapv(tanh);

        let cache = LstmCellCache {
            z,
            cx: cx.to_owned(),
            forget_gate,
            input_gate,
            output_gate,
            cell_gate,
            cy: cy.clone(),
        };

        Ok((hy, cy, cache))
    }

    /// Backward pass for one timestep.
    ///
    /// Adds this step's contribution to the `W` and `b` gradients on
    /// `params` and returns `(dx, dh_prev, dc_prev)`.
    pub fn backward(
        &self,
        params: &mut ParamNode,
        dhy: ArrayView2<f64>,
        dcy: ArrayView2<f64>,
        cache: &LstmCellCache,
    ) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>)> {
        let h = self.hidden_size;
        let n = cache.cy.nrows();
        check_dim("hidden gradient", dhy, (n, h))?;
        check_dim("cell gradient", dcy, (n, h))?;

        let tanh_cy = cache.cy.mapv(tanh);

        // ∂L/∂o_t = ∂L/∂h_t ⊙ tanh(c_t)
        let do_raw = &dhy * &tanh_cy * cache.output_gate.mapv(dsigmoid);

        // Cell state gradient from the recurrence plus the tanh path
        let dcy_total = &dcy + &(&dhy * &cache.output_gate * tanh_cy.mapv(dtanh));

        let df_raw = &dcy_total * &cache.cx * cache.forget_gate.mapv(dsigmoid);
        let di_raw = &dcy_total * &cache.cell_gate * cache.input_gate.mapv(dsigmoid);
        let dg_raw = &dcy_total * &cache.input_gate * cache.cell_gate.mapv(dtanh);

        let mut dgates = Array2::<f64>::zeros((n, 4 * h));
        dgates.slice_mut(s![.., 0..h]).assign(&df_raw);
        dgates.slice_mut(s![.., h..2 * h]).assign(&di_raw);
        dgates.slice_mut(s![.., 2 * h..3 * h]).assign(&do_raw);
        dgates.slice_mut(s![.., 3 * h..4 * h]).assign(&dg_raw);

        params
            .matrix_grad_mut(ParamName::W)?
            .scaled_add(1.0, &dgates.t().dot(&cache.z));
        let mut db = params.vector_grad_mut(ParamName::B)?;
        db += &dgates.sum_axis(Axis(0));

        let dz = dgates.dot(&params.matrix(ParamName::W)?);
        let dhx = dz.slice(s![.., ..h]).to_owned();
        let dx = dz.slice(s![.., h..]).to_owned();
        let dcx = &dcy_total * &cache.forget_gate;

        Ok((dx, dhx, dcx))
    }

    /// Adds the gradients reaching the first timestep to the learned initial
    /// states, summed over the batch.
    pub fn accumulate_initial_grads(
        &self,
        params: &mut ParamNode,
        dh0: ArrayView2<f64>,
        dc0: ArrayView2<f64>,
    ) -> Result<()> {
        let mut dh = params.vector_grad_mut(ParamName::InitialHiddens)?;
        dh += &dh0.sum_axis(Axis(0));
        let mut dc = params.vector_grad_mut(ParamName::InitialCells)?;
        dc += &dc0.sum_axis(Axis(0));
        Ok(())
    }
}

fn check_dim(context: &'static str, array: ArrayView2<f64>, expected: (usize, usize)) -> Result<()> {
    if array.dim() != expected {
        return Err(LstmError::ShapeMismatch {
            context,
            expected: vec![expected.0, expected.1],
            got: array.shape().to_vec(),
        });
    }
    Ok(())
}
