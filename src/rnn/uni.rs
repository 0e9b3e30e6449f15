//! Single-direction LSTM compute engine.
//!
//! The engine re-packs the per-direction weights into a fused, transposed
//! layout once at construction, runs one whole-sequence matmul over the
//! input, then walks the time steps applying the recurrent matmul and the
//! element-wise gate kernel. Depending on the problem shape the per-step
//! work is striped across batch rows or across the fused gate columns.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};
use rayon::ThreadPool;

use super::Direction;
use crate::activations::{ActivationInfo, MergeInfo};
use crate::buffer_pool::{zeros_in, BufferPool};
use crate::error::OpError;
use crate::gemm::gemm;
use crate::kernels::{
    clip_add_bias, clip_ignore_bias, elementwise_product, merge_lstm_gates_to_memory,
    ClipWithBiasFn,
};
use crate::sequence::reverse_sequence;
use crate::threading::{div_ceil, parallel_for, ThreadPlan};

/// Fused per-gate bias vectors, `bias_WR*[k] = Wb*[k] + Rb*[k]`.
struct FusedBias {
    i: Vec<f32>,
    f: Vec<f32>,
    o: Vec<f32>,
    c: Vec<f32>,
}

/// Borrowed peephole slices. These are never modified, so the engine aliases
/// the operator input rather than copying it.
#[derive(Clone, Copy)]
struct Peepholes<'a> {
    i: &'a [f32],
    o: &'a [f32],
    f: &'a [f32],
}

/// Read-only state shared by every gate-kernel invocation of one compute
/// call.
#[derive(Clone, Copy)]
struct GateParams<'a> {
    hidden_size: usize,
    clip: f32,
    input_forget: bool,
    min_sequence_length: usize,
    clip_with_bias: ClipWithBiasFn,
    bias: Option<&'a FusedBias>,
    peepholes: Option<Peepholes<'a>>,
    activation_f: ActivationInfo,
    activation_g: ActivationInfo,
    activation_h: MergeInfo,
}

/// The per-worker state in batch-parallel mode: a stripe of batch rows,
/// carried through every time step by one task.
struct BatchStripe<'v> {
    /// Sequence lengths for the rows in this stripe.
    lens: &'v [i32],
    /// `[seq, rows, 4 * hidden]` slab of the fused gate buffer.
    ifog: ArrayViewMut3<'v, f32>,
    /// `[rows, hidden]` previous (then current) cell state.
    c_prev: ArrayViewMut2<'v, f32>,
    /// `[rows, hidden]` scratch for the staged cell value.
    c_clipped: ArrayViewMut2<'v, f32>,
    /// `[rows, hidden]` initial hidden state.
    hidden0: ArrayView2<'v, f32>,
    final_hidden: ArrayViewMut2<'v, f32>,
    final_cell: ArrayViewMut2<'v, f32>,
    /// `[seq, rows, hidden]` slab of the sequence output, if requested.
    out: Option<ArrayViewMut3<'v, f32>>,
}

/// Single-direction LSTM pass over a packed `[seq, batch, input]` sequence.
///
/// Construction re-packs the weights, fuses the bias, binds the peepholes and
/// copies the initial states; [`UniDirectionalLstm::compute`] then runs one
/// operator invocation. The engine is not retained across invocations; its
/// scratch buffers come from the pool and go back to it when the engine is
/// dropped.
pub struct UniDirectionalLstm<'a> {
    pool: &'a BufferPool,
    thread_pool: &'a ThreadPool,

    seq_length: usize,
    batch_size: usize,
    input_size: usize,
    hidden_size: usize,

    direction: Direction,
    input_forget: bool,
    clip: f32,
    plan: ThreadPlan,

    clip_with_bias: ClipWithBiasFn,
    activation_f: ActivationInfo,
    activation_g: ActivationInfo,
    activation_h: MergeInfo,

    /// `[input_size, 4 * hidden]` fused input weights.
    weights_ifoc: Array2<f32>,
    /// `[hidden, 4 * hidden]` fused recurrent weights.
    recurrent_weights_ifoc: Array2<f32>,
    bias_wr: Option<FusedBias>,
    peepholes: Option<Peepholes<'a>>,

    /// `[batch, hidden]` initial hidden state.
    batched_hidden0: Array2<f32>,
    /// `[batch, hidden]` cell state, updated in place each step.
    internal_memory_prev: Array2<f32>,
    /// `[batch, hidden]` staging area for the cell value fed to the hidden
    /// activation.
    internal_memory_clipped: Array2<f32>,
    /// `[seq, batch, 4 * hidden]` fused gate pre-activations.
    output_ifog: Array3<f32>,

    inputs_reverse: Option<Array3<f32>>,
    outputs_reverse: Option<Array3<f32>>,
}

impl<'a> UniDirectionalLstm<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: &'a BufferPool,
        thread_pool: &'a ThreadPool,
        seq_length: usize,
        batch_size: usize,
        input_size: usize,
        hidden_size: usize,
        direction: Direction,
        input_forget: bool,
        input_weights: ArrayView2<f32>,
        recurrent_weights: ArrayView2<f32>,
        bias: Option<&[f32]>,
        peephole_weights: Option<&'a [f32]>,
        initial_hidden: Option<ArrayView2<f32>>,
        initial_cell: Option<ArrayView2<f32>>,
        activation_f: ActivationInfo,
        activation_g: ActivationInfo,
        activation_h: MergeInfo,
        clip: f32,
        plan: ThreadPlan,
    ) -> UniDirectionalLstm<'a> {
        debug_assert!(
            !matches!(direction, Direction::Bidirectional),
            "bidirectional runs use one engine per direction"
        );

        let mut weights_ifoc = zeros_in(pool, (input_size, 4 * hidden_size));
        load_weights_with_transpose(input_weights, &mut weights_ifoc, hidden_size);

        let mut recurrent_weights_ifoc = zeros_in(pool, (hidden_size, 4 * hidden_size));
        load_weights_with_transpose(recurrent_weights, &mut recurrent_weights_ifoc, hidden_size);

        let bias_wr = bias.map(|bias| load_bias(pool, bias, hidden_size));
        let clip_with_bias: ClipWithBiasFn = if bias_wr.is_some() {
            clip_add_bias
        } else {
            clip_ignore_bias
        };

        let peepholes = peephole_weights.map(|p| bind_peepholes(p, hidden_size));

        let mut batched_hidden0 = zeros_in(pool, (batch_size, hidden_size));
        if let Some(initial_hidden) = initial_hidden {
            batched_hidden0.assign(&initial_hidden);
        }
        let mut internal_memory_prev = zeros_in(pool, (batch_size, hidden_size));
        if let Some(initial_cell) = initial_cell {
            internal_memory_prev.assign(&initial_cell);
        }
        let internal_memory_clipped = zeros_in(pool, (batch_size, hidden_size));
        let output_ifog = zeros_in(pool, (seq_length, batch_size, 4 * hidden_size));

        let reverse = matches!(direction, Direction::Reverse);
        let inputs_reverse = reverse.then(|| zeros_in(pool, (seq_length, batch_size, input_size)));
        let outputs_reverse =
            reverse.then(|| zeros_in(pool, (seq_length, batch_size, hidden_size)));

        UniDirectionalLstm {
            pool,
            thread_pool,
            seq_length,
            batch_size,
            input_size,
            hidden_size,
            direction,
            input_forget,
            clip,
            plan,
            clip_with_bias,
            activation_f,
            activation_g,
            activation_h,
            weights_ifoc,
            recurrent_weights_ifoc,
            bias_wr,
            peepholes,
            batched_hidden0,
            internal_memory_prev,
            internal_memory_clipped,
            output_ifog,
            inputs_reverse,
            outputs_reverse,
        }
    }

    /// Run the LSTM over `input`, which has shape `[seq, batch, input]` and
    /// must be in standard layout.
    ///
    /// `output`, if present, is this direction's `[seq, batch, hidden]` view
    /// of the caller's output tensor (strided when interleaved with a second
    /// direction) and must start out zero-filled. `final_hidden` and
    /// `final_cell` always receive the per-row last-valid hidden and cell
    /// states; rows whose sequence length is zero report the initial states
    /// unchanged.
    pub fn compute<'b>(
        &'b mut self,
        input: ArrayView3<'b, f32>,
        sequence_lens: Option<&[i32]>,
        mut output: Option<ArrayViewMut3<f32>>,
        mut final_hidden: ArrayViewMut2<f32>,
        mut final_cell: ArrayViewMut2<f32>,
    ) -> Result<(), OpError> {
        let UniDirectionalLstm {
            thread_pool,
            seq_length,
            batch_size,
            input_size,
            hidden_size,
            direction,
            input_forget,
            clip,
            plan,
            clip_with_bias,
            activation_f,
            activation_g,
            activation_h,
            ref weights_ifoc,
            ref recurrent_weights_ifoc,
            ref bias_wr,
            peepholes,
            ref batched_hidden0,
            ref mut internal_memory_prev,
            ref mut internal_memory_clipped,
            ref mut output_ifog,
            ref mut inputs_reverse,
            ref mut outputs_reverse,
            ..
        } = *self;

        debug_assert_eq!(input.dim(), (seq_length, batch_size, input_size));

        // If sequence lengths weren't provided, treat every row as
        // full-length.
        let default_lens;
        let seq_lens: &[i32] = match sequence_lens {
            Some(lens) => lens,
            None => {
                default_lens = vec![seq_length as i32; batch_size];
                &default_lens
            }
        };
        debug_assert_eq!(seq_lens.len(), batch_size);

        let max_sequence_length = seq_lens
            .iter()
            .map(|&len| len.max(0) as usize)
            .max()
            .unwrap_or(0)
            .min(seq_length);
        let min_sequence_length = seq_lens
            .iter()
            .map(|&len| len.max(0) as usize)
            .min()
            .unwrap_or(0)
            .min(seq_length);

        // Final states default to the initial states so that rows with a
        // zero sequence length report them unchanged.
        final_hidden.assign(batched_hidden0);
        final_cell.assign(internal_memory_prev);

        let output_sequence = output.is_some();
        let reverse = matches!(direction, Direction::Reverse);

        // The reverse direction consumes its own reversed-time copy of the
        // input, and produces the sequence output into a contiguous scratch
        // buffer which is re-reversed into the caller's view at the end.
        if reverse {
            let buf = inputs_reverse.as_mut().expect("reverse buffers allocated");
            reverse_sequence(input, buf.view_mut(), seq_lens);
        }
        let working_input = match (reverse, inputs_reverse.as_ref()) {
            (true, Some(buf)) => buf.view(),
            _ => input,
        };
        let mut work_out: Option<ArrayViewMut3<f32>> = match (&mut output, reverse) {
            (Some(out), false) => Some(out.view_mut()),
            (Some(_), true) => Some(
                outputs_reverse
                    .as_mut()
                    .expect("reverse buffers allocated")
                    .view_mut(),
            ),
            (None, _) => None,
        };

        let params = GateParams {
            hidden_size,
            clip,
            input_forget,
            min_sequence_length,
            clip_with_bias,
            bias: bias_wr.as_ref(),
            peepholes,
            activation_f,
            activation_g,
            activation_h,
        };

        // Apply the input weights to all steps up front: one matmul over
        // `max_sequence_length * batch` rows, striped across the pool.
        let total_rows = max_sequence_length * batch_size;
        if total_rows > 0 {
            let x_rows = working_input
                .into_shape((seq_length * batch_size, input_size))
                .expect("input is contiguous")
                .slice_move(s![..total_rows, ..]);
            let mut ifog_rows = output_ifog
                .view_mut()
                .into_shape((seq_length * batch_size, 4 * hidden_size))
                .expect("gate buffer is contiguous")
                .slice_move(s![..total_rows, ..]);

            let stripe = div_ceil(total_rows, plan.input_threads);
            let jobs: Vec<_> = x_rows
                .axis_chunks_iter(Axis(0), stripe)
                .zip(ifog_rows.axis_chunks_iter_mut(Axis(0), stripe))
                .collect();
            parallel_for(thread_pool, jobs, |(x_stripe, mut ifog_stripe)| {
                gemm(1., x_stripe, weights_ifoc.view(), 0., ifog_stripe.view_mut());
            })?;
        }

        if plan.batch_parallel {
            // Each task owns a stripe of batch rows and runs every time step
            // for those rows: the recurrent matmul, the gate kernel and the
            // final-cell snapshot. Rows never interact, so no barrier is
            // needed between steps of different stripes.
            let stripe = div_ceil(batch_size, plan.hidden_threads);
            let n_stripes = div_ceil(batch_size, stripe);

            let out_chunks: Vec<Option<ArrayViewMut3<f32>>> = match work_out.as_mut() {
                Some(out) => out
                    .axis_chunks_iter_mut(Axis(1), stripe)
                    .map(Some)
                    .collect(),
                None => (0..n_stripes).map(|_| None).collect(),
            };

            let jobs: Vec<BatchStripe> = seq_lens
                .chunks(stripe)
                .zip(output_ifog.axis_chunks_iter_mut(Axis(1), stripe))
                .zip(internal_memory_prev.axis_chunks_iter_mut(Axis(0), stripe))
                .zip(internal_memory_clipped.axis_chunks_iter_mut(Axis(0), stripe))
                .zip(batched_hidden0.axis_chunks_iter(Axis(0), stripe))
                .zip(final_hidden.axis_chunks_iter_mut(Axis(0), stripe))
                .zip(final_cell.axis_chunks_iter_mut(Axis(0), stripe))
                .zip(out_chunks)
                .map(
                    |(((((((lens, ifog), c_prev), c_clipped), hidden0), fh), fc), out)| {
                        BatchStripe {
                            lens,
                            ifog,
                            c_prev,
                            c_clipped,
                            hidden0,
                            final_hidden: fh,
                            final_cell: fc,
                            out,
                        }
                    },
                )
                .collect();

            parallel_for(thread_pool, jobs, |mut job| {
                for step in 0..max_sequence_length {
                    {
                        // Previous hidden state: the initial state for step
                        // 0, then the hidden values written at the previous
                        // step.
                        let prev: ArrayView2<f32> = if step == 0 {
                            job.hidden0.view()
                        } else if let Some(out) = &job.out {
                            out.index_axis(Axis(0), step - 1)
                        } else {
                            job.final_hidden.view()
                        };
                        let mut ifog_step = job.ifog.index_axis_mut(Axis(0), step);
                        gemm(
                            1.,
                            prev,
                            recurrent_weights_ifoc.view(),
                            1.,
                            ifog_step.view_mut(),
                        );
                    }

                    let ifog_step = job.ifog.index_axis_mut(Axis(0), step);
                    let batched_output = match &mut job.out {
                        Some(out) => out.index_axis_mut(Axis(0), step),
                        None => job.final_hidden.view_mut(),
                    };
                    gate_computations(
                        &params,
                        step,
                        job.lens,
                        ifog_step,
                        job.c_prev.view_mut(),
                        job.c_clipped.view_mut(),
                        batched_output,
                        output_sequence,
                    );

                    // Snapshot the cell state of rows ending at this step.
                    for b in 0..job.lens.len() {
                        if step + 1 == job.lens[b].max(0) as usize {
                            job.final_cell.row_mut(b).assign(&job.c_prev.row(b));
                        }
                    }
                }
            })?;
        } else {
            // Column-parallel: steps run sequentially, and within each step
            // the recurrent matmul is split into vertical stripes of the
            // fused gate columns. The gate kernel runs on the caller thread.
            let col_stripe = div_ceil(4 * hidden_size, plan.hidden_threads);

            for step in 0..max_sequence_length {
                {
                    let prev: ArrayView2<f32> = if step == 0 {
                        batched_hidden0.view()
                    } else if let Some(out) = &work_out {
                        out.index_axis(Axis(0), step - 1)
                    } else {
                        final_hidden.view()
                    };
                    let mut ifog_step = output_ifog.index_axis_mut(Axis(0), step);
                    let jobs: Vec<_> = ifog_step
                        .axis_chunks_iter_mut(Axis(1), col_stripe)
                        .zip(recurrent_weights_ifoc.axis_chunks_iter(Axis(1), col_stripe))
                        .collect();
                    parallel_for(thread_pool, jobs, |(mut ifog_cols, weight_cols)| {
                        gemm(1., prev.view(), weight_cols, 1., ifog_cols.view_mut());
                    })?;
                }

                let ifog_step = output_ifog.index_axis_mut(Axis(0), step);
                let batched_output = match &mut work_out {
                    Some(out) => out.index_axis_mut(Axis(0), step),
                    None => final_hidden.view_mut(),
                };
                gate_computations(
                    &params,
                    step,
                    seq_lens,
                    ifog_step,
                    internal_memory_prev.view_mut(),
                    internal_memory_clipped.view_mut(),
                    batched_output,
                    output_sequence,
                );

                for b in 0..batch_size {
                    if step + 1 == seq_lens[b].max(0) as usize {
                        final_cell
                            .row_mut(b)
                            .assign(&internal_memory_prev.row(b));
                    }
                }
            }
        }

        if output_sequence {
            // Copy each row's last valid output to the final hidden state.
            {
                let out_view = work_out.as_ref().expect("sequence output present");
                for b in 0..batch_size {
                    let len = (seq_lens[b].max(0) as usize).min(seq_length);
                    if len > 0 {
                        final_hidden
                            .row_mut(b)
                            .assign(&out_view.slice(s![len - 1, b, ..]));
                    }
                }
            }
            drop(work_out);

            // Put the reversed output back into caller order, so that the
            // output step index matches the input step index.
            if reverse {
                let src = outputs_reverse
                    .as_ref()
                    .expect("reverse buffers allocated")
                    .view();
                let dst = output.as_mut().expect("sequence output present");
                reverse_sequence(src, dst.view_mut(), seq_lens);
            }
        }

        Ok(())
    }
}

impl Drop for UniDirectionalLstm<'_> {
    fn drop(&mut self) {
        let pool = self.pool;
        let recycle =
            |arr: &mut Array2<f32>| pool.add(std::mem::replace(arr, Array2::zeros((0, 0))).into_raw_vec());
        recycle(&mut self.weights_ifoc);
        recycle(&mut self.recurrent_weights_ifoc);
        recycle(&mut self.batched_hidden0);
        recycle(&mut self.internal_memory_prev);
        recycle(&mut self.internal_memory_clipped);

        pool.add(
            std::mem::replace(&mut self.output_ifog, Array3::zeros((0, 0, 0))).into_raw_vec(),
        );
        if let Some(buf) = self.inputs_reverse.take() {
            pool.add(buf.into_raw_vec());
        }
        if let Some(buf) = self.outputs_reverse.take() {
            pool.add(buf.into_raw_vec());
        }
        if let Some(bias) = self.bias_wr.take() {
            pool.add(bias.i);
            pool.add(bias.f);
            pool.add(bias.o);
            pool.add(bias.c);
        }
    }
}

/// Re-pack one direction's `[4 * hidden, in_dim]` weight slab into the fused
/// `[in_dim, 4 * hidden]` layout.
///
/// The source gate order along the first axis is `[i, o, f, c]`; the fused
/// order along the output columns is `[i, f, o, c]`. Each gate block is
/// transposed so that a single row-major matmul against activations computes
/// all four gates at once.
fn load_weights_with_transpose(
    src: ArrayView2<f32>,
    dst: &mut Array2<f32>,
    hidden_size: usize,
) {
    // (gate slot in the fused columns, gate block in the source rows)
    const GATE_MAP: [(usize, usize); 4] = [(0, 0), (1, 2), (2, 1), (3, 3)];

    let in_dim = dst.nrows();
    debug_assert_eq!(src.dim(), (4 * hidden_size, in_dim));

    for row in 0..in_dim {
        for (gate_out, gate_in) in GATE_MAP {
            for k in 0..hidden_size {
                dst[[row, gate_out * hidden_size + k]] =
                    src[[gate_in * hidden_size + k, row]];
            }
        }
    }
}

/// Fuse the `[8 * hidden]` bias input into four per-gate vectors by summing
/// the input and recurrent halves. The source gate order is `[i, o, f, c]`.
fn load_bias(pool: &BufferPool, bias: &[f32], hidden_size: usize) -> FusedBias {
    debug_assert_eq!(bias.len(), 8 * hidden_size);

    let fuse = |gate: usize| {
        let mut out = pool.alloc_zeroed(hidden_size);
        for k in 0..hidden_size {
            out[k] = bias[gate * hidden_size + k] + bias[(4 + gate) * hidden_size + k];
        }
        out
    };

    FusedBias {
        i: fuse(0),
        o: fuse(1),
        f: fuse(2),
        c: fuse(3),
    }
}

/// Alias the three `[hidden]` slices of the `[3 * hidden]` peephole input,
/// in source order `[P_i, P_o, P_f]`.
fn bind_peepholes(p: &[f32], hidden_size: usize) -> Peepholes<'_> {
    debug_assert_eq!(p.len(), 3 * hidden_size);
    Peepholes {
        i: &p[..hidden_size],
        o: &p[hidden_size..2 * hidden_size],
        f: &p[2 * hidden_size..],
    }
}

/// Apply the element-wise gate computations for one step over a block of
/// batch rows.
///
/// `ifog` holds the `[rows, 4 * hidden]` fused pre-activations for this
/// step, `c_prev` the cell state which is updated in place, and
/// `batched_output` receives the hidden output. Rows whose sequence has
/// already ended are skipped; their output is zeroed when a sequence is
/// being emitted and their cell state is left untouched.
#[allow(clippy::too_many_arguments)]
fn gate_computations(
    params: &GateParams,
    step: usize,
    lens: &[i32],
    mut ifog: ArrayViewMut2<f32>,
    mut c_prev: ArrayViewMut2<f32>,
    mut c_clipped: ArrayViewMut2<f32>,
    mut batched_output: ArrayViewMut2<f32>,
    output_sequence: bool,
) {
    let hidden = params.hidden_size;
    let clip_with_bias = params.clip_with_bias;
    let act_f = params.activation_f;
    let act_g = params.activation_g;
    let act_h = params.activation_h;

    for b in 0..ifog.nrows() {
        if step >= params.min_sequence_length && step >= lens[b].max(0) as usize {
            if output_sequence {
                batched_output.row_mut(b).fill(0.);
            }
            continue;
        }

        let mut ifog_row = ifog.row_mut(b);
        let ifog_row = ifog_row.as_slice_mut().expect("gate rows are contiguous");
        let (pi, rest) = ifog_row.split_at_mut(hidden);
        let (pf, rest) = rest.split_at_mut(hidden);
        let (po, pc) = rest.split_at_mut(hidden);

        let mut c_prev_row = c_prev.row_mut(b);
        let c_prev_row = c_prev_row.as_slice_mut().expect("cell rows are contiguous");

        // Input gate.
        if let Some(p) = params.peepholes {
            elementwise_product(c_prev_row, p.i, pi);
        }
        clip_with_bias(params.clip, params.bias.map(|bias| &bias.i[..]), pi);
        (act_f.func)(pi, act_f.alpha, act_f.beta);

        // Forget gate, coupled to the input gate when requested.
        if params.input_forget {
            for k in 0..hidden {
                pf[k] = 1. - pi[k];
            }
        } else {
            if let Some(p) = params.peepholes {
                elementwise_product(c_prev_row, p.f, pf);
            }
            clip_with_bias(params.clip, params.bias.map(|bias| &bias.f[..]), pf);
            (act_f.func)(pf, act_f.alpha, act_f.beta);
        }

        // Cell candidate.
        clip_with_bias(params.clip, params.bias.map(|bias| &bias.c[..]), pc);
        (act_g.func)(pc, act_g.alpha, act_g.beta);

        // Merge into memory; `c_prev_row` now holds the current cell value.
        merge_lstm_gates_to_memory(c_prev_row, pi, pf, pc);

        // Output gate. The peephole reads the freshly merged cell state.
        if let Some(p) = params.peepholes {
            elementwise_product(c_prev_row, p.o, po);
        }
        clip_with_bias(params.clip, params.bias.map(|bias| &bias.o[..]), po);
        (act_f.func)(po, act_f.alpha, act_f.beta);

        // Hidden output.
        let mut out_row = batched_output.row_mut(b);
        let out_row = out_row.as_slice_mut().expect("output rows are contiguous");
        let mut clipped_row = c_clipped.row_mut(b);
        let clipped_row = clipped_row
            .as_slice_mut()
            .expect("scratch rows are contiguous");
        (act_h.func)(c_prev_row, clipped_row, po, out_row, act_h.alpha, act_h.beta);
    }
}
