//! Recurrent operators.

use ndarray::{Array3, Array4, ArrayView1, ArrayView2, ArrayView3, Axis};
use rayon::ThreadPool;

use crate::activations::{
    resolve_activation, resolve_merge, ActivationDesc, ActivationInfo, MergeInfo,
};
use crate::buffer_pool::{zeros_in, BufferPool};
use crate::error::OpError;
use crate::threading::ThreadPlan;

mod uni;

pub use uni::UniDirectionalLstm;

/// Direction that an RNN operator will traverse the input sequence in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
    Bidirectional,
}

impl Direction {
    /// Number of directions that an RNN operator will traverse the sequence
    /// in.
    pub fn num_directions(self) -> usize {
        match self {
            Self::Forward | Self::Reverse => 1,
            Self::Bidirectional => 2,
        }
    }
}

/// Long Short-Term Memory operator.
///
/// Computes a one-layer LSTM over a packed (possibly padded) input sequence,
/// following the ONNX operator semantics. See [`Lstm::compute`].
#[derive(Clone, Debug)]
pub struct Lstm {
    pub direction: Direction,
    pub hidden_size: usize,

    /// Activation functions, 3 entries per direction in `(f, g, h)` order.
    /// An empty list selects the default `(Sigmoid, Tanh, Tanh)`.
    pub activations: Vec<ActivationDesc>,

    /// Cell clip threshold applied to gate pre-activations. `None` or a
    /// non-positive value disables clipping.
    pub clip: Option<f32>,

    /// Couple the input and forget gates (`f_t = 1 - i_t`).
    pub input_forget: bool,

    /// Whether to produce the per-step hidden sequence output `Y`. The final
    /// hidden and cell states are always produced.
    pub output_sequence: bool,

    /// Override the shape-based threading heuristic. Mostly useful for
    /// pinning thread counts in tests.
    pub thread_plan: Option<ThreadPlan>,
}

impl Lstm {
    pub fn new(direction: Direction, hidden_size: usize) -> Lstm {
        Lstm {
            direction,
            hidden_size,
            activations: Vec::new(),
            clip: None,
            input_forget: false,
            output_sequence: true,
            thread_plan: None,
        }
    }
}

/// Inputs for one LSTM invocation.
///
/// Shapes follow the ONNX operator: `input` is `[seq, batch, input]`,
/// `weights` is `[dirs, 4 * hidden, input]` and `recurrent_weights` is
/// `[dirs, 4 * hidden, hidden]`, both with gates concatenated in
/// `[i, o, f, c]` order. `bias` is `[dirs, 8 * hidden]` holding `Wb[iofc]`
/// then `Rb[iofc]`. `peepholes` is `[dirs, 3 * hidden]` holding
/// `P[i, o, f]`. `initial_h` and `initial_c` are `[dirs, batch, hidden]` and
/// default to zero. `sequence_lens` is `[batch]` with values in
/// `[0, seq]`, defaulting to full-length rows.
pub struct LstmInputs<'a, T = f32> {
    pub input: ArrayView3<'a, T>,
    pub weights: ArrayView3<'a, T>,
    pub recurrent_weights: ArrayView3<'a, T>,
    pub bias: Option<ArrayView2<'a, T>>,
    pub sequence_lens: Option<ArrayView1<'a, i32>>,
    pub initial_h: Option<ArrayView3<'a, T>>,
    pub initial_c: Option<ArrayView3<'a, T>>,
    pub peepholes: Option<ArrayView2<'a, T>>,
}

impl<'a, T> LstmInputs<'a, T> {
    pub fn new(
        input: ArrayView3<'a, T>,
        weights: ArrayView3<'a, T>,
        recurrent_weights: ArrayView3<'a, T>,
    ) -> LstmInputs<'a, T> {
        LstmInputs {
            input,
            weights,
            recurrent_weights,
            bias: None,
            sequence_lens: None,
            initial_h: None,
            initial_c: None,
            peepholes: None,
        }
    }
}

/// Outputs of one LSTM invocation.
#[derive(Debug)]
pub struct LstmOutputs<T = f32> {
    /// Per-step hidden outputs, `[seq, dirs, batch, hidden]`. `None` when the
    /// operator was configured without a sequence output.
    pub output: Option<Array4<T>>,
    /// Final hidden state, `[dirs, batch, hidden]`.
    pub hidden_state: Array3<T>,
    /// Final cell state, `[dirs, batch, hidden]`.
    pub cell_state: Array3<T>,
}

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Element types the LSTM operator can be invoked with.
///
/// The interface is generic over the element type, but only `f32` has a
/// kernel; `f64` fails with [`OpError::NotImplemented`].
pub trait LstmElement: private::Sealed + Sized {
    #[doc(hidden)]
    fn lstm(
        op: &Lstm,
        pool: &BufferPool,
        threads: &ThreadPool,
        inputs: &LstmInputs<'_, Self>,
    ) -> Result<LstmOutputs<Self>, OpError>;
}

impl LstmElement for f32 {
    fn lstm(
        op: &Lstm,
        pool: &BufferPool,
        threads: &ThreadPool,
        inputs: &LstmInputs<'_, f32>,
    ) -> Result<LstmOutputs<f32>, OpError> {
        lstm_f32(op, pool, threads, inputs)
    }
}

impl LstmElement for f64 {
    fn lstm(
        _op: &Lstm,
        _pool: &BufferPool,
        _threads: &ThreadPool,
        _inputs: &LstmInputs<'_, f64>,
    ) -> Result<LstmOutputs<f64>, OpError> {
        Err(OpError::NotImplemented(
            "LSTM operator does not support double yet",
        ))
    }
}

impl Lstm {
    /// Run the operator over one set of inputs.
    ///
    /// Scratch space is allocated from `pool`, and parallel work is submitted
    /// to `threads` (see [`crate::threading::thread_pool`] for a shared
    /// default). On any error no outputs are produced.
    pub fn compute<T: LstmElement>(
        &self,
        pool: &BufferPool,
        threads: &ThreadPool,
        inputs: &LstmInputs<'_, T>,
    ) -> Result<LstmOutputs<T>, OpError> {
        T::lstm(self, pool, threads, inputs)
    }
}

/// Validate input shapes against the operator attributes, returning the
/// `(seq_length, batch_size, input_size)` taken from `input`.
fn validate_inputs(op: &Lstm, inputs: &LstmInputs<f32>) -> Result<(usize, usize, usize), OpError> {
    let num_directions = op.direction.num_directions();
    let hidden_size = op.hidden_size;
    let (seq_length, batch_size, input_size) = inputs.input.dim();

    let weights_shape = [num_directions, 4 * hidden_size, input_size];
    if inputs.weights.shape() != weights_shape {
        return Err(OpError::InvalidArgument(format!(
            "input W must have shape {:?}, actual {:?}",
            weights_shape,
            inputs.weights.shape()
        )));
    }

    let recurrent_shape = [num_directions, 4 * hidden_size, hidden_size];
    if inputs.recurrent_weights.shape() != recurrent_shape {
        return Err(OpError::InvalidArgument(format!(
            "input R must have shape {:?}, actual {:?}",
            recurrent_shape,
            inputs.recurrent_weights.shape()
        )));
    }

    if let Some(bias) = inputs.bias.as_ref() {
        let bias_shape = [num_directions, 8 * hidden_size];
        if bias.shape() != bias_shape {
            return Err(OpError::InvalidArgument(format!(
                "input B must have shape {:?}, actual {:?}",
                bias_shape,
                bias.shape()
            )));
        }
    }

    if let Some(seq_lens) = inputs.sequence_lens.as_ref() {
        if seq_lens.len() != batch_size {
            return Err(OpError::InvalidArgument(format!(
                "input sequence_lens must have shape [{}], actual {:?}",
                batch_size,
                seq_lens.shape()
            )));
        }
        if let Some(&bad) = seq_lens
            .iter()
            .find(|&&len| len < 0 || len as usize > seq_length)
        {
            return Err(OpError::InvalidArgument(format!(
                "sequence_lens value {} is outside [0, {}]",
                bad, seq_length
            )));
        }
    }

    let state_shape = [num_directions, batch_size, hidden_size];
    if let Some(initial_h) = inputs.initial_h.as_ref() {
        if initial_h.shape() != state_shape {
            return Err(OpError::InvalidArgument(format!(
                "input initial_h must have shape {:?}, actual {:?}",
                state_shape,
                initial_h.shape()
            )));
        }
    }
    if let Some(initial_c) = inputs.initial_c.as_ref() {
        if initial_c.shape() != state_shape {
            return Err(OpError::InvalidArgument(format!(
                "input initial_c must have shape {:?}, actual {:?}",
                state_shape,
                initial_c.shape()
            )));
        }
    }

    if let Some(peepholes) = inputs.peepholes.as_ref() {
        let peephole_shape = [num_directions, 3 * hidden_size];
        if peepholes.shape() != peephole_shape {
            return Err(OpError::InvalidArgument(format!(
                "input P must have shape {:?}, actual {:?}",
                peephole_shape,
                peepholes.shape()
            )));
        }
    }

    Ok((seq_length, batch_size, input_size))
}

/// Resolve the operator's activation attribute into one `(f, g, h)` triple
/// per direction.
fn resolved_activations(
    op: &Lstm,
    num_directions: usize,
) -> Result<Vec<(ActivationInfo, ActivationInfo, MergeInfo)>, OpError> {
    let default_descs;
    let descs: &[ActivationDesc] = if op.activations.is_empty() {
        default_descs = ["Sigmoid", "Tanh", "Tanh"]
            .iter()
            .cycle()
            .take(3 * num_directions)
            .map(|name| ActivationDesc::new(name))
            .collect::<Vec<_>>();
        &default_descs
    } else {
        &op.activations
    };

    if descs.len() != 3 * num_directions {
        return Err(OpError::InvalidArgument(format!(
            "activations must list {} entries, actual {}",
            3 * num_directions,
            descs.len()
        )));
    }

    descs
        .chunks(3)
        .map(|fgh| {
            Ok((
                resolve_activation(&fgh[0])?,
                resolve_activation(&fgh[1])?,
                resolve_merge(&fgh[2])?,
            ))
        })
        .collect()
}

fn lstm_f32(
    op: &Lstm,
    pool: &BufferPool,
    threads: &ThreadPool,
    inputs: &LstmInputs<'_, f32>,
) -> Result<LstmOutputs<f32>, OpError> {
    let num_directions = op.direction.num_directions();
    let hidden_size = op.hidden_size;

    let (seq_length, batch_size, input_size) = validate_inputs(op, inputs)?;
    let activations = resolved_activations(op, num_directions)?;
    let clip = op.clip.unwrap_or(0.);

    let plan = op
        .thread_plan
        .unwrap_or_else(|| ThreadPlan::for_shape(batch_size, hidden_size, num_cpus::get()));

    let mut output: Option<Array4<f32>> = op
        .output_sequence
        .then(|| zeros_in(pool, (seq_length, num_directions, batch_size, hidden_size)));
    let mut hidden_state: Array3<f32> =
        zeros_in(pool, (num_directions, batch_size, hidden_size));
    let mut cell_state: Array3<f32> = zeros_in(pool, (num_directions, batch_size, hidden_size));

    if seq_length == 0 || batch_size == 0 {
        return Ok(LstmOutputs {
            output,
            hidden_state,
            cell_state,
        });
    }

    // Inputs the engine reads as flat rows must be contiguous.
    let input = inputs.input.as_standard_layout();
    let bias = inputs.bias.map(|b| b.as_standard_layout().into_owned());
    let peepholes = inputs.peepholes.map(|p| p.as_standard_layout().into_owned());
    let sequence_lens: Option<Vec<i32>> = inputs
        .sequence_lens
        .map(|lens| lens.iter().copied().collect());

    for dir_index in 0..num_directions {
        let dir = match (op.direction, dir_index) {
            (Direction::Reverse, _) => Direction::Reverse,
            (Direction::Bidirectional, 1) => Direction::Reverse,
            _ => Direction::Forward,
        };
        log::debug!("LSTM direction {} ({:?})", dir_index, dir);

        let weights = inputs.weights.index_axis(Axis(0), dir_index);
        let recurrent_weights = inputs.recurrent_weights.index_axis(Axis(0), dir_index);
        let bias_dir = bias.as_ref().map(|b| {
            b.index_axis(Axis(0), dir_index)
                .to_slice()
                .expect("bias rows are contiguous")
        });
        let peephole = peepholes.as_ref().map(|p| {
            p.index_axis(Axis(0), dir_index)
                .to_slice()
                .expect("peephole rows are contiguous")
        });
        let initial_h = inputs
            .initial_h
            .map(|h| h.index_axis_move(Axis(0), dir_index));
        let initial_c = inputs
            .initial_c
            .map(|c| c.index_axis_move(Axis(0), dir_index));
        let (activation_f, activation_g, activation_h) = activations[dir_index];

        let mut engine = UniDirectionalLstm::new(
            pool,
            threads,
            seq_length,
            batch_size,
            input_size,
            hidden_size,
            dir,
            op.input_forget,
            weights,
            recurrent_weights,
            bias_dir,
            peephole,
            initial_h,
            initial_c,
            activation_f,
            activation_g,
            activation_h,
            clip,
            plan,
        );

        let output_slot = output
            .as_mut()
            .map(|out| out.index_axis_mut(Axis(1), dir_index));
        engine.compute(
            input.view(),
            sequence_lens.as_deref(),
            output_slot,
            hidden_state.index_axis_mut(Axis(0), dir_index),
            cell_state.index_axis_mut(Axis(0), dir_index),
        )?;
    }

    Ok(LstmOutputs {
        output,
        hidden_state,
        cell_state,
    })
}
