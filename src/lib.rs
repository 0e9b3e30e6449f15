//! CPU implementation of the ONNX `LSTM` recurrent operator.
//!
//! The crate provides the [`Lstm`] operator (forward, reverse and
//! bidirectional, with per-batch variable sequence lengths, peepholes, cell
//! clipping and coupled input/forget gates) plus the [`UniDirectionalLstm`]
//! engine it is built on. Scratch buffers come from a [`BufferPool`] and
//! parallel work runs on a caller-supplied Rayon pool (see [`thread_pool`]).

pub mod activations;
pub mod buffer_pool;
mod error;
pub mod gemm;
pub mod kernels;
pub mod rnn;
pub mod sequence;
pub mod threading;

pub use activations::ActivationDesc;
pub use buffer_pool::BufferPool;
pub use error::OpError;
pub use rnn::{Direction, Lstm, LstmElement, LstmInputs, LstmOutputs, UniDirectionalLstm};
pub use threading::{thread_pool, ThreadPlan};

#[cfg(test)]
mod test_util;
