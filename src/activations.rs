//! Registry of activation functions for the recurrent gate kernels.
//!
//! Gate activations (`f` and `g` in the ONNX LSTM equations) are element-wise
//! transforms applied in place to a gate's pre-activation. The hidden
//! activation (`h`) is fused with the output projection: it stages the
//! current cell value in a scratch buffer and writes
//! `out = gate ⊙ h(scratch)` in a single pass.

use crate::error::OpError;

/// Element-wise activation applied in place: `f(x, alpha, beta)`.
pub type ActivationFn = fn(&mut [f32], f32, f32);

/// Fused hidden activation and output projection.
///
/// Arguments are `(cell, scratch, gate, out, alpha, beta)`: the current cell
/// value is copied into `scratch` and `out[k] = gate[k] * h(scratch[k])`.
pub type LstmMergeFn = fn(&[f32], &mut [f32], &[f32], &mut [f32], f32, f32);

/// An activation requested by name, with optional scaling values.
///
/// `alpha` and `beta` default to per-function values when unset (for example
/// `LeakyRelu` defaults to `alpha = 0.01`).
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationDesc {
    pub name: String,
    pub alpha: Option<f32>,
    pub beta: Option<f32>,
}

impl ActivationDesc {
    pub fn new(name: &str) -> ActivationDesc {
        ActivationDesc {
            name: name.to_string(),
            alpha: None,
            beta: None,
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = Some(alpha);
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = Some(beta);
        self
    }
}

/// A resolved gate activation.
#[derive(Clone, Copy, Debug)]
pub struct ActivationInfo {
    pub func: ActivationFn,
    pub alpha: f32,
    pub beta: f32,
}

/// A resolved hidden activation.
#[derive(Clone, Copy)]
pub struct MergeInfo {
    pub func: LstmMergeFn,
    pub alpha: f32,
    pub beta: f32,
}

macro_rules! activation_fn {
    ($name:ident, $x:ident, $alpha:ident, $beta:ident, $expr:expr) => {
        fn $name(data: &mut [f32], $alpha: f32, $beta: f32) {
            for v in data.iter_mut() {
                let $x = *v;
                *v = $expr;
            }
        }
    };
}

activation_fn!(sigmoid, x, _alpha, _beta, 1. / (1. + (-x).exp()));
activation_fn!(tanh, x, _alpha, _beta, x.tanh());
activation_fn!(relu, x, _alpha, _beta, x.max(0.));
activation_fn!(affine, x, alpha, beta, alpha * x + beta);
activation_fn!(leaky_relu, x, alpha, _beta, if x >= 0. { x } else { alpha * x });
activation_fn!(thresholded_relu, x, alpha, _beta, if x >= alpha { x } else { 0. });
activation_fn!(scaled_tanh, x, alpha, beta, alpha * (beta * x).tanh());
activation_fn!(hard_sigmoid, x, alpha, beta, (alpha * x + beta).clamp(0., 1.));
activation_fn!(elu, x, alpha, _beta, if x >= 0. { x } else { alpha * (x.exp() - 1.) });
activation_fn!(softsign, x, _alpha, _beta, x / (1. + x.abs()));
activation_fn!(softplus, x, _alpha, _beta, (1. + x.exp()).ln());

macro_rules! merge_fn {
    ($name:ident, $x:ident, $alpha:ident, $beta:ident, $expr:expr) => {
        fn $name(
            cell: &[f32],
            scratch: &mut [f32],
            gate: &[f32],
            out: &mut [f32],
            $alpha: f32,
            $beta: f32,
        ) {
            for k in 0..out.len() {
                scratch[k] = cell[k];
                let $x = scratch[k];
                out[k] = gate[k] * $expr;
            }
        }
    };
}

merge_fn!(merge_sigmoid, x, _alpha, _beta, 1. / (1. + (-x).exp()));
merge_fn!(merge_tanh, x, _alpha, _beta, x.tanh());
merge_fn!(merge_relu, x, _alpha, _beta, x.max(0.));
merge_fn!(merge_affine, x, alpha, beta, alpha * x + beta);
merge_fn!(merge_leaky_relu, x, alpha, _beta, if x >= 0. { x } else { alpha * x });
merge_fn!(merge_thresholded_relu, x, alpha, _beta, if x >= alpha { x } else { 0. });
merge_fn!(merge_scaled_tanh, x, alpha, beta, alpha * (beta * x).tanh());
merge_fn!(merge_hard_sigmoid, x, alpha, beta, (alpha * x + beta).clamp(0., 1.));
merge_fn!(merge_elu, x, alpha, _beta, if x >= 0. { x } else { alpha * (x.exp() - 1.) });
merge_fn!(merge_softsign, x, _alpha, _beta, x / (1. + x.abs()));
merge_fn!(merge_softplus, x, _alpha, _beta, (1. + x.exp()).ln());

/// Look up a gate activation by its ONNX name, returning the function and
/// its default `(alpha, beta)` values.
fn activation_entry(name: &str) -> Option<(ActivationFn, f32, f32)> {
    let entry = match name {
        "Sigmoid" => (sigmoid as ActivationFn, 0., 0.),
        "Tanh" => (tanh as ActivationFn, 0., 0.),
        "Relu" => (relu as ActivationFn, 0., 0.),
        "Affine" => (affine as ActivationFn, 1., 0.),
        "LeakyRelu" => (leaky_relu as ActivationFn, 0.01, 0.),
        "ThresholdedRelu" => (thresholded_relu as ActivationFn, 1., 0.),
        "ScaledTanh" => (scaled_tanh as ActivationFn, 1., 1.),
        "HardSigmoid" => (hard_sigmoid as ActivationFn, 0.2, 0.5),
        "Elu" => (elu as ActivationFn, 1., 0.),
        "Softsign" => (softsign as ActivationFn, 0., 0.),
        "Softplus" => (softplus as ActivationFn, 0., 0.),
        _ => return None,
    };
    Some(entry)
}

fn merge_entry(name: &str) -> Option<(LstmMergeFn, f32, f32)> {
    let entry = match name {
        "Sigmoid" => (merge_sigmoid as LstmMergeFn, 0., 0.),
        "Tanh" => (merge_tanh as LstmMergeFn, 0., 0.),
        "Relu" => (merge_relu as LstmMergeFn, 0., 0.),
        "Affine" => (merge_affine as LstmMergeFn, 1., 0.),
        "LeakyRelu" => (merge_leaky_relu as LstmMergeFn, 0.01, 0.),
        "ThresholdedRelu" => (merge_thresholded_relu as LstmMergeFn, 1., 0.),
        "ScaledTanh" => (merge_scaled_tanh as LstmMergeFn, 1., 1.),
        "HardSigmoid" => (merge_hard_sigmoid as LstmMergeFn, 0.2, 0.5),
        "Elu" => (merge_elu as LstmMergeFn, 1., 0.),
        "Softsign" => (merge_softsign as LstmMergeFn, 0., 0.),
        "Softplus" => (merge_softplus as LstmMergeFn, 0., 0.),
        _ => return None,
    };
    Some(entry)
}

/// Resolve a gate activation (`f` or `g`) by name.
pub fn resolve_activation(desc: &ActivationDesc) -> Result<ActivationInfo, OpError> {
    let (func, default_alpha, default_beta) = activation_entry(&desc.name)
        .ok_or_else(|| OpError::InvalidArgument(format!("unknown activation {:?}", desc.name)))?;
    Ok(ActivationInfo {
        func,
        alpha: desc.alpha.unwrap_or(default_alpha),
        beta: desc.beta.unwrap_or(default_beta),
    })
}

/// Resolve the hidden activation (`h`) by name.
pub fn resolve_merge(desc: &ActivationDesc) -> Result<MergeInfo, OpError> {
    let (func, default_alpha, default_beta) = merge_entry(&desc.name)
        .ok_or_else(|| OpError::InvalidArgument(format!("unknown activation {:?}", desc.name)))?;
    Ok(MergeInfo {
        func,
        alpha: desc.alpha.unwrap_or(default_alpha),
        beta: desc.beta.unwrap_or(default_beta),
    })
}
