//! Element-wise kernels used by the LSTM gate computations.

/// Pointer type for the clip-and-bias preparation applied to each gate's
/// pre-activation. The engine picks [`clip_add_bias`] or [`clip_ignore_bias`]
/// once, depending on whether a bias input was supplied.
pub type ClipWithBiasFn = fn(f32, Option<&[f32]>, &mut [f32]);

/// Compute `dst += a ⊙ b`.
///
/// The accumulating form lets peephole contributions be added on top of the
/// matmul output already in the gate buffer.
pub fn elementwise_product(a: &[f32], b: &[f32], dst: &mut [f32]) {
    for ((dst, &a), &b) in dst.iter_mut().zip(a).zip(b) {
        *dst += a * b;
    }
}

/// Clamp `x` to `[-clip, clip]` (skipped when `clip <= 0`), then add `bias`.
pub fn clip_add_bias(clip: f32, bias: Option<&[f32]>, x: &mut [f32]) {
    let bias = bias.unwrap_or(&[]);
    if clip > 0. {
        for (x, &b) in x.iter_mut().zip(bias) {
            *x = x.clamp(-clip, clip) + b;
        }
    } else {
        for (x, &b) in x.iter_mut().zip(bias) {
            *x += b;
        }
    }
}

/// Clamp `x` to `[-clip, clip]` (skipped when `clip <= 0`), ignoring `bias`.
pub fn clip_ignore_bias(clip: f32, _bias: Option<&[f32]>, x: &mut [f32]) {
    if clip > 0. {
        for x in x.iter_mut() {
            *x = x.clamp(-clip, clip);
        }
    }
}

/// Merge the activated gates into the cell state:
/// `c_prev = f ⊙ c_prev + i ⊙ c_bar`.
///
/// The previous cell value is consumed and overwritten in place, so after the
/// call `c_prev` holds the current cell state.
pub fn merge_lstm_gates_to_memory(c_prev: &mut [f32], i: &[f32], f: &[f32], c_bar: &[f32]) {
    for (((c, &i), &f), &g) in c_prev.iter_mut().zip(i).zip(f).zip(c_bar) {
        *c = f * *c + i * g;
    }
}
