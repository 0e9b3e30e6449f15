//! Reversal of padded, variable-length sequences along the time axis.

use ndarray::{s, ArrayView3, ArrayViewMut3};

/// Reverse `src` along the time axis into `dst`, honoring per-batch sequence
/// lengths.
///
/// Both arrays have shape `[seq_length, batch, features]`, though either may
/// be strided (the bidirectional output writes through an interleaved
/// per-direction view). For each batch row `r`, step `t < seq_lens[r]` of
/// `src` is copied to step `seq_lens[r] - 1 - t` of `dst` and the remaining
/// steps of `dst` are zeroed.
pub fn reverse_sequence(src: ArrayView3<f32>, mut dst: ArrayViewMut3<f32>, seq_lens: &[i32]) {
    let (seq_length, batch, _features) = src.dim();
    assert_eq!(src.dim(), dst.dim(), "source and destination shapes differ");
    assert_eq!(seq_lens.len(), batch, "sequence length per batch row");

    for r in 0..batch {
        let len = (seq_lens[r].max(0) as usize).min(seq_length);
        for t in 0..len {
            dst.slice_mut(s![len - 1 - t, r, ..])
                .assign(&src.slice(s![t, r, ..]));
        }
        for t in len..seq_length {
            dst.slice_mut(s![t, r, ..]).fill(0.);
        }
    }
}
