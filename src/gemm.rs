//! Seam over the matrix multiplication primitive used by the LSTM engine.
//!
//! The engine pre-transposes its fused weight layouts, so every call is a
//! plain row-major `C = alpha * A · B + beta * C` with no transposition.
//! Views may be strided, which the per-step drivers rely on to write
//! directly into column slabs of the fused gate buffer.

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

/// Compute `c = alpha * a · b + beta * c`.
///
/// Panics if the shapes of `a`, `b` and `c` are not compatible.
pub fn gemm(alpha: f32, a: ArrayView2<f32>, b: ArrayView2<f32>, beta: f32, mut c: ArrayViewMut2<f32>) {
    general_mat_mul(alpha, &a, &b, beta, &mut c);
}
