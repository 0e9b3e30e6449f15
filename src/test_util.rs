use ndarray::{Array, ArrayView, Dimension, ShapeBuilder};

/// Deterministic xorshift generator for test tensors.
///
/// Seeded per test so failures reproduce. Not a statistical RNG; it only has
/// to spread values across the gates.
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> XorShiftRng {
        XorShiftRng { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut tmp = self.state;
        tmp ^= tmp << 13;
        tmp ^= tmp >> 7;
        tmp ^= tmp << 17;
        self.state = tmp;
        tmp
    }

    /// Return a random value in `[-0.5, 0.5]`.
    ///
    /// Centered values keep weights and gate pre-activations in the region
    /// where sigmoid and tanh still have slope, so reference comparisons
    /// stay sensitive to indexing mistakes instead of saturating to 0/1.
    pub fn next_centered_f32(&mut self) -> f32 {
        const N_BITS: u32 = 40;
        let unit = (self.next_u64() >> (64 - N_BITS)) as f32 / (1u64 << N_BITS) as f32;
        unit - 0.5
    }
}

/// Build an array of the given shape filled with values from `rng`.
pub fn rand_array<Sh, D>(shape: Sh, rng: &mut XorShiftRng) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    Array::from_shape_fn(shape, |_| rng.next_centered_f32())
}

/// Check that the shapes of two arrays are equal and that their contents
/// are equal within an absolute tolerance.
pub fn expect_equal<D: Dimension>(
    x: ArrayView<f32, D>,
    y: ArrayView<f32, D>,
    epsilon: f32,
) -> Result<(), String> {
    if x.shape() != y.shape() {
        return Err(format!(
            "Arrays have different shapes. {:?} vs. {:?}",
            x.shape(),
            y.shape()
        ));
    }

    for (i, (xi, yi)) in x.iter().zip(y.iter()).enumerate() {
        if (xi - yi).abs() > epsilon {
            return Err(format!("Values differ at index {}: {} vs {}", i, xi, yi));
        }
    }

    Ok(())
}
