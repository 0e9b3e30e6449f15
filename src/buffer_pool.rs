use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ndarray::{Array, Dimension, IntoDimension};

/// A pool which enables reuse of scratch buffers across operator invocations.
///
/// The purpose of this pool is to minimize the overhead from allocating and
/// de-allocating large buffers repeatedly during inference. Allocation
/// requests are satisfied from the pool if a suitable buffer is available and
/// the requested capacity exceeds a threshold, otherwise the global allocator
/// is used.
///
/// The pool assumes that it will be managing a relatively small number of
/// buffers at any given time, and isn't optimized for managing a large number
/// of buffers.
pub struct BufferPool {
    /// Buffers currently available for reuse.
    buffers: Mutex<Vec<Vec<f32>>>,

    /// Number of allocation requests received.
    alloc_count: AtomicUsize,

    /// Number of allocation requests fulfilled from the pool.
    hit_count: AtomicUsize,

    /// Minimum size, in bytes, of buffers to store in the pool.
    ///
    /// For small buffers it is more efficient to use the system allocator.
    min_size: usize,
}

impl BufferPool {
    /// Return a new, empty pool.
    ///
    /// This is a cheap operation that does not allocate, so it can be used
    /// to create a temporary pool to pass to a function that requires one,
    /// if the caller does not have a pool otherwise available.
    pub fn new() -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            alloc_count: AtomicUsize::new(0),
            hit_count: AtomicUsize::new(0),
            min_size: 128,
        }
    }

    /// Configure the minimum size for allocations from the pool.
    ///
    /// Allocations below this size will fall back to the global allocator.
    pub fn with_min_size(mut self, n_bytes: usize) -> Self {
        self.min_size = n_bytes;
        self
    }

    /// Allocate an empty vec with a given capacity from the pool.
    ///
    /// The returned buffer will have a capacity of at least the requested
    /// size, but _may have more_.
    pub fn alloc(&self, capacity: usize) -> Vec<f32> {
        // Skip the pool for small buffers.
        if capacity * std::mem::size_of::<f32>() < self.min_size {
            return Vec::with_capacity(capacity);
        }

        self.alloc_count.fetch_add(1, Ordering::AcqRel);

        let mut buffers = self.buffers.lock().unwrap();

        // Find the best-fit item, ie. the one which matches the requested
        // size with the least excess capacity.
        let best_fit = buffers
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= capacity)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(idx, _)| idx);

        if let Some(best_fit) = best_fit {
            self.hit_count.fetch_add(1, Ordering::AcqRel);
            return buffers.remove(best_fit);
        }

        // No suitable buffer was found. Fall back to the global allocator,
        // but release the mutex before we do.
        std::mem::drop(buffers);

        Vec::with_capacity(capacity)
    }

    /// Allocate a buffer of exactly `len` elements, filled with zeros.
    pub fn alloc_zeroed(&self, len: usize) -> Vec<f32> {
        let mut buf = self.alloc(len);
        buf.resize(len, 0.);
        buf
    }

    /// Add a data buffer to the pool.
    ///
    /// The buffer is cleared and then made available to fulfill future
    /// allocation requests.
    pub fn add(&self, mut buf: Vec<f32>) {
        buf.clear();
        if buf.capacity() * std::mem::size_of::<f32>() >= self.min_size {
            self.buffers.lock().unwrap().push(buf);
        }
    }

    /// Return the total number of allocation requests.
    ///
    /// This excludes allocations below the minimum size threshold.
    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Acquire)
    }

    /// Return the number of allocation requests that were fulfilled using
    /// items in the pool.
    pub fn hit_count(&self) -> usize {
        self.hit_count.load(Ordering::Acquire)
    }

    /// Return the number of buffers currently available for reuse.
    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}

/// Allocate a zero-filled array whose storage comes from the pool.
pub fn zeros_in<Sh, D>(pool: &BufferPool, shape: Sh) -> Array<f32, D>
where
    Sh: IntoDimension<Dim = D>,
    D: Dimension,
{
    let dim = shape.into_dimension();
    let data = pool.alloc_zeroed(dim.size());
    Array::from_shape_vec(dim, data).expect("pool buffer length matches shape")
}
