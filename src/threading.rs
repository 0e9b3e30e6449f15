use std::any::Any;
use std::env;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::OpError;

/// Return the shared [Rayon][rayon] thread pool which is used to execute
/// LSTM workloads.
///
/// This differs from Rayon's default global thread pool in that it is tuned
/// for CPU rather than IO-bound work by choosing a thread count based on the
/// number of physical rather than logical cores.
///
/// The thread count can be overridden at the process level by setting the
/// `DEEP_LSTM_NUM_THREADS` environment variable, whose value must be a number
/// between 1 and the logical core count.
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical();

        let num_threads = if let Some(threads_var) = env::var_os("DEEP_LSTM_NUM_THREADS") {
            let requested_threads: Result<usize, _> = threads_var.to_string_lossy().parse();
            match requested_threads {
                Ok(n_threads) => n_threads.clamp(1, num_cpus::get()),
                Err(_) => physical_cpus,
            }
        } else {
            physical_cpus
        };

        ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("deep-lstm-{}", index))
            .build()
            .expect("failed to initialize thread pool")
    })
}

pub fn div_ceil(a: usize, b: usize) -> usize {
    if b == 1 {
        // Fast path
        return a;
    }
    let rounding = usize::from(a % b != 0);
    a / b + rounding
}

/// How an LSTM invocation distributes work across the thread pool.
///
/// `input_threads` stripes the whole-sequence input matmul by rows. The
/// per-step recurrent matmul either stripes batch rows (`batch_parallel`,
/// with the gate kernel run inside the same stripe) or splits the fused
/// gate columns across `hidden_threads` with a sequential gate kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadPlan {
    pub input_threads: usize,
    pub hidden_threads: usize,
    pub batch_parallel: bool,
}

impl ThreadPlan {
    /// Choose thread counts for a given problem shape.
    ///
    /// The numbers come from profiling runs on a mix of 4-core and 24-core
    /// Xeons: the input matmul stops scaling past ~24 threads (16 for small
    /// hidden sizes), and the per-step recurrent matmul is batch-parallel
    /// whenever the batch is large enough to stripe, otherwise
    /// column-parallel with a cap that grows with the hidden size.
    pub fn for_shape(batch_size: usize, hidden_size: usize, hw_threads: usize) -> ThreadPlan {
        let threads = hw_threads.saturating_sub(1).max(1);

        let mut input_threads = threads.min(24);
        if input_threads > 16 && hidden_size <= 256 {
            input_threads = 16;
        }

        let (batch_parallel, hidden_threads) =
            if batch_size > 4 || (batch_size >= 2 && hidden_size <= 256) {
                (true, threads)
            } else {
                let cap = if hidden_size <= 128 {
                    2
                } else if hidden_size <= 256 {
                    5
                } else if hidden_size <= 512 {
                    7
                } else if hidden_size <= 1024 {
                    11
                } else {
                    threads
                };
                (false, threads.min(cap))
            };

        log::debug!(
            "thread plan: input={} hidden={} batch_parallel={}",
            input_threads,
            hidden_threads,
            batch_parallel
        );

        ThreadPlan {
            input_threads,
            hidden_threads,
            batch_parallel,
        }
    }

    pub fn single_threaded() -> ThreadPlan {
        ThreadPlan {
            input_threads: 1,
            hidden_threads: 1,
            batch_parallel: false,
        }
    }
}

/// Run `task` over each item of `items` on the worker pool, returning once
/// every task has finished.
///
/// Items are expected to address disjoint output regions, so no ordering is
/// guaranteed between them. A panic in any task is converted into an
/// [`OpError::Internal`] at the join.
pub(crate) fn parallel_for<I, F>(pool: &ThreadPool, items: Vec<I>, task: F) -> Result<(), OpError>
where
    I: Send,
    F: Fn(I) + Send + Sync,
{
    catch_unwind(AssertUnwindSafe(|| {
        if items.len() <= 1 {
            for item in items {
                task(item);
            }
        } else {
            pool.install(|| items.into_par_iter().for_each(|item| task(item)));
        }
    }))
    .map_err(|payload| OpError::Internal(panic_message(payload)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker task panicked".to_string()
    }
}
