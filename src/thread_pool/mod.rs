//! Worker pools used for concurrent batch retrieval.
//!
//! Two implementations are provided: [`SharedQueueThreadPool`], a fixed set of threads pulling
//! jobs from a shared crossbeam channel, and [`RayonThreadPool`], a work stealing pool. Pools are
//! torn down explicitly with [`ThreadPool::shutdown`]; jobs spawned afterwards are rejected.
use crate::Result;

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;

/// A pool of worker threads.
pub trait ThreadPool: Send + Sync + 'static {
    /// creates a pool with the given number of `threads`
    ///
    /// # Errors
    /// returns [`ClientError::ThreadPool`](crate::ClientError::ThreadPool) if the threads could
    /// not be started
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// runs `job` on one of the pool's threads
    ///
    /// # Errors
    /// returns [`ClientError::ThreadPool`](crate::ClientError::ThreadPool) if the pool was
    /// shut down
    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static;

    /// stops accepting jobs and releases the pool's threads. Jobs already queued are allowed
    /// to finish. Calling it more than once is harmless.
    fn shutdown(&self);
}
