use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::{ClientError, Result, ThreadPool};

/// A thread pool that uses a work stealing strategy as implemented by the [`Rayon`] library.
///
/// [`Rayon`]: https://docs.rs/rayon/latest/rayon/index.html
pub struct RayonThreadPool {
    pool: RwLock<Option<rayon::ThreadPool>>,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .thread_name(|i| format!("batch-rayon-{}", i))
            .build()
            .map_err(|e| {
                ClientError::ThreadPool(format!("could not build thread pool: {:?}", &e))
            })?;
        debug!("created thread pool with {} threads", &threads);

        Ok(Self {
            pool: RwLock::new(Some(pool)),
        })
    }

    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        match pool.as_ref() {
            Some(pool) => {
                pool.spawn(job);
                Ok(())
            }
            None => Err(ClientError::ThreadPool("thread pool is shut down".into())),
        }
    }

    fn shutdown(&self) {
        // dropping a rayon pool lets queued jobs finish, then terminates its threads
        if self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("rayon thread pool shut down");
        }
    }
}
