use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, instrument, warn};

use crate::{ClientError, Result, ThreadPool};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// This implementation uses the MPMC [`channel`] provided by the crossbeam crate.
/// Specifically, we are using it as a single producer, multiple consumer. The single producer
/// is this type itself, and the threads in the pool are the consumers.
///
/// If a spawned task panics, the old thread will be destroyed and a new one will be
/// created. Shutting the pool down drops the sending half of the channel, so every worker
/// finishes the jobs already queued and then exits.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending part of the channel, `None` once shut down
    tx: Mutex<Option<Sender<Job>>>,
    /// the initially started workers
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool for SharedQueueThreadPool {
    /// create a new "thread pool" with the given number of `threads`.
    /// Every thread created will have a handle to the receiving end of the channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let task_rx = TaskReceiver(rx.clone());
            let handle = thread::Builder::new()
                .name("batch-worker".into())
                .spawn(move || run_tasks(task_rx))
                .map_err(|e| ClientError::ThreadPool(format!("could not spawn worker: {}", e)))?;
            workers.push(handle);
        }
        debug!("created shared queue thread pool with {} threads", threads);
        Ok(SharedQueueThreadPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Sends a function to the pool's queue.
    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| ClientError::ThreadPool("there are no threads in the pool".into())),
            None => Err(ClientError::ThreadPool("thread pool is shut down".into())),
        }
    }

    #[instrument(skip(self))]
    fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread exited with a panic");
            }
        }
        debug!("shared queue thread pool shut down");
    }
}

impl Drop for SharedQueueThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A type that can receive tasks (i.e. closures) from a channel and run them.
/// Additionally, this type is responsible for restarting any threads that panicked
#[derive(Clone, Debug)]
struct TaskReceiver(Receiver<Job>);

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("thread panicked, starting a new thread");
            let task_rx = self.clone();
            if let Err(e) = thread::Builder::new()
                .name("batch-worker".into())
                .spawn(move || run_tasks(task_rx))
            {
                error!("Failed to spawn a thread: {}", e);
            }
        }
    }
}

/// this function waits for a task to arrive on its (wrapped) receiver, and then runs the task
fn run_tasks(rx: TaskReceiver) {
    loop {
        match rx.0.recv() {
            Ok(task) => task(),
            Err(_) => {
                debug!("Thread exited because the thread pool was destroyed.");
                break;
            }
        }
    }
}
