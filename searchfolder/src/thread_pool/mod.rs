//! # Thread pool
//!
//! Module dedicated to thread pool management. The [`ThreadPool`] is
//! the main structure of this module: it spawns n threads and
//! transfers tasks to them using an unbounded channel. The receiver
//! part is shared accross all threads in a mutex, this way only one
//! thread can wait for a task at a time. When a thread receives a
//! task, it releases the lock and an other thread can wait for the
//! next task. A task is a function that takes the shared context and
//! returns a future. The easiest way to build a pool is to use the
//! [`ThreadPoolBuilder`].
//!
//! The search folders engine runs its rebuild workers in such a
//! pool.

mod error;

use std::{num::NonZeroUsize, pin::Pin, sync::Arc, thread::available_parallelism};

use futures::{lock::Mutex, Future};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

#[doc(inline)]
pub use self::error::{Error, Result};

/// The thread pool task.
pub type ThreadPoolTask<C> =
    Box<dyn FnOnce(Arc<C>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// The thread pool.
pub struct ThreadPool<C> {
    /// Channel used to send tasks to threads.
    tx: mpsc::UnboundedSender<ThreadPoolTask<C>>,

    /// The list of threads spawned by the pool.
    threads: Vec<JoinHandle<()>>,
}

impl<C> ThreadPool<C>
where
    C: Send + Sync + 'static,
{
    /// Send a task to the pool.
    ///
    /// The task will be executed by the first available thread.
    pub fn send<F>(&self, task: impl FnOnce(Arc<C>) -> F + Send + 'static) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: ThreadPoolTask<C> = Box::new(move |ctx| Box::pin(task(ctx)));
        self.tx.send(task).map_err(|_| Error::SendTaskError)
    }

    /// The number of threads of the pool.
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Close the channel and wait for threads to finish.
    ///
    /// Tasks already sent are executed before threads exit.
    pub async fn close(self) -> Result<()> {
        debug!("closing pool…");

        drop(self.tx);

        for (id, thread) in self.threads.into_iter().enumerate() {
            thread.await?;
            trace!(id = id + 1, "thread exited");
        }

        debug!("pool closed");
        Ok(())
    }
}

/// The thread pool builder.
///
/// Builder that help you to create a [`ThreadPool`].
#[derive(Clone)]
pub struct ThreadPoolBuilder<C> {
    /// The context shared by all threads.
    ctx: Arc<C>,

    /// The size of the pool.
    ///
    /// Represents the number of threads that will be spawn in
    /// parallel. Defaults to the number of available CPUs.
    size: usize,
}

impl<C: Send + Sync + 'static> ThreadPoolBuilder<C> {
    /// Create a new thread pool builder with a shared context.
    pub fn new(ctx: Arc<C>) -> Self {
        Self {
            ctx,
            size: available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }

    /// Change the thread pool size.
    pub fn set_some_size(&mut self, size: Option<usize>) {
        if let Some(size) = size {
            self.size = size.max(1);
        }
    }

    /// Change the thread pool size.
    pub fn set_size(&mut self, size: usize) {
        self.set_some_size(Some(size));
    }

    /// Change the thread pool size using the builder pattern.
    pub fn with_some_size(mut self, size: Option<usize>) -> Self {
        self.set_some_size(size);
        self
    }

    /// Change the thread pool size using the builder pattern.
    pub fn with_size(mut self, size: usize) -> Self {
        self.set_size(size);
        self
    }

    /// Build the final thread pool.
    ///
    /// Threads are spawned on the current tokio runtime.
    pub fn build(self) -> ThreadPool<C> {
        let (tx, rx) = mpsc::unbounded_channel::<ThreadPoolTask<C>>();
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::with_capacity(self.size);

        for id in 1..=self.size {
            let ctx = self.ctx.clone();
            let rx = rx.clone();

            threads.push(tokio::spawn(async move {
                loop {
                    let mut lock = rx.lock().await;

                    trace!(id, "thread waiting for a task…");
                    match lock.recv().await {
                        None => {
                            drop(lock);
                            break;
                        }
                        Some(task) => {
                            drop(lock);

                            trace!(id, "thread executing task…");
                            task(ctx.clone()).await;
                            trace!(id, "thread successfully executed task");
                        }
                    }
                }

                debug!(id, "no more task for thread, exiting");
            }));
        }

        ThreadPool { tx, threads }
    }
}
