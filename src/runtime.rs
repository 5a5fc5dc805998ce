//! Execution context for the client's background work.
//!
//! The socket supervisor, side-channel HTTP calls and waiters all run on one
//! multi-threaded runtime owned by the client, so blocking, async and
//! background call styles share the same connection and cache regardless of
//! which runtime (if any) the caller is on.

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{ClientError, ClientResult};

pub struct ExecutionContext {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl ExecutionContext {
    /// Start a dedicated runtime with `worker_threads` workers.
    pub fn new(worker_threads: usize) -> ClientResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("finx-socket-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        log::debug!(
            target: "finx_socket::runtime",
            "Started client runtime with {} worker(s)",
            worker_threads.max(1)
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drive `future` to completion from synchronous code.
    ///
    /// Safe to call from inside another runtime: the wait then happens on a
    /// scoped helper thread instead of the caller's worker.
    pub fn call_blocking<F>(&self, future: F) -> ClientResult<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        block_on_handle(&self.handle, future)
    }

    /// Start `future` on the client runtime and return immediately.
    pub fn call_in_background<F>(&self, future: F) -> BackgroundCall<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        BackgroundCall {
            task: self.handle.spawn(future),
            handle: self.handle.clone(),
        }
    }

    /// Run `future` on the client runtime and await it from any runtime.
    pub async fn call_async<F>(&self, future: F) -> ClientResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.call_in_background(future).wait().await
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Dropping a runtime from async code panics; never block here.
            runtime.shutdown_background();
        }
    }
}

/// A call running on the client runtime.
///
/// Dropping it detaches the call; the result is discarded.
pub struct BackgroundCall<T> {
    task: JoinHandle<T>,
    handle: Handle,
}

impl<T: Send + 'static> BackgroundCall<T> {
    /// Block the current thread until the call finishes.
    pub fn join(self) -> ClientResult<T> {
        let Self { task, handle } = self;
        block_on_handle(&handle, task)?.map_err(join_error)
    }

    /// Await the call.
    pub async fn wait(self) -> ClientResult<T> {
        self.task.await.map_err(join_error)
    }
}

fn block_on_handle<F>(handle: &Handle, future: F) -> ClientResult<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    if Handle::try_current().is_err() {
        return Ok(handle.block_on(future));
    }
    std::thread::scope(|scope| {
        scope
            .spawn(|| handle.block_on(future))
            .join()
            .map_err(|_| ClientError::internal("blocking call panicked"))
    })
}

fn join_error(e: tokio::task::JoinError) -> ClientError {
    if e.is_cancelled() {
        ClientError::internal("call was cancelled")
    } else {
        ClientError::internal(format!("call panicked: {}", e))
    }
}
