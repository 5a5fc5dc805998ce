//! The client facade.
//!
//! Every call runs the same async core on the client's runtime: plan the
//! request against the cache, send whatever this call claimed, then wait
//! for every fingerprint in caller order. The core is exposed three ways:
//! awaitable (`dispatch`), blocking (`dispatch_blocking`) and detached
//! (`dispatch_in_background`).

pub mod context;

pub use context::ClientContext;

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::batch::{self, BatchRequest, Plan, Row};
use crate::cache::{AbandonReason, Resolved};
use crate::error::{ClientError, ClientResult};
use crate::registry::{LIST_FUNCTIONS_METHOD, MethodTable};
use crate::runtime::BackgroundCall;
use crate::session::{ConnectionState, JobGuard, JobRegistry, Session};
use crate::waiter::CompletionWaiter;

/// Ordered per-request outcomes of one call.
pub type Results = Vec<ClientResult<Resolved>>;

struct ClientInner {
    session: Session,
    jobs: Arc<JobRegistry>,
    waiter: CompletionWaiter,
    functions: ArcSwap<MethodTable>,
    context: ClientContext,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect and block until the session is authenticated.
    pub fn connect(context: ClientContext) -> ClientResult<Self> {
        let client = Self::start(context);
        client
            .inner
            .context
            .execution()
            .call_blocking(client.inner.session.wait_authenticated())??;
        Ok(client)
    }

    /// Connect and await authentication.
    pub async fn connect_async(context: ClientContext) -> ClientResult<Self> {
        let client = Self::start(context);
        client.inner.session.wait_authenticated().await?;
        Ok(client)
    }

    fn start(context: ClientContext) -> Self {
        let jobs = Arc::new(JobRegistry::new());
        let session = Session::start(
            context.execution().handle(),
            Arc::clone(context.settings()),
            Arc::clone(context.cache()),
            Arc::clone(&jobs),
            Arc::clone(context.observer()),
        );
        let waiter = CompletionWaiter::new(
            Arc::clone(context.cache()),
            Arc::clone(context.side_channel()),
        );
        Self {
            inner: Arc::new(ClientInner {
                session,
                jobs,
                waiter,
                functions: ArcSwap::from_pointee(MethodTable::default()),
                context,
            }),
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.inner.context
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Send one request and await its result.
    pub async fn dispatch(&self, method: &str, params: impl Serialize) -> ClientResult<Resolved> {
        let params = to_params(params)?;
        let inner = Arc::clone(&self.inner);
        let method = method.to_string();
        let results = self
            .inner
            .context
            .execution()
            .call_async(async move { inner.run(&method, params, None, None).await })
            .await??;
        first_result(results)
    }

    pub fn dispatch_blocking(&self, method: &str, params: impl Serialize) -> ClientResult<Resolved> {
        let params = to_params(params)?;
        let results = self
            .inner
            .context
            .execution()
            .call_blocking(self.inner.run(method, params, None, None))??;
        first_result(results)
    }

    /// Start one request and return without waiting for it.
    pub fn dispatch_in_background(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> ClientResult<BackgroundCall<ClientResult<Resolved>>> {
        let params = to_params(params)?;
        let inner = Arc::clone(&self.inner);
        let method = method.to_string();
        Ok(self.inner.context.execution().call_in_background(async move {
            first_result(inner.run(&method, params, None, None).await?)
        }))
    }

    /// Send a batch and await every row's result, in row order.
    pub async fn dispatch_batch(&self, request: BatchRequest) -> ClientResult<Results> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .execution()
            .call_async(async move { inner.run_batch(request).await })
            .await?
    }

    pub fn dispatch_batch_blocking(&self, request: BatchRequest) -> ClientResult<Results> {
        self.inner
            .context
            .execution()
            .call_blocking(self.inner.run_batch(request))?
    }

    pub fn dispatch_batch_in_background(
        &self,
        request: BatchRequest,
    ) -> BackgroundCall<ClientResult<Results>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .execution()
            .call_in_background(async move { inner.run_batch(request).await })
    }

    /// Fetch the method listing and make it available to [`Client::call`].
    ///
    /// Returns how many methods were loaded.
    pub async fn load_functions(&self) -> ClientResult<usize> {
        let listing = self.dispatch(LIST_FUNCTIONS_METHOD, Map::new()).await?;
        self.store_functions(listing)
    }

    pub fn load_functions_blocking(&self) -> ClientResult<usize> {
        let listing = self.dispatch_blocking(LIST_FUNCTIONS_METHOD, Map::new())?;
        self.store_functions(listing)
    }

    fn store_functions(&self, listing: Resolved) -> ClientResult<usize> {
        let table = match listing {
            Resolved::Data(value) => MethodTable::from_listing(&value)?,
            Resolved::Empty => MethodTable::default(),
            Resolved::RemoteError(message) => {
                return Err(ClientError::internal(format!(
                    "{} failed: {}",
                    LIST_FUNCTIONS_METHOD, message
                )));
            }
        };
        let count = table.len();
        self.inner.functions.store(Arc::new(table));
        Ok(count)
    }

    /// The loaded method table; empty until [`Client::load_functions`] ran.
    pub fn functions(&self) -> Arc<MethodTable> {
        self.inner.functions.load_full()
    }

    /// Call a listed method by name, validating its parameters first.
    pub async fn call(&self, method: &str, params: impl Serialize) -> ClientResult<Resolved> {
        let params = self.functions().prepare(method, to_params(params)?)?;
        self.dispatch(method, params).await
    }

    pub fn call_blocking(&self, method: &str, params: impl Serialize) -> ClientResult<Resolved> {
        let params = self.functions().prepare(method, to_params(params)?)?;
        self.dispatch_blocking(method, params)
    }

    /// Batch form of [`Client::call`].
    pub async fn call_batch(&self, request: BatchRequest) -> ClientResult<Results> {
        let request = self.validate_batch(request)?;
        self.dispatch_batch(request).await
    }

    pub fn call_batch_blocking(&self, request: BatchRequest) -> ClientResult<Results> {
        let request = self.validate_batch(request)?;
        self.dispatch_batch_blocking(request)
    }

    fn validate_batch(&self, request: BatchRequest) -> ClientResult<BatchRequest> {
        let BatchRequest {
            method,
            input,
            params,
            output_file,
        } = request;
        let rows = input.into_rows()?;
        let params = self.functions().prepare_batch(&method, params, &rows)?;
        Ok(BatchRequest {
            method,
            input: rows.into(),
            params,
            output_file,
        })
    }

    /// Forget every cached result.
    ///
    /// Waiters still blocked on a discarded slot fail instead of hanging.
    pub fn clear_cache(&self) {
        self.inner.context.cache().clear();
        log::debug!(target: "finx_socket::client", "Cache cleared");
    }

    /// Close the socket. Outstanding calls fail with
    /// [`ClientError::ConnectionClosed`]; the client cannot reconnect.
    pub async fn close(&self) {
        self.inner.session.shutdown().await;
    }

    pub fn close_blocking(&self) {
        if let Err(e) = self
            .inner
            .context
            .execution()
            .call_blocking(self.inner.session.shutdown())
        {
            log::warn!(target: "finx_socket::client", "Close failed: {}", e);
        }
    }
}

impl ClientInner {
    async fn run_batch(&self, request: BatchRequest) -> ClientResult<Results> {
        let rows = request.input.into_rows()?;
        self.run(&request.method, request.params, Some(rows), request.output_file)
            .await
    }

    /// The async core shared by every entry point.
    async fn run(
        &self,
        method: &str,
        params: Map<String, Value>,
        rows: Option<Vec<Row>>,
        output_file: Option<PathBuf>,
    ) -> ClientResult<Results> {
        let cache = self.context.cache();
        let plan = batch::plan(cache, self.context.settings(), method, &params, rows.as_deref())?;

        let mut job_guard = None;
        match &plan {
            Plan::Wait { .. } => {}
            Plan::Single { frame, .. } => {
                if let Err(e) = self.session.send(frame).await {
                    cache.abandon(plan.claimed(), AbandonReason::DispatchFailed);
                    return Err(e);
                }
            }
            Plan::Batch(batch_plan) => {
                let frame = match batch_plan.frame(self.context.side_channel()).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        cache.abandon(plan.claimed(), AbandonReason::DispatchFailed);
                        return Err(e);
                    }
                };
                // Rows cached or in flight elsewhere are not this job's to resume.
                let id = self.jobs.register(batch_plan.outstanding.clone(), frame);
                job_guard = Some(JobGuard::new(Arc::clone(&self.jobs), id));
                log::debug!(
                    target: "finx_socket::client",
                    "Dispatching batch {} ({} row(s), {} outstanding, {:?})",
                    id,
                    batch_plan.fingerprints.len(),
                    batch_plan.outstanding.len(),
                    batch_plan.delivery
                );
                if let Err(e) = self.session.send_job(id).await {
                    cache.abandon(plan.claimed(), AbandonReason::DispatchFailed);
                    return Err(e);
                }
            }
        }

        let results = self
            .waiter
            .wait(plan.fingerprints(), self.context.settings().request_timeout)
            .await;
        drop(job_guard);

        if let Some(path) = output_file {
            batch::write_results(&path, &results)?;
        }
        Ok(results)
    }
}

fn first_result(results: Results) -> ClientResult<Resolved> {
    results
        .into_iter()
        .next()
        .unwrap_or_else(|| Err(ClientError::internal("dispatch produced no result")))
}

/// Convert caller parameters to a JSON object.
fn to_params(params: impl Serialize) -> ClientResult<Map<String, Value>> {
    match serde_json::to_value(params) {
        Ok(Value::Object(params)) => Ok(params),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(ClientError::serialization(format!(
            "parameters must serialize to an object, got {}",
            other
        ))),
        Err(e) => Err(ClientError::serialization(e.to_string())),
    }
}
