//! Socket session: one authenticated connection at a time.
//!
//! A [`Session`] owns a supervisor task that opens the socket, sends the auth
//! frame, feeds inbound frames to the [`Correlator`] and reconnects while a
//! batch job still has results outstanding. Callers only ever see the
//! session through [`Session::send`], [`Session::send_job`] and the
//! connection state.

pub mod connection;
mod handshake;
pub mod jobs;
pub mod state;
pub(crate) mod writer;

pub use jobs::{BatchJob, JobGuard, JobRegistry};
pub use state::{ConnectionState, StateCell};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::cache::CacheStore;
use crate::config::ClientSettings;
use crate::correlator::{Correlator, ProgressObserver};
use crate::error::{ClientError, ClientResult, LockResultExt};
use crate::protocol::RequestFrame;
use writer::Outbound;

/// Why the session last gave up on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionFailure {
    /// The socket could not be opened.
    Connect(String),
    /// The service never acknowledged the API key.
    AuthTimeout,
    /// An open socket was lost.
    Lost(String),
}

/// State shared between the session handle and its supervisor task.
pub(crate) struct SessionShared {
    pub(crate) settings: Arc<ClientSettings>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) jobs: Arc<JobRegistry>,
    pub(crate) correlator: Correlator,
    pub(crate) state: StateCell,
    /// Queue of the current authenticated socket, `None` otherwise.
    pub(crate) outbound: ArcSwapOption<mpsc::Sender<Outbound>>,
    /// Bumped on every successful authentication.
    pub(crate) generation: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    pub(crate) last_failure: Mutex<Option<SessionFailure>>,
}

impl SessionShared {
    pub(crate) fn record_failure(&self, failure: SessionFailure) {
        *self
            .last_failure
            .lock()
            .recover_poison("SessionShared::record_failure") = Some(failure);
    }

    pub(crate) fn last_failure(&self) -> Option<SessionFailure> {
        self.last_failure
            .lock()
            .recover_poison("SessionShared::last_failure")
            .clone()
    }

    async fn enqueue(&self, outbound: Outbound) -> ClientResult<()> {
        let sender = self
            .outbound
            .load_full()
            .ok_or(ClientError::ConnectionClosed)?;
        sender
            .send(outbound)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

pub struct Session {
    shared: Arc<SessionShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start connecting on `handle`. Use [`Session::wait_authenticated`] to
    /// learn whether the handshake succeeded.
    pub fn start(
        handle: &Handle,
        settings: Arc<ClientSettings>,
        cache: Arc<CacheStore>,
        jobs: Arc<JobRegistry>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        let correlator = Correlator::new(Arc::clone(&cache), Arc::clone(&jobs), observer);
        let shared = Arc::new(SessionShared {
            settings,
            cache,
            jobs,
            correlator,
            state: StateCell::new(),
            outbound: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            last_failure: Mutex::new(None),
        });
        shared.state.set(ConnectionState::Connecting);
        let task = handle.spawn(connection::supervise(Arc::clone(&shared)));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Send a request frame on the authenticated socket.
    ///
    /// Fails fast with [`ClientError::NotAuthenticated`] outside the
    /// authenticated state; nothing is queued for later.
    pub async fn send(&self, frame: &RequestFrame) -> ClientResult<()> {
        if !self.is_authenticated() {
            return Err(ClientError::NotAuthenticated);
        }
        let text = frame.encode()?;
        log::debug!(
            target: "finx_socket::session",
            "Sending {} request",
            frame.method().unwrap_or("unnamed")
        );
        self.shared.enqueue(Outbound::Text(text)).await
    }

    /// Send a registered batch job unless it already went out on this
    /// connection.
    ///
    /// While the session is reconnecting the job is left to the supervisor,
    /// which resends every resumable job once authenticated again.
    pub async fn send_job(&self, id: Ulid) -> ClientResult<()> {
        match self.state() {
            ConnectionState::Authenticated => {}
            ConnectionState::Disconnected => return Err(ClientError::ConnectionClosed),
            other => {
                log::debug!(
                    target: "finx_socket::session",
                    "Deferring batch {} while connection is {:?}",
                    id,
                    other
                );
                return Ok(());
            }
        }
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let Some(frame) = self.shared.jobs.claim_send(id, generation) else {
            return Ok(());
        };
        let text = frame.encode()?;
        if let Err(e) = self.shared.enqueue(Outbound::Text(text)).await {
            // The supervisor resends or abandons the job once the socket settles.
            log::debug!(
                target: "finx_socket::session",
                "Batch {} not queued: {}",
                id,
                e
            );
        }
        Ok(())
    }

    /// Close the socket and wait for the supervisor to finish.
    ///
    /// Pending slots are abandoned, so concurrent waiters observe
    /// [`ClientError::ConnectionClosed`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self.task.lock().recover_poison("Session::shutdown").take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            log::warn!(
                target: "finx_socket::session",
                "Session task ended abnormally: {}",
                e
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
