//! Per-client shared state.
//!
//! A context bundles what every call of one client shares: settings, the
//! result cache, the runtime the socket lives on and the HTTP side channel.
//! Separate clients never share a context, so their caches stay apart.

use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::ClientSettings;
use crate::correlator::{LogProgress, ProgressObserver};
use crate::error::ClientResult;
use crate::runtime::ExecutionContext;
use crate::side_channel::SideChannel;

pub struct ClientContext {
    settings: Arc<ClientSettings>,
    cache: Arc<CacheStore>,
    side_channel: Arc<SideChannel>,
    observer: Arc<dyn ProgressObserver>,
    execution: ExecutionContext,
}

impl ClientContext {
    /// Build a context with its own runtime and the logging progress observer.
    pub fn new(settings: ClientSettings) -> ClientResult<Self> {
        let execution = ExecutionContext::new(settings.worker_threads)?;
        Self::with_execution(settings, execution)
    }

    pub fn with_execution(
        settings: ClientSettings,
        execution: ExecutionContext,
    ) -> ClientResult<Self> {
        let side_channel = SideChannel::new(&settings)?;
        Ok(Self {
            settings: Arc::new(settings),
            cache: Arc::new(CacheStore::new()),
            side_channel: Arc::new(side_channel),
            observer: Arc::new(LogProgress),
            execution,
        })
    }

    /// Route progress updates somewhere other than the log.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &Arc<ClientSettings> {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn side_channel(&self) -> &Arc<SideChannel> {
        &self.side_channel
    }

    pub fn observer(&self) -> &Arc<dyn ProgressObserver> {
        &self.observer
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }
}
