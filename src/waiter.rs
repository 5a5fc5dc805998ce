//! Waiting for dispatched requests to resolve.
//!
//! The waiter never polls: it subscribes to the cache's change notifications
//! before inspecting any slot, so a write that lands between the check and
//! the wait still wakes it. Dropping the future returned by
//! [`CompletionWaiter::wait`] cancels the wait and nothing else.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{AbandonReason, CacheSlot, CacheStore, Fingerprint, Resolution, Resolved};
use crate::correlator::file_results::{FileResult, resolve_files};
use crate::error::{ClientError, ClientResult};
use crate::side_channel::SideChannel;

pub struct CompletionWaiter {
    cache: Arc<CacheStore>,
    side_channel: Arc<SideChannel>,
}

impl CompletionWaiter {
    pub fn new(cache: Arc<CacheStore>, side_channel: Arc<SideChannel>) -> Self {
        Self {
            cache,
            side_channel,
        }
    }

    /// Wait until every fingerprint has left the pending state.
    ///
    /// Results come back in input order. Failures are scoped to their own
    /// entry; the call as a whole never fails. With a deadline, slots still
    /// pending when it expires are abandoned and reported as timeouts.
    pub async fn wait(
        &self,
        fingerprints: &[Fingerprint],
        deadline: Option<Duration>,
    ) -> Vec<ClientResult<Resolved>> {
        let slots = match deadline {
            None => self.settled(fingerprints).await,
            Some(limit) => match tokio::time::timeout(limit, self.settled(fingerprints)).await {
                Ok(slots) => slots,
                Err(_) => {
                    let expired = self.cache.abandon(fingerprints, AbandonReason::TimedOut);
                    log::warn!(
                        target: "finx_socket::waiter",
                        "Deadline of {:?} expired with {} request(s) outstanding",
                        limit,
                        expired
                    );
                    self.snapshot(fingerprints)
                }
            },
        };

        let mut results: Vec<Option<ClientResult<Resolved>>> = Vec::with_capacity(slots.len());
        let mut files = Vec::new();
        for (index, (fingerprint, slot)) in fingerprints.iter().zip(slots).enumerate() {
            match slot {
                Some(CacheSlot::Resolved(Resolution::File(file))) => {
                    files.push(FileResult {
                        index,
                        fingerprint: fingerprint.clone(),
                        file,
                    });
                    results.push(None);
                }
                other => results.push(Some(settle(fingerprint, other))),
            }
        }

        if !files.is_empty() {
            for (index, outcome) in resolve_files(&self.side_channel, &self.cache, files).await {
                results[index] = Some(outcome);
            }
        }

        fingerprints
            .iter()
            .zip(results)
            .map(|(fingerprint, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ClientError::internal(format!("no result recorded for {}", fingerprint)))
                });
                if let Err(e) = &result {
                    log::error!(
                        target: "finx_socket::waiter",
                        "Failed to find result for {}: {}",
                        fingerprint,
                        e
                    );
                }
                result
            })
            .collect()
    }

    /// Block until no listed slot is pending, then return a snapshot.
    async fn settled(&self, fingerprints: &[Fingerprint]) -> Vec<Option<CacheSlot>> {
        let mut changes = self.cache.subscribe();
        let mut remaining: Vec<&Fingerprint> = fingerprints.iter().collect();
        loop {
            remaining.retain(|fp| self.cache.peek(fp) == Some(CacheSlot::Pending));
            if remaining.is_empty() {
                return self.snapshot(fingerprints);
            }
            if changes.changed().await.is_err() {
                return self.snapshot(fingerprints);
            }
        }
    }

    fn snapshot(&self, fingerprints: &[Fingerprint]) -> Vec<Option<CacheSlot>> {
        fingerprints.iter().map(|fp| self.cache.peek(fp)).collect()
    }
}

/// Turn a settled slot into the caller-facing result.
fn settle(fingerprint: &Fingerprint, slot: Option<CacheSlot>) -> ClientResult<Resolved> {
    match slot {
        Some(CacheSlot::Resolved(Resolution::Data(value))) => Ok(Resolved::Data(value)),
        Some(CacheSlot::Resolved(Resolution::Empty)) => Ok(Resolved::Empty),
        Some(CacheSlot::Resolved(Resolution::RemoteError(message))) => {
            Ok(Resolved::RemoteError(message))
        }
        Some(CacheSlot::Resolved(Resolution::Unmatched(message))) => {
            Err(ClientError::correlation(fingerprint, message))
        }
        Some(CacheSlot::Resolved(Resolution::File(_))) => Err(ClientError::internal(
            "file result reached settle without download",
        )),
        Some(CacheSlot::Abandoned(AbandonReason::ConnectionClosed)) => {
            Err(ClientError::ConnectionClosed)
        }
        Some(CacheSlot::Abandoned(AbandonReason::TimedOut)) => {
            Err(ClientError::timeout(fingerprint))
        }
        Some(CacheSlot::Abandoned(AbandonReason::DispatchFailed)) => Err(ClientError::connection(
            "request could not be sent",
        )),
        Some(CacheSlot::Pending) => Err(ClientError::timeout(fingerprint)),
        None => Err(ClientError::internal(format!(
            "result for {} was discarded while waiting",
            fingerprint
        ))),
    }
}
