//! Supervisor and receive loop for the analytics socket.
//!
//! # Lifecycle
//!
//! 1. **Connect**: open the socket, bounded by the auth timeout
//! 2. **Handshake**: queue the auth frame, wait for the ack
//! 3. **Receive**: hand every text frame to the correlator, ping on an interval
//! 4. **Teardown**: on loss, either reconnect to resume batch jobs or abandon
//!    every pending slot and settle in `Disconnected`
//!
//! The receive loop is the only place cache slots are written from socket
//! traffic.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use ulid::Ulid;

use super::writer::{OUTBOUND_QUEUE_CAPACITY, Outbound, spawn_writer_task};
use super::{ConnectionState, SessionFailure, SessionShared};
use crate::cache::AbandonReason;
use crate::correlator::FrameOutcome;
use crate::protocol::auth_frame;

/// How one connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndReason {
    Shutdown,
    ConnectFailed(String),
    AuthTimeout,
    Closed(String),
}

impl EndReason {
    fn into_failure(self) -> Option<SessionFailure> {
        match self {
            EndReason::Shutdown => None,
            EndReason::ConnectFailed(message) => Some(SessionFailure::Connect(message)),
            EndReason::AuthTimeout => Some(SessionFailure::AuthTimeout),
            EndReason::Closed(message) => Some(SessionFailure::Lost(message)),
        }
    }
}

struct ConnectionEnd {
    /// At least one result arrived on this connection.
    delivered: bool,
    reason: EndReason,
}

/// Run connections until shutdown or until there is nothing left to resume.
pub(crate) async fn supervise(shared: Arc<SessionShared>) {
    let mut attempts_left = shared.settings.reconnect_attempts;
    loop {
        let end = run_connection(&shared).await;
        shared.outbound.store(None);

        if end.delivered {
            attempts_left = shared.settings.reconnect_attempts;
        }
        if end.reason == EndReason::AuthTimeout {
            log::error!(
                target: "finx_socket::session",
                "Client not authenticated - Invalid API KEY"
            );
        }

        let resumable = if end.reason == EndReason::Shutdown {
            Vec::new()
        } else {
            shared.jobs.resumable(&shared.cache)
        };

        if !resumable.is_empty() && attempts_left > 0 {
            attempts_left -= 1;
            let keep = shared.jobs.tracked_fingerprints();
            let lost = shared
                .cache
                .abandon_untracked(&keep, AbandonReason::ConnectionClosed);
            log::info!(
                target: "finx_socket::session",
                "Connection ended ({:?}); reconnecting to resume {} batch job(s), \
                 {} request(s) lost, {} attempt(s) left",
                end.reason,
                resumable.len(),
                lost,
                attempts_left
            );
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    settle_disconnected(&shared, None);
                    return;
                }
                _ = tokio::time::sleep(shared.settings.reconnect_backoff) => {}
            }
            shared.state.set(ConnectionState::Connecting);
            continue;
        }

        settle_disconnected(&shared, end.reason.into_failure());
        return;
    }
}

fn settle_disconnected(shared: &SessionShared, failure: Option<SessionFailure>) {
    if let Some(failure) = failure {
        shared.record_failure(failure);
    }
    let abandoned = shared
        .cache
        .abandon_all_pending(AbandonReason::ConnectionClosed);
    if abandoned > 0 {
        log::warn!(
            target: "finx_socket::session",
            "Connection closed with {} request(s) outstanding",
            abandoned
        );
    }
    shared.state.set(ConnectionState::Disconnected);
}

async fn run_connection(shared: &SessionShared) -> ConnectionEnd {
    let ended = |reason| ConnectionEnd {
        delivered: false,
        reason,
    };

    let url = match shared.settings.ws_url() {
        Ok(url) => url,
        Err(e) => {
            shared.state.set(ConnectionState::Closing);
            return ended(EndReason::ConnectFailed(e.to_string()));
        }
    };
    log::debug!(target: "finx_socket::session", "Connecting to {}", url);

    let auth_timeout = shared.settings.auth_timeout;
    let connect = tokio::time::timeout(auth_timeout, connect_async(url.as_str()));
    let stream = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            shared.state.set(ConnectionState::Closing);
            return ended(EndReason::Shutdown);
        }
        result = connect => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                shared.state.set(ConnectionState::Closing);
                return ended(EndReason::ConnectFailed(e.to_string()));
            }
            Err(_) => {
                shared.state.set(ConnectionState::Closing);
                return ended(EndReason::ConnectFailed(format!(
                    "no response from {} within {:?}",
                    url, auth_timeout
                )));
            }
        }
    };

    let (sink, mut source) = stream.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut writer = spawn_writer_task(sink, rx);

    shared.state.set(ConnectionState::AwaitingAuth);
    if tx
        .send(Outbound::Text(auth_frame(shared.settings.api_key())))
        .await
        .is_err()
    {
        shared.state.set(ConnectionState::Closing);
        return ended(EndReason::Closed("writer exited before auth".into()));
    }

    let auth_deadline = tokio::time::sleep(auth_timeout);
    tokio::pin!(auth_deadline);
    let period = shared.settings.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut authenticated = false;
    let mut delivered = false;
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break EndReason::Shutdown,

            _ = &mut auth_deadline, if !authenticated => break EndReason::AuthTimeout,

            _ = ping.tick(), if authenticated => {
                // A full queue already keeps the socket busy.
                let _ = tx.try_send(Outbound::Ping);
            }

            message = source.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            log::warn!(
                                target: "finx_socket::session",
                                "Dropping non-UTF-8 binary frame ({} bytes)",
                                bytes.len()
                            );
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break EndReason::Closed(match frame {
                            Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason.as_str()),
                            None => "closed by server".to_string(),
                        });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break EndReason::Closed(e.to_string()),
                    None => break EndReason::Closed("stream ended".to_string()),
                };

                match shared.correlator.handle_text(&text, authenticated) {
                    FrameOutcome::Authenticated => {
                        authenticated = true;
                        on_authenticated(shared, &tx);
                    }
                    FrameOutcome::Resolved => delivered = true,
                    _ => {}
                }
            }
        }
    };

    shared.outbound.store(None);
    shared.state.set(ConnectionState::Closing);
    if reason == EndReason::Shutdown {
        writer.stop().await;
    }
    log::debug!(
        target: "finx_socket::session",
        "Connection ended: {:?}",
        reason
    );
    ConnectionEnd {
        delivered,
        reason,
    }
}

/// Publish the queue, bump the generation and resend resumable batch jobs.
fn on_authenticated(shared: &SessionShared, tx: &mpsc::Sender<Outbound>) {
    shared.outbound.store(Some(Arc::new(tx.clone())));
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    shared.state.set(ConnectionState::Authenticated);
    log::info!(
        target: "finx_socket::session",
        "Authenticated (connection {})",
        generation
    );

    let resends = claim_resends(shared, generation);
    if resends.is_empty() {
        return;
    }
    // The receive loop must keep reading while the queue is full.
    let tx = tx.clone();
    tokio::spawn(async move {
        for (id, text) in resends {
            log::info!(target: "finx_socket::session", "Resending batch {}", id);
            if tx.send(Outbound::Text(text)).await.is_err() {
                break;
            }
        }
    });
}

/// Encoded continuation frames of every resumable job not yet sent on
/// connection `generation`.
fn claim_resends(shared: &SessionShared, generation: u64) -> Vec<(Ulid, String)> {
    let mut resends = Vec::new();
    for id in shared.jobs.resumable(&shared.cache) {
        let Some(frame) = shared.jobs.claim_send(id, generation) else {
            continue;
        };
        match frame.encode() {
            Ok(text) => resends.push((id, text)),
            Err(e) => log::error!(
                target: "finx_socket::session",
                "Cannot resend batch {}: {}",
                id,
                e
            ),
        }
    }
    resends
}
