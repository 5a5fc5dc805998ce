//! Connection state machine for the analytics socket.

use tokio::sync::watch;

/// State of the socket connection.
///
/// State transitions:
/// - Disconnected -> Connecting (session started, or reconnect scheduled)
/// - Connecting -> AwaitingAuth (socket open, auth frame sent)
/// - Connecting -> Disconnected (connect failed, nothing to resume)
/// - AwaitingAuth -> Authenticated (auth ack received)
/// - AwaitingAuth -> Closing (socket lost or auth timed out)
/// - Authenticated -> Closing (socket lost or shutdown requested)
/// - Closing -> Connecting (a resumable batch job is still pending)
/// - Closing -> Disconnected (terminal; the client must be recreated)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; terminal once the session has given up
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, auth frame sent, waiting for the ack
    AwaitingAuth,
    /// Auth ack received; requests may be sent
    Authenticated,
    /// Socket is going away
    Closing,
}

impl ConnectionState {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, AwaitingAuth)
                | (Connecting, Disconnected)
                | (Connecting, Closing)
                | (AwaitingAuth, Authenticated)
                | (AwaitingAuth, Closing)
                | (Authenticated, Closing)
                | (Closing, Connecting)
                | (Closing, Disconnected)
        )
    }
}

/// Shared, observable connection state.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next`, logging transitions the state machine does not expect.
    ///
    /// Illegal transitions are still applied so the cell always reflects the
    /// socket's real condition.
    pub fn set(&self, next: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_transition_to(next) {
                log::debug!(
                    target: "finx_socket::session",
                    "Connection state {:?} -> {:?}",
                    current,
                    next
                );
            } else {
                log::warn!(
                    target: "finx_socket::session",
                    "Unexpected connection state transition {:?} -> {:?}",
                    current,
                    next
                );
            }
            *current = next;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
