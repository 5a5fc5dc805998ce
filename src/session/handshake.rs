//! Waiting for the auth handshake.

use super::{ConnectionState, Session, SessionFailure};
use crate::error::{ClientError, ClientResult};

/// Message reported when the service never acknowledges the API key.
pub(crate) const INVALID_KEY_MESSAGE: &str = "Invalid API KEY";

impl Session {
    /// Resolve once the session is authenticated, or fail with the reason it
    /// gave up.
    ///
    /// The supervisor bounds both the socket open and the ack wait by the
    /// configured auth timeout, so this always settles.
    pub async fn wait_authenticated(&self) -> ClientResult<()> {
        let mut states = self.shared.state.subscribe();
        let settled = states
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Authenticated | ConnectionState::Disconnected
                )
            })
            .await
            .map(|state| *state);

        match settled {
            Ok(ConnectionState::Authenticated) => Ok(()),
            _ => Err(failure_error(self.shared.last_failure())),
        }
    }
}

pub(crate) fn failure_error(failure: Option<SessionFailure>) -> ClientError {
    match failure {
        Some(SessionFailure::AuthTimeout) => ClientError::authentication(INVALID_KEY_MESSAGE),
        Some(SessionFailure::Connect(message)) => {
            ClientError::connection(format!("Could not open socket: {}", message))
        }
        Some(SessionFailure::Lost(message)) => {
            ClientError::connection(format!("Socket closed before authentication: {}", message))
        }
        None => ClientError::ConnectionClosed,
    }
}
