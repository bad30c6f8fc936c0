//! Streaming connection state machine.

use crate::error::{SyncError, SyncResult};

/// The state of the push notification pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,
    /// Waiting for a streaming token.
    Authenticating,
    /// Waiting for the streaming endpoint to accept the stream.
    Connecting,
    /// Receiving notifications.
    Connected,
    /// Failed; waiting for the owner to restart.
    Retrying,
    /// Streaming is off for the rest of the session.
    Disabled,
}

impl ConnectionState {
    /// Returns true while a connection is being set up or is open.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Returns true if authentication may be (re)started.
    pub fn can_start(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Retrying)
    }

    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Authenticating)
                | (Authenticating, Connecting | Retrying | Disabled | Disconnected)
                | (Connecting, Connected | Retrying | Disabled | Disconnected)
                | (Connected, Authenticating | Retrying | Disabled | Disconnected)
                | (Retrying, Authenticating | Disconnected)
        )
    }

    /// Validates a transition and returns the new state.
    pub fn transition_to(self, next: ConnectionState) -> SyncResult<ConnectionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SyncError::InvalidStateTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_checks() {
        assert!(ConnectionState::Disconnected.can_start());
        assert!(ConnectionState::Retrying.can_start());
        assert!(!ConnectionState::Connected.can_start());
        assert!(!ConnectionState::Disabled.can_start());

        assert!(ConnectionState::Authenticating.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Retrying.is_active());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn happy_path_transitions() {
        let state = ConnectionState::Disconnected
            .transition_to(ConnectionState::Authenticating)
            .and_then(|s| s.transition_to(ConnectionState::Connecting))
            .and_then(|s| s.transition_to(ConnectionState::Connected))
            .unwrap();
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn disabled_is_terminal() {
        for next in [
            ConnectionState::Disconnected,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Retrying,
        ] {
            assert!(!ConnectionState::Disabled.can_transition_to(next));
        }
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let err = ConnectionState::Disconnected
            .transition_to(ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert!(err.to_string().contains("Disconnected"));
    }
}
