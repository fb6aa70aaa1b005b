//! Lifecycle of one sync round against one peer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Handshaking,
    ExchangingChanges,
    Applying,
    Failed,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Handshaking => "handshaking",
            Self::ExchangingChanges => "exchanging_changes",
            Self::Applying => "applying",
            Self::Failed => "failed",
        }
    }

    const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Handshaking)
                | (Self::Handshaking, Self::ExchangingChanges)
                | (Self::ExchangingChanges, Self::Applying)
                | (Self::Applying, Self::ExchangingChanges)
                | (Self::ExchangingChanges | Self::Applying, Self::Idle)
                | (_, Self::Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks a round's state and every state it passed through.
#[derive(Debug, Clone)]
pub struct SyncSession {
    peer_id: DeviceId,
    state: SessionState,
    history: Vec<SessionState>,
}

impl SyncSession {
    pub fn new(peer_id: DeviceId) -> Self {
        Self {
            peer_id,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if self.state == SessionState::Failed || !self.state.can_advance_to(next) {
            return Err(Error::Protocol(format!(
                "sync session cannot move from {} to {next}",
                self.state
            )));
        }
        tracing::debug!(
            peer_id = %self.peer_id,
            from = %self.state,
            to = %next,
            "Sync session transition"
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Mark the round failed; terminal.
    pub fn fail(&mut self) {
        if self.state != SessionState::Failed {
            tracing::debug!(peer_id = %self.peer_id, from = %self.state, "Sync session failed");
            self.state = SessionState::Failed;
            self.history.push(SessionState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_round_walks_every_state() {
        let mut session = SyncSession::new(DeviceId::new());
        for next in [
            SessionState::Handshaking,
            SessionState::ExchangingChanges,
            SessionState::Applying,
            SessionState::ExchangingChanges,
            SessionState::Idle,
        ] {
            session.advance(next).unwrap();
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.history().len(), 6);
    }

    #[test]
    fn skipping_the_handshake_is_rejected() {
        let mut session = SyncSession::new(DeviceId::new());
        assert!(session.advance(SessionState::Applying).is_err());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn failed_is_terminal() {
        let mut session = SyncSession::new(DeviceId::new());
        session.advance(SessionState::Handshaking).unwrap();
        session.fail();
        session.fail();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.history(),
            &[
                SessionState::Idle,
                SessionState::Handshaking,
                SessionState::Failed
            ]
        );
        assert!(session.advance(SessionState::Idle).is_err());
    }
}
