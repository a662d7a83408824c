//! Per-channel state machine.
//!
//! A channel binds one session to one named data point.  Its life runs:
//!
//! ```text
//!            Created            ConnectReplySent
//! Invalid ───────────► PendConnectResp ───────────► InService
//!                         │                          │    ▲
//!          RightsChanged  │                          │    │ UpdateCompleted
//!                         ▼                          ▼    │
//!             PendConnectRespUpdatePendAR     InServiceUpdatePendAR
//!                         │ UpdateCompleted
//!                         └──────────────────────► InService
//!
//! any live state ── Shutdown ──► Shutdown (terminal)
//! ```
//!
//! The two `…UpdatePendAR` states park a channel whose access rights changed
//! while it still remembers whether the client has seen the connect reply.
//! The server's outbound worker later sends the matching reply and collapses
//! the channel to `InService`.
//!
//! Everything here is pure: the caller stores the state and asks
//! [`ChannelState::apply`] for the successor.

use thiserror::Error;

/// State of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// Sentinel for records that are not bound to anything (pooled objects).
    Invalid = 0,
    PendConnectResp = 1,
    InService = 2,
    PendConnectRespUpdatePendAR = 3,
    InServiceUpdatePendAR = 4,
    Shutdown = 5,
}

impl TryFrom<u8> for ChannelState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(ChannelState::Invalid),
            1 => Ok(ChannelState::PendConnectResp),
            2 => Ok(ChannelState::InService),
            3 => Ok(ChannelState::PendConnectRespUpdatePendAR),
            4 => Ok(ChannelState::InServiceUpdatePendAR),
            5 => Ok(ChannelState::Shutdown),
            _ => Err(()),
        }
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel record was bound to a data point.
    Created,
    /// The connect reply went out or the first operation was served.
    ConnectReplySent,
    /// Access rights changed and the client must be told.
    RightsChanged,
    /// The deferred reply for a rights change went out.
    UpdateCompleted,
    /// The channel was cleared or its session torn down.
    Shutdown,
}

/// Which of its session's lists a channel in a given state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelList {
    Active,
    PendingAccessUpdate,
    /// Unreachable from any session.
    Detached,
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel cannot go from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: ChannelState,
    pub event: ChannelEvent,
}

impl ChannelState {
    /// The successor of `self` on `event`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for skip transitions such as
    /// `PendConnectResp → InServiceUpdatePendAR` and for anything applied to
    /// `Shutdown`, which is terminal.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pv_core::domain::channel_state::{ChannelEvent, ChannelState};
    ///
    /// let s = ChannelState::Invalid.apply(ChannelEvent::Created).unwrap();
    /// assert_eq!(s, ChannelState::PendConnectResp);
    /// let s = s.apply(ChannelEvent::RightsChanged).unwrap();
    /// assert_eq!(s, ChannelState::PendConnectRespUpdatePendAR);
    /// ```
    pub fn apply(self, event: ChannelEvent) -> Result<ChannelState, TransitionError> {
        use ChannelEvent as E;
        use ChannelState as S;

        let next = match (self, event) {
            (S::Invalid, E::Created) => S::PendConnectResp,
            (S::PendConnectResp, E::ConnectReplySent) => S::InService,
            (S::PendConnectResp, E::RightsChanged) => S::PendConnectRespUpdatePendAR,
            (S::InService, E::RightsChanged) => S::InServiceUpdatePendAR,
            // A second change before the first was delivered is absorbed.
            (S::PendConnectRespUpdatePendAR, E::RightsChanged) => S::PendConnectRespUpdatePendAR,
            (S::InServiceUpdatePendAR, E::RightsChanged) => S::InServiceUpdatePendAR,
            (S::PendConnectRespUpdatePendAR, E::UpdateCompleted) => S::InService,
            (S::InServiceUpdatePendAR, E::UpdateCompleted) => S::InService,
            (
                S::PendConnectResp
                | S::InService
                | S::PendConnectRespUpdatePendAR
                | S::InServiceUpdatePendAR,
                E::Shutdown,
            ) => S::Shutdown,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// The session list a channel in this state lives on.
    pub fn list(self) -> ChannelList {
        match self {
            ChannelState::PendConnectResp | ChannelState::InService => ChannelList::Active,
            ChannelState::PendConnectRespUpdatePendAR | ChannelState::InServiceUpdatePendAR => {
                ChannelList::PendingAccessUpdate
            }
            ChannelState::Invalid | ChannelState::Shutdown => ChannelList::Detached,
        }
    }

    /// Whether the channel is still bound to a session.
    pub fn is_live(self) -> bool {
        self.list() != ChannelList::Detached
    }

    /// Whether the client has been told the channel is connected.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ChannelState::InService | ChannelState::InServiceUpdatePendAR
        )
    }
}
