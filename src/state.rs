//! Connection state machine.
//!
//! ```text
//!                connect          probe ok
//!  Disconnected ────────► Connecting ────────► Connected
//!      ▲  ▲                   │                   │
//!      │  └───── probe fail ──┘                   │ poll fail
//!      │                                          ▼
//!      └────── disconnect / polling stopped ───── Disconnected
//!
//!  Disconnected ── poll ok ──► Connected   (implicit recovery)
//! ```
//!
//! Besides the state, the machine keeps a session epoch. It advances on every
//! connect attempt, every disconnect and every stop; a poll started under an older epoch
//! must not touch the state when it completes.

use crate::types::ConnectionState;

/// Inputs that can move the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The user asked to connect.
    ConnectRequested,
    /// The handshake probe returned an acknowledging body.
    ProbeSucceeded,
    /// The handshake probe failed or was not acknowledged.
    ProbeFailed,
    /// A scheduled `readings` poll succeeded.
    PollSucceeded,
    /// A scheduled `readings` poll failed.
    PollFailed,
    /// The user asked to disconnect.
    DisconnectRequested,
    /// Polling stopped without a failed poll: the auto-connect flag was
    /// cleared or the bearer token disappeared.
    PollingStopped,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    epoch: u64,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current session epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `true` if a result tagged with `epoch` may still be applied.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Feed one trigger. Returns the new state if it changed.
    ///
    /// Triggers that make no sense in the current state (a probe result
    /// outside a handshake, a poll result during one) are ignored.
    pub fn apply(&mut self, trigger: Trigger) -> Option<ConnectionState> {
        use ConnectionState::*;

        let next = match (self.state, trigger) {
            (Disconnected, Trigger::ConnectRequested) => {
                self.epoch += 1;
                Connecting
            }
            (Connecting, Trigger::ProbeSucceeded) => Connected,
            (Connecting, Trigger::ProbeFailed) => Disconnected,
            (Disconnected, Trigger::PollSucceeded) => Connected,
            (Connected, Trigger::PollFailed) => Disconnected,
            (_, Trigger::DisconnectRequested | Trigger::PollingStopped) => {
                self.epoch += 1;
                Disconnected
            }
            (state, _) => state,
        };

        if next == self.state {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }
}
