use serde::Serialize;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Camera selection, nothing on the network yet
    #[default]
    Setup,
    /// Session requested, socket opening
    Connecting,
    /// Socket open, frames flowing
    Active,
    /// Terminal
    Ended,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Setup => "setup",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Active => "active",
            SessionPhase::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Ended)
    }
}

/// Inputs that can move the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    StartRequested,
    SocketOpened,
    /// Session creation failed, socket refused, or the connect deadline passed
    ConnectFailed,
    /// Open socket errored or closed without `session_ended`
    SocketLost,
    EndRequested,
    /// `session_ended` from the server
    ServerEnded,
}

/// The whole state machine. `None` means the event does not apply in `phase`
/// and is ignored.
pub fn transition(phase: SessionPhase, event: PhaseEvent) -> Option<SessionPhase> {
    use PhaseEvent::*;
    use SessionPhase::*;

    match (phase, event) {
        (Setup, StartRequested) => Some(Connecting),

        (Connecting, SocketOpened) => Some(Active),
        (Connecting, ConnectFailed) => Some(Setup),
        (Connecting, EndRequested) => Some(Ended),

        (Active, EndRequested) => Some(Ended),
        (Active, ServerEnded) => Some(Ended),
        (Active, SocketLost) => Some(Setup),

        _ => None,
    }
}
