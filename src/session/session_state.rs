use crate::session::session_config::SessionConfig;

/// Lifecycle state of a session. [SessionState::Dying] is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionState {
    Running,
    Sleeping,
    Disconnected,
    ReconnectInProgress,
    Dying,
}

/// Everything that can move a session from one state to another
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateEvent {
    /// a frame arrived from the peer
    Traffic,
    /// a heartbeat tick without traffic since the previous one. `silence_ticks` is the already
    ///  incremented count for the current state.
    SilentTick { silence_ticks: u32, command_running: bool },
    /// read or write error, or the peer closed the connection without logging out
    TransportFault { authenticated: bool },
    HandoffStarted,
    HandoffCompleted,
    HandoffFailed,
    /// peer logout, administrative shutdown or any other unrecoverable condition
    Terminate,
}

impl SessionState {
    /// The session's transition function. It is total: every state has exactly one successor for
    ///  every event, possibly itself.
    pub fn next(self, event: StateEvent, config: &SessionConfig) -> SessionState {
        use SessionState::*;

        match (self, event) {
            (Dying, _) => Dying,
            (_, StateEvent::Terminate) => Dying,

            (Sleeping, StateEvent::Traffic) => Running,
            (state, StateEvent::Traffic) => state,

            (Running, StateEvent::SilentTick { silence_ticks, command_running }) => {
                if !command_running && silence_ticks >= config.idle_ticks_before_sleep {
                    Sleeping
                }
                else {
                    Running
                }
            }
            (Sleeping, StateEvent::SilentTick { silence_ticks, .. }) => {
                if silence_ticks >= config.sleep_timeout_ticks { Dying } else { Sleeping }
            }
            (Disconnected, StateEvent::SilentTick { silence_ticks, .. }) => {
                if silence_ticks >= config.disconnected_timeout_ticks { Dying } else { Disconnected }
            }
            (ReconnectInProgress, StateEvent::SilentTick { .. }) => ReconnectInProgress,

            // an unauthenticated peer cannot be trusted to reconnect, so there is no point in waiting
            (Running | Sleeping, StateEvent::TransportFault { authenticated }) => {
                if authenticated { Disconnected } else { Dying }
            }
            (Disconnected, StateEvent::TransportFault { .. }) => Disconnected,
            (ReconnectInProgress, StateEvent::TransportFault { .. }) => Dying,

            (_, StateEvent::HandoffStarted) => ReconnectInProgress,

            (ReconnectInProgress, StateEvent::HandoffCompleted) => Running,
            (state, StateEvent::HandoffCompleted) => state,

            (_, StateEvent::HandoffFailed) => Dying,
        }
    }

    /// whether the session has (or should have) a transport in this state
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Sleeping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use SessionState::*;

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new();
        config.idle_ticks_before_sleep = 3;
        config.sleep_timeout_ticks = 5;
        config.disconnected_timeout_ticks = 5;
        config
    }

    const TICK_BELOW: StateEvent = StateEvent::SilentTick { silence_ticks: 2, command_running: false };
    const TICK_IDLE: StateEvent = StateEvent::SilentTick { silence_ticks: 3, command_running: false };
    const TICK_IDLE_BUSY: StateEvent = StateEvent::SilentTick { silence_ticks: 3, command_running: true };
    const TICK_TIMEOUT: StateEvent = StateEvent::SilentTick { silence_ticks: 5, command_running: false };
    const FAULT_AUTH: StateEvent = StateEvent::TransportFault { authenticated: true };
    const FAULT_ANON: StateEvent = StateEvent::TransportFault { authenticated: false };

    #[rstest]
    #[case(Running, StateEvent::Traffic, Running)]
    #[case(Running, TICK_BELOW, Running)]
    #[case(Running, TICK_IDLE, Sleeping)]
    #[case(Running, TICK_IDLE_BUSY, Running)]
    #[case(Running, TICK_TIMEOUT, Sleeping)]
    #[case(Running, FAULT_AUTH, Disconnected)]
    #[case(Running, FAULT_ANON, Dying)]
    #[case(Running, StateEvent::HandoffStarted, ReconnectInProgress)]
    #[case(Running, StateEvent::HandoffCompleted, Running)]
    #[case(Running, StateEvent::HandoffFailed, Dying)]
    #[case(Running, StateEvent::Terminate, Dying)]

    #[case(Sleeping, StateEvent::Traffic, Running)]
    #[case(Sleeping, TICK_BELOW, Sleeping)]
    #[case(Sleeping, TICK_IDLE, Sleeping)]
    #[case(Sleeping, TICK_IDLE_BUSY, Sleeping)]
    #[case(Sleeping, TICK_TIMEOUT, Dying)]
    #[case(Sleeping, FAULT_AUTH, Disconnected)]
    #[case(Sleeping, FAULT_ANON, Dying)]
    #[case(Sleeping, StateEvent::HandoffStarted, ReconnectInProgress)]
    #[case(Sleeping, StateEvent::HandoffCompleted, Sleeping)]
    #[case(Sleeping, StateEvent::HandoffFailed, Dying)]
    #[case(Sleeping, StateEvent::Terminate, Dying)]

    #[case(Disconnected, StateEvent::Traffic, Disconnected)]
    #[case(Disconnected, TICK_BELOW, Disconnected)]
    #[case(Disconnected, TICK_IDLE, Disconnected)]
    #[case(Disconnected, TICK_IDLE_BUSY, Disconnected)]
    #[case(Disconnected, TICK_TIMEOUT, Dying)]
    #[case(Disconnected, FAULT_AUTH, Disconnected)]
    #[case(Disconnected, FAULT_ANON, Disconnected)]
    #[case(Disconnected, StateEvent::HandoffStarted, ReconnectInProgress)]
    #[case(Disconnected, StateEvent::HandoffCompleted, Disconnected)]
    #[case(Disconnected, StateEvent::HandoffFailed, Dying)]
    #[case(Disconnected, StateEvent::Terminate, Dying)]

    #[case(ReconnectInProgress, StateEvent::Traffic, ReconnectInProgress)]
    #[case(ReconnectInProgress, TICK_BELOW, ReconnectInProgress)]
    #[case(ReconnectInProgress, TICK_IDLE, ReconnectInProgress)]
    #[case(ReconnectInProgress, TICK_IDLE_BUSY, ReconnectInProgress)]
    #[case(ReconnectInProgress, TICK_TIMEOUT, ReconnectInProgress)]
    #[case(ReconnectInProgress, FAULT_AUTH, Dying)]
    #[case(ReconnectInProgress, FAULT_ANON, Dying)]
    #[case(ReconnectInProgress, StateEvent::HandoffStarted, ReconnectInProgress)]
    #[case(ReconnectInProgress, StateEvent::HandoffCompleted, Running)]
    #[case(ReconnectInProgress, StateEvent::HandoffFailed, Dying)]
    #[case(ReconnectInProgress, StateEvent::Terminate, Dying)]

    #[case(Dying, StateEvent::Traffic, Dying)]
    #[case(Dying, TICK_BELOW, Dying)]
    #[case(Dying, TICK_IDLE, Dying)]
    #[case(Dying, TICK_IDLE_BUSY, Dying)]
    #[case(Dying, TICK_TIMEOUT, Dying)]
    #[case(Dying, FAULT_AUTH, Dying)]
    #[case(Dying, FAULT_ANON, Dying)]
    #[case(Dying, StateEvent::HandoffStarted, Dying)]
    #[case(Dying, StateEvent::HandoffCompleted, Dying)]
    #[case(Dying, StateEvent::HandoffFailed, Dying)]
    #[case(Dying, StateEvent::Terminate, Dying)]
    fn test_transition(#[case] from: SessionState, #[case] event: StateEvent, #[case] expected: SessionState) {
        assert_eq!(from.next(event, &config()), expected);
    }

    #[rstest]
    #[case(Running, true)]
    #[case(Sleeping, true)]
    #[case(Disconnected, false)]
    #[case(ReconnectInProgress, false)]
    #[case(Dying, false)]
    fn test_is_connected(#[case] state: SessionState, #[case] expected: bool) {
        assert_eq!(state.is_connected(), expected);
    }
}
