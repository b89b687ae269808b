#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::handoff::SessionToken;

/// Why a session ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TerminationReason {
    /// the peer sent a close request, or closed the connection after logging out
    PeerClosed,
    /// a transport fault on a session that was never authenticated
    UnauthenticatedDisconnect,
    SleepTimeout,
    DisconnectedTimeout,
    /// disconnected, and nobody is left who could hand over a new transport
    NoReconnectPossible,
    HandoffFailed,
    /// explicit termination request from the supervisor, or an announced shutdown that came due
    Administrative,
    /// the session was dropped without an orderly shutdown, e.g. because its task was aborted
    Aborted,
}

/// Lifecycle notifications for the supervising process, e.g. for logging or metrics.
///
/// Hooks are called synchronously from the session's task and must not block.
#[cfg_attr(test, automock)]
pub trait SessionHooks: Send + Sync + 'static {
    fn on_disconnect(&self, token: SessionToken);

    fn on_reconnect(&self, token: SessionToken);

    /// Called exactly once per session, after its transport was released.
    fn on_terminate(&self, token: SessionToken, reason: TerminationReason);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Disconnected(SessionToken),
    Reconnected(SessionToken),
    Terminated(SessionToken, TerminationReason),
}

/// [SessionHooks] implementation that publishes [SessionEvent]s to any number of subscribers
pub struct SessionEventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}
impl SessionEventNotifier {
    pub fn new() -> SessionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        SessionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for SessionEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHooks for SessionEventNotifier {
    fn on_disconnect(&self, token: SessionToken) {
        self.send_event(SessionEvent::Disconnected(token));
    }

    fn on_reconnect(&self, token: SessionToken) {
        self.send_event(SessionEvent::Reconnected(token));
    }

    fn on_terminate(&self, token: SessionToken, reason: TerminationReason) {
        self.send_event(SessionEvent::Terminated(token, reason));
    }
}
