use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::protocol::command_table::SessionEffect;
use crate::protocol::frame::Frame;
use crate::protocol::transport::Transport;
use crate::session::handoff::{SessionToken, TransportHandoff};
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{SessionHooks, TerminationReason};
use crate::session::session_state::{SessionState, StateEvent};

/// All state of one logical connection, independent of the transport that currently backs it.
///
/// A [Session] is owned by exactly one engine and passed around as `&mut Session`; nothing else
///  ever has access to it.
///
/// Releasing the session's resources happens exactly once: either explicitly through
///  [Session::release], or when the session is dropped without having been released (e.g. if its
///  task is aborted), in which case the transport is closed by dropping it.
pub struct Session<T: Transport> {
    token: SessionToken,
    config: Arc<SessionConfig>,
    hooks: Arc<dyn SessionHooks>,

    transport: Option<T>,
    state: SessionState,
    silence_ticks: u32,
    traffic_since_last_tick: bool,

    pub(crate) pending_message: bool,
    pub(crate) pending_shutdown: bool,
    pub(crate) shutdown_grace: std::time::Duration,
    pub(crate) shutdown_deadline: Option<Instant>,
    pub(crate) pending_handoff: Option<TransportHandoff<T>>,
    pub(crate) pending_terminate: Option<TerminationReason>,
    pub(crate) outstanding_attentions: u32,

    next_request_id: u16,
    server_request_id: u16,
    current_command_running: bool,
    authenticated: bool,
    logged_out: bool,

    termination_reason: Option<TerminationReason>,
}

impl<T: Transport> Session<T> {
    pub fn new(token: SessionToken, transport: T, config: Arc<SessionConfig>, hooks: Arc<dyn SessionHooks>) -> Session<T> {
        Session {
            token,
            config,
            hooks,
            transport: Some(transport),
            state: SessionState::Running,
            silence_ticks: 0,
            traffic_since_last_tick: false,
            pending_message: false,
            pending_shutdown: false,
            shutdown_grace: Default::default(),
            shutdown_deadline: None,
            pending_handoff: None,
            pending_terminate: None,
            outstanding_attentions: 0,
            next_request_id: 0,
            server_request_id: 0,
            current_command_running: false,
            authenticated: false,
            logged_out: false,
            termination_reason: None,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn silence_ticks(&self) -> u32 {
        self.silence_ticks
    }

    pub fn next_request_id(&self) -> u16 {
        self.next_request_id
    }

    pub fn is_command_running(&self) -> bool {
        self.current_command_running
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn has_pending_message(&self) -> bool {
        self.pending_message
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    pub(crate) fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    pub(crate) fn take_transport(&mut self) -> Option<T> {
        self.transport.take()
    }

    pub(crate) fn install_transport(&mut self, transport: T) {
        debug_assert!(self.transport.is_none(), "the previous transport must be released first");
        self.transport = Some(transport);
    }

    /// Sends a frame on the current transport. A send that does not complete within
    ///  `keepalive_send_timeout` fails: a peer that stopped reading is as dead as one whose
    ///  connection broke, and waiting for it would stall the heartbeat.
    pub(crate) async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let timeout = self.config.keepalive_send_timeout;
        let transport = self.transport.as_mut()
            .ok_or_else(|| anyhow!("no transport for sending {:?}", frame))?;

        trace!("sending {:?}", frame);
        match time::timeout(timeout, transport.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => bail!("sending {:?} did not complete within {:?}", frame, timeout),
        }
    }

    pub(crate) fn set_next_request_id(&mut self, request_id: u16) {
        self.next_request_id = request_id;
    }

    pub(crate) fn set_command_running(&mut self, running: bool) {
        self.current_command_running = running;
    }

    pub(crate) fn apply_effect(&mut self, effect: SessionEffect) {
        debug!("session {:?}: {:?}", self.token, effect);
        match effect {
            SessionEffect::Authenticated => self.authenticated = true,
            SessionEffect::LoggedOut => self.logged_out = true,
        }
    }

    /// id for the next request the server sends on its own (keepalives, attentions)
    pub(crate) fn next_server_request_id(&mut self) -> u16 {
        let id = self.server_request_id;
        self.server_request_id = self.server_request_id.wrapping_add(1);
        id
    }

    /// inbound traffic of any kind: the peer is alive
    pub(crate) fn note_traffic(&mut self) {
        self.traffic_since_last_tick = true;
        self.silence_ticks = 0;
        self.apply(StateEvent::Traffic);
    }

    /// Returns whether there was traffic since the previous call, resetting the flag
    pub(crate) fn take_traffic_flag(&mut self) -> bool {
        std::mem::replace(&mut self.traffic_since_last_tick, false)
    }

    pub(crate) fn reset_silence(&mut self) {
        self.silence_ticks = 0;
    }

    pub(crate) fn increment_silence(&mut self) -> u32 {
        self.silence_ticks = self.silence_ticks.saturating_add(1);
        self.silence_ticks
    }

    /// Feeds an event into the state machine. Silence is counted per state, so it starts from zero
    ///  whenever the state changes.
    pub(crate) fn apply(&mut self, event: StateEvent) -> SessionState {
        let old_state = self.state;
        let new_state = old_state.next(event, &self.config);
        if new_state == old_state {
            return new_state;
        }

        debug!("session {:?}: {:?} -> {:?} on {:?}", self.token, old_state, new_state, event);
        self.state = new_state;
        self.silence_ticks = 0;

        match (old_state, new_state) {
            (_, SessionState::Disconnected) => {
                info!("session {:?} disconnected - waiting for reconnect", self.token);
                self.hooks.on_disconnect(self.token);
            }
            (SessionState::ReconnectInProgress, SessionState::Running) => {
                info!("session {:?} reconnected", self.token);
                self.hooks.on_reconnect(self.token);
            }
            _ => {}
        }
        new_state
    }

    /// Terminates the session: closes the transport if there is one and notifies the hooks. This
    ///  is idempotent, only the first call has an effect.
    pub async fn release(&mut self, reason: TerminationReason) {
        if self.termination_reason.is_some() {
            return;
        }
        self.termination_reason = Some(reason);
        self.apply(StateEvent::Terminate);

        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(handoff) = self.pending_handoff.take() {
            debug!("session {:?}: discarding pending {:?}", self.token, handoff);
            let mut transport = handoff.transport;
            transport.close().await;
        }

        info!("session {:?} terminated: {:?}", self.token, reason);
        self.hooks.on_terminate(self.token, reason);
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.termination_reason.is_none() {
            self.termination_reason = Some(TerminationReason::Aborted);
            self.state = SessionState::Dying;
            info!("session {:?} dropped without orderly termination", self.token);
            self.hooks.on_terminate(self.token, TerminationReason::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session_events::MockSessionHooks;
    use crate::test_util::transport::{ScriptedTransport, TransportEvent};
    use mockall::predicate::eq;

    const TOKEN: SessionToken = SessionToken::from_raw(7);

    fn new_session(hooks: MockSessionHooks) -> (Session<ScriptedTransport>, crate::test_util::transport::ScriptedPeer) {
        let (transport, peer) = ScriptedTransport::new("t");
        let session = Session::new(TOKEN, transport, Arc::new(SessionConfig::new()), Arc::new(hooks));
        (session, peer)
    }

    #[tokio::test]
    async fn test_release_exactly_once() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_terminate()
            .with(eq(TOKEN), eq(TerminationReason::Administrative))
            .times(1)
            .return_const(());
        let (mut session, peer) = new_session(hooks);

        session.release(TerminationReason::Administrative).await;
        session.release(TerminationReason::PeerClosed).await;
        drop(session);

        assert_eq!(peer.events(), vec![TransportEvent::Closed]);
    }

    #[tokio::test]
    async fn test_drop_without_release() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_terminate()
            .with(eq(TOKEN), eq(TerminationReason::Aborted))
            .times(1)
            .return_const(());
        let (session, _peer) = new_session(hooks);

        drop(session);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_hooks() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_disconnect().with(eq(TOKEN)).times(1).return_const(());
        hooks.expect_on_reconnect().with(eq(TOKEN)).times(1).return_const(());
        hooks.expect_on_terminate().times(1).return_const(());
        let (mut session, _peer) = new_session(hooks);

        session.apply(StateEvent::TransportFault { authenticated: true });
        assert_eq!(session.state(), SessionState::Disconnected);
        // no second notification for a fault while already disconnected
        session.apply(StateEvent::TransportFault { authenticated: true });

        session.apply(StateEvent::HandoffStarted);
        session.apply(StateEvent::HandoffCompleted);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_silence_resets_on_state_change() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_terminate().return_const(());
        let (mut session, _peer) = new_session(hooks);

        for _ in 0..3 {
            session.increment_silence();
        }
        assert_eq!(session.silence_ticks(), 3);

        session.apply(StateEvent::SilentTick { silence_ticks: 4, command_running: false });
        assert_eq!(session.state(), SessionState::Sleeping);
        assert_eq!(session.silence_ticks(), 0);
    }

    #[tokio::test]
    async fn test_effects() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_terminate().return_const(());
        let (mut session, _peer) = new_session(hooks);

        assert!(!session.is_authenticated());
        session.apply_effect(SessionEffect::Authenticated);
        assert!(session.is_authenticated());

        assert!(!session.is_logged_out());
        session.apply_effect(SessionEffect::LoggedOut);
        assert!(session.is_logged_out());
    }

    #[tokio::test]
    async fn test_server_request_ids_wrap() {
        let mut hooks = MockSessionHooks::new();
        hooks.expect_on_terminate().return_const(());
        let (mut session, _peer) = new_session(hooks);
        session.server_request_id = u16::MAX;

        assert_eq!(session.next_server_request_id(), u16::MAX);
        assert_eq!(session.next_server_request_id(), 0);
    }
}
