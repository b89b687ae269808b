use std::future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio::{pin, select, time};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::protocol::command_table::{CommandResult, CommandTable};
use crate::protocol::frame::{DsiCommand, Frame, FrameFlags, FrameKind};
use crate::protocol::result_codes::{attn_time, ATTN_MESSAGE, ATTN_SHUTDOWN, ERR_MISC, NO_ERR};
use crate::protocol::transport::Transport;
use crate::session::control::{SessionControl, SessionHandle};
use crate::session::handoff::{SessionToken, TransportHandoff};
use crate::session::heartbeat;
use crate::session::heartbeat::{heartbeat_ticks, TickOutcome};
use crate::session::replay_cache::ReplayCache;
use crate::session::session::Session;
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{SessionHooks, TerminationReason};
use crate::session::session_state::{SessionState, StateEvent};

/// minutes announced with a 'server message' attention
const MESSAGE_ATTENTION_MINUTES: u32 = 5;

/// `Err` means the session must be terminated for the given reason
type Flow = Result<(), TerminationReason>;

/// Whatever woke up the dispatcher's idle wait
enum Wake<T: Transport> {
    Frame(anyhow::Result<Option<Frame>>),
    Tick,
    Control(Option<SessionControl<T>>),
    ShutdownDeadline,
}

/// Drives one session from the accepted connection to its termination: receives frames and
///  dispatches them to the [CommandTable], runs the heartbeat and applies control events from
///  the session's [SessionHandle]s.
///
/// Everything happens in a single task, and the engine is the only owner of the [Session]. Frames
///  are processed strictly in the order they arrive, one command at a time. While a command
///  executes, heartbeat ticks are still processed, but control events are only recorded and
///  applied once the command completes.
pub struct SessionEngine<T: Transport, C: CommandTable> {
    session: Session<T>,
    replay_cache: ReplayCache,
    commands: Arc<C>,
    control: mpsc::Receiver<SessionControl<T>>,
    control_open: bool,
    ticks: Interval,
}

impl<T: Transport, C: CommandTable> SessionEngine<T, C> {
    pub fn new(config: Arc<SessionConfig>, token: SessionToken, transport: T, commands: Arc<C>, hooks: Arc<dyn SessionHooks>) -> anyhow::Result<(SessionEngine<T, C>, SessionHandle<T>)> {
        config.validate()?;

        let (sender, control) = mpsc::channel(config.control_channel_capacity);
        let engine = SessionEngine {
            replay_cache: ReplayCache::new(config.replay_cache_size),
            ticks: heartbeat_ticks(config.tick_interval),
            session: Session::new(token, transport, config, hooks),
            commands,
            control,
            control_open: true,
        };
        Ok((engine, SessionHandle::new(token, sender)))
    }

    pub fn token(&self) -> SessionToken {
        self.session.token()
    }

    /// Runs the session until it terminates, returning the reason. The session's resources are
    ///  released when this returns, and also if the returned future is dropped before it
    ///  completes.
    pub async fn run(self) -> TerminationReason {
        let span = info_span!("session", token = ?self.session.token());
        self.run_loop()
            .instrument(span)
            .await
    }

    async fn run_loop(mut self) -> TerminationReason {
        info!("session started");

        let reason = loop {
            if let Err(reason) = self.safe_point().await {
                break reason;
            }

            let flow = match self.next_wake().await {
                Wake::Frame(Ok(Some(frame))) => self.on_frame(frame).await,
                Wake::Frame(Ok(None)) => self.on_peer_closed().await,
                Wake::Frame(Err(e)) => {
                    warn!("receiving failed: {:#}", e);
                    self.on_transport_fault().await
                }
                Wake::Tick => self.on_tick().await,
                Wake::Control(control) => {
                    self.on_control(control).await;
                    Ok(())
                }
                // the safe point terminates the session
                Wake::ShutdownDeadline => Ok(()),
            };
            if let Err(reason) = flow {
                break reason;
            }
        };

        self.terminate(reason).await
    }

    async fn next_wake(&mut self) -> Wake<T> {
        let control_open = self.control_open;
        let shutdown_deadline = self.session.shutdown_deadline;
        let control = &mut self.control;
        let ticks = &mut self.ticks;

        match self.session.transport_mut() {
            Some(transport) => select! {
                biased;
                event = control.recv(), if control_open => Wake::Control(event),
                _ = ticks.tick() => Wake::Tick,
                _ = sleep_until_deadline(shutdown_deadline) => Wake::ShutdownDeadline,
                frame = transport.receive_frame() => Wake::Frame(frame),
            },
            None => select! {
                biased;
                event = control.recv(), if control_open => Wake::Control(event),
                _ = ticks.tick() => Wake::Tick,
                _ = sleep_until_deadline(shutdown_deadline) => Wake::ShutdownDeadline,
            },
        }
    }

    /// Applies everything that was deferred until no command is running and no frame is being
    ///  processed
    async fn safe_point(&mut self) -> Flow {
        if let Some(reason) = self.session.pending_terminate.take() {
            return Err(reason);
        }

        if let Some(handoff) = self.session.pending_handoff.take() {
            self.complete_handoff(handoff).await?;
        }

        if self.session.state() == SessionState::Disconnected && !self.control_open {
            info!("disconnected, and there is no one left to hand over a new connection");
            return Err(TerminationReason::NoReconnectPossible);
        }

        self.deliver_notifications().await?;

        if let Some(deadline) = self.session.shutdown_deadline {
            if Instant::now() >= deadline {
                info!("announced shutdown is due");
                return Err(TerminationReason::Administrative);
            }
        }
        Ok(())
    }

    async fn on_control(&mut self, control: Option<SessionControl<T>>) {
        debug!("control event {:?}", control);

        match control {
            None => {
                debug!("all session handles were dropped");
                self.control_open = false;
            }
            Some(SessionControl::Handoff(handoff)) => {
                if let Some(superseded) = self.session.pending_handoff.replace(handoff) {
                    warn!("{:?} was superseded by a newer handoff before it was applied", superseded);
                    let mut transport = superseded.transport;
                    transport.close().await;
                }
            }
            Some(SessionControl::Shutdown { grace }) => {
                self.session.pending_shutdown = true;
                self.session.shutdown_grace = grace;
                self.session.shutdown_deadline = Some(Instant::now() + grace);
            }
            Some(SessionControl::RelayMessage) => {
                self.session.pending_message = true;
            }
            Some(SessionControl::Terminate) => {
                self.defer_termination(TerminationReason::Administrative);
            }
        }
    }

    fn defer_termination(&mut self, reason: TerminationReason) {
        if self.session.pending_terminate.is_none() {
            self.session.pending_terminate = Some(reason);
        }
    }

    async fn on_tick(&mut self) -> Flow {
        match heartbeat::on_tick(&mut self.session, Instant::now()) {
            TickOutcome::Nothing => Ok(()),
            TickOutcome::SendKeepalive => {
                if let Err(e) = heartbeat::send_keepalive(&mut self.session).await {
                    warn!("keepalive failed: {:#}", e);
                    return self.on_transport_fault().await;
                }
                Ok(())
            }
            TickOutcome::Terminate(reason) => Err(reason),
        }
    }

    async fn on_peer_closed(&mut self) -> Flow {
        if self.session.is_logged_out() {
            info!("peer closed the connection after logging out");
            return Err(TerminationReason::PeerClosed);
        }
        info!("peer closed the connection unexpectedly");
        self.on_transport_fault().await
    }

    /// The transport is broken: release it and wait for a reconnect, or terminate if the peer
    ///  never authenticated
    async fn on_transport_fault(&mut self) -> Flow {
        let old_state = self.session.state();

        if let Some(mut transport) = self.session.take_transport() {
            transport.close().await;
        }

        let authenticated = self.session.is_authenticated();
        match self.session.apply(StateEvent::TransportFault { authenticated }) {
            SessionState::Dying if old_state == SessionState::ReconnectInProgress => Err(TerminationReason::HandoffFailed),
            SessionState::Dying => Err(TerminationReason::UnauthenticatedDisconnect),
            _ => Ok(()),
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Flow {
        trace!("received {:?}", frame);
        self.session.note_traffic();

        match FrameKind::classify(&frame) {
            Ok(FrameKind::HeartbeatAck) => Ok(()),
            Ok(FrameKind::AttentionAck) => {
                self.session.outstanding_attentions = self.session.outstanding_attentions.saturating_sub(1);
                Ok(())
            }
            Ok(FrameKind::CloseRequest) => {
                info!("peer requested to close the session");
                Err(TerminationReason::PeerClosed)
            }
            Ok(FrameKind::Command) => self.on_command(frame, true).await,
            Ok(FrameKind::CommandNoReply) => self.on_command(frame, false).await,
            Err(e) => {
                warn!("protocol violation in {:?}: {}", frame, e);
                self.reply_error(&frame).await
            }
        }
    }

    async fn reply_error(&mut self, frame: &Frame) -> Flow {
        if frame.flags.contains(FrameFlags::NO_REPLY) {
            return Ok(());
        }
        self.send(&Frame::reply_to(frame.command, frame.request_id, ERR_MISC, Bytes::new())).await
    }

    async fn on_command(&mut self, frame: Frame, with_reply: bool) -> Flow {
        let opcode = match frame.payload.first() {
            Some(&opcode) => opcode,
            None => {
                warn!("command {:?} without an opcode", frame);
                return self.reply_error(&frame).await;
            }
        };

        let Frame { command, request_id, payload, .. } = frame;

        if request_id != self.session.next_request_id() {
            debug!("request id #{} is out of sequence, expected #{}", request_id, self.session.next_request_id());
        }
        self.session.set_next_request_id(request_id.wrapping_add(1));

        let (result_code, reply) = match self.replay_cache.lookup(request_id, opcode) {
            Some(result_code) => {
                debug!("request #{} (opcode {}) is a retransmission - replaying result {}", request_id, opcode, result_code);
                (result_code, Bytes::new())
            }
            None => {
                let result = self.execute(opcode, payload).await;
                if let Some(effect) = result.effect {
                    self.session.apply_effect(effect);
                }
                self.replay_cache.store(request_id, opcode, result.result_code);
                (result.result_code, result.reply)
            }
        };

        if !with_reply {
            return Ok(());
        }
        if !self.session.state().is_connected() {
            // the peer retransmits after reconnecting, and the replay cache answers
            debug!("transport was lost while executing request #{} - dropping the reply", request_id);
            return Ok(());
        }
        self.send(&Frame::reply_to(command, request_id, result_code, reply)).await
    }

    async fn execute(&mut self, opcode: u8, payload: Bytes) -> CommandResult {
        let commands = self.commands.clone();
        let execution = commands.execute(opcode, payload);
        pin!(execution);

        // control events are recorded as soon as they arrive, and applied after the command
        self.session.set_command_running(true);
        let result = loop {
            select! {
                biased;
                _ = self.ticks.tick() => {
                    if let Err(reason) = self.on_tick().await {
                        self.defer_termination(reason);
                    }
                }
                event = self.control.recv(), if self.control_open => {
                    self.on_control(event).await;
                }
                result = &mut execution => break result,
            }
        };
        self.session.set_command_running(false);

        trace!("opcode {} returned {:?}", opcode, result);
        result
    }

    /// Installs a transport that was handed over from elsewhere, replacing the current one (if
    ///  any). Nothing is read from or written to either transport until the new one is in place.
    async fn complete_handoff(&mut self, handoff: TransportHandoff<T>) -> Flow {
        info!("taking over {:?}", handoff);
        let TransportHandoff { request_id, transport } = handoff;

        self.session.apply(StateEvent::HandoffStarted);
        if let Some(mut previous) = self.session.take_transport() {
            debug!("releasing previous transport {:?}", previous);
            previous.close().await;
        }

        self.session.install_transport(transport);
        self.session.set_next_request_id(request_id);
        self.session.reset_silence();
        self.session.apply(StateEvent::HandoffCompleted);

        let ack = Frame::reply_to(DsiCommand::Command.into(), request_id, NO_ERR, Bytes::new());
        if let Err(e) = self.session.send_frame(&ack).await {
            warn!("acknowledging the reconnect failed: {:#}", e);
            if let Some(mut transport) = self.session.take_transport() {
                transport.close().await;
            }
            self.session.apply(StateEvent::HandoffFailed);
            return Err(TerminationReason::HandoffFailed);
        }

        self.session.set_next_request_id(request_id.wrapping_add(1));
        Ok(())
    }

    async fn deliver_notifications(&mut self) -> Flow {
        if self.session.pending_shutdown {
            let minutes = self.session.shutdown_grace.as_secs().div_ceil(60);
            let minutes = u32::try_from(minutes).unwrap_or(u32::MAX);
            if !self.send_attention(ATTN_SHUTDOWN | attn_time(minutes)).await? {
                return Ok(());
            }
            self.session.pending_shutdown = false;
        }

        if self.session.pending_message {
            if !self.send_attention(ATTN_MESSAGE | attn_time(MESSAGE_ATTENTION_MINUTES)).await? {
                return Ok(());
            }
            self.session.pending_message = false;
        }
        Ok(())
    }

    /// Returns whether the attention was actually sent. It is held back while the transport is
    ///  gone, and while the peer has too many unacknowledged attentions.
    async fn send_attention(&mut self, attention_code: u16) -> Result<bool, TerminationReason> {
        if !self.session.state().is_connected() || self.session.is_command_running() {
            return Ok(false);
        }
        if self.session.outstanding_attentions >= self.session.config().max_outstanding_attentions {
            debug!("{} unacknowledged attentions - holding back attention 0x{:04X}", self.session.outstanding_attentions, attention_code);
            return Ok(false);
        }

        if !self.session.has_transport() {
            return Ok(false);
        }

        let frame = Frame::attention(self.session.next_server_request_id(), attention_code);
        debug!("sending attention {:?}", frame);
        match self.session.send_frame(&frame).await {
            Ok(()) => {
                self.session.outstanding_attentions += 1;
                Ok(true)
            }
            Err(e) => {
                warn!("sending attention failed: {:#}", e);
                self.on_transport_fault().await?;
                Ok(false)
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Flow {
        if !self.session.has_transport() {
            debug!("no transport - dropping {:?}", frame);
            return Ok(());
        }

        if let Err(e) = self.session.send_frame(frame).await {
            warn!("sending {:?} failed: {:#}", frame, e);
            return self.on_transport_fault().await;
        }
        Ok(())
    }

    async fn terminate(mut self, reason: TerminationReason) -> TerminationReason {
        // handoffs that are still queued will never be applied
        self.control.close();
        while let Ok(control) = self.control.try_recv() {
            if let SessionControl::Handoff(handoff) = control {
                debug!("rejecting {:?}, the session is terminating", handoff);
                let mut transport = handoff.transport;
                transport.close().await;
            }
        }

        if reason != TerminationReason::PeerClosed && self.session.has_transport() {
            // tell the peer not to bother reconnecting
            let close = Frame::close_session(self.session.next_server_request_id());
            if let Err(e) = self.session.send_frame(&close).await {
                debug!("{:#}", e);
            }
        }

        self.session.release(reason).await;
        reason
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
