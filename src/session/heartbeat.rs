//! The heartbeat is the only timeout authority of a session. It ticks at a fixed interval and
//!  counts the ticks without inbound traffic, escalating from idle to sleeping to terminated (or
//!  from disconnected to terminated). While the session is running, every silent tick probes the
//!  peer with a keepalive.

use std::time::Duration;

use tokio::time;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::protocol::frame::Frame;
use crate::protocol::transport::Transport;
use crate::session::session::Session;
use crate::session::session_events::TerminationReason;
use crate::session::session_state::{SessionState, StateEvent};

/// The tick source for a session. The first tick is one full period from now, and a tick that
///  was missed (e.g. because a frame took long to process) is delayed rather than caught up.
pub fn heartbeat_ticks(period: Duration) -> Interval {
    let mut ticks = time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks
}

/// What the session's engine has to do after a tick
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TickOutcome {
    Nothing,
    /// the peer was silent, but the session is still running: probe it
    SendKeepalive,
    Terminate(TerminationReason),
}

pub fn on_tick<T: Transport>(session: &mut Session<T>, now: Instant) -> TickOutcome {
    if let Some(deadline) = session.shutdown_deadline {
        if now >= deadline {
            debug!("announced shutdown is due");
            return TickOutcome::Terminate(TerminationReason::Administrative);
        }
    }

    if session.take_traffic_flag() {
        session.reset_silence();
        return TickOutcome::Nothing;
    }

    let old_state = session.state();
    let silence_ticks = session.increment_silence();
    trace!("silent tick #{} in state {:?}", silence_ticks, old_state);

    let command_running = session.is_command_running();
    let new_state = session.apply(StateEvent::SilentTick { silence_ticks, command_running });

    match (old_state, new_state) {
        (SessionState::Running, SessionState::Running) => TickOutcome::SendKeepalive,
        (SessionState::Disconnected, SessionState::Dying) => TickOutcome::Terminate(TerminationReason::DisconnectedTimeout),
        (_, SessionState::Dying) => TickOutcome::Terminate(TerminationReason::SleepTimeout),
        _ => TickOutcome::Nothing,
    }
}

/// Sends a tickle to the peer, bounded by the configured send timeout
pub async fn send_keepalive<T: Transport>(session: &mut Session<T>) -> anyhow::Result<()> {
    let frame = Frame::tickle(session.next_server_request_id());
    trace!("sending keepalive {:?}", frame);
    session.send_frame(&frame).await
}
