//! The per-connection session: its state machine, heartbeat, replay cache, reconnect handoff
//!  and the engine that drives all of them.

pub mod control;
pub mod dispatcher;
pub mod handoff;
pub mod heartbeat;
pub mod replay_cache;
pub mod session;
pub mod session_config;
pub mod session_events;
pub mod session_state;
