use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::protocol::result_codes::ERR_NOT_SUPPORTED;

/// Side effects of a command that the session engine needs to know about
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionEffect {
    /// the peer logged in - a later transport fault leaves the session waiting for a reconnect
    Authenticated,
    /// the peer logged out - the session terminates cleanly when the peer closes the connection
    LoggedOut,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub result_code: u32,
    pub reply: Bytes,
    pub effect: Option<SessionEffect>,
}

impl CommandResult {
    pub fn new(result_code: u32, reply: Bytes) -> CommandResult {
        CommandResult {
            result_code,
            reply,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: SessionEffect) -> CommandResult {
        self.effect = Some(effect);
        self
    }
}

/// The application's command set, as seen by the session engine.
///
/// The engine calls this at most once per distinct (request id, opcode) pair that is still in its
///  replay cache, and it never calls it concurrently for one session. Handlers must finish in
///  bounded time: a stuck handler stalls its session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandTable: Send + Sync + 'static {
    /// Handler failures are reported through the result code, never as a Rust error: a failing
    ///  command must not affect the session's state.
    async fn execute(&self, opcode: u8, payload: Bytes) -> CommandResult;
}

/// A single command, registered for one opcode in a [CommandRegistry]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    fn opcode(&self) -> u8;

    /// `payload` is the command's full payload, starting with the opcode byte
    async fn handle(&self, payload: Bytes) -> CommandResult;
}

/// [CommandTable] implementation dispatching by opcode to registered [CommandHandler]s. Unknown
///  opcodes are answered with [ERR_NOT_SUPPORTED].
#[derive(Default)]
pub struct CommandRegistry {
    handlers: FxHashMap<u8, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        Default::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) -> anyhow::Result<()> {
        match self.handlers.entry(handler.opcode()) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for opcode {}", handler.opcode()))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn deregister(&mut self, opcode: u8) -> anyhow::Result<()> {
        if self.handlers.remove(&opcode).is_none() {
            return Err(anyhow!("deregistering opcode {} which was not previously registered", opcode));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandTable for CommandRegistry {
    async fn execute(&self, opcode: u8, payload: Bytes) -> CommandResult {
        match self.handlers.get(&opcode) {
            Some(handler) => handler.handle(payload).await,
            None => {
                debug!("no handler for opcode {}", opcode);
                CommandResult::new(ERR_NOT_SUPPORTED, Bytes::new())
            }
        }
    }
}
