//! Primary reconnect: a client whose connection broke connects again, and whoever accepts the new
//!  connection hands the transport over to the session that still holds the client's state.
//!  The client continues where it left off without logging in again.

use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::transport::Transport;
use crate::session::control::SessionHandle;

/// Identifies a logical session independently of the transport that currently backs it. The peer
///  learns the token after login and presents it when reconnecting.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn new_random() -> SessionToken {
        SessionToken(rand::random())
    }

    pub const fn from_raw(raw: u64) -> SessionToken {
        SessionToken(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl Debug for SessionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S-{:016X}", self.0)
    }
}

/// Transfers ownership of a freshly accepted transport to an existing session.
///
/// `request_id` is the id of the peer's request that triggered the reconnect on the accepting
///  side. The session acknowledges that request on the new transport, and continues expecting
///  request ids from there.
pub struct TransportHandoff<T: Transport> {
    pub request_id: u16,
    pub transport: T,
}

impl<T: Transport> Debug for TransportHandoff<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportHandoff{{#{}:{:?}}}", self.request_id, self.transport)
    }
}

/// Routes reconnect handoffs to the sessions they belong to. The supervisor registers each
///  session's handle under its token and removes it when the session terminates.
pub struct HandoffDirectory<T: Transport> {
    sessions: RwLock<FxHashMap<SessionToken, SessionHandle<T>>>,
}

impl<T: Transport> HandoffDirectory<T> {
    pub fn new() -> HandoffDirectory<T> {
        HandoffDirectory {
            sessions: Default::default(),
        }
    }

    pub async fn register(&self, handle: SessionHandle<T>) -> anyhow::Result<()> {
        let token = handle.token();
        match self.sessions.write().await
            .entry(token)
        {
            Entry::Occupied(_) => Err(anyhow!("a session is already registered for token {:?}", token)),
            Entry::Vacant(e) => {
                e.insert(handle);
                Ok(())
            }
        }
    }

    pub async fn deregister(&self, token: SessionToken) -> anyhow::Result<()> {
        if self.sessions.write().await.remove(&token).is_none() {
            return Err(anyhow!("deregistering token {:?} which was not previously registered", token));
        }
        Ok(())
    }

    pub async fn contains(&self, token: SessionToken) -> bool {
        self.sessions.read().await.contains_key(&token)
    }

    /// Passes `transport` on to the session registered for `token`. If there is no such session,
    ///  or it terminated in the meantime, the transport is returned so the caller can continue
    ///  with it as a fresh connection.
    pub async fn hand_off(&self, token: SessionToken, request_id: u16, transport: T) -> Result<(), T> {
        let handle = match self.sessions.read().await.get(&token) {
            Some(handle) => handle.clone(),
            None => {
                debug!("reconnect for unknown session {:?}", token);
                return Err(transport);
            }
        };

        match handle.hand_off(TransportHandoff { request_id, transport }).await {
            Ok(()) => {
                info!("handed off transport to session {:?}", token);
                Ok(())
            }
            Err(handoff) => {
                warn!("session {:?} terminated before the handoff could be delivered - removing it", token);
                self.sessions.write().await.remove(&token);
                Err(handoff.transport)
            }
        }
    }
}

impl<T: Transport> Default for HandoffDirectory<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::control::SessionControl;
    use crate::test_util::transport::ScriptedTransport;
    use tokio::sync::mpsc;

    #[test]
    fn test_token_debug() {
        assert_eq!(format!("{:?}", SessionToken::from_raw(0xabc)), "S-0000000000000ABC");
    }

    #[tokio::test]
    async fn test_hand_off_to_registered_session() {
        let (sender, mut receiver) = mpsc::channel(4);
        let token = SessionToken::from_raw(1);
        let directory = HandoffDirectory::new();
        directory.register(SessionHandle::new(token, sender)).await.unwrap();

        let (transport, _peer) = ScriptedTransport::new("new");
        assert!(directory.hand_off(token, 42, transport).await.is_ok());

        match receiver.recv().await {
            Some(SessionControl::Handoff(handoff)) => assert_eq!(handoff.request_id, 42),
            other => panic!("expected handoff, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hand_off_to_unknown_session() {
        let directory = HandoffDirectory::new();
        let (transport, _peer) = ScriptedTransport::new("new");
        assert!(directory.hand_off(SessionToken::from_raw(1), 42, transport).await.is_err());
    }

    #[tokio::test]
    async fn test_hand_off_to_terminated_session() {
        let (sender, receiver) = mpsc::channel(4);
        let token = SessionToken::from_raw(1);
        let directory = HandoffDirectory::new();
        directory.register(SessionHandle::new(token, sender)).await.unwrap();
        drop(receiver);

        let (transport, _peer) = ScriptedTransport::new("new");
        let returned = directory.hand_off(token, 42, transport).await;
        assert!(returned.is_err());
        assert!(!directory.contains(token).await);
    }

    #[tokio::test]
    async fn test_register_deregister() {
        let (sender, _receiver) = mpsc::channel::<SessionControl<ScriptedTransport>>(4);
        let token = SessionToken::from_raw(1);
        let directory = HandoffDirectory::new();

        directory.register(SessionHandle::new(token, sender.clone())).await.unwrap();
        assert!(directory.register(SessionHandle::new(token, sender)).await.is_err());
        assert!(directory.contains(token).await);

        directory.deregister(token).await.unwrap();
        assert!(directory.deregister(token).await.is_err());
        assert!(!directory.contains(token).await);
    }
}
