use std::fmt::{Debug, Formatter};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use crate::protocol::transport::Transport;
use crate::session::handoff::{SessionToken, TransportHandoff};

/// Asynchronous events for a session from outside its own task. The session consumes them only
///  at well-defined points between frames, so none of them ever interrupts a running command.
pub enum SessionControl<T: Transport> {
    Handoff(TransportHandoff<T>),
    /// announce a server shutdown to the peer, and terminate the session after `grace`
    Shutdown { grace: Duration },
    /// tell the peer that a server message is waiting for it
    RelayMessage,
    /// terminate immediately (after a running command finishes)
    Terminate,
}

impl<T: Transport> Debug for SessionControl<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionControl::Handoff(handoff) => write!(f, "Handoff({:?})", handoff),
            SessionControl::Shutdown { grace } => write!(f, "Shutdown({:?})", grace),
            SessionControl::RelayMessage => write!(f, "RelayMessage"),
            SessionControl::Terminate => write!(f, "Terminate"),
        }
    }
}

/// The supervisor's handle for sending [SessionControl] events to one session. Cloning is cheap;
///  when all handles are gone, a disconnected session stops waiting for a reconnect.
pub struct SessionHandle<T: Transport> {
    token: SessionToken,
    sender: mpsc::Sender<SessionControl<T>>,
}

impl<T: Transport> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        SessionHandle {
            token: self.token,
            sender: self.sender.clone(),
        }
    }
}

impl<T: Transport> Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHandle{{{:?}}}", self.token)
    }
}

impl<T: Transport> SessionHandle<T> {
    pub fn new(token: SessionToken, sender: mpsc::Sender<SessionControl<T>>) -> SessionHandle<T> {
        SessionHandle {
            token,
            sender,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Returns the handoff (including its transport) if the session is gone.
    pub async fn hand_off(&self, handoff: TransportHandoff<T>) -> Result<(), TransportHandoff<T>> {
        self.sender.send(SessionControl::Handoff(handoff)).await
            .map_err(|SendError(control)| match control {
                SessionControl::Handoff(handoff) => handoff,
                _ => unreachable!("a handoff was sent"),
            })
    }

    pub async fn request_shutdown(&self, grace: Duration) -> anyhow::Result<()> {
        self.send(SessionControl::Shutdown { grace }).await
    }

    pub async fn relay_message(&self) -> anyhow::Result<()> {
        self.send(SessionControl::RelayMessage).await
    }

    pub async fn terminate(&self) -> anyhow::Result<()> {
        self.send(SessionControl::Terminate).await
    }

    async fn send(&self, control: SessionControl<T>) -> anyhow::Result<()> {
        if self.sender.send(control).await.is_err() {
            anyhow::bail!("session {:?} is terminated", self.token);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::transport::ScriptedTransport;

    #[tokio::test]
    async fn test_send_to_live_session() {
        let (sender, mut receiver) = mpsc::channel::<SessionControl<ScriptedTransport>>(4);
        let handle = SessionHandle::new(SessionToken::from_raw(1), sender);

        handle.request_shutdown(Duration::from_secs(60)).await.unwrap();
        handle.relay_message().await.unwrap();
        handle.terminate().await.unwrap();

        assert!(matches!(receiver.recv().await, Some(SessionControl::Shutdown { grace }) if grace == Duration::from_secs(60)));
        assert!(matches!(receiver.recv().await, Some(SessionControl::RelayMessage)));
        assert!(matches!(receiver.recv().await, Some(SessionControl::Terminate)));
    }

    #[tokio::test]
    async fn test_send_to_terminated_session() {
        let (sender, receiver) = mpsc::channel::<SessionControl<ScriptedTransport>>(4);
        let handle = SessionHandle::new(SessionToken::from_raw(1), sender);
        drop(receiver);

        assert!(handle.is_closed());
        assert!(handle.terminate().await.is_err());

        let (transport, _peer) = ScriptedTransport::new("new");
        let returned = handle.hand_off(TransportHandoff { request_id: 3, transport }).await;
        assert_eq!(returned.unwrap_err().request_id, 3);
    }
}
