use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::frame::Frame;
use crate::protocol::transport::Transport;

enum Inbound {
    Frame(Frame),
    Close,
    Error(String),
}

/// Everything a session did to a [ScriptedTransport], in order
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    Received(Frame),
    Sent(Frame),
    Closed,
}

/// In-memory [Transport] that is fed by a [ScriptedPeer] and records every interaction for later
///  assertions.
pub struct ScriptedTransport {
    name: String,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    log: Arc<Mutex<Vec<TransportEvent>>>,
    fail_sends: Arc<AtomicBool>,
    closed: bool,
}

impl Debug for ScriptedTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScriptedTransport{{{}}}", self.name)
    }
}

impl ScriptedTransport {
    pub fn new(name: &str) -> (ScriptedTransport, ScriptedPeer) {
        let (sender, inbound) = mpsc::unbounded_channel();
        let log: Arc<Mutex<Vec<TransportEvent>>> = Default::default();
        let fail_sends: Arc<AtomicBool> = Default::default();

        let transport = ScriptedTransport {
            name: name.to_string(),
            inbound,
            log: log.clone(),
            fail_sends: fail_sends.clone(),
            closed: false,
        };
        let peer = ScriptedPeer {
            inbound: sender,
            log,
            fail_sends,
        };
        (transport, peer)
    }

    fn record(&self, event: TransportEvent) {
        self.log.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn receive_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.closed {
            bail!("{}: receiving on a closed transport", self.name);
        }

        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => {
                self.record(TransportEvent::Received(frame.clone()));
                Ok(Some(frame))
            }
            Some(Inbound::Error(msg)) => bail!("{}: {}", self.name, msg),
            Some(Inbound::Close) | None => Ok(None),
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        if self.closed {
            bail!("{}: sending on a closed transport", self.name);
        }
        if self.fail_sends.load(Ordering::Acquire) {
            bail!("{}: simulated send failure", self.name);
        }
        self.record(TransportEvent::Sent(frame.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.record(TransportEvent::Closed);
    }
}

/// The far end of a [ScriptedTransport]
pub struct ScriptedPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    log: Arc<Mutex<Vec<TransportEvent>>>,
    fail_sends: Arc<AtomicBool>,
}

impl ScriptedPeer {
    pub fn send(&self, frame: Frame) {
        let _ = self.inbound.send(Inbound::Frame(frame));
    }

    /// orderly close, i.e. end of stream
    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    pub fn fail_receive(&self, msg: &str) {
        let _ = self.inbound.send(Inbound::Error(msg.to_string()));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.log.lock().unwrap().clone()
    }

    /// the frames the session sent, in order
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.events().into_iter()
            .filter_map(|e| match e {
                TransportEvent::Sent(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    pub fn num_closed(&self) -> usize {
        self.events().iter()
            .filter(|&e| e == &TransportEvent::Closed)
            .count()
    }

    /// returns the events recorded so far, clearing the internal buffer
    pub fn take_events(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}
