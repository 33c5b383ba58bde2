//! In-process speech connector.
//!
//! Every successful `connect` hands the far side of the new link to whoever
//! holds the [`RemoteEnd`] receiver, so the simulator and tests can play the
//! speech model. Connect failures can be injected to exercise reconnection.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundEvent, OutboundEvent, SpeechConnector, SpeechLink};
use crate::error::{ParleyError, Result};

/// The speech-model side of one loopback connection.
#[derive(Debug)]
pub struct RemoteEnd {
    pub session_id: String,
    /// 1 for the first connection of a connector, then counting up.
    pub connection: u32,
    pub inbound: mpsc::Sender<InboundEvent>,
    pub outbound: mpsc::Receiver<OutboundEvent>,
}

impl RemoteEnd {
    /// Deliver an event to the orchestrator.
    pub async fn send(&self, event: InboundEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| ParleyError::ChannelClosed("loopback inbound".into()))
    }

    /// Next event written by the orchestrator, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }
}

/// Connector whose connections stay inside the process.
pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    buffer: usize,
    connections: AtomicU32,
    fail_next: AtomicU32,
}

impl LoopbackConnector {
    /// A connector plus the stream of remote ends it produces.
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes,
                buffer: buffer.max(1),
                connections: AtomicU32::new(0),
                fail_next: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechConnector for LoopbackConnector {
    async fn connect(&self, session_id: &str) -> Result<SpeechLink> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(session_id = %session_id, "Loopback connect refused");
            return Err(ParleyError::Transport("loopback connect refused".into()));
        }

        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.remotes
            .send(RemoteEnd {
                session_id: session_id.to_string(),
                connection,
                inbound: in_tx,
                outbound: out_rx,
            })
            .map_err(|_| ParleyError::Transport("no loopback peer listening".into()))?;

        Ok(SpeechLink {
            inbound: in_rx,
            outbound: out_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_hands_out_remote_end() {
        let (connector, mut remotes) = LoopbackConnector::new(8);
        let mut link = connector.connect("s1").await.unwrap();
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.session_id, "s1");
        assert_eq!(remote.connection, 1);

        remote.send(InboundEvent::SpeechStarted).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(InboundEvent::SpeechStarted));

        link.send(OutboundEvent::ResponseRequest).await.unwrap();
        assert_eq!(remote.recv().await, Some(OutboundEvent::ResponseRequest));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (connector, _remotes) = LoopbackConnector::new(8);
        connector.fail_next(2);
        assert!(connector.connect("s1").await.unwrap_err().is_transport());
        assert!(connector.connect("s1").await.is_err());
        assert!(connector.connect("s1").await.is_ok());
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_dropping_remote_closes_inbound() {
        let (connector, mut remotes) = LoopbackConnector::new(8);
        let mut link = connector.connect("s1").await.unwrap();
        drop(remotes.recv().await.unwrap());
        assert_eq!(link.inbound.recv().await, None);
    }
}
