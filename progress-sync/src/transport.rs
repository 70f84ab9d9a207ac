//! Bidirectional channel between a device and the coordinator.
//!
//! The client only sees a [`Connection`]: an outgoing frame sender and an
//! incoming event receiver. How frames travel is up to the [`Connector`]:
//!
//! - [`WebSocketConnector`]: binary WebSocket frames (tokio-tungstenite)
//! - [`ChannelConnector`]: in-process channels; the far end is handed out as
//!   a [`ChannelPeer`] (tests, embedding)

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, SyncMessage};

/// Events produced by an open connection.
///
/// `Closed` is always the last event of a connection; an `Error` may
/// precede it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound frame
    Message(Vec<u8>),
    /// Connection closed; `unsent` holds outgoing frames that never left
    Closed { unsent: Vec<Vec<u8>> },
    /// Transport-level failure; the connection is unusable afterwards
    Error(String),
}

/// An open connection.
pub struct Connection {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),
}

/// Opens connections to the coordinator.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Connection, TransportError>;
}

/// WebSocket transport using binary frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: 256,
        }
    }

    /// Channel capacity for outgoing and incoming frames.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(self.capacity);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (unsent_tx, unsent_rx) = oneshot::channel::<Vec<Vec<u8>>>();

        // Writer task: forward outgoing frames until a send fails or the
        // reader sees the socket end, then hand back what was not sent
        tokio::spawn(async move {
            let mut unsent = Vec::new();
            loop {
                tokio::select! {
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else {
                            // Sender dropped: the client is done with this connection
                            let _ = ws_writer.close().await;
                            return;
                        };
                        if let Err(e) = ws_writer.send(Message::Binary(frame.clone().into())).await {
                            log::warn!("WebSocket send failed: {e}");
                            unsent.push(frame);
                            break;
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            out_rx.close();
            while let Ok(rest) = out_rx.try_recv() {
                unsent.push(rest);
            }
            let _ = unsent_tx.send(unsent);
        });

        // Reader task: forward inbound binary frames. It emits the final
        // `Closed` once the writer has returned its unsent frames.
        tokio::spawn(async move {
            let mut failure = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(TransportEvent::Message(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            let _ = stop_tx.send(());
            if let Some(reason) = failure {
                let _ = in_tx.send(TransportEvent::Error(reason)).await;
            }
            let unsent = unsent_rx.await.unwrap_or_default();
            let _ = in_tx.send(TransportEvent::Closed { unsent }).await;
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Far end of a connection opened through a [`ChannelConnector`].
pub struct ChannelPeer {
    pub from_client: mpsc::Receiver<Vec<u8>>,
    pub to_client: mpsc::Sender<TransportEvent>,
}

impl ChannelPeer {
    /// Next frame from the client, decoded. `None` once the client hung up.
    pub async fn recv_message(&mut self) -> Option<Result<SyncMessage, ProtocolError>> {
        self.from_client
            .recv()
            .await
            .map(|frame| SyncMessage::decode(&frame))
    }

    /// Deliver a message to the client.
    pub async fn send_message(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.to_client
            .send(TransportEvent::Message(frame))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Report a transport failure to the client, then close.
    pub async fn fail(self, reason: impl Into<String>) {
        let _ = self.to_client.send(TransportEvent::Error(reason.into())).await;
        self.close().await;
    }

    /// Close the connection, returning frames the client queued but the peer
    /// never read as unsent.
    pub async fn close(mut self) {
        self.from_client.close();
        let mut unsent = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            unsent.push(frame);
        }
        let _ = self.to_client.send(TransportEvent::Closed { unsent }).await;
    }
}

/// In-process transport. Every `open` produces a [`ChannelPeer`] on the
/// receiver returned by [`ChannelConnector::new`].
#[derive(Clone)]
pub struct ChannelConnector {
    peers: mpsc::UnboundedSender<ChannelPeer>,
    capacity: usize,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                capacity: capacity.max(1),
            },
            peer_rx,
        )
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self) -> Result<Connection, TransportError> {
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let (in_tx, in_rx) = mpsc::channel(self.capacity);

        self.peers
            .send(ChannelPeer {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| TransportError::Connect("no channel peer listening".into()))?;

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
