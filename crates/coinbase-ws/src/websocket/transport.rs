//! Socket plumbing: the [`Connector`] seam, the default tokio-tungstenite
//! connector, and the reader/writer tasks behind a [`SocketHandle`].

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::{actor::InternalEvent, protocol::WsMessage, types::WsKey};
use crate::error::{WsError, WsResult};

/// Outbound half of an open socket.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Inbound half of an open socket.
pub type WsStream = Pin<Box<dyn Stream<Item = WsResult<Message>> + Send>>;

/// Generation counter of a key's socket. Events tagged with an older epoch
/// belong to a socket that has already been replaced and are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionEpoch(pub u64);

impl ConnectionEpoch {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Opens sockets. Implemented by [`TungsteniteConnector`]; tests plug in
/// in-memory transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> WsResult<(WsSink, WsStream)>;
}

/// Default connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> WsResult<(WsSink, WsStream)> {
        if url.starts_with("wss://") {
            install_crypto_provider();
        }
        let (ws, response) = connect_async(url).await?;
        debug!(url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        let sink: WsSink = Box::pin(sink.sink_map_err(WsError::from));
        let stream: WsStream = Box::pin(stream.map(|item| item.map_err(WsError::from)));
        Ok((sink, stream))
    }
}

fn install_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // Losing the race to another installer is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
}

/// Exclusive handle to an open socket.
///
/// Sends are queued to a writer task, so they never block the caller.
/// Dropping the handle does not close the socket; use [`close`](Self::close)
/// or [`terminate`](Self::terminate).
#[derive(Debug)]
pub struct SocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl SocketHandle {
    /// Start the reader and writer tasks for a freshly opened socket.
    pub(crate) fn spawn(
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        sink: WsSink,
        stream: WsStream,
        events: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer: JoinHandle<()> = tokio::spawn(write_loop(ws_key, sink, outbound_rx));
        let reader: JoinHandle<()> = tokio::spawn(read_loop(ws_key, epoch, stream, events));
        Self {
            outbound,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        }
    }

    /// Queue a raw frame.
    pub fn send_frame(&self, message: Message) -> WsResult<()> {
        self.outbound
            .send(message)
            .map_err(|_| WsError::websocket("socket writer has stopped"))
    }

    /// Queue an application message.
    pub fn send(&self, message: &WsMessage) -> WsResult<()> {
        self.send_frame(message.to_frame())
    }

    /// Queue a protocol level ping.
    pub fn ping(&self) -> WsResult<()> {
        self.send_frame(Message::Ping(Vec::new()))
    }

    /// Start a graceful close. The close event arrives once the peer answers.
    pub fn close(&self) -> WsResult<()> {
        self.send_frame(Message::Close(None))
    }

    /// Tear the socket down immediately. No close event will follow; the
    /// caller is responsible for running its close handling.
    pub fn terminate(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop(
    ws_key: WsKey,
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!(ws_key = %ws_key, error = %e, "Failed to write to socket");
            break;
        }
        if is_close {
            break;
        }
    }
    trace!(ws_key = %ws_key, "Socket writer finished");
}

async fn read_loop(
    ws_key: WsKey,
    epoch: ConnectionEpoch,
    mut stream: WsStream,
    events: mpsc::UnboundedSender<InternalEvent>,
) {
    let mut reason = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Close(frame)) => {
                reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                break;
            }
            Ok(message) => {
                if events
                    .send(InternalEvent::SocketMessage {
                        ws_key,
                        epoch,
                        message,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(InternalEvent::SocketError {
                    ws_key,
                    epoch,
                    error,
                });
                break;
            }
        }
    }
    let _ = events.send(InternalEvent::SocketClosed {
        ws_key,
        epoch,
        reason,
    });
}
