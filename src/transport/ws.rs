//! WebSocket transport: one JSON object per text frame.

use super::{decode_inbound, Ack, ConnectError, Connector, EventSink, InboundSource, ReceiveError, SendError};
use crate::models::domain::Event;
use crate::models::wire::InboundMessage;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    send_buffer: usize,
}

impl WsConnector {
    /// `send_buffer` is the number of frames that may wait for the socket
    /// before `send` reports backpressure.
    pub fn new(url: impl Into<String>, send_buffer: usize) -> Self {
        Self {
            url: url.into(),
            send_buffer: send_buffer.max(1),
        }
    }
}

impl Connector for WsConnector {
    type Sink = WsSink;
    type Source = WsSource;

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<(WsSink, WsSource), ConnectError> {
        let (stream, response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| ConnectError {
                    endpoint: self.url.clone(),
                    reason: e.to_string(),
                })?;
        info!(endpoint = %self.url, status = %response.status(), "websocket connected");

        let (write, read) = stream.split();
        let (queue, frames) = mpsc::channel(self.send_buffer);
        let writer = tokio::spawn(write_frames(write, frames));

        Ok((
            WsSink {
                queue: Some(queue),
                writer: Some(writer),
            },
            WsSource {
                read,
                closed: false,
            },
        ))
    }
}

/// Owns the socket's write half. Ends when the queue is closed (then sends a
/// Close frame) or when a write fails (then the sink sees a closed queue).
async fn write_frames(mut write: SplitSink<WsStream, Message>, mut frames: mpsc::Receiver<Message>) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            write.feed(frame).await?;
            while let Ok(next) = frames.try_recv() {
                write.feed(next).await?;
            }
            write.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "websocket write failed");
            return;
        }
    }
    if let Err(e) = write.close().await {
        debug!(error = %e, "websocket close handshake failed");
    }
}

pub struct WsSink {
    queue: Option<mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl EventSink for WsSink {
    async fn send(&mut self, event: &Event) -> Result<Ack, SendError> {
        let queue = self.queue.as_ref().ok_or(SendError::ConnectionClosed)?;
        let text = serde_json::to_string(event)?;
        let bytes = text.len();
        match queue.try_send(Message::Text(text)) {
            Ok(()) => Ok(Ack { bytes }),
            Err(TrySendError::Full(_)) => Err(SendError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(SendError::ConnectionClosed),
        }
    }

    async fn close(&mut self) {
        // dropping the sender lets the writer drain what is queued
        self.queue.take();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!(error = %e, "websocket writer task failed");
            }
        }
    }
}

pub struct WsSource {
    read: SplitStream<WsStream>,
    closed: bool,
}

impl InboundSource for WsSource {
    async fn receive(&mut self) -> Option<Result<InboundMessage, ReceiveError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(decode_inbound(text.as_bytes())),
                Some(Ok(Message::Binary(data))) => return Some(decode_inbound(&data)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed the websocket");
                    self.closed = true;
                    return None;
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(ReceiveError::ConnectionLost(e.to_string())));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }
}
