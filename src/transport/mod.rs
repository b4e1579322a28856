//! Duplex link to the stats server.
//!
//! A [`Connector`] performs the handshake and hands back two halves: an
//! [`EventSink`] driven by the send loop and an [`InboundSource`] driven by
//! the receive loop. Reconnection policy is not part of this layer; a lost
//! connection is simply reported and the supervisor decides what to do.

pub mod loopback;
pub mod ws;

use crate::models::domain::Event;
use crate::models::wire::InboundMessage;
use std::future::Future;
use thiserror::Error;

pub use loopback::LoopbackConnector;
pub use ws::WsConnector;

/// Acknowledgement that a frame was accepted for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub bytes: usize,
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is gone. Terminal for this sink.
    #[error("connection closed")]
    ConnectionClosed,
    /// The outbound queue is full. Transient; the event was not queued.
    #[error("outbound queue full")]
    Backpressure,
    /// This event could not be encoded. Skip it and carry on.
    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    /// A frame arrived that is not a valid stats message. The stream stays
    /// usable.
    #[error("malformed inbound message: {0}")]
    Malformed(String),
    /// The connection failed. No further messages will be produced.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

#[derive(Debug, Error)]
#[error("failed to connect to {endpoint}: {reason}")]
pub struct ConnectError {
    pub endpoint: String,
    pub reason: String,
}

/// Establishes connections to one endpoint.
pub trait Connector: Send + Sync + 'static {
    type Sink: EventSink;
    type Source: InboundSource;

    fn endpoint(&self) -> &str;

    fn connect(
        &self,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Source), ConnectError>> + Send;
}

/// Outbound half of a connection.
pub trait EventSink: Send + 'static {
    /// Hand one event to the connection. Must not wait for the peer.
    fn send(&mut self, event: &Event) -> impl Future<Output = Result<Ack, SendError>> + Send;

    /// Flush queued frames and close the connection. Calling it again is a
    /// no-op, and any later `send` fails with [`SendError::ConnectionClosed`].
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Inbound half of a connection: an endless sequence of stats messages that
/// ends for good once the connection closes.
pub trait InboundSource: Send + 'static {
    /// Next message, or `None` once the connection is closed. Must be
    /// cancel-safe: dropping the future loses no message.
    fn receive(
        &mut self,
    ) -> impl Future<Output = Option<Result<InboundMessage, ReceiveError>>> + Send;
}

pub(crate) fn decode_inbound(frame: &[u8]) -> Result<InboundMessage, ReceiveError> {
    serde_json::from_slice(frame).map_err(|e| ReceiveError::Malformed(e.to_string()))
}

pub(crate) fn decode_event(frame: &str) -> Result<Event, ReceiveError> {
    serde_json::from_str(frame).map_err(|e| ReceiveError::Malformed(e.to_string()))
}
