//! In-process transport for dry runs.
//!
//! Every event is encoded exactly as it would be for the network, decoded on
//! the far side and echoed back as a one-packet stats delta, like the
//! dashboard server does, plus one rate point per completed second of event
//! timestamps.

use super::{decode_event, Ack, ConnectError, Connector, EventSink, InboundSource, ReceiveError, SendError};
use crate::models::domain::{Event, RatePoint};
use crate::models::wire::InboundMessage;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    send_buffer: usize,
}

impl LoopbackConnector {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            send_buffer: send_buffer.max(1),
        }
    }
}

impl Connector for LoopbackConnector {
    type Sink = LoopbackSink;
    type Source = LoopbackSource;

    fn endpoint(&self) -> &str {
        "loopback"
    }

    async fn connect(&self) -> Result<(LoopbackSink, LoopbackSource), ConnectError> {
        let (queue, frames) = mpsc::channel(self.send_buffer);
        Ok((
            LoopbackSink { queue: Some(queue) },
            LoopbackSource {
                frames,
                second: None,
                second_events: 0,
            },
        ))
    }
}

pub struct LoopbackSink {
    queue: Option<mpsc::Sender<String>>,
}

impl EventSink for LoopbackSink {
    async fn send(&mut self, event: &Event) -> Result<Ack, SendError> {
        let queue = self.queue.as_ref().ok_or(SendError::ConnectionClosed)?;
        let frame = serde_json::to_string(event)?;
        let bytes = frame.len();
        match queue.try_send(frame) {
            Ok(()) => Ok(Ack { bytes }),
            Err(TrySendError::Full(_)) => Err(SendError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(SendError::ConnectionClosed),
        }
    }

    async fn close(&mut self) {
        self.queue.take();
    }
}

pub struct LoopbackSource {
    frames: mpsc::Receiver<String>,
    second: Option<i64>,
    second_events: u64,
}

impl LoopbackSource {
    fn echo(&mut self, event: Event) -> InboundMessage {
        let second = event.timestamp_ms.div_euclid(1000);
        let mut sps_data = Vec::new();
        match self.second {
            Some(current) if second > current => {
                sps_data.push(RatePoint {
                    timestamp: current * 1000,
                    rate: self.second_events as f64,
                });
                self.second = Some(second);
                self.second_events = 1;
            }
            Some(_) => self.second_events += 1,
            None => {
                self.second = Some(second);
                self.second_events = 1;
            }
        }
        InboundMessage {
            packet_count: 1,
            protocol_counts: BTreeMap::from([(event.protocol, 1)]),
            sps_data,
            recent_packets: vec![event],
        }
    }
}

impl InboundSource for LoopbackSource {
    async fn receive(&mut self) -> Option<Result<InboundMessage, ReceiveError>> {
        let frame = self.frames.recv().await?;
        Some(decode_event(&frame).map(|event| self.echo(event)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain::Protocol;
    use std::net::Ipv4Addr;

    fn event(protocol: Protocol, timestamp_ms: i64) -> Event {
        Event {
            source_address: Ipv4Addr::new(1, 1, 1, 1),
            destination_address: Ipv4Addr::new(2, 2, 2, 2),
            protocol,
            size_bytes: 100,
            timestamp_ms,
        }
    }

    #[tokio::test]
    async fn echoes_each_event_as_a_delta() {
        let (mut sink, mut source) = LoopbackConnector::new(8).connect().await.unwrap();
        let sent = event(Protocol::Icmp, 5_000);
        sink.send(&sent).await.unwrap();

        let msg = source.receive().await.unwrap().unwrap();
        assert_eq!(msg.packet_count, 1);
        assert_eq!(msg.protocol_counts[&Protocol::Icmp], 1);
        assert_eq!(msg.recent_packets, vec![sent]);
        assert!(msg.sps_data.is_empty());
    }

    #[tokio::test]
    async fn emits_rate_point_per_second() {
        let (mut sink, mut source) = LoopbackConnector::new(8).connect().await.unwrap();
        for ts in [1_000, 1_200, 1_900, 2_100] {
            sink.send(&event(Protocol::Tcp, ts)).await.unwrap();
        }
        let mut points = Vec::new();
        for _ in 0..4 {
            points.extend(source.receive().await.unwrap().unwrap().sps_data);
        }
        assert_eq!(
            points,
            vec![RatePoint {
                timestamp: 1_000,
                rate: 3.0
            }]
        );
    }

    #[tokio::test]
    async fn full_queue_is_backpressure() {
        let (mut sink, _source) = LoopbackConnector::new(1).connect().await.unwrap();
        sink.send(&event(Protocol::Tcp, 1)).await.unwrap();
        assert!(matches!(
            sink.send(&event(Protocol::Tcp, 2)).await,
            Err(SendError::Backpressure)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_source() {
        let (mut sink, mut source) = LoopbackConnector::new(4).connect().await.unwrap();
        sink.send(&event(Protocol::Udp, 1)).await.unwrap();
        sink.close().await;
        sink.close().await;
        assert!(matches!(
            sink.send(&event(Protocol::Udp, 2)).await,
            Err(SendError::ConnectionClosed)
        ));
        // queued frame still delivered, then the sequence ends for good
        assert!(source.receive().await.unwrap().is_ok());
        assert!(source.receive().await.is_none());
        assert!(source.receive().await.is_none());
    }

    #[tokio::test]
    async fn dropped_source_closes_the_sink() {
        let (mut sink, source) = LoopbackConnector::new(4).connect().await.unwrap();
        drop(source);
        assert!(matches!(
            sink.send(&event(Protocol::Udp, 1)).await,
            Err(SendError::ConnectionClosed)
        ));
    }
}
