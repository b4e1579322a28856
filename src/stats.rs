use crate::models::domain::StatsSnapshot;
use crate::models::wire::InboundMessage;
use tokio::sync::watch;
use tracing::warn;

/// Merges inbound stats messages into a running snapshot.
///
/// The receive loop is the only writer. Readers get a full copy of the last
/// published snapshot, so a reader never observes a half-applied message.
#[derive(Debug)]
pub struct StatsAggregator {
    snapshot: watch::Sender<StatsSnapshot>,
    recent_capacity: usize,
    series_capacity: usize,
}

impl StatsAggregator {
    pub fn new(recent_capacity: usize, series_capacity: usize) -> Self {
        let (snapshot, _) = watch::channel(StatsSnapshot::default());
        Self {
            snapshot,
            recent_capacity: recent_capacity.max(1),
            series_capacity: series_capacity.max(1),
        }
    }

    pub fn ingest(&self, message: InboundMessage) {
        let fits = self
            .snapshot
            .borrow()
            .packet_count
            .checked_add(message.packet_count)
            .is_some();
        if !message.is_consistent() || !fits {
            warn!(
                packet_count = message.packet_count,
                protocol_total = ?message.protocol_total(),
                "dropping stats message with inconsistent counts"
            );
            self.record_malformed();
            return;
        }
        if let Some(event) = message.invalid_event() {
            warn!(
                size = event.size_bytes,
                "dropping stats message carrying an event with an impossible size"
            );
            self.record_malformed();
            return;
        }

        let recent_capacity = self.recent_capacity;
        let series_capacity = self.series_capacity;
        self.snapshot.send_modify(|snap| {
            snap.messages_ingested += 1;
            for (protocol, count) in &message.protocol_counts {
                *snap.protocol_counts.entry(*protocol).or_insert(0) += count;
            }
            snap.packet_count += message.packet_count;

            for point in message.sps_data {
                if let Some(last) = snap.events_per_second_series.back() {
                    if point.timestamp <= last.timestamp {
                        warn!(
                            timestamp = point.timestamp,
                            last = last.timestamp,
                            "dropping out-of-order rate point"
                        );
                        snap.dropped_rate_points += 1;
                        continue;
                    }
                }
                snap.events_per_second_series.push_back(point);
                if snap.events_per_second_series.len() > series_capacity {
                    snap.events_per_second_series.pop_front();
                }
            }

            for event in message.recent_packets {
                snap.recent_events.push_back(event);
                if snap.recent_events.len() > recent_capacity {
                    snap.recent_events.pop_front();
                }
            }
        });
    }

    /// Count a message that could not be decoded or applied.
    pub fn record_malformed(&self) {
        self.snapshot.send_modify(|snap| snap.malformed_messages += 1);
    }

    pub fn messages_ingested(&self) -> u64 {
        self.snapshot.borrow().messages_ingested
    }

    pub fn read(&self) -> StatsSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.snapshot.subscribe()
    }
}
