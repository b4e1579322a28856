pub mod domain {
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, VecDeque};
    use std::fmt;
    use std::net::Ipv4Addr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Protocol {
        Tcp,
        Udp,
        Icmp,
    }

    impl Protocol {
        pub const ALL: [Protocol; 3] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp];

        pub fn as_str(self) -> &'static str {
            match self {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
                Protocol::Icmp => "ICMP",
            }
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Smallest and largest synthetic packet, in bytes.
    pub const MIN_EVENT_SIZE: u16 = 64;
    pub const MAX_EVENT_SIZE: u16 = 1564;

    /// One synthetic packet record. Field names on the wire match the
    /// dashboard server (`src_ip`, `dst_ip`, `size`, `timestamp`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Event {
        #[serde(rename = "src_ip")]
        pub source_address: Ipv4Addr,
        #[serde(rename = "dst_ip")]
        pub destination_address: Ipv4Addr,
        pub protocol: Protocol,
        #[serde(rename = "size")]
        pub size_bytes: u16,
        #[serde(rename = "timestamp")]
        pub timestamp_ms: i64,
    }

    impl Event {
        pub fn has_valid_size(&self) -> bool {
            (MIN_EVENT_SIZE..=MAX_EVENT_SIZE).contains(&self.size_bytes)
        }
    }

    /// Events/second observed at a point in time (milliseconds since epoch).
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct RatePoint {
        pub timestamp: i64,
        pub rate: f64,
    }

    /// Point-in-time copy of the aggregated statistics.
    ///
    /// `protocol_counts` always sums to `packet_count`, and `recent_events`
    /// holds at most the configured number of events, oldest first.
    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    pub struct StatsSnapshot {
        pub packet_count: u64,
        pub protocol_counts: BTreeMap<Protocol, u64>,
        pub events_per_second_series: VecDeque<RatePoint>,
        pub recent_events: VecDeque<Event>,
        pub messages_ingested: u64,
        pub malformed_messages: u64,
        pub dropped_rate_points: u64,
    }

    impl StatsSnapshot {
        pub fn protocol_count(&self, protocol: Protocol) -> u64 {
            self.protocol_counts.get(&protocol).copied().unwrap_or(0)
        }

        pub fn latest_rate(&self) -> Option<RatePoint> {
            self.events_per_second_series.back().copied()
        }
    }
}

pub mod wire {
    use super::domain::{Event, Protocol, RatePoint};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    /// Stats frame pushed by the server. Counts are deltas since the previous
    /// frame on the same connection.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct InboundMessage {
        pub packet_count: u64,
        #[serde(default)]
        pub protocol_counts: BTreeMap<Protocol, u64>,
        #[serde(default)]
        pub sps_data: Vec<RatePoint>,
        #[serde(default)]
        pub recent_packets: Vec<Event>,
    }

    impl InboundMessage {
        /// Sum of the per-protocol counts carried by this frame, `None` on
        /// overflow.
        pub fn protocol_total(&self) -> Option<u64> {
            self.protocol_counts
                .values()
                .try_fold(0u64, |acc, n| acc.checked_add(*n))
        }

        pub fn is_consistent(&self) -> bool {
            self.protocol_total() == Some(self.packet_count)
        }

        /// First carried event whose size is outside the packet size range.
        pub fn invalid_event(&self) -> Option<&Event> {
            self.recent_packets.iter().find(|event| !event.has_valid_size())
        }
    }
}
