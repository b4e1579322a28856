//! Property tests for pacing, aggregation and synthesis.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use trafficgen::governor::{RateGovernor, RateTarget};
use trafficgen::models::domain::{MAX_EVENT_SIZE, MIN_EVENT_SIZE};
use trafficgen::stats::StatsAggregator;
use trafficgen::synth::{EventSynthesizer, ProtocolWeights};
use trafficgen::{Event, InboundMessage, Protocol};

const RUN: Duration = Duration::from_secs(10);

/// Emissions in `RUN` when every sleep overshoots by up to `max_oversleep`.
fn emissions(rate: u32, seed: u64, max_oversleep: Duration) -> u64 {
    let mut governor = RateGovernor::new(RateTarget::new(f64::from(rate)), Duration::ZERO);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut now = Duration::ZERO;
    let mut sent = 0;
    loop {
        let delay = governor.pace(now);
        if !delay.is_zero() {
            let over = rng.gen_range(0..=max_oversleep.as_micros() as u64);
            now += delay + Duration::from_micros(over);
        }
        if now >= RUN {
            return sent;
        }
        governor.record_emission(now);
        sent += 1;
    }
}

fn protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp), Just(Protocol::Icmp)]
}

fn event() -> impl Strategy<Value = Event> {
    (any::<u32>(), any::<u32>(), protocol(), MIN_EVENT_SIZE..=MAX_EVENT_SIZE, 0i64..=4_102_444_800_000)
        .prop_map(|(src, dst, protocol, size_bytes, timestamp_ms)| Event {
            source_address: Ipv4Addr::from(src),
            destination_address: Ipv4Addr::from(dst),
            protocol,
            size_bytes,
            timestamp_ms,
        })
}

/// A well-formed delta: counts agree with each other.
fn message() -> impl Strategy<Value = InboundMessage> {
    (0u64..500, 0u64..500, 0u64..500, prop::collection::vec(event(), 0..8)).prop_map(
        |(tcp, udp, icmp, recent_packets)| InboundMessage {
            packet_count: tcp + udp + icmp,
            protocol_counts: BTreeMap::from([
                (Protocol::Tcp, tcp),
                (Protocol::Udp, udp),
                (Protocol::Icmp, icmp),
            ]),
            sps_data: Vec::new(),
            recent_packets,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_exact_clock_emits_exactly_target(rate in 1u32..=10_000) {
        let expected = u64::from(rate) * RUN.as_secs();
        prop_assert_eq!(emissions(rate, 0, Duration::ZERO), expected);
    }

    #[test]
    fn prop_oversleeping_stays_within_one_percent(rate in 1u32..=10_000, seed in any::<u64>()) {
        let expected = u64::from(rate) * RUN.as_secs();
        let sent = emissions(rate, seed, Duration::from_millis(1));
        prop_assert!(sent <= expected, "sent {} > expected {}", sent, expected);
        prop_assert!(
            expected - sent <= (expected / 100).max(1),
            "sent {} of {} at {}/s",
            sent,
            expected,
            rate
        );
    }
}

proptest! {
    #[test]
    fn prop_counts_always_sum_to_total(
        messages in prop::collection::vec(message(), 1..20),
        capacity in 1usize..16,
    ) {
        let agg = StatsAggregator::new(capacity, 8);
        let mut expected = 0;
        for message in messages {
            expected += message.packet_count;
            agg.ingest(message);
            let snap = agg.read();
            let total: u64 = snap.protocol_counts.values().sum();
            prop_assert_eq!(total, snap.packet_count);
            prop_assert!(snap.recent_events.len() <= capacity);
        }
        prop_assert_eq!(agg.read().packet_count, expected);
    }

    #[test]
    fn prop_recent_events_are_the_newest_in_arrival_order(
        messages in prop::collection::vec(message(), 1..20),
        capacity in 1usize..16,
    ) {
        let agg = StatsAggregator::new(capacity, 8);
        let mut all = Vec::new();
        for message in messages {
            all.extend(message.recent_packets.iter().copied());
            agg.ingest(message);
        }
        let keep = all.len().min(capacity);
        let recent: Vec<Event> = agg.read().recent_events.into_iter().collect();
        prop_assert_eq!(recent, all[all.len() - keep..].to_vec());
    }

    #[test]
    fn prop_events_survive_the_wire(event in event()) {
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, event);
    }

    #[test]
    fn prop_synthesized_events_respect_weights(
        tcp in prop_oneof![Just(0.0), 0.01f64..10.0],
        udp in prop_oneof![Just(0.0), 0.01f64..10.0],
        icmp in prop_oneof![Just(0.0), 0.01f64..10.0],
        seed in any::<u64>(),
    ) {
        prop_assume!(tcp + udp + icmp > 0.0);
        let weights = ProtocolWeights { tcp, udp, icmp };
        let synth = EventSynthesizer::new(weights).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..200 {
            let event = synth.generate_with(&mut rng);
            prop_assert!(weights.get(event.protocol) > 0.0);
            prop_assert!((MIN_EVENT_SIZE..=MAX_EVENT_SIZE).contains(&event.size_bytes));
        }
    }
}
