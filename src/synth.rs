use crate::models::domain::{Event, Protocol, MAX_EVENT_SIZE, MIN_EVENT_SIZE};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("expected PROTOCOL=WEIGHT, got '{0}'")]
    Syntax(String),
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("weight for {protocol} must be a finite non-negative number, got {weight}")]
    InvalidWeight { protocol: Protocol, weight: f64 },
    #[error("at least one protocol weight must be positive")]
    AllZero,
}

/// Relative protocol frequencies for synthetic traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolWeights {
    pub tcp: f64,
    pub udp: f64,
    pub icmp: f64,
}

impl Default for ProtocolWeights {
    fn default() -> Self {
        Self {
            tcp: 0.7,
            udp: 0.2,
            icmp: 0.1,
        }
    }
}

impl ProtocolWeights {
    pub fn get(&self, protocol: Protocol) -> f64 {
        match protocol {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
            Protocol::Icmp => self.icmp,
        }
    }

    fn set(&mut self, protocol: Protocol, weight: f64) {
        match protocol {
            Protocol::Tcp => self.tcp = weight,
            Protocol::Udp => self.udp = weight,
            Protocol::Icmp => self.icmp = weight,
        }
    }

    pub fn validate(&self) -> Result<(), WeightsError> {
        for protocol in Protocol::ALL {
            let weight = self.get(protocol);
            if !weight.is_finite() || weight < 0.0 {
                return Err(WeightsError::InvalidWeight { protocol, weight });
            }
        }
        if Protocol::ALL.iter().all(|p| self.get(*p) == 0.0) {
            return Err(WeightsError::AllZero);
        }
        Ok(())
    }
}

/// Parses `TCP=0.7,UDP=0.2,ICMP=0.1`. Protocols left out weigh zero.
impl FromStr for ProtocolWeights {
    type Err = WeightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut weights = ProtocolWeights {
            tcp: 0.0,
            udp: 0.0,
            icmp: 0.0,
        };
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| WeightsError::Syntax(pair.to_string()))?;
            let protocol = match name.trim().to_ascii_uppercase().as_str() {
                "TCP" => Protocol::Tcp,
                "UDP" => Protocol::Udp,
                "ICMP" => Protocol::Icmp,
                other => return Err(WeightsError::UnknownProtocol(other.to_string())),
            };
            let weight: f64 = value
                .trim()
                .parse()
                .map_err(|_| WeightsError::Syntax(pair.to_string()))?;
            weights.set(protocol, weight);
        }
        weights.validate()?;
        Ok(weights)
    }
}

impl fmt::Display for ProtocolWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP={},UDP={},ICMP={}", self.tcp, self.udp, self.icmp)
    }
}

/// Produces synthetic packet events.
///
/// Holds only immutable sampling tables, so a shared reference can feed any
/// number of producers; each caller brings its own RNG.
#[derive(Debug, Clone)]
pub struct EventSynthesizer {
    protocols: WeightedIndex<f64>,
}

impl EventSynthesizer {
    pub fn new(weights: ProtocolWeights) -> Result<Self, WeightsError> {
        weights.validate()?;
        let protocols = WeightedIndex::new(Protocol::ALL.iter().map(|p| weights.get(*p)))
            .map_err(|_| WeightsError::AllZero)?;
        Ok(Self { protocols })
    }

    pub fn generate(&self) -> Event {
        self.generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng>(&self, rng: &mut R) -> Event {
        Event {
            source_address: random_address(rng),
            destination_address: random_address(rng),
            protocol: Protocol::ALL[self.protocols.sample(rng)],
            size_bytes: rng.gen_range(MIN_EVENT_SIZE..=MAX_EVENT_SIZE),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn random_address<R: Rng>(rng: &mut R) -> Ipv4Addr {
    Ipv4Addr::from(rng.gen::<[u8; 4]>())
}
