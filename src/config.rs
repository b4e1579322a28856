//! Startup configuration. Every flag can also be set through a
//! `TRAFFICGEN_*` environment variable or a `.env` file.

use crate::governor::RateTarget;
use crate::synth::{ProtocolWeights, WeightsError};
use clap::Parser;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:5000";
pub const DEFAULT_RATE: f64 = 1000.0;
pub const MAX_RATE: f64 = 1_000_000.0;
pub const DEFAULT_RECENT_EVENTS: usize = 10;
pub const DEFAULT_SERIES_CAPACITY: usize = 300;
pub const DEFAULT_MAX_RECONNECTS: u32 = 5;
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SEND_BUFFER: usize = 1024;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "trafficgen",
    version,
    about = "Streams synthetic packet events to the dashboard server at a fixed rate and reports the stats it echoes back"
)]
pub struct Cli {
    /// WebSocket endpoint (ws:// or wss://)
    #[arg(long, env = "TRAFFICGEN_URL", default_value = DEFAULT_ENDPOINT)]
    pub url: String,

    /// Target events per second
    #[arg(long, short = 'r', env = "TRAFFICGEN_RATE", default_value_t = DEFAULT_RATE)]
    pub rate: f64,

    /// Protocol mix, e.g. TCP=0.7,UDP=0.2,ICMP=0.1
    #[arg(long, env = "TRAFFICGEN_WEIGHTS", default_value = "TCP=0.7,UDP=0.2,ICMP=0.1")]
    pub weights: ProtocolWeights,

    /// Number of most recent events kept in the stats snapshot
    #[arg(long, env = "TRAFFICGEN_RECENT", default_value_t = DEFAULT_RECENT_EVENTS)]
    pub recent: usize,

    /// Number of rate points kept in the stats snapshot
    #[arg(long, env = "TRAFFICGEN_SERIES_CAPACITY", default_value_t = DEFAULT_SERIES_CAPACITY)]
    pub series_capacity: usize,

    /// Consecutive connection failures tolerated before giving up
    #[arg(long, env = "TRAFFICGEN_MAX_RECONNECTS", default_value_t = DEFAULT_MAX_RECONNECTS)]
    pub max_reconnects: u32,

    #[arg(long, env = "TRAFFICGEN_BACKOFF_INITIAL_MS", default_value_t = 250)]
    pub backoff_initial_ms: u64,

    #[arg(long, env = "TRAFFICGEN_BACKOFF_MAX_MS", default_value_t = 5_000)]
    pub backoff_max_ms: u64,

    /// How long one connection attempt, handshake included, may take
    #[arg(long, env = "TRAFFICGEN_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// How long shutdown waits for in-flight work
    #[arg(long, env = "TRAFFICGEN_DRAIN_TIMEOUT_MS", default_value_t = 5_000)]
    pub drain_timeout_ms: u64,

    /// Outbound frames queued per connection before sends report backpressure
    #[arg(long, env = "TRAFFICGEN_SEND_BUFFER", default_value_t = DEFAULT_SEND_BUFFER)]
    pub send_buffer: usize,

    #[arg(long, env = "TRAFFICGEN_REPORT_INTERVAL_MS", default_value_t = 1_000)]
    pub report_interval_ms: u64,

    /// Stop after this many seconds (runs until interrupted otherwise)
    #[arg(long, env = "TRAFFICGEN_DURATION_SECS")]
    pub duration_secs: Option<u64>,

    /// Seed for reproducible traffic
    #[arg(long, env = "TRAFFICGEN_SEED")]
    pub seed: Option<u64>,

    /// Echo events through an in-process loopback instead of the network
    #[arg(long, env = "TRAFFICGEN_DRY_RUN")]
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint '{url}': {reason}")]
    Endpoint { url: String, reason: String },

    #[error("target rate must be a finite number in (0, 1000000], got {0}")]
    Rate(f64),

    #[error("invalid protocol weights: {0}")]
    Weights(#[from] WeightsError),

    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: u64,
        value: u64,
    },

    #[error("initial backoff {initial:?} is longer than the maximum {max:?}")]
    Backoff { initial: Duration, max: Duration },
}

/// Reconnection policy: exponential backoff, bounded attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECTS,
            initial_backoff: DEFAULT_BACKOFF_INITIAL,
            max_backoff: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt that follows failure number `failures`
    /// (1-based): `initial * 2^(failures - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Everything the supervisor needs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub rate: RateTarget,
    pub weights: ProtocolWeights,
    pub recent_capacity: usize,
    pub series_capacity: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub seed: Option<u64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            rate: RateTarget::new(DEFAULT_RATE),
            weights: ProtocolWeights::default(),
            recent_capacity: DEFAULT_RECENT_EVENTS,
            series_capacity: DEFAULT_SERIES_CAPACITY,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            seed: None,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.rate.events_per_second;
        if !self.rate.is_valid() || rate > MAX_RATE {
            return Err(ConfigError::Rate(rate));
        }
        self.weights.validate()?;
        at_least("recent", self.recent_capacity as u64, 1)?;
        at_least("series-capacity", self.series_capacity as u64, 1)?;
        at_least("max-reconnects", self.retry.max_attempts as u64, 1)?;
        at_least(
            "connect-timeout-ms",
            self.connect_timeout.as_millis().min(u64::MAX as u128) as u64,
            1,
        )?;
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::Backoff {
                initial: self.retry.initial_backoff,
                max: self.retry.max_backoff,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub send_buffer: usize,
    pub report_interval: Duration,
    pub duration: Option<Duration>,
    pub dry_run: bool,
    pub run: RunSettings,
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        validate_endpoint(&cli.url)?;
        at_least("send-buffer", cli.send_buffer as u64, 1)?;
        at_least("report-interval-ms", cli.report_interval_ms, 1)?;

        let run = RunSettings {
            rate: RateTarget::new(cli.rate),
            weights: cli.weights,
            recent_capacity: cli.recent,
            series_capacity: cli.series_capacity,
            retry: RetryPolicy {
                max_attempts: cli.max_reconnects,
                initial_backoff: Duration::from_millis(cli.backoff_initial_ms),
                max_backoff: Duration::from_millis(cli.backoff_max_ms),
            },
            connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
            drain_timeout: Duration::from_millis(cli.drain_timeout_ms),
            seed: cli.seed,
        };
        run.validate()?;

        Ok(Config {
            endpoint: cli.url,
            send_buffer: cli.send_buffer,
            report_interval: Duration::from_millis(cli.report_interval_ms),
            duration: cli.duration_secs.map(Duration::from_secs),
            dry_run: cli.dry_run,
            run,
        })
    }
}

fn validate_endpoint(url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Endpoint {
        url: url.to_string(),
        reason,
    };
    let request = url.into_client_request().map_err(|e| invalid(e.to_string()))?;
    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => Ok(()),
        other => Err(invalid(format!(
            "expected ws:// or wss://, got scheme {:?}",
            other.unwrap_or("")
        ))),
    }
}

fn at_least(name: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}
