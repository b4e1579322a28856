//! Read-only reporting surface polled by the operator.

use crate::models::domain::StatsSnapshot;
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: SupervisorState,
    /// Successful handshakes over the whole run.
    pub connections: u32,
    /// Failed connects or lost connections since the last healthy one.
    pub consecutive_failures: u32,
    /// Connection attempts that failed or timed out, over the whole run.
    pub connect_failures: u64,
    /// Established connections that were lost, over the whole run.
    pub connections_lost: u64,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Disconnected,
            connections: 0,
            consecutive_failures: 0,
            connect_failures: 0,
            connections_lost: 0,
        }
    }
}

/// Counters owned by the send loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SendStats {
    pub events_sent: u64,
    pub bytes_sent: u64,
    pub backpressure: u64,
    pub serialization_errors: u64,
    /// Events skipped because of a transient send failure.
    pub transient_failures: u64,
    pub windows_completed: u64,
    /// Emissions per second over the last completed window.
    pub realized_rate: f64,
    /// Times the send loop fell so far behind that its schedule restarted.
    pub reanchors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub link: LinkStatus,
    pub send: SendStats,
    pub stats: StatsSnapshot,
}

/// Cheap handle for polling the latest report. Clone freely.
#[derive(Debug, Clone)]
pub struct Monitor {
    link: watch::Receiver<LinkStatus>,
    send: watch::Receiver<SendStats>,
    stats: watch::Receiver<StatsSnapshot>,
}

impl Monitor {
    pub(crate) fn new(
        link: watch::Receiver<LinkStatus>,
        send: watch::Receiver<SendStats>,
        stats: watch::Receiver<StatsSnapshot>,
    ) -> Self {
        Self { link, send, stats }
    }

    pub fn state(&self) -> SupervisorState {
        self.link.borrow().state
    }

    pub fn report(&self) -> Report {
        Report {
            link: *self.link.borrow(),
            send: *self.send.borrow(),
            stats: self.stats.borrow().clone(),
        }
    }

    /// Resolves once the supervisor reaches `state`, or immediately if it is
    /// already there. Returns `false` if the supervisor went away first.
    pub async fn wait_for(&mut self, state: SupervisorState) -> bool {
        self.link.wait_for(|link| link.state == state).await.is_ok()
    }
}
