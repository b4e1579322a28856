//! Run lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Running -> Draining -> Closed
//!                     ^            |
//!                     +-- lost ----+   (bounded retries, exponential backoff)
//! ```
//!
//! While `Running`, the paced send loop and the receive loop are two
//! independent tasks. Either one ending on its own means the connection is
//! gone; a shutdown request stops both and waits for them, at most for the
//! drain timeout.

use crate::config::{ConfigError, RunSettings};
use crate::error::RunError;
use crate::governor::{RateGovernor, RateTarget};
use crate::report::{LinkStatus, Monitor, Report, SendStats, SupervisorState};
use crate::stats::StatsAggregator;
use crate::synth::EventSynthesizer;
use crate::transport::{ConnectError, Connector, EventSink, InboundSource, ReceiveError, SendError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownOutcome {
    /// In-flight work finished inside the drain timeout.
    Graceful,
    /// The drain timeout elapsed and the connection tasks were aborted.
    Ungraceful,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: ShutdownOutcome,
    pub report: Report,
}

/// Asks the supervisor to drain and close. Triggering more than once is
/// harmless.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.signal.send_replace(true);
    }
}

enum SessionEnd {
    Shutdown(ShutdownOutcome),
    Lost { healthy: bool, reason: String },
}

#[derive(Debug)]
enum SendLoopExit {
    Stopped,
    ConnectionClosed,
}

#[derive(Debug)]
enum ReceiveLoopExit {
    Stopped,
    Ended,
    ConnectionLost(String),
}

pub struct Supervisor<C: Connector> {
    connector: C,
    settings: RunSettings,
    aggregator: Arc<StatsAggregator>,
    link: watch::Sender<LinkStatus>,
    send_stats: Arc<watch::Sender<SendStats>>,
    shutdown_signal: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(connector: C, settings: RunSettings) -> Self {
        let aggregator = Arc::new(StatsAggregator::new(
            settings.recent_capacity,
            settings.series_capacity,
        ));
        let (link, _) = watch::channel(LinkStatus::default());
        let (send_stats, _) = watch::channel(SendStats::default());
        let (shutdown_signal, shutdown) = watch::channel(false);
        Self {
            connector,
            settings,
            aggregator,
            link,
            send_stats: Arc::new(send_stats),
            shutdown_signal: Arc::new(shutdown_signal),
            shutdown,
        }
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.link.subscribe(),
            self.send_stats.subscribe(),
            self.aggregator.subscribe(),
        )
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: Arc::clone(&self.shutdown_signal),
        }
    }

    /// Drive the run to completion. Returns once the supervisor is `Closed`.
    ///
    /// Only invalid settings and exhausted retries are errors; everything
    /// else is recovered from and counted in the report.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        let synth = match self.prepare() {
            Ok(synth) => synth,
            Err(e) => {
                error!(error = %e, "refusing to start");
                self.set_state(SupervisorState::Closed);
                return Err(e.into());
            }
        };

        let endpoint = self.connector.endpoint().to_string();
        let mut failures = 0u32;
        let mut sessions = 0u64;

        loop {
            if *self.shutdown.borrow() {
                return Ok(self.finish(ShutdownOutcome::Graceful));
            }
            self.set_state(SupervisorState::Connecting);

            let connect_timeout = self.settings.connect_timeout;
            let attempt = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown) => None,
                result = timeout(connect_timeout, self.connector.connect()) => Some(result),
            };
            let Some(attempt) = attempt else {
                return Ok(self.finish(ShutdownOutcome::Graceful));
            };
            let attempt = attempt.unwrap_or_else(|_| {
                Err(ConnectError {
                    endpoint: endpoint.clone(),
                    reason: format!("handshake did not complete within {connect_timeout:?}"),
                })
            });

            let (last_error, lost) = match attempt {
                Ok((sink, source)) => {
                    sessions += 1;
                    self.link.send_modify(|link| {
                        link.connections += 1;
                        link.state = SupervisorState::Running;
                    });
                    info!(%endpoint, session = sessions, "connected, streaming events");

                    match self.run_session(sink, source, &synth, sessions).await {
                        SessionEnd::Shutdown(outcome) => return Ok(self.finish(outcome)),
                        SessionEnd::Lost { healthy, reason } => {
                            if healthy {
                                failures = 0;
                            }
                            warn!(%endpoint, %reason, "connection lost");
                            (reason, true)
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                    (e.to_string(), false)
                }
            };

            failures += 1;
            self.link.send_modify(|link| {
                link.consecutive_failures = failures;
                if lost {
                    link.connections_lost += 1;
                } else {
                    link.connect_failures += 1;
                }
            });

            if self.settings.retry.exhausted(failures) {
                error!(%endpoint, attempts = failures, "giving up, retries exhausted");
                self.set_state(SupervisorState::Closed);
                return Err(RunError::RetriesExhausted {
                    endpoint,
                    attempts: failures,
                    last_error,
                });
            }

            let delay = self.settings.retry.backoff(failures);
            self.set_state(SupervisorState::Connecting);
            info!(?delay, failures, "reconnecting after backoff");
            let interrupted = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown) => true,
                _ = sleep(delay) => false,
            };
            if interrupted {
                return Ok(self.finish(ShutdownOutcome::Graceful));
            }
        }
    }

    fn prepare(&self) -> Result<EventSynthesizer, ConfigError> {
        self.settings.validate()?;
        Ok(EventSynthesizer::new(self.settings.weights)?)
    }

    async fn run_session(
        &mut self,
        sink: C::Sink,
        source: C::Source,
        synth: &EventSynthesizer,
        session: u64,
    ) -> SessionEnd {
        let progress_before = self.progress();
        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(session)),
            None => StdRng::from_entropy(),
        };

        let (stop, stop_rx) = watch::channel(false);
        let mut send_task = tokio::spawn(send_loop(
            sink,
            synth.clone(),
            self.settings.rate,
            rng,
            Arc::clone(&self.send_stats),
            stop_rx.clone(),
        ));
        let mut recv_task = tokio::spawn(receive_loop(
            source,
            Arc::clone(&self.aggregator),
            stop_rx,
        ));

        let mut send_exit = None;
        let mut recv_exit = None;
        let shutdown = tokio::select! {
            _ = stop_requested(&mut self.shutdown) => true,
            exit = &mut send_task => {
                send_exit = Some(exit);
                false
            }
            exit = &mut recv_task => {
                recv_exit = Some(exit);
                false
            }
        };

        stop.send_replace(true);
        if shutdown {
            self.set_state(SupervisorState::Draining);
            info!(timeout = ?self.settings.drain_timeout, "draining in-flight work");
        }

        let drained = timeout(self.settings.drain_timeout, async {
            let send = match send_exit {
                Some(exit) => exit,
                None => (&mut send_task).await,
            };
            let recv = match recv_exit {
                Some(exit) => exit,
                None => (&mut recv_task).await,
            };
            (send, recv)
        })
        .await;

        let healthy = self.progress() != progress_before;
        let (send, recv) = match drained {
            Ok(exits) => exits,
            Err(_) => {
                send_task.abort();
                recv_task.abort();
                warn!(timeout = ?self.settings.drain_timeout, "drain timed out, forcing close");
                return if shutdown {
                    SessionEnd::Shutdown(ShutdownOutcome::Ungraceful)
                } else {
                    SessionEnd::Lost {
                        healthy,
                        reason: "connection tasks did not stop before the drain timeout".into(),
                    }
                };
            }
        };

        if shutdown {
            return SessionEnd::Shutdown(ShutdownOutcome::Graceful);
        }
        SessionEnd::Lost {
            healthy,
            reason: loss_reason(send, recv),
        }
    }

    /// Events acknowledged plus messages ingested so far.
    fn progress(&self) -> (u64, u64) {
        (
            self.send_stats.borrow().events_sent,
            self.aggregator.messages_ingested(),
        )
    }

    fn set_state(&self, state: SupervisorState) {
        let mut previous = state;
        self.link.send_modify(|link| previous = std::mem::replace(&mut link.state, state));
        if previous != state {
            debug!(from = %previous, to = %state, "supervisor state change");
        }
    }

    fn finish(&self, outcome: ShutdownOutcome) -> RunSummary {
        self.set_state(SupervisorState::Closed);
        let report = self.monitor().report();
        info!(
            ?outcome,
            events_sent = report.send.events_sent,
            packet_count = report.stats.packet_count,
            "supervisor closed"
        );
        RunSummary { outcome, report }
    }
}

/// Resolves once `stop` reads `true`. A dropped sender counts as a stop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn send_loop<S: EventSink>(
    mut sink: S,
    synth: EventSynthesizer,
    rate: RateTarget,
    mut rng: StdRng,
    stats: Arc<watch::Sender<SendStats>>,
    mut stop: watch::Receiver<bool>,
) -> SendLoopExit {
    let origin = Instant::now();
    let mut governor = RateGovernor::new(rate, Duration::ZERO);
    let base_reanchors = stats.borrow().reanchors;

    let exit = loop {
        if *stop.borrow() {
            break SendLoopExit::Stopped;
        }
        let delay = governor.pace(origin.elapsed());
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break SendLoopExit::Stopped,
                _ = sleep(delay) => {}
            }
        }

        let event = synth.generate_with(&mut rng);
        let window = governor.record_emission(origin.elapsed());
        let result = sink.send(&event).await;
        let reanchors = base_reanchors + governor.reanchors();

        stats.send_modify(|s| {
            if let Some(window) = window {
                s.windows_completed += window.windows();
                s.realized_rate = window.latest_rate();
            }
            s.reanchors = reanchors;
            match &result {
                Ok(ack) => {
                    s.events_sent += 1;
                    s.bytes_sent += ack.bytes as u64;
                }
                Err(SendError::Backpressure) => {
                    s.backpressure += 1;
                    s.transient_failures += 1;
                }
                Err(SendError::Serialization(_)) => {
                    s.serialization_errors += 1;
                    s.transient_failures += 1;
                }
                // ends the session; the supervisor counts it as a lost connection
                Err(SendError::ConnectionClosed) => {}
            }
        });
        if let Some(window) = window {
            debug!(
                events = window.events,
                rate = window.realized_rate,
                idle_windows = window.idle_windows,
                "send window closed"
            );
        }

        match result {
            Ok(_) => {}
            Err(SendError::Backpressure) => debug!("outbound queue full, event skipped"),
            Err(SendError::Serialization(e)) => warn!(error = %e, "event skipped"),
            Err(SendError::ConnectionClosed) => break SendLoopExit::ConnectionClosed,
        }
    };

    sink.close().await;
    exit
}

async fn receive_loop<R: InboundSource>(
    mut source: R,
    aggregator: Arc<StatsAggregator>,
    mut stop: watch::Receiver<bool>,
) -> ReceiveLoopExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => return ReceiveLoopExit::Stopped,
            next = source.receive() => next,
        };
        match next {
            Some(Ok(message)) => aggregator.ingest(message),
            Some(Err(ReceiveError::Malformed(reason))) => {
                warn!(%reason, "dropping malformed inbound message");
                aggregator.record_malformed();
            }
            Some(Err(ReceiveError::ConnectionLost(reason))) => {
                return ReceiveLoopExit::ConnectionLost(reason)
            }
            None => return ReceiveLoopExit::Ended,
        }
    }
}

fn loss_reason(
    send: Result<SendLoopExit, JoinError>,
    recv: Result<ReceiveLoopExit, JoinError>,
) -> String {
    match (send, recv) {
        (_, Ok(ReceiveLoopExit::ConnectionLost(reason))) => reason,
        (Ok(SendLoopExit::ConnectionClosed), _) => "connection closed while sending".into(),
        (_, Ok(ReceiveLoopExit::Ended)) => "server closed the connection".into(),
        (Err(e), _) | (_, Err(e)) => format!("connection task failed: {e}"),
        (Ok(SendLoopExit::Stopped), Ok(ReceiveLoopExit::Stopped)) => "connection stopped".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_reason_prefers_receive_error() {
        let reason = loss_reason(
            Ok(SendLoopExit::ConnectionClosed),
            Ok(ReceiveLoopExit::ConnectionLost("reset by peer".into())),
        );
        assert_eq!(reason, "reset by peer");
    }

    #[test]
    fn loss_reason_reports_server_close() {
        let reason = loss_reason(Ok(SendLoopExit::Stopped), Ok(ReceiveLoopExit::Ended));
        assert_eq!(reason, "server closed the connection");
    }

    #[test]
    fn shutdown_handle_is_sticky() {
        let (signal, rx) = watch::channel(false);
        let handle = ShutdownHandle {
            signal: Arc::new(signal),
        };
        assert!(!*rx.borrow());
        handle.trigger();
        handle.trigger();
        assert!(*rx.borrow());
    }
}
