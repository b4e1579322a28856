use clap::Parser;
use dotenv::dotenv;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};
use trafficgen::config::{Cli, Config};
use trafficgen::error::RunError;
use trafficgen::logging;
use trafficgen::report::{Monitor, Report};
use trafficgen::supervisor::{ShutdownHandle, ShutdownOutcome, Supervisor};
use trafficgen::transport::{Connector, LoopbackConnector, WsConnector};
use trafficgen::Protocol;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    logging::init();

    let config = match Config::try_from(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            let e = RunError::from(e);
            error!(error = %e, "invalid configuration");
            return ExitCode::from(e.exit_code());
        }
    };

    info!(
        endpoint = %config.endpoint,
        rate = config.run.rate.events_per_second,
        weights = %config.run.weights,
        dry_run = config.dry_run,
        "starting traffic generator"
    );

    if config.dry_run {
        run(LoopbackConnector::new(config.send_buffer), config).await
    } else {
        let connector = WsConnector::new(config.endpoint.clone(), config.send_buffer);
        run(connector, config).await
    }
}

async fn run<C: Connector>(connector: C, config: Config) -> ExitCode {
    let supervisor = Supervisor::new(connector, config.run.clone());
    let reporter = tokio::spawn(report_every(supervisor.monitor(), config.report_interval));
    let stopper = tokio::spawn(stop_on_signal(supervisor.shutdown_handle(), config.duration));

    let result = supervisor.run().await;
    reporter.abort();
    stopper.abort();

    match result {
        Ok(summary) => {
            log_report("final report", &summary.report);
            match summary.outcome {
                ShutdownOutcome::Graceful => ExitCode::SUCCESS,
                ShutdownOutcome::Ungraceful => {
                    warn!("shutdown did not finish within the drain timeout");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn report_every(monitor: Monitor, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        log_report("report", &monitor.report());
    }
}

fn log_report(label: &str, report: &Report) {
    let stats = &report.stats;
    info!(
        state = %report.link.state,
        connections = report.link.connections,
        connect_failures = report.link.connect_failures,
        connections_lost = report.link.connections_lost,
        sent = report.send.events_sent,
        send_rate = report.send.realized_rate,
        backpressure = report.send.backpressure,
        reanchors = report.send.reanchors,
        packets = stats.packet_count,
        tcp = stats.protocol_count(Protocol::Tcp),
        udp = stats.protocol_count(Protocol::Udp),
        icmp = stats.protocol_count(Protocol::Icmp),
        server_rate = ?stats.latest_rate().map(|point| point.rate),
        recent = stats.recent_events.len(),
        malformed = stats.malformed_messages,
        "{}",
        label
    );
}

async fn stop_on_signal(handle: ShutdownHandle, duration: Option<Duration>) {
    let deadline = async {
        match duration {
            Some(duration) => time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown requested"),
        _ = deadline => info!("run duration elapsed"),
    }
    handle.trigger();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
