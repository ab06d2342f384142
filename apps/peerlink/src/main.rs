use anyhow::Context;
use clap::Parser;
use peerlink::config::{AppConfig, Cli};
use peerlink::loopback::run_loopback;
use peerlink::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);
    let cfg = AppConfig::from_cli(cli).context("invalid configuration")?;

    info!(
        local = %cfg.local,
        remote = %cfg.remote,
        transport = ?cfg.transport,
        relay = %cfg.relay,
        connect_timeout_ms = cfg.connect_timeout.as_millis() as u64,
        negotiation_timeout = ?cfg.session.negotiation_timeout,
        simulate_disconnect = cfg.simulate_disconnect,
        "starting peerlink loopback"
    );

    tokio::select! {
        report = run_loopback(&cfg) => {
            let report = report.context("loopback session failed")?;
            info!(
                initiator = %cfg.local,
                responder = %cfg.remote,
                restarts = report.initiator.restarts,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "peers connected"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; tearing down");
        }
    }
    Ok(())
}
