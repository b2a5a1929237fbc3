//! Wires the agent together and runs it until shutdown.

use std::sync::Arc;

use anyhow::Context;
use canbridge_control::CommandAllowlist;
use canbridge_discovery::{DiscoveryEvent, Scanner, ScannerConfig};
use canbridge_protocol::ChannelKind;
use canbridge_protocol::constants::PROTOCOL_VERSION;
use canbridge_protocol::messages::HelloRequest;
use canbridge_transport::DongleTransport;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{FrameSink, forward_frames};
use crate::client::{ChannelOptions, Uplink, run_channel};
use crate::config::AgentConfig;
use crate::dongles::DongleRegistry;
use crate::handler::ControlHandler;
use crate::runner::CommandRunner;

pub async fn run(cfg: AgentConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let transport = Arc::new(
        DongleTransport::bind(cfg.udp_bind)
            .await
            .with_context(|| format!("binding REMP socket on {}", cfg.udp_bind))?,
    );
    let mut scanner = Scanner::bind(ScannerConfig {
        port: cfg.discovery_port,
        interval: cfg.discovery_interval(),
        stale_timeout: cfg.stale_timeout(),
        ..Default::default()
    })
    .await
    .context("binding discovery socket")?;
    let events = scanner
        .take_events()
        .context("discovery events already taken")?;
    let scanner = Arc::new(scanner);

    let registry = Arc::new(DongleRegistry::new(
        Arc::clone(&transport),
        cfg.request_timeout(),
    ));
    let control = Uplink::default();
    let data = Uplink::default();
    let runner = Arc::new(CommandRunner::new(CommandAllowlist::new(
        cfg.commands.clone(),
    )));

    let opts = ChannelOptions {
        backend_url: cfg.backend_url.clone(),
        hello: HelloRequest {
            agent_id: cfg.agent_id.clone(),
            token: cfg.token.clone(),
            version: PROTOCOL_VERSION,
        },
        heartbeat: cfg.heartbeat_interval(),
        reconnect: cfg.reconnect.clone(),
    };
    info!(agent = %cfg.agent_id, name = %cfg.name, backend = %cfg.backend_url, "agent starting");

    let mut tasks = JoinSet::new();
    {
        let scanner = Arc::clone(&scanner);
        let cancel = cancel.clone();
        tasks.spawn(async move { scanner.run(cancel).await });
    }
    tasks.spawn(track_dongles(
        events,
        Arc::clone(&registry),
        control.clone(),
        cancel.clone(),
    ));
    tasks.spawn(forward_frames(
        transport.subscribe_frames(),
        data.clone(),
        cancel.clone(),
    ));
    tasks.spawn(run_channel(
        ChannelKind::Control,
        opts.clone(),
        control.clone(),
        Arc::new(ControlHandler::new(Arc::clone(&registry), runner, control)),
        cancel.clone(),
    ));
    tasks.spawn(run_channel(
        ChannelKind::Data,
        opts,
        data,
        Arc::new(FrameSink::new(registry)),
        cancel.clone(),
    ));

    cancel.cancelled().await;
    info!("agent shutting down");
    transport.shutdown();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// Applies scanner events and reports changes upstream.
async fn track_dongles(
    mut events: mpsc::Receiver<DiscoveryEvent>,
    registry: Arc<DongleRegistry>,
    control: Uplink,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        if let Some(report) = registry.apply(&event) {
            // Missed reports are resent on the next control handshake.
            control.send_msg(&report);
        }
    }
}
