mod cli;

use std::sync::Arc;

use anyhow::Context;
use duet_client::call::{CallClient, CallDeps, CallEvent, Session};
use duet_client::config::load_config;
use duet_client::ice_servers::{ConfiguredIceServers, HttpIceServerProvider, IceServerProvider};
use duet_client::media::SyntheticMediaProvider;
use duet_client::metrics::{HttpMetricsSink, MetricsSink};
use duet_client::network::poll_local_route;
use duet_client::rtc::RtcPeerFactory;
use duet_client::token::{StaticToken, TokenProvider, user_id_from_token};
use duet_client::ws::WsTransport;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let args = cli::parse_args()?;
    let mut config = load_config(&args.config_path)?;
    args.apply(&mut config);

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    match args.token.as_deref().map(user_id_from_token) {
        Some(Some(user_id)) => info!(%user_id, "Access token loaded"),
        Some(None) => warn!("Access token carries no user identity, metrics will not be sent"),
        None => warn!("No access token, the relay may reject the connection"),
    }
    let token: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(args.token.clone()));

    let (transport, ws_task) = WsTransport::spawn(&config.signaling, Arc::clone(&token));
    let ice_servers: Arc<dyn IceServerProvider> = match &config.ice.provider_url {
        Some(url) => Arc::new(HttpIceServerProvider::new(url.clone(), Arc::clone(&token))),
        None => Arc::new(ConfiguredIceServers::new(&config.ice)),
    };
    let metrics = config.metrics.endpoint.as_ref().map(|url| {
        Arc::new(HttpMetricsSink::new(url.clone(), Arc::clone(&token))) as Arc<dyn MetricsSink>
    });
    if config.metrics.enabled && metrics.is_none() {
        info!("No metrics endpoint configured, connection metrics are disabled");
    }

    let deps = CallDeps {
        transport: Arc::new(transport),
        peers: Arc::new(RtcPeerFactory),
        media: Arc::new(SyntheticMediaProvider),
        ice_servers,
        metrics,
        token,
    };
    let poll_interval = config.network.poll_interval();
    let (client, mut events) = CallClient::spawn(config, deps);
    let route_watch = tokio::spawn(poll_local_route(poll_interval, client.network_events()));

    let mut session = Session::new(args.session_id.clone());
    if let Some(partner) = &args.partner_id {
        session = session.with_partner(partner.clone());
    }
    client.start_session(session)?;
    if args.call_now {
        client.start_call()?;
    }

    let mut state = client.state();
    let mut quality = client.quality();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                CallEvent::Error(e) => error!(code = e.code(), "Call error: {e}"),
                CallEvent::LocalMediaReady(media) => info!(
                    stream_id = %media.stream_id,
                    tracks = media.tracks.len(),
                    "Local media ready"
                ),
                CallEvent::RemoteTrack(track) => info!(
                    track_id = %track.id,
                    kind = ?track.kind,
                    "Remote track ready"
                ),
            },
            Ok(()) = state.changed() => {
                let current = *state.borrow();
                info!(state = %current, "Call state changed");
            }
            Ok(()) = quality.changed() => {
                let current = *quality.borrow();
                info!(quality = ?current, "Call quality changed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    route_watch.abort();
    client.shutdown().await?;
    ws_task.abort();
    Ok(())
}
