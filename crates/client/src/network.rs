//! OS network transitions turned into throttled ICE restarts.

use std::net::IpAddr;
use std::time::Duration;

use duet_protocol::NetworkConfig;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
    ConnectionTypeChanged,
}

/// Debounces network changes and throttles the resulting restarts.
#[derive(Debug, Clone, Copy)]
pub struct NetworkResponder {
    debounce: Duration,
    throttle: Duration,
}

impl From<&NetworkConfig> for NetworkResponder {
    fn from(config: &NetworkConfig) -> Self {
        Self::new(config.debounce(), config.throttle())
    }
}

impl NetworkResponder {
    pub fn new(debounce: Duration, throttle: Duration) -> Self {
        Self { debounce, throttle }
    }

    /// Run until `events` closes, calling `restart` for each ICE restart.
    pub async fn run<F>(self, mut events: mpsc::Receiver<NetworkEvent>, mut restart: F)
    where
        F: FnMut() + Send,
    {
        let mut deadline: Option<Instant> = None;
        let mut last_restart: Option<Instant> = None;

        loop {
            let armed = deadline;
            let timer = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    match event {
                        NetworkEvent::Online | NetworkEvent::ConnectionTypeChanged => {
                            debug!(?event, "Network change, debouncing ICE restart");
                            deadline = Some(Instant::now() + self.debounce);
                        }
                        NetworkEvent::Offline => {
                            if deadline.take().is_some() {
                                debug!("Network offline, pending ICE restart cancelled");
                            }
                        }
                    }
                }
                _ = timer => {
                    deadline = None;
                    let now = Instant::now();
                    let throttled = last_restart
                        .is_some_and(|at| now.duration_since(at) < self.throttle);
                    if throttled {
                        debug!("ICE restart throttled");
                        continue;
                    }
                    last_restart = Some(now);
                    info!("Network settled, requesting ICE restart");
                    restart();
                }
            }
        }
    }
}

/// Address of the interface that routes to the public internet.
async fn local_route() -> Option<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    // UDP connect only selects a route; nothing is sent.
    socket.connect("8.8.8.8:80").await.ok()?;
    let addr = socket.local_addr().ok()?.ip();
    (!addr.is_unspecified()).then_some(addr)
}

pub fn route_change(previous: Option<IpAddr>, current: Option<IpAddr>) -> Option<NetworkEvent> {
    match (previous, current) {
        (None, Some(_)) => Some(NetworkEvent::Online),
        (Some(_), None) => Some(NetworkEvent::Offline),
        (Some(a), Some(b)) if a != b => Some(NetworkEvent::ConnectionTypeChanged),
        _ => None,
    }
}

/// Probe the local route every `interval` and report transitions.
/// Returns when the receiver is dropped.
pub async fn poll_local_route(interval: Duration, events: mpsc::Sender<NetworkEvent>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut previous = local_route().await;
    info!(route = ?previous, "Watching local network route");

    loop {
        ticker.tick().await;
        let current = local_route().await;
        if let Some(event) = route_change(previous, current) {
            info!(?event, from = ?previous, to = ?current, "Local route changed");
            if events.send(event).await.is_err() {
                return;
            }
        }
        previous = current;
    }
}
