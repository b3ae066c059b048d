//! WebSocket connection to the signaling relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use duet_protocol::{EventKind, SignalingConfig, SignalingMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;
use crate::token::TokenProvider;
use crate::transport::{SignalingTransport, Subscribers, Subscription};

type Outgoing = (SignalingMessage, oneshot::Sender<Result<(), TransportError>>);

/// Auto-reconnecting relay client. Sends resolve once the frame was
/// written to the socket.
pub struct WsTransport {
    outgoing: mpsc::Sender<Outgoing>,
    connected: Arc<AtomicBool>,
    subscribers: Subscribers,
}

impl WsTransport {
    /// Start the connection task. It runs until the transport is dropped.
    pub fn spawn(config: &SignalingConfig, token: Arc<dyn TokenProvider>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let connected = Arc::new(AtomicBool::new(false));
        let subscribers = Subscribers::new();
        let conn = Connection {
            url: config.url.clone(),
            tls_cert: config.tls_cert.clone(),
            max_message_size: config.max_message_size,
            initial_backoff: Duration::from_millis(config.reconnect_initial_ms),
            max_backoff: Duration::from_millis(config.reconnect_max_ms),
            token,
            connected: Arc::clone(&connected),
            subscribers: subscribers.clone(),
        };
        let task = tokio::spawn(conn.run(rx));
        (
            Self {
                outgoing: tx,
                connected,
                subscribers,
            },
            task,
        )
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let (ack, done) = oneshot::channel();
        self.outgoing
            .send((message, ack))
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, events: &[EventKind]) -> Subscription {
        self.subscribers.subscribe(events)
    }
}

/// Relay URL with the access token as query parameter. A base without a
/// path gets `/` so the handshake has a valid request target.
pub fn relay_url(base: &str, token: Option<&str>) -> anyhow::Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid signaling URL: {base}"))?;
    if let Some(token) = token {
        let param = format!("token={}", urlencoding::encode(token));
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{param}"),
            _ => param,
        };
        url.set_query(Some(&query));
    }
    Ok(url.into())
}

/// Build a TLS connector, pinning the server certificate if a cert path is provided.
/// Falls back to system roots if no cert path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load platform certificate: {e}");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded platform root certificates");

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

enum Ended {
    /// The transport handle was dropped.
    Shutdown,
    /// The relay closed the socket.
    ServerClosed,
}

struct Connection {
    url: String,
    tls_cert: Option<String>,
    max_message_size: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    token: Arc<dyn TokenProvider>,
    connected: Arc<AtomicBool>,
    subscribers: Subscribers,
}

impl Connection {
    async fn run(self, mut outgoing: mpsc::Receiver<Outgoing>) {
        if self.url.is_empty() {
            info!("No signaling URL configured, messages will not be delivered");
            while let Some((message, ack)) = outgoing.recv().await {
                debug!(event = %message.kind(), "Outgoing signal (no relay connected)");
                let _ = ack.send(Err(TransportError::NotConnected));
            }
            return;
        }

        let mut backoff = self.initial_backoff;
        loop {
            info!(url = %self.url, "Connecting to signaling server");
            let result = self.connect_and_handle(&mut outgoing).await;
            self.connected.store(false, Ordering::SeqCst);

            match result {
                Ok(Ended::Shutdown) => {
                    info!("Signaling transport shut down");
                    return;
                }
                Ok(Ended::ServerClosed) => {
                    info!("Signaling connection closed by server");
                    backoff = self.initial_backoff;
                }
                Err(e) => warn!("Signaling connection error: {e:#}"),
            }

            info!("Reconnecting in {} seconds...", backoff.as_secs());
            if !reject_until(&mut outgoing, backoff).await {
                return;
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn connect_and_handle(
        &self,
        outgoing: &mut mpsc::Receiver<Outgoing>,
    ) -> anyhow::Result<Ended> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let token = self.token.access_token();
        let url = relay_url(&self.url, token.as_deref())?;
        let connector = build_tls_connector(self.tls_cert.as_deref());
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            &url,
            Some(ws_config),
            false,
            Some(connector),
        )
        .await
        .context("WebSocket connection failed")?;

        info!("Connected to signaling server");
        self.connected.store(true, Ordering::SeqCst);
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalingMessage>(&text) {
                                Ok(message) => {
                                    debug!(event = %message.kind(), "Signal received");
                                    self.subscribers.publish(&message);
                                }
                                Err(e) => warn!("Invalid message from server: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(Ended::ServerClosed),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                next = outgoing.recv() => {
                    let Some((message, ack)) = next else {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(Ended::Shutdown);
                    };
                    let kind = message.kind();
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = ack.send(Err(TransportError::Encode(kind, e.to_string())));
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        let _ = ack.send(Err(TransportError::Send(e.to_string())));
                        return Err(e.into());
                    }
                    let _ = ack.send(Ok(()));
                }
            }
        }
    }
}

/// Fail queued sends while waiting out `delay`. Returns false once the
/// transport handle is gone.
async fn reject_until(outgoing: &mut mpsc::Receiver<Outgoing>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            next = outgoing.recv() => match next {
                Some((_, ack)) => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                }
                None => return false,
            },
        }
    }
}
