use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::protocol::PlaybackEvent;
use crate::session::EventSink;

/// Client side of the relay channel.
///
/// Owns the outbound queue for the websocket; emission is fire-and-forget
/// and a missed message is tolerated by the sync design. The connection may
/// come and go; `connect` installs a fresh transport each time.
pub struct RelayClient {
    inner: Arc<RelayClientState>,
}

struct RelayClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    stats: Mutex<RelayStats>,
}

#[derive(Default, Clone)]
struct RelayStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
}

pub struct RelayStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
}

impl RelayClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayClientState {
                tx: Mutex::new(None),
                stats: Mutex::new(RelayStats::default()),
            }),
        }
    }

    /// Connect to the relay. Returns a receiver that resolves when the socket
    /// closes. Incoming frames that parse as playback events are handed to
    /// `on_event`; anything else is dropped after a debug log.
    pub async fn connect<F>(&self, server_url: &str, on_event: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(PlaybackEvent) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to relay")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx.clone());

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Receiver task
        let handler = Arc::new(on_event);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<PlaybackEvent>(&text) {
                            Ok(event) => handler(event),
                            Err(e) => {
                                tracing::debug!("Ignoring malformed relay frame: {}", e)
                            }
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(12)).await;
                if ping_inner.send_keepalive().is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    pub fn mark_connected(&self) {
        self.inner.stats.lock().connected_since = Some(Instant::now());
    }

    pub fn mark_disconnected(&self) {
        let mut stats = self.inner.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    pub fn stats_snapshot(&self) -> RelayStatsSnapshot {
        self.inner.snapshot()
    }

    /// Queue a playback event for the relay. Serialization failures and a
    /// missing transport both just drop the event.
    pub fn send_event(&self, event: &PlaybackEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        self.inner.record_outgoing(json.len() as u64);
        if let Some(tx) = self.inner.tx.lock().clone() {
            tx.send(WsMessage::Text(json.into()))
                .context("Failed to queue event to socket")?;
        }
        Ok(())
    }
}

impl EventSink for RelayClient {
    fn emit(&self, event: PlaybackEvent) {
        if let Err(e) = self.send_event(&event) {
            tracing::warn!("Dropped outbound {:?}: {}", event, e);
        }
    }
}

impl RelayClientState {
    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let payload = nonce.to_le_bytes().to_vec();
        self.record_outgoing(payload.len() as u64);
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(WsMessage::Ping(payload.into())).map_err(|_| ())
        } else {
            Err(())
        }
    }

    fn clear_transport(&self) {
        *self.tx.lock() = None;
        let mut stats = self.stats.lock();
        stats.last_ping_nonce = None;
        stats.last_ping_sent = None;
    }

    fn snapshot(&self) -> RelayStatsSnapshot {
        let stats = self.stats.lock();
        RelayStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age: stats.last_message_at.map(|at| at.elapsed().as_secs_f32()),
            connected_duration: stats
                .connected_since
                .map(|at| at.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
        }
    }
}
