use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::protocol::PlaybackEvent;

const LOG_TAG: &str = "[Lockstep Server]";

/// Broadcast fan-out for the single shared viewing session.
///
/// Every connected peer gets a copy of each frame except the peer that sent
/// it; the sender relies on never hearing its own echo. Delivery is
/// best-effort: a peer whose queue is gone is simply skipped.
pub struct Relay {
    peers: DashMap<Uuid, UnboundedSender<String>>,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    pub fn subscribe(&self, peer_id: Uuid, tx: UnboundedSender<String>) {
        self.peers.insert(peer_id, tx);
        tracing::info!("{LOG_TAG} Peer {} connected ({} total)", peer_id, self.peers.len());
    }

    pub fn unsubscribe(&self, peer_id: Uuid) {
        self.peers.remove(&peer_id);
        tracing::info!("{LOG_TAG} Peer {} disconnected ({} left)", peer_id, self.peers.len());
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forward a raw frame from one peer to every other peer.
    ///
    /// The frame is parsed only for logging; the bytes on the wire are
    /// forwarded exactly as received so the relay stays a dumb pipe.
    pub fn broadcast_from(&self, from_peer: Uuid, frame: String) {
        match serde_json::from_str::<PlaybackEvent>(&frame) {
            Ok(event) => tracing::debug!(
                "{LOG_TAG} Relaying {:?} from {} to {} peers",
                event,
                from_peer,
                self.peers.len().saturating_sub(1)
            ),
            Err(e) => tracing::debug!("{LOG_TAG} Relaying unparsed frame from {}: {}", from_peer, e),
        }

        for entry in self.peers.iter() {
            if *entry.key() == from_peer {
                continue;
            }
            let _ = entry.value().send(frame.clone());
        }
    }
}
