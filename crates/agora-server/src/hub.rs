//! Outbound fan-out to live connections.
//!
//! Every connection owns a bounded queue drained by its socket writer. Sends
//! never wait: a connection whose queue is full is dropped from the hub, which
//! closes its writer and, in turn, the socket.

use std::collections::HashMap;

use agora_shared::protocol::ServerEvent;
use agora_shared::{ConnectionId, UserId};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Per-connection queue depth.
pub const OUTBOUND_QUEUE: usize = 256;

struct Peer {
    user: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
pub struct Hub {
    peers: Mutex<HashMap<ConnectionId, Peer>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, conn: ConnectionId, user: UserId, tx: mpsc::Sender<ServerEvent>) {
        self.peers.lock().await.insert(conn, Peer { user, tx });
    }

    pub async fn remove(&self, conn: ConnectionId) {
        self.peers.lock().await.remove(&conn);
    }

    /// Queue `event` for every connection.
    pub async fn broadcast(&self, event: &ServerEvent) {
        let mut peers = self.peers.lock().await;
        let mut dead = Vec::new();
        for (conn, peer) in peers.iter() {
            if !deliver(*conn, peer, event.clone()) {
                dead.push(*conn);
            }
        }
        for conn in dead {
            peers.remove(&conn);
        }
    }

    /// Queue `event` for one connection. Returns whether it was queued.
    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let mut peers = self.peers.lock().await;
        let Some(peer) = peers.get(&conn) else {
            return false;
        };
        if deliver(conn, peer, event) {
            return true;
        }
        peers.remove(&conn);
        false
    }

    /// Queue `event` for every connection of `user`; returns how many got it.
    pub async fn send_to_user(&self, user: UserId, event: &ServerEvent) -> usize {
        let mut peers = self.peers.lock().await;
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn, peer) in peers.iter().filter(|(_, p)| p.user == user) {
            if deliver(*conn, peer, event.clone()) {
                delivered += 1;
            } else {
                dead.push(*conn);
            }
        }
        for conn in dead {
            peers.remove(&conn);
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

fn deliver(conn: ConnectionId, peer: &Peer, event: ServerEvent) -> bool {
    match peer.tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn = %conn, user = %peer.user, "outbound queue full, dropping connection");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn = %conn, "connection already closed");
            false
        }
    }
}
