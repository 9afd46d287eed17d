//! Session/connection layer
//!
//! Tracks one entry per connected client: channel state, in-flight request
//! count, and the outbound channel end. The pipeline controller is
//! transport-agnostic; it only ever calls `send`, and a disconnected
//! client turns delivery into a no-op rather than an abort.

use crate::error::PipelineError;
use crate::models::{ChannelState, OutboundMessage};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound channel depth per client.
const CHANNEL_CAPACITY: usize = 32;

struct SessionEntry {
    state: ChannelState,
    in_flight: usize,
    created_at: DateTime<Utc>,
    sender: Option<mpsc::Sender<OutboundMessage>>,
}

/// Registry of connected clients. Safe for concurrent access from every
/// in-flight request.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    max_clients: usize,
    max_in_flight: usize,
}

impl SessionRegistry {
    pub fn new(max_clients: usize, max_in_flight: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_clients,
            max_in_flight,
        }
    }

    /// Register a client and hand back the receiving end of its outbound
    /// channel. Returns `None` when the client cap is reached.
    pub async fn connect(&self, client_id: Uuid) -> Option<mpsc::Receiver<OutboundMessage>> {
        let mut sessions = self.sessions.write().await;

        let open_count = sessions
            .values()
            .filter(|s| s.state != ChannelState::Closed)
            .count();
        if open_count >= self.max_clients && !sessions.contains_key(&client_id) {
            warn!(%client_id, "connection refused, client cap reached");
            return None;
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        sessions.insert(
            client_id,
            SessionEntry {
                state: ChannelState::Connecting,
                in_flight: 0,
                created_at: Utc::now(),
                sender: Some(tx),
            },
        );

        info!(%client_id, total = sessions.len(), "client connected");
        Some(rx)
    }

    /// Transport handshake finished; the channel is now deliverable.
    pub async fn mark_open(&self, client_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&client_id) {
            entry.state = ChannelState::Open;
        }
    }

    /// Account for a new request. False when the client is gone or at its
    /// in-flight bound; the caller must not start the pipeline in that case.
    pub async fn begin_request(&self, client_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&client_id) {
            Some(entry) if entry.state != ChannelState::Closed => {
                if entry.in_flight >= self.max_in_flight {
                    warn!(%client_id, in_flight = entry.in_flight, "in-flight bound reached");
                    return false;
                }
                entry.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Account for a finished request, whatever its outcome. Closed
    /// sessions are dropped once their last request drains.
    pub async fn complete_request(&self, client_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&client_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.state == ChannelState::Closed && entry.in_flight == 0 {
                sessions.remove(&client_id);
                debug!(%client_id, "closed session drained and removed");
            }
        }
    }

    /// Push one outbound message to a client's channel.
    pub async fn send(&self, client_id: Uuid, message: OutboundMessage) -> Result<()> {
        let sender = {
            let sessions = self.sessions.read().await;
            match sessions.get(&client_id) {
                Some(entry) if entry.state == ChannelState::Open => entry.sender.clone(),
                _ => None,
            }
        };

        let Some(sender) = sender else {
            return Err(PipelineError::ClientGone(client_id));
        };

        if sender.send(message).await.is_err() {
            // Receiver dropped without a disconnect call; close the session.
            self.disconnect(client_id).await;
            return Err(PipelineError::ClientGone(client_id));
        }

        Ok(())
    }

    /// Mark a session closed. In-flight requests keep running; their final
    /// delivery becomes a no-op.
    pub async fn disconnect(&self, client_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&client_id) {
            entry.state = ChannelState::Closed;
            entry.sender = None;
            if entry.in_flight == 0 {
                sessions.remove(&client_id);
            }
            info!(%client_id, "client disconnected");
        }
    }

    pub async fn channel_state(&self, client_id: Uuid) -> Option<ChannelState> {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .map(|e| e.state)
    }

    pub async fn session_age(&self, client_id: Uuid) -> Option<chrono::Duration> {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .map(|e| Utc::now() - e.created_at)
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state != ChannelState::Closed)
            .count()
    }

    pub async fn in_flight(&self, client_id: Uuid) -> usize {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .map(|e| e.in_flight)
            .unwrap_or(0)
    }
}
