//! Connection registry and event fan-out
//!
//! Each connection owns a bounded outbound queue drained by its socket task.
//! Broadcasts serialize once and `try_send` to every member of a channel; a
//! full or closed queue evicts that connection only, so a slow consumer can
//! never stall the round clock.

pub mod messages;
pub mod router;

pub use messages::{ClientMessage, ServerMessage};
pub use router::InboundRouter;

use crate::errors::{BetError, TransportError};
use crate::games::types::PlayerId;
use crate::metrics::MetricsRegistry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel every spectator and player joins
pub const GAME_CHANNEL: &str = "game";

pub type ConnectionId = Uuid;

/// Private channel for one player's events
pub fn player_channel(player: PlayerId) -> String {
    format!("player:{}", player)
}

struct Connection {
    tx: mpsc::Sender<String>,
    channels: HashSet<String>,
    player: Option<PlayerId>,
    last_seen: Instant,
}

/// Result of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

pub struct BroadcastHub {
    connections: DashMap<ConnectionId, Connection>,
    channels: DashMap<String, HashSet<ConnectionId>>,
    queue_capacity: usize,
    liveness_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl BroadcastHub {
    pub fn new(
        queue_capacity: usize,
        liveness_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            liveness_timeout,
            metrics,
        }
    }

    /// Accept a connection; the receiver feeds its socket writer
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                tx,
                channels: HashSet::new(),
                player: None,
                last_seen: Instant::now(),
            },
        );
        self.metrics.connection_opened();
        debug!(connection_id = %id, "Connection registered");
        (id, rx)
    }

    /// Drop a connection and all of its channel memberships
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return false;
        };
        for channel in connection.channels {
            if let Some(mut members) = self.channels.get_mut(&channel) {
                members.remove(&id);
            }
        }
        self.channels.retain(|_, members| !members.is_empty());
        self.metrics.connection_closed();
        debug!(connection_id = %id, "Connection removed");
        true
    }

    fn evict(&self, id: ConnectionId, reason: &str) {
        if self.disconnect(id) {
            MetricsRegistry::incr(&self.metrics.connections_evicted);
            info!(connection_id = %id, reason, "Connection evicted");
        }
    }

    /// Join `channel`; false if the connection is unknown.
    ///
    /// The connection entry stays locked while the channel is updated, so a
    /// concurrent `disconnect` sees the membership and removes it.
    pub fn register(&self, id: ConnectionId, channel: &str) -> bool {
        let Some(mut connection) = self.connections.get_mut(&id) else {
            return false;
        };
        if connection.channels.insert(channel.to_string()) {
            self.channels
                .entry(channel.to_string())
                .or_default()
                .insert(id);
        }
        true
    }

    /// Leave `channel`; false if the connection was not a member
    pub fn unregister(&self, id: ConnectionId, channel: &str) -> bool {
        let Some(mut connection) = self.connections.get_mut(&id) else {
            return false;
        };
        if !connection.channels.remove(channel) {
            return false;
        }
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(&id);
        }
        self.channels.remove_if(channel, |_, members| members.is_empty());
        true
    }

    /// Bind the connection to a player identity.
    ///
    /// The first identity used sticks; a different one is rejected.
    pub fn bind_player(&self, id: ConnectionId, player: PlayerId) -> Result<(), BetError> {
        let mut connection = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| BetError::InvalidBet("unknown connection".to_string()))?;
        match connection.player {
            None => {
                connection.player = Some(player);
                Ok(())
            }
            Some(bound) if bound == player => Ok(()),
            Some(bound) => Err(BetError::InvalidBet(format!(
                "connection is bound to player {}",
                bound
            ))),
        }
    }

    pub fn player_of(&self, id: ConnectionId) -> Option<PlayerId> {
        self.connections.get(&id).and_then(|c| c.player)
    }

    /// Record activity on a connection
    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut connection) = self.connections.get_mut(&id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Queue a message for one connection, evicting it on failure
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> Result<(), TransportError> {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                return Ok(());
            }
        };
        self.send_raw(id, payload)
    }

    fn send_raw(&self, id: ConnectionId, payload: String) -> Result<(), TransportError> {
        let tx = self
            .connections
            .get(&id)
            .map(|c| c.tx.clone())
            .ok_or(TransportError::UnknownConnection)?;

        match tx.try_send(payload) {
            Ok(()) => {
                MetricsRegistry::incr(&self.metrics.messages_sent);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.evict(id, "send queue full");
                Err(TransportError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.evict(id, "connection closed");
                Err(TransportError::Closed)
            }
        }
    }

    /// Best-effort fan-out to every member of `channel`
    pub fn broadcast(&self, channel: &str, message: &ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, channel, "Failed to serialize broadcast");
                return report;
            }
        };

        let members: Vec<ConnectionId> = self
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();

        for id in members {
            match self.send_raw(id, payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TransportError::UnknownConnection) => {}
                Err(_) => report.evicted.push(id),
            }
        }
        report
    }

    /// Evict connections silent for longer than the liveness timeout
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| now.saturating_duration_since(c.last_seen) > self.liveness_timeout)
            .map(|c| *c.key())
            .collect();
        for id in &stale {
            self.evict(*id, "liveness timeout");
        }
        stale
    }

    pub fn spawn_liveness_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = hub.sweep_idle();
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Liveness sweep evicted connections");
                }
            }
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_size(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }
}
