//! Inbound message routing for game channel connections

use super::messages::{ClientMessage, ServerMessage};
use super::{BroadcastHub, ConnectionId};
use crate::games::round::RoundStateMachine;
use crate::games::types::PlayerId;
use crate::metrics::MetricsRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InboundRouter {
    hub: Arc<BroadcastHub>,
    machine: Arc<RoundStateMachine>,
    metrics: Arc<MetricsRegistry>,
}

impl InboundRouter {
    pub fn new(
        hub: Arc<BroadcastHub>,
        machine: Arc<RoundStateMachine>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            hub,
            machine,
            metrics,
        }
    }

    /// Handle one text frame from `conn`.
    ///
    /// Malformed frames are logged and dropped without a reply.
    pub async fn route_inbound(&self, conn: ConnectionId, text: &str) {
        self.hub.touch(conn);

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                MetricsRegistry::incr(&self.metrics.malformed_messages);
                warn!(connection_id = %conn, error = %e, "Dropping malformed message");
                return;
            }
        };

        let reply = match message {
            ClientMessage::PlaceBet {
                user_id,
                amount,
                auto_cashout,
            } => self.place_bet(conn, user_id, amount, auto_cashout).await,
            ClientMessage::CashOut { user_id } => self.cash_out(conn, user_id).await,
            ClientMessage::Ping { timestamp } => ServerMessage::Pong { timestamp },
        };

        if let Err(e) = self.hub.send_to(conn, &reply) {
            debug!(connection_id = %conn, error = %e, "Reply not delivered");
        }
    }

    async fn place_bet(
        &self,
        conn: ConnectionId,
        player: PlayerId,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> ServerMessage {
        if let Err(e) = self.hub.bind_player(conn, player) {
            MetricsRegistry::incr(&self.metrics.bets_rejected);
            return ServerMessage::bet_rejected(&e);
        }
        match self.machine.place_bet(player, amount, auto_cashout).await {
            Ok(_) => ServerMessage::bet_accepted(),
            Err(e) => {
                debug!(connection_id = %conn, player_id = %player, error = %e, "Bet rejected");
                ServerMessage::bet_rejected(&e)
            }
        }
    }

    async fn cash_out(&self, conn: ConnectionId, player: PlayerId) -> ServerMessage {
        if let Err(e) = self.hub.bind_player(conn, player) {
            MetricsRegistry::incr(&self.metrics.bets_rejected);
            return ServerMessage::cash_out_rejected(&e);
        }
        match self.machine.cash_out(player).await {
            Ok(wager) => ServerMessage::cash_out_accepted(
                wager.cashout_multiplier.unwrap_or_default(),
                wager.payout,
            ),
            Err(e) => {
                debug!(connection_id = %conn, player_id = %player, error = %e, "Cash-out rejected");
                ServerMessage::cash_out_rejected(&e)
            }
        }
    }
}
