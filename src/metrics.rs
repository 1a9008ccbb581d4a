//! Engine counters exported in Prometheus text format

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Prometheus-compatible metrics registry
#[derive(Default)]
pub struct MetricsRegistry {
    pub rounds_started: AtomicU64,
    pub rounds_settled: AtomicU64,
    pub rounds_aborted: AtomicU64,
    pub bets_accepted: AtomicU64,
    pub bets_rejected: AtomicU64,
    pub manual_cashouts: AtomicU64,
    pub auto_cashouts: AtomicU64,
    staked_cents: AtomicU64,
    paid_cents: AtomicU64,
    pub active_connections: AtomicU64,
    pub messages_sent: AtomicU64,
    pub connections_evicted: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub settlement_retries: AtomicU64,
    pub settlement_failures: AtomicU64,
    pub payments_credited: AtomicU64,
    pub payments_duplicate: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_totals(&self, staked: f64, paid: f64) {
        self.staked_cents
            .fetch_add((staked * 100.0).round() as u64, Ordering::Relaxed);
        self.paid_cents
            .fetch_add((paid * 100.0).round() as u64, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn total_staked(&self) -> f64 {
        self.staked_cents.load(Ordering::Relaxed) as f64 / 100.0
    }

    pub fn total_paid(&self) -> f64 {
        self.paid_cents.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Generate Prometheus metrics format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();
        let counters: [(&str, &str, &AtomicU64); 14] = [
            ("rounds_started_total", "Rounds opened for betting", &self.rounds_started),
            ("rounds_settled_total", "Rounds fully settled", &self.rounds_settled),
            ("rounds_aborted_total", "Rounds aborted by an operator", &self.rounds_aborted),
            ("bets_accepted_total", "Wagers accepted", &self.bets_accepted),
            ("bets_rejected_total", "Wager or cash-out requests rejected", &self.bets_rejected),
            ("cashouts_manual_total", "Player initiated cash-outs", &self.manual_cashouts),
            ("cashouts_auto_total", "Threshold cash-outs", &self.auto_cashouts),
            ("ws_messages_sent_total", "Messages queued to connections", &self.messages_sent),
            ("ws_evictions_total", "Connections evicted", &self.connections_evicted),
            ("ws_malformed_total", "Malformed inbound messages dropped", &self.malformed_messages),
            ("settlement_retries_total", "Settlement step retries", &self.settlement_retries),
            ("settlement_failures_total", "Settlements that exhausted retries", &self.settlement_failures),
            ("payments_credited_total", "External payments credited", &self.payments_credited),
            ("payments_duplicate_total", "Replayed payment notifications", &self.payments_duplicate),
        ];

        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP crashline_{name} {help}\n\
                 # TYPE crashline_{name} counter\n\
                 crashline_{name} {}\n\n",
                value.load(Ordering::Relaxed)
            );
        }

        let _ = write!(
            output,
            "# HELP crashline_ws_connections_active Live WebSocket connections\n\
             # TYPE crashline_ws_connections_active gauge\n\
             crashline_ws_connections_active {}\n\n",
            self.active_connections.load(Ordering::Relaxed)
        );
        let _ = write!(
            output,
            "# HELP crashline_staked_total Total amount staked\n\
             # TYPE crashline_staked_total counter\n\
             crashline_staked_total {:.2}\n\n\
             # HELP crashline_paid_out_total Total amount paid out\n\
             # TYPE crashline_paid_out_total counter\n\
             crashline_paid_out_total {:.2}\n",
            self.total_staked(),
            self.total_paid()
        );

        output
    }
}
