//! External payment notifications
//!
//! Payment providers may deliver the same notification more than once. A
//! charge id is credited at most once: the ledger credit is keyed by the
//! charge id, and the processed log records the id with a single conditional
//! insert.

use crate::errors::{PaymentError, StoreError};
use crate::games::types::PlayerId;
use crate::ledger::Ledger;
use crate::storage::RocksStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const PROCESSED_PAYMENT_PREFIX: &str = "payment:processed:";

/// Append-only record of processed charge ids
#[async_trait]
pub trait ProcessedPaymentLog: Send + Sync {
    /// Record `charge_id`; true only the first time it is seen
    async fn insert_if_absent(&self, charge_id: &str) -> Result<bool, StoreError>;

    async fn contains(&self, charge_id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemoryPaymentLog {
    seen: DashMap<String, DateTime<Utc>>,
}

impl MemoryPaymentLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedPaymentLog for MemoryPaymentLog {
    async fn insert_if_absent(&self, charge_id: &str) -> Result<bool, StoreError> {
        match self.seen.entry(charge_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn contains(&self, charge_id: &str) -> Result<bool, StoreError> {
        Ok(self.seen.contains_key(charge_id))
    }
}

/// Durable log; the mutex makes get-then-put a single conditional insert
pub struct RocksPaymentLog {
    storage: RocksStorage,
    insert_lock: Mutex<()>,
}

impl RocksPaymentLog {
    pub fn new(storage: RocksStorage) -> Self {
        Self {
            storage,
            insert_lock: Mutex::new(()),
        }
    }

    fn key(charge_id: &str) -> Vec<u8> {
        format!("{}{}", PROCESSED_PAYMENT_PREFIX, charge_id).into_bytes()
    }
}

#[async_trait]
impl ProcessedPaymentLog for RocksPaymentLog {
    async fn insert_if_absent(&self, charge_id: &str) -> Result<bool, StoreError> {
        let key = Self::key(charge_id);
        let _guard = self
            .insert_lock
            .lock()
            .map_err(|_| StoreError::WriteFailed("payment log lock poisoned".to_string()))?;

        if self.storage.get(&key)?.is_some() {
            return Ok(false);
        }
        let stamp = serde_json::to_vec(&Utc::now())?;
        self.storage.put(&key, &stamp)?;
        Ok(true)
    }

    async fn contains(&self, charge_id: &str) -> Result<bool, StoreError> {
        Ok(self.storage.get(&Self::key(charge_id))?.is_some())
    }
}

/// Rejects replays of external payment ids
#[derive(Clone)]
pub struct PaymentDeduplicator {
    log: Arc<dyn ProcessedPaymentLog>,
}

impl PaymentDeduplicator {
    pub fn new(log: Arc<dyn ProcessedPaymentLog>) -> Self {
        Self { log }
    }

    /// True (and durably recorded) only the first time `payment_id` is seen
    pub async fn try_mark_processed(&self, payment_id: &str) -> Result<bool, PaymentError> {
        if payment_id.trim().is_empty() {
            return Err(PaymentError::InvalidNotification(
                "payment id must not be empty".to_string(),
            ));
        }
        Ok(self.log.insert_if_absent(payment_id).await?)
    }

    pub async fn is_processed(&self, payment_id: &str) -> Result<bool, PaymentError> {
        Ok(self.log.contains(payment_id).await?)
    }
}

/// Inbound notification from the payment provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub charge_id: String,
    pub user_id: PlayerId,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentOutcome {
    Credited,
    Duplicate,
}

/// Credits external payments through the ledger exactly once per charge id
pub struct PaymentProcessor {
    dedup: PaymentDeduplicator,
    ledger: Arc<dyn Ledger>,
    default_currency: String,
}

impl PaymentProcessor {
    pub fn new(
        dedup: PaymentDeduplicator,
        ledger: Arc<dyn Ledger>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            dedup,
            ledger,
            default_currency: default_currency.into(),
        }
    }

    pub async fn handle_notification(
        &self,
        notification: &PaymentNotification,
    ) -> Result<PaymentOutcome, PaymentError> {
        if !notification.amount.is_finite() || notification.amount <= 0.0 {
            return Err(PaymentError::InvalidNotification(format!(
                "amount must be positive, got {}",
                notification.amount
            )));
        }

        if self.dedup.is_processed(&notification.charge_id).await? {
            warn!(charge_id = %notification.charge_id, "Duplicate payment notification ignored");
            return Ok(PaymentOutcome::Duplicate);
        }

        // Credit first; a replay after a failed mark hits the same ledger reason key
        let currency = notification
            .currency
            .as_deref()
            .unwrap_or(&self.default_currency);
        self.ledger
            .credit(
                notification.user_id,
                currency,
                notification.amount,
                &format!("payment:{}", notification.charge_id),
            )
            .await?;

        if self.dedup.try_mark_processed(&notification.charge_id).await? {
            info!(
                charge_id = %notification.charge_id,
                player_id = %notification.user_id,
                amount = notification.amount,
                "Payment credited"
            );
            Ok(PaymentOutcome::Credited)
        } else {
            warn!(charge_id = %notification.charge_id, "Concurrent duplicate payment notification");
            Ok(PaymentOutcome::Duplicate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn processor(ledger: Arc<InMemoryLedger>) -> PaymentProcessor {
        PaymentProcessor::new(
            PaymentDeduplicator::new(Arc::new(MemoryPaymentLog::new())),
            ledger,
            "STARS",
        )
    }

    #[tokio::test]
    async fn test_mark_processed_once() {
        let dedup = PaymentDeduplicator::new(Arc::new(MemoryPaymentLog::new()));
        assert!(dedup.try_mark_processed("ch_1").await.unwrap());
        assert!(!dedup.try_mark_processed("ch_1").await.unwrap());
        assert!(dedup.try_mark_processed("ch_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let dedup = PaymentDeduplicator::new(Arc::new(MemoryPaymentLog::new()));
        assert!(dedup.try_mark_processed("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_replayed_notification_credits_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let processor = processor(ledger.clone());
        let notification = PaymentNotification {
            charge_id: "ch_42".to_string(),
            user_id: PlayerId(9),
            amount: 250.0,
            currency: None,
        };

        assert_eq!(
            processor.handle_notification(&notification).await.unwrap(),
            PaymentOutcome::Credited
        );
        assert_eq!(
            processor.handle_notification(&notification).await.unwrap(),
            PaymentOutcome::Duplicate
        );
        assert_eq!(ledger.balance(PlayerId(9), "STARS").await.unwrap(), 250.0);
    }

    #[tokio::test]
    async fn test_credit_failure_leaves_id_unmarked() {
        let ledger = Arc::new(InMemoryLedger::new());
        let processor = processor(ledger.clone());
        let notification = PaymentNotification {
            charge_id: "ch_7".to_string(),
            user_id: PlayerId(1),
            amount: 100.0,
            currency: None,
        };

        ledger.fail_next_credits(1);
        assert!(processor.handle_notification(&notification).await.is_err());
        assert_eq!(
            processor.handle_notification(&notification).await.unwrap(),
            PaymentOutcome::Credited
        );
        assert_eq!(ledger.balance(PlayerId(1), "STARS").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_invalid_amount() {
        let processor = processor(Arc::new(InMemoryLedger::new()));
        let notification = PaymentNotification {
            charge_id: "ch_bad".to_string(),
            user_id: PlayerId(1),
            amount: 0.0,
            currency: None,
        };
        assert!(matches!(
            processor.handle_notification(&notification).await,
            Err(PaymentError::InvalidNotification(_))
        ));
    }
}
