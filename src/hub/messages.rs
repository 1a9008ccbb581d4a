use crate::errors::BetError;
use crate::games::types::{Phase, PlayerId, RoundId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages accepted from game channel connections
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PlaceBet {
        user_id: PlayerId,
        amount: f64,
        #[serde(default)]
        auto_cashout: Option<f64>,
    },
    CashOut {
        user_id: PlayerId,
    },
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashUpdate {
    pub game_id: RoundId,
    pub phase: Phase,
    /// Whole seconds left in the betting countdown
    pub time_remaining: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashResult {
    pub game_id: RoundId,
    pub final_multiplier: f64,
    pub crashed_at: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBet {
    pub user_id: PlayerId,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CashedOut {
    pub user_id: PlayerId,
    pub multiplier: f64,
    pub payout: f64,
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundHalted {
    pub game_id: RoundId,
    pub reason: String,
}

/// Events pushed to connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CrashUpdate {
        data: CrashUpdate,
    },
    CrashResult {
        data: CrashResult,
    },
    NewBet {
        data: NewBet,
    },
    CashedOut {
        data: CashedOut,
    },
    RoundHalted {
        data: RoundHalted,
    },
    Pong {
        timestamp: Value,
    },
    BetPlaced {
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    CashOutResult {
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multiplier: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payout: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn bet_accepted() -> Self {
        ServerMessage::BetPlaced {
            status: AckStatus::Success,
            message: None,
            code: None,
        }
    }

    pub fn bet_rejected(err: &BetError) -> Self {
        ServerMessage::BetPlaced {
            status: AckStatus::Error,
            message: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }

    pub fn cash_out_accepted(multiplier: f64, payout: f64) -> Self {
        ServerMessage::CashOutResult {
            status: AckStatus::Success,
            multiplier: Some(multiplier),
            payout: Some(payout),
            message: None,
            code: None,
        }
    }

    pub fn cash_out_rejected(err: &BetError) -> Self {
        ServerMessage::CashOutResult {
            status: AckStatus::Error,
            multiplier: None,
            payout: None,
            message: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let bet: ClientMessage = serde_json::from_str(
            r#"{"type":"place_bet","user_id":42,"amount":10,"auto_cashout":null}"#,
        )
        .unwrap();
        assert_eq!(
            bet,
            ClientMessage::PlaceBet {
                user_id: PlayerId(42),
                amount: 10.0,
                auto_cashout: None
            }
        );

        let cash: ClientMessage =
            serde_json::from_str(r#"{"type":"cash_out","user_id":42}"#).unwrap();
        assert_eq!(cash, ClientMessage::CashOut { user_id: PlayerId(42) });

        let ping: ClientMessage =
            serde_json::from_str(r#"{"type":"ping","timestamp":1700000000123}"#).unwrap();
        assert_eq!(
            ping,
            ClientMessage::Ping {
                timestamp: json!(1700000000123u64)
            }
        );
    }

    #[test]
    fn test_malformed_messages_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"fly_me"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"place_bet"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_crash_update_wire_format() {
        let msg = ServerMessage::CrashUpdate {
            data: CrashUpdate {
                game_id: RoundId(12),
                phase: Phase::Betting,
                time_remaining: 14,
                multiplier: 1.0,
            },
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "crash_update",
                "data": {"game_id": 12, "phase": "betting", "time_remaining": 14, "multiplier": 1.0}
            })
        );
    }

    #[test]
    fn test_ack_wire_format() {
        let ok: Value = serde_json::from_str(&ServerMessage::bet_accepted().to_json().unwrap()).unwrap();
        assert_eq!(ok, json!({"type": "bet_placed", "status": "success"}));

        let err = ServerMessage::bet_rejected(&BetError::DuplicateBet(PlayerId(1)));
        let value: Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "duplicate_bet");
        assert!(value["message"].as_str().unwrap().contains("already has"));
    }

    #[test]
    fn test_crash_result_has_iso_timestamp() {
        let msg = ServerMessage::CrashResult {
            data: CrashResult {
                game_id: RoundId(3),
                final_multiplier: 2.37,
                crashed_at: 2.37,
                timestamp: Utc::now(),
            },
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        let stamp = value["data"]["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
