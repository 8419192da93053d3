//! Hyperliquid perpetuals adapter.
//!
//! Order signing lives outside this crate behind [`HyperliquidTrader`]; this
//! adapter only shapes requests and normalises the raw responses. Entries
//! carry native SL/TP trigger orders, so local SL/TP monitoring is skipped.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::Result;
use crate::exchange::precision::format_fixed;
use crate::exchange::types::{
    dedup_errors, error_text, oid_from, CloseRequest, CloseResult, EntryRequest, EntryResult,
    PositionSide,
};
use crate::exchange::{ExchangeClient, ExchangeKind};

const ENTRY_FALLBACK: &str =
    "Hyperliquid entry order was not accepted; see raw payload for details.";
const CLOSE_FALLBACK: &str =
    "Hyperliquid close order was not accepted; see raw payload for details.";

/// Order-entry collaborator for a signed Hyperliquid session.
///
/// `place_entry_with_sl_tp` returns
/// `{"entry": .., "stop_loss": .., "take_profit": .., "entry_oid", "stop_loss_oid", "take_profit_oid"}`
/// where each leg is the exchange's raw order response.
#[async_trait]
pub trait HyperliquidTrader: Send + Sync {
    fn is_live(&self) -> bool;

    #[allow(clippy::too_many_arguments)]
    async fn place_entry_with_sl_tp(
        &self,
        coin: &str,
        is_buy: bool,
        size: &str,
        entry_price: Option<f64>,
        stop_loss_price: Option<f64>,
        take_profit_price: Option<f64>,
        leverage: f64,
    ) -> Result<Value>;

    async fn close_position(
        &self,
        coin: &str,
        is_long: bool,
        size: Option<&str>,
        fallback_price: Option<f64>,
    ) -> Result<Value>;
}

pub struct HyperliquidClient {
    trader: Arc<dyn HyperliquidTrader>,
}

impl HyperliquidClient {
    pub fn new(trader: Arc<dyn HyperliquidTrader>) -> Self {
        Self { trader }
    }

    pub fn format_size(size: f64) -> String {
        format_fixed(size, 6)
    }

    /// Error strings found anywhere in a raw order response.
    pub fn collect_errors(payload: &Value, label: &str) -> Vec<String> {
        let mut errors = Vec::new();
        match payload {
            Value::Null => {}
            Value::String(text) => {
                if !text.trim().is_empty() {
                    errors.push(format!("{}: {}", label, text.trim()));
                }
            }
            Value::Object(map) => {
                if let Some(status) = map.get("status").and_then(Value::as_str) {
                    let lower = status.to_ascii_lowercase();
                    if lower != "ok" && lower != "success" {
                        match map.get("response").and_then(Value::as_str) {
                            Some(detail) if !detail.is_empty() => {
                                errors.push(format!("{}: {}", label, detail))
                            }
                            _ => errors.push(format!("{}: status={}", label, status)),
                        }
                    }
                }

                let statuses = map
                    .get("response")
                    .and_then(|r| r.get("data"))
                    .and_then(|d| d.get("statuses"))
                    .or_else(|| map.get("statuses"))
                    .and_then(Value::as_array);
                for status in statuses.map(Vec::as_slice).unwrap_or_default() {
                    match status.get("error") {
                        Some(Value::String(e)) if !e.is_empty() => {
                            errors.push(format!("{}: {}", label, e))
                        }
                        Some(other) if !other.is_null() => {
                            errors.push(format!("{}: {}", label, other))
                        }
                        _ => {}
                    }
                }

                for key in ["error", "exception", "message"] {
                    if let Some(text) = map.get(key).and_then(Value::as_str) {
                        if !text.is_empty() {
                            errors.push(format!("{}: {}", label, text));
                        }
                    }
                }
            }
            _ => {}
        }
        dedup_errors(errors)
    }
}

#[async_trait]
impl ExchangeClient for HyperliquidClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Hyperliquid
    }

    fn is_live(&self) -> bool {
        self.trader.is_live()
    }

    fn manages_protective_orders(&self) -> bool {
        self.trader.is_live()
    }

    async fn place_entry(&self, request: &EntryRequest) -> EntryResult {
        if request.size.is_nan() || request.size <= 0.0 {
            return EntryResult::failed(
                self.kind(),
                format!("entry: invalid order quantity {}", request.size),
            );
        }
        let size = Self::format_size(request.size);
        let is_buy = request.side == PositionSide::Long;

        let raw = match self
            .trader
            .place_entry_with_sl_tp(
                &request.coin,
                is_buy,
                &size,
                request.entry_price,
                request.stop_loss_price,
                request.take_profit_price,
                request.leverage,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let text = error_text(&e);
                error!("{}: Hyperliquid entry failed: {}", request.coin, text);
                return EntryResult::failed(self.kind(), format!("entry: {}", text))
                    .with_extra("exception", text);
            }
        };

        let entry_errors = raw
            .get("entry")
            .map(|payload| Self::collect_errors(payload, "entry"))
            .unwrap_or_default();
        let mut protective_errors = Vec::new();
        for leg in ["stop_loss", "take_profit"] {
            if let Some(payload) = raw.get(leg) {
                protective_errors.extend(Self::collect_errors(payload, leg));
            }
        }

        let entry_oid = oid_from(raw.get("entry_oid"));
        // an entry leg without an oid never reached the book
        let accepted = entry_oid.is_some();

        let mut result = EntryResult::resolve(
            self.kind(),
            accepted,
            entry_errors,
            ENTRY_FALLBACK,
            raw.clone(),
        );
        if result.success && !protective_errors.is_empty() {
            warn!(
                "{}: Hyperliquid entry filled but protective orders failed: {}",
                request.coin,
                protective_errors.join("; ")
            );
        }
        result.entry_oid = entry_oid;
        result.sl_oid = oid_from(raw.get("stop_loss_oid"));
        result.tp_oid = oid_from(raw.get("take_profit_oid"));
        if !protective_errors.is_empty() {
            result = result.with_extra("protective_errors", protective_errors);
        }
        result.with_extra("size", size)
    }

    async fn close_position(&self, request: &CloseRequest) -> CloseResult {
        let size = request.size.map(Self::format_size);
        let is_long = request.side == PositionSide::Long;
        let raw = match self
            .trader
            .close_position(&request.coin, is_long, size.as_deref(), request.fallback_price)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let text = error_text(&e);
                error!("{}: Hyperliquid close failed: {}", request.coin, text);
                return CloseResult::failed(self.kind(), format!("close: {}", text));
            }
        };

        let errors = Self::collect_errors(&raw, "close");
        let close_oid = raw
            .get("response")
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("statuses"))
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .and_then(|s| s.get("filled").or_else(|| s.get("resting")))
            .and_then(|leg| oid_from(leg.get("oid")));

        let mut result = CloseResult::resolve(self.kind(), true, errors, CLOSE_FALLBACK, raw);
        result.close_oid = close_oid;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TradebotError;
    use crate::exchange::types::Liquidity;
    use serde_json::json;

    struct CannedTrader {
        entry: std::result::Result<Value, String>,
    }

    #[async_trait]
    impl HyperliquidTrader for CannedTrader {
        fn is_live(&self) -> bool {
            true
        }

        async fn place_entry_with_sl_tp(
            &self,
            _coin: &str,
            _is_buy: bool,
            _size: &str,
            _entry_price: Option<f64>,
            _stop_loss_price: Option<f64>,
            _take_profit_price: Option<f64>,
            _leverage: f64,
        ) -> Result<Value> {
            self.entry
                .clone()
                .map_err(TradebotError::Exchange)
        }

        async fn close_position(
            &self,
            _coin: &str,
            _is_long: bool,
            _size: Option<&str>,
            _fallback_price: Option<f64>,
        ) -> Result<Value> {
            Ok(json!({"status": "err", "response": "User or API Wallet does not exist."}))
        }
    }

    fn entry_request() -> EntryRequest {
        EntryRequest {
            coin: "ETH".to_string(),
            side: PositionSide::Long,
            size: 0.1234567,
            entry_price: Some(3000.0),
            stop_loss_price: Some(2900.0),
            take_profit_price: Some(3300.0),
            leverage: 5.0,
            liquidity: Liquidity::Taker,
        }
    }

    #[test]
    fn statuses_errors_are_collected() {
        let payload = json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"error": "Insufficient margin to place order."}
            ]}}
        });
        assert_eq!(
            HyperliquidClient::collect_errors(&payload, "entry"),
            vec!["entry: Insufficient margin to place order.".to_string()]
        );
        assert!(HyperliquidClient::collect_errors(
            &json!({"status": "ok", "response": {"data": {"statuses": [{"filled": {"oid": 1}}]}}}),
            "entry"
        )
        .is_empty());
    }

    #[tokio::test]
    async fn entry_with_native_triggers_returns_all_oids() {
        let client = HyperliquidClient::new(Arc::new(CannedTrader {
            entry: Ok(json!({
                "entry": {"status": "ok", "response": {"data": {"statuses": [{"filled": {"oid": 77}}]}}},
                "stop_loss": {"status": "ok"},
                "take_profit": {"status": "ok"},
                "entry_oid": 77,
                "stop_loss_oid": 78,
                "take_profit_oid": "79",
            })),
        }));
        let result = client.place_entry(&entry_request()).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.entry_oid.as_deref(), Some("77"));
        assert_eq!(result.sl_oid.as_deref(), Some("78"));
        assert_eq!(result.tp_oid.as_deref(), Some("79"));
        assert_eq!(result.extra["size"], json!("0.123457"));
        assert!(client.manages_protective_orders());
    }

    #[tokio::test]
    async fn failed_trigger_leg_keeps_filled_entry() {
        let client = HyperliquidClient::new(Arc::new(CannedTrader {
            entry: Ok(json!({
                "entry": {"status": "ok", "response": {"data": {"statuses": [{"filled": {"oid": 77}}]}}},
                "stop_loss": {"status": "ok", "response": {"data": {"statuses": [{"error": "Trigger price too close"}]}}},
                "take_profit": {"status": "ok"},
                "entry_oid": 77,
                "take_profit_oid": 79,
            })),
        }));
        let result = client.place_entry(&entry_request()).await;
        assert!(result.success, "{:?}", result.errors);
        assert!(result.errors.is_empty());
        assert_eq!(result.entry_oid.as_deref(), Some("77"));
        assert_eq!(result.sl_oid, None);
        assert_eq!(result.tp_oid.as_deref(), Some("79"));
        assert_eq!(
            result.extra["protective_errors"],
            json!(["stop_loss: Trigger price too close"])
        );
    }

    #[tokio::test]
    async fn executor_tracks_entry_whose_stop_loss_was_rejected() {
        use crate::execution::{Decision, EntryOutcome, PlanLimits, Portfolio, Signal, TradeExecutor};

        let client = HyperliquidClient::new(Arc::new(CannedTrader {
            entry: Ok(json!({
                "entry": {"status": "ok", "response": {"data": {"statuses": [{"filled": {"oid": 77}}]}}},
                "stop_loss": {"error": "Trigger price too close"},
                "take_profit": {"status": "ok"},
                "entry_oid": 77,
                "take_profit_oid": 79,
            })),
        }));
        let executor = TradeExecutor::new(Arc::new(client), PlanLimits::default());
        let decision = Decision {
            signal: Signal::Entry,
            side: PositionSide::Long,
            leverage: Some(5.0),
            risk_usd: Some(50.0),
            stop_loss: Some(95.0),
            profit_target: Some(110.0),
            ..Default::default()
        };
        let mut portfolio = Portfolio::new(10_000.0);
        let outcome = executor
            .execute_entry(&mut portfolio, "ETH", &decision, 100.0, chrono::Utc::now())
            .await;

        assert!(matches!(outcome, EntryOutcome::Opened { .. }), "got {:?}", outcome);
        let pos = portfolio.positions.get("ETH").expect("filled entry is tracked");
        assert_eq!(pos.entry_oid.as_deref(), Some("77"));
        assert_eq!(pos.live_backend, Some(ExchangeKind::Hyperliquid));
    }

    #[tokio::test]
    async fn entry_leg_error_fails_even_with_oid() {
        let client = HyperliquidClient::new(Arc::new(CannedTrader {
            entry: Ok(json!({
                "entry": {"status": "ok", "response": {"data": {"statuses": [{"error": "Insufficient margin to place order."}]}}},
                "entry_oid": 77,
            })),
        }));
        let result = client.place_entry(&entry_request()).await;
        assert!(!result.success);
        assert_eq!(
            result.errors,
            vec!["entry: Insufficient margin to place order.".to_string()]
        );
    }

    #[tokio::test]
    async fn trader_errors_become_result_errors() {
        let client = HyperliquidClient::new(Arc::new(CannedTrader {
            entry: Err("connection reset".to_string()),
        }));
        let result = client.place_entry(&entry_request()).await;
        assert!(!result.success);
        assert_eq!(result.errors, vec!["entry: connection reset".to_string()]);

        let close = client
            .close_position(&CloseRequest {
                coin: "ETH".to_string(),
                side: PositionSide::Long,
                size: None,
                fallback_price: Some(3000.0),
            })
            .await;
        assert!(!close.success);
        assert_eq!(
            close.errors,
            vec!["close: User or API Wallet does not exist.".to_string()]
        );
    }
}
