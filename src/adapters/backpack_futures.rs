//! Backpack USDC perpetuals adapter.
//!
//! Requests are signed with an ED25519 key derived from the base64 seed.
//! Only plain market orders are sent; SL/TP stay with the local sweep.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::Utc;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::{BackpackConfig, HttpConfig};
use crate::error::{Result, TradebotError};
use crate::exchange::precision::{format_decimal, format_fixed, round_down_to_step, to_decimal};
use crate::exchange::types::{
    dedup_errors, is_failure_status, oid_from, CloseRequest, CloseResult, EntryRequest,
    EntryResult, PositionSide,
};
use crate::exchange::{ExchangeClient, ExchangeKind};

const DEFAULT_BACKPACK_API_BASE: &str = "https://api.backpack.exchange";
const ORDER_INSTRUCTION: &str = "orderExecute";
const ENTRY_FALLBACK: &str =
    "Backpack futures entry order was not accepted; see raw payload for details.";
const CLOSE_FALLBACK: &str =
    "Backpack futures close order was not accepted; see raw payload for details.";
const ALREADY_CLOSED_REASON: &str =
    "position already closed on exchange (reduce-only order not reduced)";

/// `filters.quantity` of a Backpack market.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantityFilter {
    pub step_size: Option<Decimal>,
    pub min_quantity: Option<Decimal>,
}

impl QuantityFilter {
    fn from_market(filters: &Value) -> Self {
        let quantity = filters.get("quantity");
        let field = |key: &str| {
            quantity
                .and_then(|q| q.get(key))
                .and_then(Value::as_str)
                .and_then(|s| Decimal::from_str(s.trim()).ok())
        };
        Self {
            step_size: field("stepSize"),
            min_quantity: field("minQuantity"),
        }
    }
}

pub struct BackpackFuturesClient {
    http: Client,
    base_url: String,
    api_public_key: String,
    signing_key: SigningKey,
    window_ms: u64,
    markets: DashMap<String, QuantityFilter>,
}

impl BackpackFuturesClient {
    pub fn new(
        base_url: Option<&str>,
        api_public_key: &str,
        api_secret_seed: &str,
        window_ms: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let api_public_key = api_public_key.trim();
        let api_secret_seed = api_secret_seed.trim();
        if api_public_key.is_empty() || api_secret_seed.is_empty() {
            return Err(TradebotError::Validation(
                "Backpack futures requires both API public key and secret seed".to_string(),
            ));
        }
        let signing_key = Self::signing_key_from_seed(api_secret_seed)?;

        let base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BACKPACK_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("tradebot-backpack-futures/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TradebotError::Internal(format!("failed to build Backpack HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url,
            api_public_key: api_public_key.to_string(),
            signing_key,
            window_ms: if window_ms == 0 { 5_000 } else { window_ms },
            markets: DashMap::new(),
        })
    }

    pub fn from_config(cfg: &BackpackConfig, http: &HttpConfig) -> Result<Self> {
        Self::new(
            Some(&cfg.base_url),
            cfg.api_public_key.as_deref().unwrap_or_default(),
            cfg.api_secret_seed.as_deref().unwrap_or_default(),
            cfg.window_ms,
            Duration::from_secs(http.timeout_secs.max(1)),
        )
    }

    fn signing_key_from_seed(seed_b64: &str) -> Result<SigningKey> {
        let invalid = || {
            TradebotError::Validation(
                "Invalid BACKPACK_API_SECRET_SEED; expected base64-encoded ED25519 seed".to_string(),
            )
        };
        let bytes = BASE64_STANDARD.decode(seed_b64).map_err(|_| invalid())?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| invalid())?;
        Ok(SigningKey::from_bytes(&seed))
    }

    pub fn symbol_for(coin: &str) -> String {
        format!("{}_USDC_PERP", coin.trim().to_ascii_uppercase())
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "Bid",
            PositionSide::Short => "Ask",
        }
    }

    /// `instruction=...&k=v...&timestamp=...&window=...` with keys sorted and
    /// null values skipped.
    pub fn signing_string(
        instruction: &str,
        params: &Map<String, Value>,
        timestamp_ms: i64,
        window_ms: u64,
    ) -> String {
        let sorted: BTreeMap<&String, &Value> = params.iter().collect();
        let mut out = format!("instruction={}", instruction);
        for (key, value) in sorted {
            let rendered = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("&{}={}", key, rendered));
        }
        out.push_str(&format!("&timestamp={}&window={}", timestamp_ms, window_ms));
        out
    }

    fn auth_headers(&self, instruction: &str, params: &Map<String, Value>) -> Result<HeaderMap> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let message = Self::signing_string(instruction, params, timestamp_ms, self.window_ms);
        let signature = BASE64_STANDARD.encode(self.signing_key.sign(message.as_bytes()).to_bytes());

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| TradebotError::Auth(format!("invalid Backpack header value: {}", e)))
        };
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-api-key"), header(&self.api_public_key)?);
        headers.insert(HeaderName::from_static("x-signature"), header(&signature)?);
        headers.insert(
            HeaderName::from_static("x-timestamp"),
            header(&timestamp_ms.to_string())?,
        );
        headers.insert(
            HeaderName::from_static("x-window"),
            header(&self.window_ms.to_string())?,
        );
        headers.insert(CONTENT_TYPE, header("application/json; charset=utf-8")?);
        Ok(headers)
    }

    async fn quantity_filter(&self, symbol: &str) -> Option<QuantityFilter> {
        if let Some(cached) = self.markets.get(symbol) {
            return Some(*cached);
        }
        let url = format!("{}/api/v1/markets", self.base_url);
        let markets: Value = match self.http.get(&url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Backpack markets response unreadable: {}", e);
                    return None;
                }
            },
            Err(e) => {
                warn!("Backpack markets request failed: {}", e);
                return None;
            }
        };
        let filter = markets
            .as_array()?
            .iter()
            .find(|m| m.get("symbol").and_then(Value::as_str) == Some(symbol))
            .and_then(|m| m.get("filters"))
            .filter(|f| f.is_object())
            .map(QuantityFilter::from_market)?;
        self.markets.insert(symbol.to_string(), filter);
        Some(filter)
    }

    /// Quantity string for an order: rounded down to the market step, at most
    /// 8 decimals, trailing zeros stripped.
    pub fn format_quantity(size: f64, filter: Option<&QuantityFilter>) -> Result<String> {
        if size.is_nan() || size <= 0.0 {
            return Err(TradebotError::Validation(
                "Order quantity must be positive.".to_string(),
            ));
        }
        let min_qty = filter
            .and_then(|f| f.min_quantity)
            .filter(|m| *m > Decimal::ZERO);
        let step = filter.and_then(|f| f.step_size).filter(|s| *s > Decimal::ZERO);

        let text = match (step, to_decimal(size)) {
            (Some(step), Some(size)) => {
                let mut qty = round_down_to_step(size, step);
                if qty <= Decimal::ZERO {
                    if let Some(min_qty) = min_qty {
                        qty = min_qty;
                    }
                }
                format_decimal(qty, 8)
            }
            _ => format_fixed(size, 4),
        };

        if text.is_empty() || text == "0" {
            return Ok(min_qty
                .map(|m| m.normalize().to_string())
                .unwrap_or_else(|| "0.0001".to_string()));
        }
        Ok(text)
    }

    /// Errors for an order payload labelled `entry`/`close`.
    pub fn collect_order_errors(payload: &Value, label: &str) -> Vec<String> {
        let Some(map) = payload.as_object() else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        if let Some(status) = map.get("status").and_then(Value::as_str) {
            if is_failure_status(status) {
                errors.push(format!("{}: status={}", label, status));
            }
        }
        if let Some(message) = Self::message_of(payload) {
            errors.push(format!("{}: {}", label, message));
        }
        dedup_errors(errors)
    }

    fn message_of(payload: &Value) -> Option<&str> {
        ["message", "error", "exception"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_str))
            .filter(|m| !m.is_empty())
    }

    /// POST `/api/v1/order`. Never fails: transport and HTTP problems are
    /// folded into an `error` status payload.
    async fn post_order(&self, body: Map<String, Value>) -> Value {
        let headers = match self.auth_headers(ORDER_INSTRUCTION, &body) {
            Ok(h) => h,
            Err(e) => return json!({"status": "error", "message": e.to_string()}),
        };
        let url = format!("{}/api/v1/order", self.base_url);
        let resp = match self
            .http
            .post(&url)
            .headers(headers)
            .json(&Value::Object(body))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Backpack order request failed: {}", e);
                return json!({"status": "error", "exception": e.to_string()});
            }
        };

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        Self::normalize_response(status, &text)
    }

    fn normalize_response(status: u16, text: &str) -> Value {
        let data = serde_json::from_str::<Value>(text).unwrap_or_else(|_| {
            json!({"status": "error", "message": format!("Non-JSON response: HTTP {}", status)})
        });
        if status != 200 {
            let mut map = match data {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            map.entry("status").or_insert_with(|| json!("error"));
            map.entry("message").or_insert_with(|| {
                json!(format!("HTTP {} while executing Backpack order.", status))
            });
            return Value::Object(map);
        }
        match data {
            Value::Object(_) => data,
            other => json!({"status": "error", "message": other.to_string()}),
        }
    }

    fn order_body(symbol: &str, side: &str, quantity: String, reduce_only: bool) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("symbol".to_string(), json!(symbol));
        body.insert("side".to_string(), json!(side));
        body.insert("orderType".to_string(), json!("Market"));
        body.insert("quantity".to_string(), json!(quantity));
        body.insert("reduceOnly".to_string(), json!(reduce_only));
        body
    }

    fn accepted(raw: &Value) -> bool {
        !raw.get("status")
            .and_then(Value::as_str)
            .is_some_and(is_failure_status)
    }
}

#[async_trait]
impl ExchangeClient for BackpackFuturesClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::BackpackFutures
    }

    fn is_live(&self) -> bool {
        true
    }

    async fn place_entry(&self, request: &EntryRequest) -> EntryResult {
        let symbol = Self::symbol_for(&request.coin);
        let order_side = Self::order_side(request.side);
        let filter = self.quantity_filter(&symbol).await;
        let quantity = match Self::format_quantity(request.size, filter.as_ref()) {
            Ok(q) => q,
            Err(e) => return EntryResult::failed(self.kind(), format!("entry: {}", e)),
        };

        let raw = self
            .post_order(Self::order_body(&symbol, order_side, quantity, false))
            .await;
        let errors = Self::collect_order_errors(&raw, "entry");
        let accepted = Self::accepted(&raw);
        let entry_oid = oid_from(raw.get("id"));

        let mut result =
            EntryResult::resolve(self.kind(), accepted, errors, ENTRY_FALLBACK, raw.clone());
        result.entry_oid = entry_oid;
        result
            .with_extra("order", raw)
            .with_extra("symbol", symbol)
            .with_extra("side", order_side)
    }

    async fn close_position(&self, request: &CloseRequest) -> CloseResult {
        let amount = request.size.unwrap_or(0.0);
        if amount <= 0.0 {
            return CloseResult::nothing_to_close(self.kind());
        }

        let symbol = Self::symbol_for(&request.coin);
        let order_side = Self::order_side(request.side.opposite());
        let filter = self.quantity_filter(&symbol).await;
        let quantity = match Self::format_quantity(amount, filter.as_ref()) {
            Ok(q) => q,
            Err(e) => return CloseResult::failed(self.kind(), format!("close: {}", e)),
        };

        let raw = self
            .post_order(Self::order_body(&symbol, order_side, quantity, true))
            .await;
        let mut errors = Self::collect_order_errors(&raw, "close");
        let mut accepted = Self::accepted(&raw);
        let mut reason = None;

        let already_closed = Self::message_of(&raw)
            .is_some_and(|m| m.to_ascii_lowercase().contains("reduce only order not reduced"));
        if (!accepted || !errors.is_empty()) && already_closed {
            accepted = true;
            errors.clear();
            reason = Some(ALREADY_CLOSED_REASON);
        }

        let close_oid = oid_from(raw.get("id"));
        let mut result =
            CloseResult::resolve(self.kind(), accepted, errors, CLOSE_FALLBACK, raw.clone());
        result.close_oid = close_oid;
        let result = result.with_extra("order", raw).with_extra("symbol", symbol);
        match reason {
            Some(reason) => result.with_extra("reason", reason),
            None => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use rust_decimal_macros::dec;

    fn seed() -> String {
        BASE64_STANDARD.encode([7u8; 32])
    }

    #[test]
    fn signing_string_sorts_keys_and_skips_nulls() {
        let mut params = Map::new();
        params.insert("symbol".to_string(), json!("BTC_USDC_PERP"));
        params.insert("side".to_string(), json!("Bid"));
        params.insert("reduceOnly".to_string(), json!(false));
        params.insert("clientId".to_string(), Value::Null);
        params.insert("quantity".to_string(), json!("0.01"));
        params.insert("orderType".to_string(), json!("Market"));

        assert_eq!(
            BackpackFuturesClient::signing_string("orderExecute", &params, 1_700_000_000_000, 5000),
            "instruction=orderExecute&orderType=Market&quantity=0.01&reduceOnly=false&side=Bid&symbol=BTC_USDC_PERP&timestamp=1700000000000&window=5000"
        );
    }

    #[test]
    fn signature_verifies_with_derived_public_key() {
        let key = BackpackFuturesClient::signing_key_from_seed(&seed()).expect("valid seed");
        let message = "instruction=orderExecute&timestamp=1&window=5000";
        let signature = key.sign(message.as_bytes());
        let decoded = Signature::from_bytes(&signature.to_bytes());
        assert!(key.verifying_key().verify(message.as_bytes(), &decoded).is_ok());
    }

    #[test]
    fn invalid_seed_is_rejected() {
        assert!(BackpackFuturesClient::signing_key_from_seed("not base64!").is_err());
        let short = BASE64_STANDARD.encode([1u8; 16]);
        assert!(BackpackFuturesClient::signing_key_from_seed(&short).is_err());
        assert!(BackpackFuturesClient::new(None, "", &seed(), 5000, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn quantity_follows_step_and_min_quantity() {
        let filter = QuantityFilter {
            step_size: Some(dec!(0.01)),
            min_quantity: Some(dec!(0.01)),
        };
        assert_eq!(
            BackpackFuturesClient::format_quantity(1.23789, Some(&filter)).expect("positive"),
            "1.23"
        );
        assert_eq!(
            BackpackFuturesClient::format_quantity(0.004, Some(&filter)).expect("positive"),
            "0.01"
        );
        assert_eq!(
            BackpackFuturesClient::format_quantity(0.5, None).expect("positive"),
            "0.5"
        );
        assert_eq!(
            BackpackFuturesClient::format_quantity(0.00001, None).expect("positive"),
            "0.0001"
        );
        assert!(BackpackFuturesClient::format_quantity(0.0, None).is_err());
    }

    #[test]
    fn non_200_responses_get_error_status() {
        let raw = BackpackFuturesClient::normalize_response(400, r#"{"code":"INVALID_ORDER"}"#);
        assert_eq!(raw["status"], json!("error"));
        assert_eq!(
            raw["message"],
            json!("HTTP 400 while executing Backpack order.")
        );

        let raw = BackpackFuturesClient::normalize_response(502, "<html>bad gateway</html>");
        assert_eq!(raw["message"], json!("Non-JSON response: HTTP 502"));
        assert_eq!(
            BackpackFuturesClient::collect_order_errors(&raw, "entry"),
            vec![
                "entry: status=error".to_string(),
                "entry: Non-JSON response: HTTP 502".to_string(),
            ]
        );
    }

    #[test]
    fn transport_failure_text_is_reported() {
        let raw = json!({"status": "error", "exception": "error sending request: connection refused"});
        assert_eq!(
            BackpackFuturesClient::collect_order_errors(&raw, "entry"),
            vec![
                "entry: status=error".to_string(),
                "entry: error sending request: connection refused".to_string(),
            ]
        );
        assert!(!BackpackFuturesClient::accepted(&raw));
    }

    #[test]
    fn filled_order_has_no_errors() {
        let raw = json!({"id": "111", "status": "Filled", "quantity": "0.01"});
        assert!(BackpackFuturesClient::collect_order_errors(&raw, "entry").is_empty());
        assert!(BackpackFuturesClient::accepted(&raw));
    }

    #[test]
    fn market_filters_are_read_from_quantity_section() {
        let filters = json!({
            "price": {"tickSize": "0.1"},
            "quantity": {"stepSize": "0.00001", "minQuantity": "0.00001"}
        });
        let parsed = QuantityFilter::from_market(&filters);
        assert_eq!(parsed.step_size, Some(dec!(0.00001)));
        assert_eq!(parsed.min_quantity, Some(dec!(0.00001)));
    }
}
