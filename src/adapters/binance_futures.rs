//! Binance USDⓈ-M futures adapter (native REST, HMAC-SHA256 signed).
//!
//! Orders are sent in hedge mode (`positionSide` LONG/SHORT). Protective
//! SL/TP triggers are only placed through `update_tpsl`; entries rely on the
//! local SL/TP sweep.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{BinanceConfig, HttpConfig};
use crate::error::{Result, TradebotError};
use crate::exchange::precision::{format_decimal, round_down_to_step, round_to_tick, to_decimal};
use crate::exchange::types::{
    dedup_errors, error_text, is_failure_status, oid_from, CloseRequest, CloseResult,
    EntryRequest, EntryResult, PositionSide, TpslRequest, TpslResult,
};
use crate::exchange::{ExchangeClient, ExchangeKind};

const DEFAULT_BINANCE_FAPI_BASE: &str = "https://fapi.binance.com";
const ENTRY_FALLBACK: &str =
    "Binance futures entry order was not accepted; see raw payload for details.";
const CLOSE_FALLBACK: &str =
    "Binance futures close order was not accepted; see raw payload for details.";

type HmacSha256 = Hmac<Sha256>;

/// LOT_SIZE / PRICE_FILTER values for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub step_size: Option<Decimal>,
    pub tick_size: Option<Decimal>,
    pub min_qty: Option<Decimal>,
}

impl SymbolFilters {
    fn from_exchange_info(symbol_info: &Value) -> Self {
        let mut filters = Self {
            step_size: None,
            tick_size: None,
            min_qty: None,
        };
        let Some(items) = symbol_info.get("filters").and_then(Value::as_array) else {
            return filters;
        };
        for item in items {
            match item.get("filterType").and_then(Value::as_str) {
                Some("LOT_SIZE") => {
                    filters.step_size = decimal_field(item, "stepSize");
                    filters.min_qty = decimal_field(item, "minQty");
                }
                Some("PRICE_FILTER") => {
                    filters.tick_size = decimal_field(item, "tickSize");
                }
                _ => {}
            }
        }
        filters
    }
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s.trim()).ok())
        .filter(|d| *d > Decimal::ZERO)
}

pub struct BinanceFuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    filters: DashMap<String, SymbolFilters>,
}

impl BinanceFuturesClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: String,
        api_secret: String,
        recv_window_ms: u64,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(TradebotError::Validation(
                "Binance futures requires BINANCE_API_KEY and BINANCE_API_SECRET".to_string(),
            ));
        }
        let base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BINANCE_FAPI_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("tradebot-binance-futures/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TradebotError::Internal(format!("failed to build Binance HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.trim().to_string(),
            api_secret: api_secret.trim().to_string(),
            recv_window_ms: if recv_window_ms == 0 { 5_000 } else { recv_window_ms },
            filters: DashMap::new(),
        })
    }

    pub fn from_config(cfg: &BinanceConfig, http: &HttpConfig) -> Result<Self> {
        Self::new(
            Some(&cfg.base_url),
            cfg.api_key.clone().unwrap_or_default(),
            cfg.api_secret.clone().unwrap_or_default(),
            cfg.recv_window_ms,
            Duration::from_secs(http.timeout_secs.max(1)),
        )
    }

    pub fn symbol_for(coin: &str) -> String {
        format!("{}USDT", coin.trim().to_ascii_uppercase())
    }

    fn position_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    fn order_side(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "BUY",
            PositionSide::Short => "SELL",
        }
    }

    /// Hex HMAC-SHA256 of the query string.
    pub fn sign_query(secret: &str, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| TradebotError::Signature(format!("invalid Binance secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-mbx-apikey"),
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| TradebotError::Auth(format!("invalid Binance API key header: {}", e)))?,
        );
        Ok(headers)
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let mut query = Self::encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={}",
            Utc::now().timestamp_millis(),
            self.recv_window_ms
        ));
        let signature = Self::sign_query(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let resp = self
            .http
            .request(method.clone(), &url)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        Self::read_json(resp, &method, path).await
    }

    async fn read_json(resp: reqwest::Response, method: &Method, path: &str) -> Result<Value> {
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(TradebotError::RateLimited(format!(
                "Binance API rate limited for {} {}",
                method, path
            )));
        }

        let body: Option<Value> = serde_json::from_str(&text).ok();
        if !status.is_success() {
            return Err(Self::api_error(status.as_u16(), body.as_ref(), method, path));
        }

        match body {
            Some(value) => Ok(value),
            None if text.trim().is_empty() => Ok(Value::Null),
            None => Err(TradebotError::Exchange(format!(
                "Non-JSON response: HTTP {}",
                status.as_u16()
            ))),
        }
    }

    /// Order endpoints answering 4xx with a `{"code", "msg"}` body are
    /// exchange rejections; anything else is a generic exchange failure.
    fn api_error(status: u16, body: Option<&Value>, method: &Method, path: &str) -> TradebotError {
        // {"code": -2019, "msg": "Margin is insufficient."}
        let detail = body.and_then(|b| {
            let msg = b.get("msg").and_then(Value::as_str)?;
            Some(match b.get("code") {
                Some(code) if !code.is_null() => format!("{} {}", code, msg),
                _ => msg.to_string(),
            })
        });
        match detail {
            Some(detail) if (400..500).contains(&status) && path.ends_with("/order") => {
                TradebotError::OrderRejected(detail)
            }
            Some(detail) => TradebotError::Exchange(detail),
            None => TradebotError::Exchange(format!("HTTP {} from {} {}", status, method, path)),
        }
    }

    /// Step/tick filters from `/fapi/v1/exchangeInfo`, cached per symbol.
    async fn symbol_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        if let Some(cached) = self.filters.get(symbol) {
            return Some(*cached);
        }

        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let info: Value = match self.http.get(&url).query(&[("symbol", symbol)]).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Binance exchangeInfo response unreadable for {}: {}", symbol, e);
                    return None;
                }
            },
            Err(e) => {
                warn!("Binance exchangeInfo request failed for {}: {}", symbol, e);
                return None;
            }
        };

        let selected = info
            .get("symbols")
            .and_then(Value::as_array)?
            .iter()
            .find(|s| s.get("symbol").and_then(Value::as_str) == Some(symbol))
            .map(SymbolFilters::from_exchange_info)?;
        self.filters.insert(symbol.to_string(), selected);
        Some(selected)
    }

    pub fn format_quantity(size: f64, filters: Option<&SymbolFilters>) -> Option<String> {
        let size = to_decimal(size).filter(|d| *d > Decimal::ZERO)?;
        let qty = match filters.and_then(|f| f.step_size) {
            Some(step) => {
                let rounded = round_down_to_step(size, step);
                if rounded <= Decimal::ZERO {
                    filters.and_then(|f| f.min_qty).unwrap_or(rounded)
                } else {
                    rounded
                }
            }
            None => size,
        };
        if qty <= Decimal::ZERO {
            return None;
        }
        Some(format_decimal(qty, 8))
    }

    pub fn format_price(price: f64, filters: Option<&SymbolFilters>) -> Option<String> {
        let price = to_decimal(price).filter(|d| *d > Decimal::ZERO)?;
        let price = match filters.and_then(|f| f.tick_size) {
            Some(tick) => round_to_tick(price, tick),
            None => price,
        };
        Some(format_decimal(price, 8))
    }

    /// Error strings for an order payload, labelled `entry`/`close`.
    pub fn collect_errors(payload: &Value, label: &str) -> Vec<String> {
        let mut errors = Vec::new();
        match payload {
            Value::Null => {}
            Value::Object(map) => {
                if let Some(status) = map.get("status").and_then(Value::as_str) {
                    if is_failure_status(status) {
                        errors.push(format!("{}: status={}", label, status));
                    }
                }
                let message = map
                    .get("msg")
                    .or_else(|| map.get("message"))
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty());
                if let Some(message) = message {
                    match map.get("code") {
                        Some(Value::Number(n)) if n.as_i64() != Some(0) => {
                            errors.push(format!("{}: {} {}", label, n, message).trim().to_string())
                        }
                        Some(Value::String(s)) if !s.is_empty() && s != "0" => {
                            errors.push(format!("{}: {} {}", label, s, message).trim().to_string())
                        }
                        _ => errors.push(format!("{}: {}", label, message)),
                    }
                }
            }
            other => {
                let text = match other {
                    Value::String(s) => s.trim().to_string(),
                    v => v.to_string(),
                };
                if !text.is_empty() {
                    errors.push(format!("{}: {}", label, text));
                }
            }
        }
        dedup_errors(errors)
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) {
        let leverage = leverage.max(1.0).round() as i64;
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        if let Err(e) = self
            .signed_request(Method::POST, "/fapi/v1/leverage", &params)
            .await
        {
            warn!(
                "Failed to set leverage {} for {} on Binance futures: {}",
                leverage, symbol, e
            );
        }
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        position_side: &str,
        quantity: &str,
        reduce_only: bool,
    ) -> Result<Value> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("positionSide", position_side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        self.signed_request(Method::POST, "/fapi/v1/order", &params)
            .await
    }

    async fn cancel_existing_tpsl(&self, symbol: &str, position_side: &str) -> Result<usize> {
        let open = self
            .signed_request(
                Method::GET,
                "/fapi/v1/openOrders",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        let mut cancelled = 0;
        for order in open.as_array().map(Vec::as_slice).unwrap_or_default() {
            let order_type = order
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_uppercase();
            let order_position_side = order
                .get("positionSide")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !matches!(order_type.as_str(), "STOP_MARKET" | "TAKE_PROFIT_MARKET")
                || order_position_side != position_side
            {
                continue;
            }
            let Some(order_id) = oid_from(order.get("orderId")) else {
                continue;
            };
            self.signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                &[("symbol", symbol.to_string()), ("orderId", order_id.clone())],
            )
            .await?;
            debug!("Cancelled existing {} order {}", order_type, order_id);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn place_trigger(
        &self,
        symbol: &str,
        order_type: &str,
        side: &str,
        position_side: &str,
        quantity: &str,
        stop_price: &str,
    ) -> Result<Value> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("positionSide", position_side.to_string()),
            ("type", order_type.to_string()),
            ("quantity", quantity.to_string()),
            ("stopPrice", stop_price.to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        self.signed_request(Method::POST, "/fapi/v1/order", &params)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_protective(
        &self,
        symbol: &str,
        label: &str,
        order_type: &str,
        side: PositionSide,
        quantity: Option<&str>,
        price: f64,
        filters: Option<&SymbolFilters>,
    ) -> std::result::Result<Value, String> {
        let (Some(quantity), Some(stop_price)) = (quantity, Self::format_price(price, filters)) else {
            return Err(format!("{} order failed: invalid quantity or price", label));
        };
        self.place_trigger(
            symbol,
            order_type,
            Self::order_side(side.opposite()),
            Self::position_side(side),
            quantity,
            &stop_price,
        )
        .await
        .map_err(|e| format!("{} order failed: {}", label, error_text(&e)))
    }

    fn is_reduce_only_rejection(message: &str) -> bool {
        message.contains("-1106") && message.to_ascii_lowercase().contains("reduceonly")
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::BinanceFutures
    }

    fn is_live(&self) -> bool {
        true
    }

    async fn place_entry(&self, request: &EntryRequest) -> EntryResult {
        let symbol = Self::symbol_for(&request.coin);
        let order_side = Self::order_side(request.side);
        let filters = self.symbol_filters(&symbol).await;

        let Some(quantity) = Self::format_quantity(request.size, filters.as_ref()) else {
            return EntryResult::failed(
                self.kind(),
                format!("entry: invalid order quantity {}", request.size),
            );
        };

        self.set_leverage(&symbol, request.leverage).await;

        let mut errors = Vec::new();
        let raw = match self
            .market_order(
                &symbol,
                order_side,
                Self::position_side(request.side),
                &quantity,
                false,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let text = error_text(&e);
                error!("{}: Binance futures live entry failed: {}", request.coin, text);
                errors.push(format!("entry: {}", text));
                json!({"status": "error", "exception": text})
            }
        };
        if errors.is_empty() {
            errors.extend(Self::collect_errors(&raw, "entry"));
        }
        let accepted = !raw
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(is_failure_status);

        let entry_oid = oid_from(raw.get("orderId"));
        let mut result = EntryResult::resolve(self.kind(), accepted, errors, ENTRY_FALLBACK, raw);
        result.entry_oid = entry_oid;
        result
            .with_extra("symbol", symbol)
            .with_extra("side", order_side)
            .with_extra("quantity", quantity)
            .with_extra("stop_loss_price", json!(request.stop_loss_price))
            .with_extra("take_profit_price", json!(request.take_profit_price))
    }

    async fn close_position(&self, request: &CloseRequest) -> CloseResult {
        let amount = request.size.unwrap_or(0.0);
        if amount <= 0.0 {
            return CloseResult::nothing_to_close(self.kind());
        }

        let symbol = Self::symbol_for(&request.coin);
        let order_side = Self::order_side(request.side.opposite());
        let position_side = Self::position_side(request.side);
        let filters = self.symbol_filters(&symbol).await;
        let Some(quantity) = Self::format_quantity(amount, filters.as_ref()) else {
            return CloseResult::failed(
                self.kind(),
                format!("close: invalid order quantity {}", amount),
            );
        };

        let mut errors = Vec::new();
        let attempt = match self
            .market_order(&symbol, order_side, position_side, &quantity, true)
            .await
        {
            Err(e) if Self::is_reduce_only_rejection(&error_text(&e)) => {
                warn!(
                    "{}: Binance futures close failed due to reduceOnly parameter; retrying without reduceOnly.",
                    request.coin
                );
                self.market_order(&symbol, order_side, position_side, &quantity, false)
                    .await
            }
            other => other,
        };
        let raw = match attempt {
            Ok(raw) => raw,
            Err(e) => {
                let text = error_text(&e);
                error!("{}: Binance futures live close failed: {}", request.coin, text);
                errors.push(format!("close: {}", text));
                json!({"status": "error", "exception": text})
            }
        };
        if errors.is_empty() {
            errors.extend(Self::collect_errors(&raw, "close"));
        }
        let accepted = !raw
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(is_failure_status);

        let close_oid = oid_from(raw.get("orderId"));
        let mut result = CloseResult::resolve(self.kind(), accepted, errors, CLOSE_FALLBACK, raw);
        result.close_oid = close_oid;
        result
            .with_extra("symbol", symbol)
            .with_extra("fallback_price", json!(request.fallback_price))
    }

    async fn update_tpsl(&self, request: &TpslRequest) -> TpslResult {
        let new_sl = request.new_sl.filter(|p| *p > 0.0);
        let new_tp = request.new_tp.filter(|p| *p > 0.0);
        if new_sl.is_none() && new_tp.is_none() {
            return TpslResult {
                success: true,
                backend: self.kind(),
                errors: Vec::new(),
                sl_order_id: None,
                tp_order_id: None,
                raw: json!({"reason": "no SL/TP values provided"}),
            };
        }

        let symbol = Self::symbol_for(&request.coin);
        let close_side = Self::order_side(request.side.opposite());
        let position_side = Self::position_side(request.side);
        let filters = self.symbol_filters(&symbol).await;

        if let Err(e) = self.cancel_existing_tpsl(&symbol, position_side).await {
            warn!("Failed to cancel existing TP/SL orders for {}: {}", symbol, e);
        }

        let mut errors = Vec::new();
        let mut raw = Map::new();
        let quantity = Self::format_quantity(request.quantity, filters.as_ref());

        let mut sl_order_id = None;
        if let Some(price) = new_sl {
            match self
                .place_protective(
                    &symbol,
                    "SL",
                    "STOP_MARKET",
                    request.side,
                    quantity.as_deref(),
                    price,
                    filters.as_ref(),
                )
                .await
            {
                Ok(order) => {
                    sl_order_id = oid_from(order.get("orderId"));
                    info!(
                        "Binance SL order created: {} {} @ {}, order_id={:?}",
                        symbol, close_side, price, sl_order_id
                    );
                    raw.insert("sl_order".to_string(), order);
                }
                Err(msg) => {
                    error!("Binance {}: {}", symbol, msg);
                    errors.push(msg);
                }
            }
        }

        let mut tp_order_id = None;
        if let Some(price) = new_tp {
            match self
                .place_protective(
                    &symbol,
                    "TP",
                    "TAKE_PROFIT_MARKET",
                    request.side,
                    quantity.as_deref(),
                    price,
                    filters.as_ref(),
                )
                .await
            {
                Ok(order) => {
                    tp_order_id = oid_from(order.get("orderId"));
                    info!(
                        "Binance TP order created: {} {} @ {}, order_id={:?}",
                        symbol, close_side, price, tp_order_id
                    );
                    raw.insert("tp_order".to_string(), order);
                }
                Err(msg) => {
                    error!("Binance {}: {}", symbol, msg);
                    errors.push(msg);
                }
            }
        }

        let success =
            (new_sl.is_none() || sl_order_id.is_some()) && (new_tp.is_none() || tp_order_id.is_some());
        if !success && errors.is_empty() {
            errors.push("TP/SL order was not accepted; see raw payload for details.".to_string());
        }
        TpslResult {
            success,
            backend: self.kind(),
            errors: dedup_errors(errors),
            sl_order_id,
            tp_order_id,
            raw: Value::Object(raw),
        }
    }
}
