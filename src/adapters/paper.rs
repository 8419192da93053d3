//! Paper execution: every order fills immediately at the reference price.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::exchange::types::{CloseRequest, CloseResult, EntryRequest, EntryResult};
use crate::exchange::{ExchangeClient, ExchangeKind};

#[derive(Debug, Clone, Default)]
pub struct PaperExchangeClient;

impl PaperExchangeClient {
    pub fn new() -> Self {
        Self
    }

    fn order_id() -> String {
        format!("paper-{}", Uuid::new_v4())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchangeClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    fn is_live(&self) -> bool {
        false
    }

    async fn place_entry(&self, request: &EntryRequest) -> EntryResult {
        if request.size.is_nan() || request.size <= 0.0 {
            return EntryResult::failed(
                self.kind(),
                format!("entry: invalid order quantity {}", request.size),
            );
        }
        let oid = Self::order_id();
        debug!(
            "Paper {} {} {} @ {:?} (oid {})",
            request.side, request.size, request.coin, request.entry_price, oid
        );
        let raw = json!({
            "status": "filled",
            "coin": request.coin,
            "side": request.side.as_str(),
            "size": request.size,
            "price": request.entry_price,
            "liquidity": request.liquidity.as_str(),
        });
        let mut result = EntryResult::resolve(self.kind(), true, Vec::new(), "", raw);
        result.entry_oid = Some(oid);
        result
    }

    async fn close_position(&self, request: &CloseRequest) -> CloseResult {
        let oid = Self::order_id();
        let raw = json!({
            "status": "filled",
            "coin": request.coin,
            "side": request.side.as_str(),
            "size": request.size,
            "price": request.fallback_price,
        });
        let mut result = CloseResult::resolve(self.kind(), true, Vec::new(), "", raw);
        result.close_oid = Some(oid);
        result
    }
}
