use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tradebot::config::RiskControlConfig;
use tradebot::exchange::{
    CloseRequest, CloseResult, EntryRequest, EntryResult, ExchangeClient, ExchangeKind,
    PositionSide, TpslRequest, TpslResult,
};
use tradebot::execution::{
    CloseOutcome, Decision, EntryOutcome, EntryPermission, PlanLimits, Portfolio, Position, Signal,
    TradeExecutor,
};
use tradebot::market::Candle;
use tradebot::risk::{RiskControlState, RiskGate, REASON_TELEGRAM_KILL};

mock! {
    pub Exchange {}

    #[async_trait]
    impl ExchangeClient for Exchange {
        fn kind(&self) -> ExchangeKind;
        fn is_live(&self) -> bool;
        fn manages_protective_orders(&self) -> bool;
        async fn place_entry(&self, request: &EntryRequest) -> EntryResult;
        async fn close_position(&self, request: &CloseRequest) -> CloseResult;
        async fn update_tpsl(&self, request: &TpslRequest) -> TpslResult;
    }
}

fn live_exchange() -> MockExchange {
    let mut mock = MockExchange::new();
    mock.expect_kind().return_const(ExchangeKind::BinanceFutures);
    mock.expect_is_live().return_const(true);
    mock.expect_manages_protective_orders().return_const(false);
    mock
}

fn gate(kill_switch_active: bool) -> RiskGate {
    let mut gate = RiskGate::from_persisted(
        RiskControlState::default(),
        RiskControlConfig::default(),
        Utc::now(),
    );
    if kill_switch_active {
        gate.activate_kill_switch(REASON_TELEGRAM_KILL, Utc::now());
    }
    gate
}

fn entry_decision() -> Decision {
    Decision {
        signal: Signal::Entry,
        side: PositionSide::Long,
        leverage: Some(5.0),
        risk_usd: Some(50.0),
        stop_loss: Some(95.0),
        profit_target: Some(110.0),
        justification: "breakout".to_string(),
        ..Default::default()
    }
}

fn open_position() -> Position {
    Position {
        side: PositionSide::Long,
        quantity: 2.0,
        entry_price: 100.0,
        profit_target: 120.0,
        stop_loss: 90.0,
        leverage: 5.0,
        margin: 40.0,
        fee_rate: 0.0005,
        live_backend: Some(ExchangeKind::BinanceFutures),
        ..Default::default()
    }
}

fn candle(close: f64) -> Candle {
    Candle {
        open_time: Utc::now(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

#[tokio::test]
async fn active_kill_switch_never_reaches_place_entry() {
    let mut mock = live_exchange();
    mock.expect_place_entry().never();
    let gate = gate(true);
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default())
        .with_kill_switch(Arc::new(gate.handle()));

    let mut portfolio = Portfolio::new(1_000.0);
    let outcome = executor
        .execute_entry(&mut portfolio, "BTC", &entry_decision(), 100.0, Utc::now())
        .await;

    assert_eq!(outcome, EntryOutcome::Blocked);
    assert!(portfolio.positions.is_empty());
    assert_eq!(portfolio.balance, 1_000.0);
}

#[tokio::test]
async fn guard_follows_gate_transitions() {
    let mut mock = live_exchange();
    mock.expect_place_entry()
        .times(1)
        .returning(|_| EntryResult::resolve(ExchangeKind::BinanceFutures, true, Vec::new(), "", Value::Null));
    let mut gate = gate(true);
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default())
        .with_kill_switch(Arc::new(gate.handle()));
    let mut portfolio = Portfolio::new(1_000.0);

    let blocked = executor
        .execute_entry(&mut portfolio, "BTC", &entry_decision(), 100.0, Utc::now())
        .await;
    assert_eq!(blocked, EntryOutcome::Blocked);

    gate.deactivate_kill_switch("test", false);
    let opened = executor
        .execute_entry(&mut portfolio, "BTC", &entry_decision(), 100.0, Utc::now())
        .await;
    assert!(matches!(opened, EntryOutcome::Opened { .. }), "got {:?}", opened);
    assert!(portfolio.positions.contains_key("BTC"));
}

#[tokio::test]
async fn close_is_sent_while_kill_switch_active() {
    let mut mock = live_exchange();
    mock.expect_place_entry().never();
    mock.expect_close_position()
        .withf(|req| req.coin == "ETH" && req.side == PositionSide::Long && req.size == Some(2.0))
        .times(1)
        .returning(|_| CloseResult::resolve(ExchangeKind::BinanceFutures, true, Vec::new(), "", Value::Null));
    let gate = gate(true);
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default())
        .with_kill_switch(Arc::new(gate.handle()));

    let mut portfolio = Portfolio::new(1_000.0);
    portfolio.positions.insert("ETH".to_string(), open_position());

    let outcome = executor
        .execute_close(&mut portfolio, "ETH", "operator exit", 105.0, Utc::now())
        .await;
    assert!(matches!(outcome, CloseOutcome::Closed { partial: false, .. }), "got {:?}", outcome);
    assert!(portfolio.positions.is_empty());
    assert!(portfolio.balance > 1_000.0);
}

#[tokio::test]
async fn blocked_iteration_still_closes_and_skips_entries() {
    let mut mock = live_exchange();
    mock.expect_place_entry().never();
    mock.expect_close_position()
        .times(1)
        .returning(|_| CloseResult::resolve(ExchangeKind::BinanceFutures, true, Vec::new(), "", Value::Null));
    let gate = gate(true);
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default())
        .with_kill_switch(Arc::new(gate.handle()));

    let mut portfolio = Portfolio::new(1_000.0);
    portfolio.positions.insert("ETH".to_string(), open_position());
    let universe = vec!["BTC".to_string(), "ETH".to_string()];
    let decisions = BTreeMap::from([
        ("BTC".to_string(), entry_decision()),
        ("ETH".to_string(), Decision::close_with_reason("invalidated")),
    ]);
    let candles = HashMap::from([
        ("BTC".to_string(), candle(100.0)),
        ("ETH".to_string(), candle(101.0)),
    ]);

    let summary = executor
        .process_decisions(
            &mut portfolio,
            &universe,
            &decisions,
            &candles,
            &EntryPermission::from_gate(&gate, false),
            Utc::now(),
        )
        .await;

    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.closed, 1);
    assert_eq!(summary.opened, 0);
    assert!(portfolio.positions.is_empty());
}

#[tokio::test]
async fn failed_entry_leaves_no_position_and_is_not_retried() {
    let mut mock = live_exchange();
    mock.expect_place_entry()
        .times(1)
        .returning(|_| EntryResult::failed(ExchangeKind::BinanceFutures, "Margin is insufficient"));
    let gate = gate(false);
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default())
        .with_kill_switch(Arc::new(gate.handle()));

    let mut portfolio = Portfolio::new(1_000.0);
    let outcome = executor
        .execute_entry(&mut portfolio, "BTC", &entry_decision(), 100.0, Utc::now())
        .await;

    assert_eq!(
        outcome,
        EntryOutcome::Failed(vec!["Margin is insufficient".to_string()])
    );
    assert!(portfolio.positions.is_empty());
    assert_eq!(portfolio.balance, 1_000.0);
}

#[tokio::test]
async fn failed_close_keeps_position_open() {
    let mut mock = live_exchange();
    mock.expect_close_position()
        .times(1)
        .returning(|_| CloseResult::failed(ExchangeKind::BinanceFutures, "ReduceOnly Order is rejected"));
    let executor = TradeExecutor::new(Arc::new(mock), PlanLimits::default());

    let mut portfolio = Portfolio::new(1_000.0);
    portfolio.positions.insert("ETH".to_string(), open_position());

    let outcome = executor
        .execute_close(&mut portfolio, "ETH", "stop loss", 90.0, Utc::now())
        .await;
    assert!(matches!(outcome, CloseOutcome::Failed(_)));
    assert_eq!(portfolio.positions.get("ETH"), Some(&open_position()));
    assert_eq!(portfolio.balance, 1_000.0);
}
