use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;

use tradebot::config::RiskControlConfig;
use tradebot::execution::Portfolio;
use tradebot::persistence::StateStore;
use tradebot::risk::{
    DeactivateOutcome, RiskGate, REASON_DAILY_LOSS_LIMIT, REASON_ENV_OVERRIDE,
    REASON_TELEGRAM_KILL, REASON_TELEGRAM_RESUME,
};

fn temp_state_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!(
            "tradebot-{}-{}",
            name,
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ))
        .join("portfolio_state.json")
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

async fn restart(store: &StateStore, config: RiskControlConfig, now: DateTime<Utc>) -> (Portfolio, RiskGate) {
    let loaded = store.load().await;
    let gate = RiskGate::from_persisted(loaded.risk_control, config, now);
    (loaded.portfolio, gate)
}

#[tokio::test]
async fn kill_switch_survives_restart() {
    let store = StateStore::new(temp_state_path("kill-restart"), 1_000.0);
    let (portfolio, mut gate) = restart(&store, RiskControlConfig::default(), at(1, 9)).await;
    assert!(!gate.is_kill_switch_active());

    gate.activate_kill_switch(REASON_TELEGRAM_KILL, at(1, 10));
    store
        .save(&portfolio, gate.state(), at(1, 10))
        .await
        .expect("state should save");

    let (_, gate) = restart(&store, RiskControlConfig::default(), at(1, 11)).await;
    assert!(gate.is_kill_switch_active());
    assert!(!gate.allow_entry());
    assert_eq!(gate.state().kill_switch_reason.as_deref(), Some(REASON_TELEGRAM_KILL));
    assert_eq!(gate.state().kill_switch_triggered_at, Some(at(1, 10)));
}

#[tokio::test]
async fn boot_override_wins_over_persisted_state() {
    let store = StateStore::new(temp_state_path("override"), 1_000.0);
    let (portfolio, mut gate) = restart(&store, RiskControlConfig::default(), at(1, 9)).await;
    gate.activate_kill_switch(REASON_TELEGRAM_KILL, at(1, 9));
    store
        .save(&portfolio, gate.state(), at(1, 9))
        .await
        .expect("state should save");

    let forced_off = RiskControlConfig {
        kill_switch: Some(false),
        ..Default::default()
    };
    let (_, gate) = restart(&store, forced_off, at(1, 10)).await;
    assert!(!gate.is_kill_switch_active());
    assert_eq!(gate.state().kill_switch_reason.as_deref(), Some(REASON_ENV_OVERRIDE));

    let forced_on = RiskControlConfig {
        kill_switch: Some(true),
        ..Default::default()
    };
    let (_, gate) = restart(&store, forced_on, at(1, 11)).await;
    assert!(gate.is_kill_switch_active());
    assert_eq!(gate.state().kill_switch_triggered_at, Some(at(1, 11)));
}

#[tokio::test]
async fn daily_loss_trip_blocks_resume_until_next_day() {
    let store = StateStore::new(temp_state_path("daily-loss"), 1_000.0);
    let (portfolio, mut gate) = restart(&store, RiskControlConfig::default(), at(2, 0)).await;

    assert!(gate.check_risk_limits(Some(1_000.0), at(2, 1)).await);
    assert!(gate.check_risk_limits(Some(960.0), at(2, 2)).await);
    assert!(!gate.check_risk_limits(Some(940.0), at(2, 3)).await);
    assert!(gate.state().daily_loss_triggered);
    assert_eq!(gate.state().kill_switch_reason.as_deref(), Some(REASON_DAILY_LOSS_LIMIT));
    assert!((gate.state().daily_loss_pct + 6.0).abs() < 1e-9);

    store
        .save(&portfolio, gate.state(), at(2, 3))
        .await
        .expect("state should save");
    let (_, mut gate) = restart(&store, RiskControlConfig::default(), at(2, 4)).await;
    assert_eq!(
        gate.deactivate_kill_switch(REASON_TELEGRAM_RESUME, false),
        DeactivateOutcome::BlockedByDailyLoss
    );
    assert!(gate.is_kill_switch_active());

    // Recovery the same day does not lift the block.
    assert!(!gate.check_risk_limits(Some(1_010.0), at(2, 5)).await);

    // A new UTC day rolls the baseline but leaves the kill switch to the operator.
    assert!(!gate.check_risk_limits(Some(940.0), at(3, 0)).await);
    assert!(!gate.state().daily_loss_triggered);
    assert_eq!(gate.state().daily_start_equity, Some(940.0));
    assert_eq!(
        gate.deactivate_kill_switch(REASON_TELEGRAM_RESUME, false),
        DeactivateOutcome::Deactivated
    );
    assert!(gate.check_risk_limits(Some(940.0), at(3, 1)).await);
}

#[tokio::test]
async fn manual_reset_clears_trigger_but_not_kill_switch() {
    let mut gate = RiskGate::from_persisted(Default::default(), RiskControlConfig::default(), at(4, 0));
    gate.check_risk_limits(Some(1_000.0), at(4, 1)).await;
    gate.check_risk_limits(Some(900.0), at(4, 2)).await;
    assert!(gate.is_kill_switch_active());

    gate.reset_daily_baseline(900.0, "telegram:/reset_daily", at(4, 3));
    assert!(!gate.state().daily_loss_triggered);
    assert_eq!(gate.state().daily_loss_pct, 0.0);
    assert_eq!(gate.state().daily_start_equity, Some(900.0));
    assert!(gate.is_kill_switch_active());

    assert_eq!(
        gate.deactivate_kill_switch(REASON_TELEGRAM_RESUME, false),
        DeactivateOutcome::Deactivated
    );
    assert!(gate.allow_entry());
}

#[tokio::test]
async fn forced_resume_overrides_daily_loss_block() {
    let mut gate = RiskGate::from_persisted(Default::default(), RiskControlConfig::default(), at(5, 0));
    gate.check_risk_limits(Some(1_000.0), at(5, 1)).await;
    gate.check_risk_limits(Some(900.0), at(5, 2)).await;

    assert_eq!(
        gate.deactivate_kill_switch(REASON_TELEGRAM_RESUME, true),
        DeactivateOutcome::Deactivated
    );
    // The trigger stays latched, so the limit does not fire twice the same day.
    assert!(gate.check_risk_limits(Some(850.0), at(5, 3)).await);
    assert!(!gate.is_kill_switch_active());
}

#[tokio::test]
async fn disabled_risk_control_allows_entries_with_kill_switch_set() {
    let store = StateStore::new(temp_state_path("disabled"), 1_000.0);
    let (portfolio, mut gate) = restart(&store, RiskControlConfig::default(), at(6, 0)).await;
    gate.activate_kill_switch(REASON_TELEGRAM_KILL, at(6, 0));
    store
        .save(&portfolio, gate.state(), at(6, 0))
        .await
        .expect("state should save");

    let disabled = RiskControlConfig {
        enabled: false,
        ..Default::default()
    };
    let (_, mut gate) = restart(&store, disabled, at(6, 1)).await;
    assert!(gate.is_kill_switch_active());
    assert!(gate.allow_entry());
    assert!(gate.check_risk_limits(Some(1.0), at(6, 2)).await);
}

#[test]
fn corrupt_state_file_starts_fresh() {
    let path = temp_state_path("corrupt");
    let parent = path.parent().expect("state path has a parent").to_path_buf();
    std::fs::create_dir_all(&parent).expect("temp dir");
    std::fs::write(&path, "{not json").expect("write corrupt file");

    let store = StateStore::new(&path, 2_500.0);
    let (portfolio, gate) =
        tokio_test::block_on(restart(&store, RiskControlConfig::default(), at(7, 0)));
    assert_eq!(portfolio.balance, 2_500.0);
    assert!(portfolio.positions.is_empty());
    assert!(!gate.is_kill_switch_active());

    let _ = std::fs::remove_dir_all(parent);
}
