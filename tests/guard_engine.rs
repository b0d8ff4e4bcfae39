mod common;

use chrono::{Duration, Utc};
use common::{harness, settings, PositionBuilder};
use oko_guard::storage::Ledger;
use oko_guard::types::{CloseReason, GuardOutcome, PositionStatus, Side};
use rust_decimal_macros::dec;

fn btc_long() -> PositionBuilder {
    // 0.1 BTC at 50x: 100 USDT margin
    PositionBuilder::new("BTCUSDT", Side::Long, dec!(50000), dec!(0.1))
        .leverage(50)
        .stop(dec!(49000))
        .targets(&[dec!(52000), dec!(54000), dec!(56000)])
}

#[tokio::test]
async fn pnl_emergency_closes_on_third_consecutive_cycle() {
    // shipped thresholds: the account check must not pre-empt a lone position
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, true).await;

    // -600 * 0.1 = -60 on 100 margin
    h.exchange.set_price("BTCUSDT", dec!(49400));

    for _ in 0..2 {
        let report = h.engine.run_monitor_cycle().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.closed, 0);
    }
    assert_eq!(h.exchange.mutating_calls(), 0);
    assert_eq!(h.stored(&position.id).await.status, PositionStatus::Open);

    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 1, "{:?}", report.errors);

    let stored = h.stored(&position.id).await;
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.close_reason, Some(CloseReason::PnlEmergency));
    assert!(h.exchange.position("BTCUSDT", Side::Long).is_none());
    assert!(h
        .ledger
        .guard_log()
        .await
        .iter()
        .any(|e| e.action == "pnl_emergency" && e.outcome == GuardOutcome::Executed));
}

#[tokio::test]
async fn recovery_between_detections_restarts_the_count() {
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, true).await;

    h.exchange.set_price("BTCUSDT", dec!(49400));
    h.engine.run_monitor_cycle().await;
    h.engine.run_monitor_cycle().await;

    // -20%: not an emergency, streak resets
    h.exchange.set_price("BTCUSDT", dec!(49800));
    assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);

    h.exchange.set_price("BTCUSDT", dec!(49400));
    assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);
    assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);
    assert_eq!(h.engine.run_monitor_cycle().await.closed, 1);
}

#[tokio::test]
async fn ghost_position_is_closed_locally_without_remote_calls() {
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, true).await;
    h.exchange.remove_position("BTCUSDT", Side::Long);

    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 1);
    assert!(report.errors.is_empty());
    assert_eq!(h.exchange.mutating_calls(), 0);

    let stored = h.stored(&position.id).await;
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.close_reason, Some(CloseReason::GhostPosition));
    assert!(h.ledger.load_open_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_breach_closes_instantly() {
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, true).await;

    // 3% under the stop, past the 2% tolerance
    h.exchange.set_price("BTCUSDT", dec!(47500));
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 1);
    assert_eq!(h.stored(&position.id).await.close_reason, Some(CloseReason::SlBreach));
}

#[tokio::test]
async fn unverified_close_is_reported_not_assumed() {
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, true).await;
    h.exchange.set_ignore_closes(true);

    h.exchange.set_price("BTCUSDT", dec!(47500));
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 0);
    assert!(report.errors.iter().any(|e| e.contains("unverified")));
    assert_eq!(h.stored(&position.id).await.status, PositionStatus::Open);
    assert!(h
        .ledger
        .guard_log()
        .await
        .iter()
        .any(|e| e.action == "close_unverified" && e.outcome == GuardOutcome::Critical));
}

#[tokio::test]
async fn missing_stop_is_repaired_and_verified() {
    let h = harness(settings());
    let position = btc_long().build();
    h.seed(&position, false).await;

    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.repaired, 1, "{:?}", report.errors);
    let remote = h.exchange.position("BTCUSDT", Side::Long).unwrap();
    assert_eq!(remote.stop_loss, Some(dec!(49000)));
    assert_eq!(remote.take_profit, Some(dec!(52000)));

    // nothing left to do next cycle
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.repaired, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn repair_budget_is_refused_after_max_attempts() {
    let mut s = settings();
    s.guard.repair_grace_secs = 3600;
    let h = harness(s);
    let position = btc_long().build();
    h.seed(&position, false).await;
    h.exchange.set_ignore_protection(true);

    for _ in 0..3 {
        let report = h.engine.run_monitor_cycle().await;
        assert!(report.errors.iter().any(|e| e.contains("repair failed")));
    }
    let report = h.engine.run_monitor_cycle().await;
    assert!(report.errors.iter().any(|e| e.contains("budget spent")));
    assert_eq!(
        h.engine.executor().repairs().attempts(&position.id, "missing_protection"),
        3
    );
    // still open: inside the grace period nothing escalates
    assert_eq!(h.stored(&position.id).await.status, PositionStatus::Open);
}

#[tokio::test]
async fn exhausted_repair_past_grace_escalates_then_bans() {
    let mut s = settings();
    s.guard.repair_grace_secs = 60;
    let h = harness(s);
    // opened five minutes ago
    let position = btc_long().build();
    h.seed(&position, false).await;
    h.exchange.set_ignore_protection(true);

    for _ in 0..3 {
        h.engine.run_monitor_cycle().await;
    }
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 1, "{:?}", report.errors);

    let stored = h.stored(&position.id).await;
    assert_eq!(stored.close_reason, Some(CloseReason::RepairEscalation));
    let bans = h.ledger.load_active_bans().await.unwrap();
    assert_eq!(bans.len(), 1);
    assert_eq!(bans[0].symbol, "BTCUSDT");
}

#[tokio::test]
async fn escalation_keeps_the_longer_capitulation_ban() {
    let mut s = settings();
    s.guard.repair_grace_secs = 60;
    s.guard.capitulation_threshold = 1;
    let h = harness(s);
    let position = btc_long().build();
    h.seed(&position, false).await;
    h.exchange.set_ignore_protection(true);

    for _ in 0..4 {
        h.engine.run_monitor_cycle().await;
    }
    assert_eq!(
        h.stored(&position.id).await.close_reason,
        Some(CloseReason::RepairEscalation)
    );

    let bans = h.ledger.load_active_bans().await.unwrap();
    assert_eq!(bans.len(), 1);
    assert!(bans[0].reason.starts_with("capitulation"), "{}", bans[0].reason);
    assert!(bans[0].expires_at - Utc::now() > Duration::hours(23));
}

#[tokio::test]
async fn ladder_round_trip_ends_closed_with_every_target_hit() {
    let h = harness(settings());
    let position = PositionBuilder::new("SOLUSDT", Side::Long, dec!(100), dec!(10))
        .stop(dec!(95))
        .targets(&[dec!(105), dec!(110), dec!(120)])
        .build();
    h.seed(&position, true).await;
    h.exchange.set_drop_protection_on_partial(true);

    let mut last_quantity = position.quantity;
    for price in [dec!(103), dec!(106), dec!(111), dec!(121)] {
        h.exchange.set_price("SOLUSDT", price);
        let report = h.engine.run_monitor_cycle().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);

        let stored = h.stored(&position.id).await;
        assert!(stored.quantity <= last_quantity);
        last_quantity = stored.quantity;
    }

    let stored = h.stored(&position.id).await;
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(stored.take_profits.iter().all(|t| t.hit));
    assert!(stored.quantity.is_zero());
    assert_eq!(stored.close_reason, Some(CloseReason::TakeProfit));
    assert!(h.exchange.position("SOLUSDT", Side::Long).is_none());
}

#[tokio::test]
async fn ladder_waits_for_a_mark_price() {
    let h = harness(settings());
    let position = PositionBuilder::new("SOLUSDT", Side::Short, dec!(100), dec!(10))
        .stop(dec!(105))
        .targets(&[dec!(95), dec!(90)])
        .build();
    h.seed(&position, true).await;

    // exchange row without a usable mark price
    let mut remote = common::remote_of(&position, true);
    remote.mark_price = dec!(0);
    h.exchange.insert_position(remote);

    let report = h.engine.run_monitor_cycle().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    let stored = h.stored(&position.id).await;
    assert_eq!(stored.quantity, dec!(10));
    assert!(!stored.take_profits[0].hit);
    assert_eq!(h.exchange.mutating_calls(), 0);
}

#[tokio::test]
async fn quantity_follows_exchange_after_take_profit() {
    let h = harness(settings());
    let mut position = PositionBuilder::new("SOLUSDT", Side::Long, dec!(100), dec!(5))
        .stop(dec!(100))
        .targets(&[dec!(105), dec!(110)])
        .build();
    position.take_profits[0].hit = true;
    h.seed(&position, true).await;

    let mut remote = common::remote_of(&position, true);
    remote.size = dec!(3);
    h.exchange.insert_position(remote);
    h.exchange.set_price("SOLUSDT", dec!(104));

    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.repaired, 1);
    assert_eq!(h.stored(&position.id).await.quantity, dec!(3));
}

#[tokio::test]
async fn account_drawdown_closes_every_position() {
    let mut s = settings();
    s.guard.account_drawdown_threshold = dec!(-0.3);
    let h = harness(s);
    let btc = btc_long().build();
    let eth = PositionBuilder::new("ETHUSDT", Side::Short, dec!(3000), dec!(1))
        .leverage(30)
        .stop(dec!(3100))
        .targets(&[dec!(2800)])
        .build();
    h.seed(&btc, true).await;
    h.seed(&eth, true).await;

    // BTC -40% of margin, ETH -40% of margin: no single position trips -50%
    h.exchange.set_price("BTCUSDT", dec!(49600));
    h.exchange.set_price("ETHUSDT", dec!(3040));

    assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);
    assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 2, "{:?}", report.errors);

    for id in [&btc.id, &eth.id] {
        assert_eq!(h.stored(id).await.close_reason, Some(CloseReason::AccountDrawdown));
    }
}

#[tokio::test]
async fn correlated_losers_on_one_symbol_are_closed() {
    let mut s = settings();
    s.guard.account_drawdown_threshold = dec!(-0.9);
    let h = harness(s);
    let long = btc_long().build();
    let short = PositionBuilder::new("BTCUSDT", Side::Short, dec!(49900), dec!(0.1))
        .leverage(50)
        .stop(dec!(51000))
        .targets(&[dec!(46000)])
        .build();
    h.seed(&long, true).await;
    h.seed(&short, true).await;

    // both about -5% of margin, far from the emergency threshold
    h.exchange.set_price("BTCUSDT", dec!(49950));

    for _ in 0..2 {
        assert_eq!(h.engine.run_monitor_cycle().await.closed, 0);
    }
    let report = h.engine.run_monitor_cycle().await;
    assert_eq!(report.closed, 2, "{:?}", report.errors);
    assert_eq!(h.stored(&long.id).await.close_reason, Some(CloseReason::CorrelatedLoss));
}
