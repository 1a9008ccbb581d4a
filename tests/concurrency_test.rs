//! Concurrent access to the bet registry and ledger

use crashline::errors::BetError;
use crashline::games::{BetLedger, BetLimits, PlayerId, RoundId, WagerStatus};
use crashline::ledger::{InMemoryLedger, Ledger, MovementKind};
use std::sync::Arc;

const CURRENCY: &str = "STARS";

fn registry(ledger: Arc<InMemoryLedger>) -> Arc<BetLedger> {
    Arc::new(BetLedger::new(
        RoundId(1),
        ledger,
        CURRENCY.to_string(),
        BetLimits::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bets_same_player_single_debit() {
    let ledger = Arc::new(InMemoryLedger::new());
    let player = PlayerId(1);
    ledger.set_balance(player, CURRENCY, 10.0);
    let bets = registry(ledger.clone());

    let a = tokio::spawn({
        let bets = bets.clone();
        async move { bets.place(player, 10.0, None).await }
    });
    let b = tokio::spawn({
        let bets = bets.clone();
        async move { bets.place(player, 10.0, None).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(BetError::InsufficientBalance { .. })
    )));
    assert_eq!(ledger.balance(player, CURRENCY).await.unwrap(), 0.0);
    assert_eq!(bets.player_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bets_with_ample_balance_report_duplicate() {
    let ledger = Arc::new(InMemoryLedger::new());
    let player = PlayerId(2);
    ledger.set_balance(player, CURRENCY, 1_000.0);
    let bets = registry(ledger.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bets = bets.clone();
            tokio::spawn(async move { bets.place(player, 10.0, None).await })
        })
        .collect();

    let mut accepted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(BetError::DuplicateBet(_)) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(ledger.balance(player, CURRENCY).await.unwrap(), 990.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_players_totals_are_exact() {
    let ledger = Arc::new(InMemoryLedger::new());
    for id in 0..200 {
        ledger.set_balance(PlayerId(id), CURRENCY, 100.0);
    }
    let bets = registry(ledger.clone());

    let handles: Vec<_> = (0..200)
        .map(|id| {
            let bets = bets.clone();
            tokio::spawn(async move { bets.place(PlayerId(id), 2.5, None).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(bets.player_count(), 200);
    assert_eq!(bets.total_wagered(), 500.0);

    let mut bet_numbers = Vec::new();
    for id in 0..200 {
        bet_numbers.push(bets.wager(PlayerId(id)).await.unwrap().bet_number);
    }
    bet_numbers.sort_unstable();
    assert_eq!(bet_numbers, (1..=200).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auto_and_manual_cashout_race_credits_once() {
    for round in 0..50 {
        let ledger = Arc::new(InMemoryLedger::new());
        let player = PlayerId(round);
        ledger.set_balance(player, CURRENCY, 100.0);
        let bets = registry(ledger.clone());
        let wager = bets.place(player, 10.0, Some(2.0)).await.unwrap();
        bets.open_flight().await.unwrap();

        let sweep = tokio::spawn({
            let bets = bets.clone();
            async move { bets.auto_cashout_sweep(2.0).await }
        });
        let manual = tokio::spawn({
            let bets = bets.clone();
            async move { bets.cash_out(player, 2.0).await }
        });

        let swept = sweep.await.unwrap();
        let manual = manual.await.unwrap();
        let wins = swept.len() + usize::from(manual.is_ok());
        assert_eq!(wins, 1);
        if let Err(e) = manual {
            assert!(matches!(e, BetError::AlreadySettled(_)));
        }

        let credits: Vec<_> = ledger
            .movements_for_round([wager.id])
            .into_iter()
            .filter(|m| m.kind == MovementKind::Credit)
            .collect();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].amount, 20.0);
        assert_eq!(ledger.balance(player, CURRENCY).await.unwrap(), 110.0);

        let snapshot = bets.close_round().await.unwrap();
        assert_eq!(snapshot.wagers[0].status, WagerStatus::CashedOut);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cashout_racing_close_is_all_or_nothing() {
    for round in 0..50 {
        let ledger = Arc::new(InMemoryLedger::new());
        let player = PlayerId(round);
        ledger.set_balance(player, CURRENCY, 100.0);
        let bets = registry(ledger.clone());
        bets.place(player, 10.0, None).await.unwrap();
        bets.open_flight().await.unwrap();

        let manual = tokio::spawn({
            let bets = bets.clone();
            async move { bets.cash_out(player, 1.5).await }
        });
        let close = tokio::spawn({
            let bets = bets.clone();
            async move { bets.close_round().await }
        });

        let manual = manual.await.unwrap();
        let snapshot = close.await.unwrap().unwrap();
        let status = snapshot.wagers[0].status;
        let balance = ledger.balance(player, CURRENCY).await.unwrap();

        match manual {
            Ok(_) => {
                assert_eq!(status, WagerStatus::CashedOut);
                assert_eq!(balance, 105.0);
            }
            Err(e) => {
                assert!(matches!(e, BetError::Phase { .. }));
                assert_eq!(status, WagerStatus::Lost);
                assert_eq!(balance, 90.0);
            }
        }
    }
}
