//! Randomized and concurrent checks of the ledger invariants.

use std::sync::Arc;

use chrono::Utc;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rust_decimal::Decimal;
use treasury_ledger::{BalanceStore, BasisPointsFeeCalculator, MemoryStore, conservation};
use treasury_types::{IdempotencyKey, MerchantId, PayoutId, TreasuryError, verify_chain};

fn setup() -> (Arc<MemoryStore>, BalanceStore) {
    let store = Arc::new(MemoryStore::new());
    let bs = BalanceStore::new(store.clone(), Arc::new(BasisPointsFeeCalculator::default()));
    (store, bs)
}

#[tokio::test]
async fn random_operation_sequence_conserves_money() {
    let (store, bs) = setup();
    let mch = MerchantId::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut open: Vec<(PayoutId, Decimal, Decimal)> = Vec::new();

    for step in 0..500 {
        let now = Utc::now();
        match rng.gen_range(0..4) {
            0 => {
                let amount = Decimal::new(rng.gen_range(1..50_000), 2);
                bs.credit(mch, amount, "Deposit", now).await.unwrap();
            }
            1 => {
                let amount = Decimal::new(rng.gen_range(1..20_000), 2);
                let fee = bs.calculate_fee(amount);
                let payout = PayoutId::new();
                let key = IdempotencyKey::new(format!("step-{step}"));
                match bs.reserve(mch, amount, fee, key, Some(payout), now).await {
                    Ok(_) => open.push((payout, amount, fee)),
                    Err(TreasuryError::InsufficientBalance { .. }) => {}
                    Err(e) => panic!("unexpected: {e}"),
                }
            }
            2 if !open.is_empty() => {
                let (payout, amount, fee) = open.swap_remove(rng.gen_range(0..open.len()));
                bs.release(mch, amount, fee, payout, now).await.unwrap();
            }
            3 if !open.is_empty() => {
                let (payout, amount, fee) = open.swap_remove(rng.gen_range(0..open.len()));
                bs.settle(mch, amount, fee, payout, Some("sig"), now).await.unwrap();
            }
            _ => {}
        }

        let bal = bs.balance(mch).await.unwrap();
        conservation::verify(&bal).unwrap();
        let outstanding: Decimal = open.iter().map(|(_, a, f)| a + f).sum();
        assert_eq!(bal.reserved, outstanding, "reserved drifted at step {step}");
    }

    assert_eq!(verify_chain(&store.journal(mch)), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_mixed_operations_never_overdraw() {
    let (_store, bs) = setup();
    let mch = MerchantId::new();
    bs.credit(mch, Decimal::new(50_000, 2), "Initial funding", Utc::now())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..64 {
        let bs = bs.clone();
        handles.push(tokio::spawn(async move {
            let payout = PayoutId::new();
            let amount = Decimal::new(2_000, 2);
            let fee = bs.calculate_fee(amount);
            let key = IdempotencyKey::new(format!("w{i}"));
            if bs.reserve(mch, amount, fee, key, Some(payout), Utc::now()).await.is_ok() {
                if i % 2 == 0 {
                    bs.release(mch, amount, fee, payout, Utc::now()).await.unwrap();
                } else {
                    bs.settle(mch, amount, fee, payout, None, Utc::now()).await.unwrap();
                }
            }
            let bal = bs.balance(mch).await.unwrap();
            assert!(bal.available >= Decimal::ZERO);
            assert!(bal.reserved >= Decimal::ZERO);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let bal = bs.balance(mch).await.unwrap();
    conservation::verify(&bal).unwrap();
    assert_eq!(bal.reserved, Decimal::ZERO);
}

#[tokio::test]
async fn non_positive_credit_is_rejected() {
    let (_store, bs) = setup();
    let err = bs
        .credit(MerchantId::new(), Decimal::ZERO, "nothing", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, TreasuryError::InvalidAmount { .. }));
}
