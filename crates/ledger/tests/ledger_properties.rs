//! Behavioural properties of the in-memory ledger under redelivery and
//! concurrent mutation.

use futures_util::future::join_all;
use ledger::{
    Account, AccountBalanceChangeReasonType, AccountId, AccountsRepository, BalanceChangeQuery,
    BalanceUpdate, ClientId, InMemoryAccountsRepository, LedgerError, LedgerSettings,
    OperationId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn seeded(repo: &InMemoryAccountsRepository, id: &str) -> AccountId {
    let account_id = AccountId::new(id);
    repo.add(Account::new(
        account_id.clone(),
        ClientId::new("client-1"),
        "TC-1",
        "EUR",
        "Default",
    ))
    .await
    .unwrap();
    account_id
}

fn update(operation_id: &str, account_id: &AccountId, delta: Decimal) -> BalanceUpdate {
    BalanceUpdate::new(
        OperationId::new(operation_id),
        account_id.clone(),
        delta,
        AccountBalanceChangeReasonType::Manual,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_on_one_account_are_serialized() {
    let repo = InMemoryAccountsRepository::new();
    let account_id = seeded(&repo, "AA-1").await;

    let tasks = (0..100).map(|i| {
        let repo = repo.clone();
        let account_id = account_id.clone();
        tokio::spawn(async move {
            repo.update_balance(update(&format!("op-{i}"), &account_id, dec!(1.5)))
                .await
                .unwrap()
        })
    });
    for result in join_all(tasks).await {
        assert!(result.unwrap().applied);
    }

    let account = repo.get(&account_id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(150));

    let changes = repo
        .get_balance_changes(&BalanceChangeQuery::for_account(account_id))
        .await
        .unwrap();
    assert_eq!(changes.len(), 100);

    // Each entry's balance must equal the running sum of deltas up to it.
    let mut running = Decimal::ZERO;
    for change in &changes {
        running += change.change_amount;
        assert_eq!(change.balance, running);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_redeliveries_apply_once() {
    let repo = InMemoryAccountsRepository::new();
    let account_id = seeded(&repo, "AA-1").await;

    let tasks = (0..20).map(|_| {
        let repo = repo.clone();
        let account_id = account_id.clone();
        tokio::spawn(async move {
            repo.update_balance(update("op-dup", &account_id, dec!(100)))
                .await
                .unwrap()
        })
    });
    let applied = join_all(tasks)
        .await
        .into_iter()
        .filter(|result| result.as_ref().unwrap().applied)
        .count();

    assert_eq!(applied, 1);
    let account = repo.get(&account_id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100));
    assert_eq!(repo.balance_change_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_withdrawals_never_overdraw() {
    let repo = InMemoryAccountsRepository::new();
    let account_id = seeded(&repo, "AA-1").await;
    repo.update_balance(update("dep-1", &account_id, dec!(100)))
        .await
        .unwrap();

    let tasks = (0..10).map(|i| {
        let repo = repo.clone();
        let account_id = account_id.clone();
        tokio::spawn(async move {
            repo.update_balance(BalanceUpdate::new(
                OperationId::new(format!("wd-{i}")),
                account_id,
                dec!(-30),
                AccountBalanceChangeReasonType::Withdraw,
            ))
            .await
        })
    });
    let mut applied = 0;
    for result in join_all(tasks).await {
        match result.unwrap() {
            Ok(outcome) => {
                assert!(outcome.applied);
                applied += 1;
            }
            Err(LedgerError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(applied, 3);
    let account = repo.get(&account_id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(10));
    assert_eq!(repo.balance_change_count().await, 4);
}

#[tokio::test]
async fn recent_operations_stay_bounded() {
    let repo = InMemoryAccountsRepository::with_settings(LedgerSettings {
        recent_operations_capacity: 5,
    });
    let account_id = seeded(&repo, "AA-1").await;

    for i in 0..12 {
        repo.update_balance(update(&format!("op-{i}"), &account_id, dec!(1)))
            .await
            .unwrap();
    }

    let account = repo.get(&account_id).await.unwrap().unwrap();
    assert_eq!(account.last_executed_operations.len(), 5);
    assert!(account.has_executed(&OperationId::new("op-11")));
    assert!(!account.has_executed(&OperationId::new("op-6")));
    assert_eq!(account.balance, dec!(12));
}

#[tokio::test]
async fn accounts_are_isolated() {
    let repo = InMemoryAccountsRepository::new();
    let a = seeded(&repo, "AA-1").await;
    let b = seeded(&repo, "AA-2").await;

    repo.update_balance(update("op-1", &a, dec!(10)))
        .await
        .unwrap();
    // The same operation id on another account is a distinct change.
    repo.update_balance(update("op-1", &b, dec!(-3)))
        .await
        .unwrap();

    assert_eq!(repo.get(&a).await.unwrap().unwrap().balance, dec!(10));
    assert_eq!(repo.get(&b).await.unwrap().unwrap().balance, dec!(-3));
}
