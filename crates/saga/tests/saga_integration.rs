//! End-to-end saga scenarios over the in-memory infrastructure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{AccountId, ClientId, OperationId};
use execution_store::{ExecutionInfoRepository, InMemoryExecutionInfoStore};
use ledger::{
    Account, AccountBalanceChange, AccountBalanceChangeReasonType, AccountFilter, AccountFlags,
    AccountsRepository, BalanceChangeQuery, BalanceUpdate, BalanceUpdateOutcome,
    InMemoryAccountsRepository, LedgerError, TemporaryCapital,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use saga::delete_accounts::{self, REASON_NON_ZERO_BALANCE};
use saga::{
    AccountsService, Command, CreateAccount, DeleteAccountsData, DeleteAccountsOutcome,
    DeleteAccountsRequest, DepositData, DepositState, Dispatcher, Event, FundsRequest,
    GiveTemporaryCapitalRequest, InMemoryMessageBus, InMemoryTradingEngine, ManualChargeRequest,
    Message, MessagePump, RetryPolicy, RevokeTemporaryCapitalRequest, SagaContext,
    TemporaryCapitalData, TemporaryCapitalKind, TemporaryCapitalState, WithdrawalData,
    WithdrawalState, deposit, withdrawal,
};
use serde::de::DeserializeOwned;

const CLIENT: &str = "client-1";

/// Ledger that refuses balance updates with the given reason types, as if
/// the account had vanished.
struct RefusingLedger {
    inner: Arc<InMemoryAccountsRepository>,
    refused: Vec<AccountBalanceChangeReasonType>,
}

#[async_trait]
impl AccountsRepository for RefusingLedger {
    async fn add(&self, account: Account) -> ledger::Result<()> {
        self.inner.add(account).await
    }

    async fn get(&self, account_id: &AccountId) -> ledger::Result<Option<Account>> {
        self.inner.get(account_id).await
    }

    async fn get_all(&self, filter: &AccountFilter) -> ledger::Result<Vec<Account>> {
        self.inner.get_all(filter).await
    }

    async fn update_balance(&self, update: BalanceUpdate) -> ledger::Result<BalanceUpdateOutcome> {
        if self.refused.contains(&update.reason_type) {
            return Err(LedgerError::AccountNotFound(update.account_id));
        }
        self.inner.update_balance(update).await
    }

    async fn update_temporary_capital(
        &self,
        account_id: &AccountId,
        item: TemporaryCapital,
        add: bool,
    ) -> ledger::Result<Account> {
        self.inner.update_temporary_capital(account_id, item, add).await
    }

    async fn rollback_temporary_capital(
        &self,
        account_id: &AccountId,
        items: &[TemporaryCapital],
    ) -> ledger::Result<Account> {
        self.inner.rollback_temporary_capital(account_id, items).await
    }

    async fn update_flags(
        &self,
        account_id: &AccountId,
        flags: AccountFlags,
    ) -> ledger::Result<Account> {
        self.inner.update_flags(account_id, flags).await
    }

    async fn mark_as_deleted(&self, account_id: &AccountId) -> ledger::Result<Account> {
        self.inner.mark_as_deleted(account_id).await
    }

    async fn get_balance_changes(
        &self,
        query: &BalanceChangeQuery,
    ) -> ledger::Result<Vec<AccountBalanceChange>> {
        self.inner.get_balance_changes(query).await
    }
}

struct Harness {
    service: AccountsService,
    ledger: Arc<InMemoryAccountsRepository>,
    engine: InMemoryTradingEngine,
    bus: InMemoryMessageBus,
    executions: ExecutionInfoRepository,
    pump: MessagePump,
}

impl Harness {
    fn new() -> Self {
        Self::build(Vec::new(), RetryPolicy::default())
    }

    fn refusing(refused: Vec<AccountBalanceChangeReasonType>) -> Self {
        Self::build(refused, RetryPolicy::default())
    }

    fn with_policy(policy: RetryPolicy) -> Self {
        Self::build(Vec::new(), policy)
    }

    fn build(refused: Vec<AccountBalanceChangeReasonType>, policy: RetryPolicy) -> Self {
        let ledger = Arc::new(InMemoryAccountsRepository::new());
        let accounts: Arc<dyn AccountsRepository> = if refused.is_empty() {
            ledger.clone()
        } else {
            Arc::new(RefusingLedger {
                inner: ledger.clone(),
                refused,
            })
        };
        let engine = InMemoryTradingEngine::new();
        let bus = InMemoryMessageBus::new();
        let executions = ExecutionInfoRepository::new(InMemoryExecutionInfoStore::new());

        let ctx = SagaContext::new(
            executions.clone(),
            accounts,
            Arc::new(engine.clone()),
            Arc::new(bus.clone()),
        );
        let pump = MessagePump::new(Dispatcher::new(ctx.clone()), bus.clone(), policy);

        Self {
            service: AccountsService::new(ctx),
            ledger,
            engine,
            bus,
            executions,
            pump,
        }
    }

    async fn open_account(&self, id: &str) -> AccountId {
        let account = self
            .service
            .create_account(CreateAccount {
                account_id: Some(AccountId::new(id)),
                client_id: ClientId::new(CLIENT),
                trading_condition_id: format!("TC-{id}"),
                base_asset_id: "EUR".to_string(),
                legal_entity: "LE-1".to_string(),
            })
            .await
            .unwrap();
        self.pump.drain().await;
        account.id
    }

    async fn deposit(&self, account_id: &AccountId, op: &str, amount: Decimal) -> OperationId {
        self.service
            .begin_deposit(funds(account_id, op, amount))
            .await
            .unwrap()
    }

    async fn withdraw(&self, account_id: &AccountId, op: &str, amount: Decimal) -> OperationId {
        self.service
            .begin_withdrawal(funds(account_id, op, amount))
            .await
            .unwrap()
    }

    async fn balance(&self, account_id: &AccountId) -> Decimal {
        self.ledger.get(account_id).await.unwrap().unwrap().balance
    }

    async fn changes(&self, account_id: &AccountId) -> Vec<AccountBalanceChange> {
        self.ledger
            .get_balance_changes(&BalanceChangeQuery::for_account(account_id.clone()))
            .await
            .unwrap()
    }

    async fn data<D: DeserializeOwned>(&self, operation_name: &str, op: &OperationId) -> D {
        self.executions
            .get::<D>(operation_name, op)
            .await
            .unwrap()
            .unwrap()
            .data
    }
}

fn funds(account_id: &AccountId, op: &str, amount: Decimal) -> FundsRequest {
    FundsRequest {
        operation_id: Some(OperationId::new(op)),
        client_id: ClientId::new(CLIENT),
        account_id: account_id.clone(),
        amount,
        comment: String::new(),
        audit_log: String::new(),
    }
}

#[tokio::test]
async fn deposit_credits_the_account_once() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;

    let op = h.deposit(&account, "dep-1", dec!(100)).await;
    let report = h.pump.drain().await;

    assert_eq!(report.dead_lettered, 0);
    let data: DepositData = h.data(deposit::OPERATION_NAME, &op).await;
    assert_eq!(data.state, DepositState::Succeeded);
    assert_eq!(h.balance(&account).await, dec!(100));

    let changes = h.changes(&account).await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, op);
    assert_eq!(changes[0].change_amount, dec!(100));
    assert_eq!(changes[0].balance, dec!(100));
    assert_eq!(changes[0].withdraw_transfer_limit, dec!(100));
    assert_eq!(changes[0].reason_type, AccountBalanceChangeReasonType::Deposit);

    let events = h.bus.published_events().await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::DepositSucceeded(s) if s.amount == dec!(100)))
    );
}

#[tokio::test]
async fn deposit_to_missing_account_fails_at_start() {
    let h = Harness::new();

    let op = h
        .deposit(&AccountId::new("missing"), "dep-1", dec!(100))
        .await;
    h.pump.drain().await;

    let data: DepositData = h.data(deposit::OPERATION_NAME, &op).await;
    assert_eq!(data.state, DepositState::Failed);
    assert!(data.fail_reason.unwrap().contains("not found"));
    assert_eq!(h.ledger.balance_change_count().await, 0);
}

#[tokio::test]
async fn withdrawal_above_balance_is_rejected_without_touching_anything() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let op = h.withdraw(&account, "wd-1", dec!(150)).await;
    h.pump.drain().await;

    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::Failed);
    assert_eq!(h.balance(&account).await, dec!(100));
    assert_eq!(h.changes(&account).await.len(), 1);
    assert_eq!(h.engine.freeze_calls().await, 0);
}

#[tokio::test]
async fn withdrawal_moves_balance_and_limit_together() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let op = h.withdraw(&account, "wd-1", dec!(30)).await;
    h.pump.drain().await;

    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::Succeeded);

    let account_row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(account_row.balance, dec!(70));
    assert_eq!(account_row.withdraw_transfer_limit, dec!(70));

    let changes = h.changes(&account).await;
    let total: Decimal = changes.iter().map(|c| c.change_amount).sum();
    assert_eq!(total, account_row.balance);
    assert_eq!(changes.last().unwrap().balance, dec!(70));
    assert_eq!(
        changes.last().unwrap().reason_type,
        AccountBalanceChangeReasonType::Withdraw
    );
}

#[tokio::test]
async fn refused_withdrawal_releases_the_hold_before_failing() {
    let h = Harness::refusing(vec![AccountBalanceChangeReasonType::Withdraw]);
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let op = h.withdraw(&account, "wd-1", dec!(40)).await;
    h.pump.drain().await;

    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::Failed);
    assert!(data.fail_reason.is_some());
    assert_eq!(h.balance(&account).await, dec!(100));
    assert_eq!(h.engine.frozen_amount(&account).await, Decimal::ZERO);
    assert_eq!(h.engine.freeze_calls().await, 1);

    let events = h.bus.published_events().await;
    let unfrozen = events
        .iter()
        .position(|e| matches!(e, Event::UnfreezeMarginOnFailSucceeded(_)))
        .unwrap();
    let failed = events
        .iter()
        .position(|e| matches!(e, Event::WithdrawalFailed(_)))
        .unwrap();
    assert!(unfrozen < failed);
}

#[tokio::test]
async fn withdrawals_racing_for_the_same_funds_cannot_overdraw() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    // Both pass the start checks before either reaches the ledger.
    let first = h.withdraw(&account, "wd-1", dec!(80)).await;
    let second = h.withdraw(&account, "wd-2", dec!(80)).await;
    let report = h.pump.drain().await;

    assert_eq!(report.dead_lettered, 0);
    let first: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &first).await;
    let second: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &second).await;
    assert_eq!(first.state, WithdrawalState::Succeeded);
    assert_eq!(second.state, WithdrawalState::Failed);
    assert!(second.fail_reason.unwrap().contains("Insufficient balance"));

    assert_eq!(h.balance(&account).await, dec!(20));
    assert_eq!(h.changes(&account).await.len(), 2);
    assert_eq!(h.engine.frozen_amount(&account).await, dec!(80));
    let events = h.bus.published_events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::UnfreezeMarginOnFailSucceeded(r) if r.operation_id.as_str() == "wd-2"
    )));
}

#[tokio::test]
async fn deposit_the_ledger_refuses_fails() {
    let h = Harness::refusing(vec![AccountBalanceChangeReasonType::Deposit]);
    let account = h.open_account("AA-1").await;

    let op = h.deposit(&account, "dep-1", dec!(100)).await;
    let report = h.pump.drain().await;

    assert_eq!(report.dead_lettered, 0);
    let data: DepositData = h.data(deposit::OPERATION_NAME, &op).await;
    assert_eq!(data.state, DepositState::Failed);
    assert!(data.fail_reason.unwrap().contains("not found"));
    assert_eq!(h.balance(&account).await, Decimal::ZERO);

    let events = h.bus.published_events().await;
    assert!(events.iter().any(|e| matches!(e, Event::DepositFailed(_))));
    assert!(!events.iter().any(|e| matches!(e, Event::DepositSucceeded(_))));
}

#[tokio::test]
async fn rejected_freeze_fails_withdrawal() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;
    h.engine.set_reject_freeze(Some("insufficient margin")).await;

    let op = h.withdraw(&account, "wd-1", dec!(40)).await;
    h.pump.drain().await;

    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::Failed);
    assert_eq!(data.fail_reason.as_deref(), Some("insufficient margin"));
    assert_eq!(h.balance(&account).await, dec!(100));
}

#[tokio::test]
async fn unavailable_engine_delays_withdrawal_until_it_recovers() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;
    h.engine.set_unavailable(true).await;

    let op = h.withdraw(&account, "wd-1", dec!(40)).await;
    let report = h.pump.drain_at_most(50).await;

    assert!(report.redelivered > 0);
    assert_eq!(report.dead_lettered, 0);
    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::FreezingAmount);
    assert_eq!(h.balance(&account).await, dec!(100));

    h.engine.set_unavailable(false).await;
    h.pump.drain().await;

    let data: WithdrawalData = h.data(withdrawal::OPERATION_NAME, &op).await;
    assert_eq!(data.state, WithdrawalState::Succeeded);
    assert_eq!(h.balance(&account).await, dec!(60));
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: Some(3),
        delay: Duration::ZERO,
    });
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;
    h.engine.set_unavailable(true).await;

    h.withdraw(&account, "wd-1", dec!(40)).await;
    let report = h.pump.drain().await;

    assert_eq!(report.dead_lettered, 1);
    let dead = h.bus.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].message.name(), "FreezeAmountForWithdrawal");
}

#[tokio::test]
async fn delete_accounts_reports_partial_failure() {
    let h = Harness::new();
    let empty = h.open_account("A").await;
    let funded = h.open_account("B").await;
    h.deposit(&funded, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let op = h
        .service
        .delete_accounts(DeleteAccountsRequest {
            operation_id: Some(OperationId::new("del-1")),
            account_ids: vec![empty.clone(), funded.clone()],
            comment: "closing".to_string(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let finished = h
        .bus
        .published_events()
        .await
        .into_iter()
        .find_map(|e| match e {
            Event::AccountsDeletionFinished(f) => Some(f),
            _ => None,
        })
        .unwrap();
    assert_eq!(finished.deleted_account_ids, vec![empty.clone()]);
    assert_eq!(
        finished.failed_account_ids,
        BTreeMap::from([(funded.clone(), REASON_NON_ZERO_BALANCE.to_string())])
    );

    assert!(h.ledger.get(&empty).await.unwrap().unwrap().is_deleted);
    assert!(!h.ledger.get(&funded).await.unwrap().unwrap().is_deleted);
    assert!(h.engine.is_removed(&empty).await);
    assert!(!h.engine.is_blocked(&funded).await);

    let record = h
        .executions
        .get::<DeleteAccountsData>(delete_accounts::OPERATION_NAME, &op)
        .await
        .unwrap();
    assert!(record.is_none());
}

#[tokio::test]
async fn delete_command_redelivered_after_cleanup_is_dropped() {
    let h = Harness::new();
    let account = h.open_account("A").await;

    let op = h
        .service
        .delete_accounts(DeleteAccountsRequest {
            operation_id: Some(OperationId::new("del-1")),
            account_ids: vec![account.clone()],
            comment: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let command = h
        .bus
        .history()
        .await
        .into_iter()
        .find(|m| matches!(m, Message::Command(Command::DeleteAccounts(_))))
        .unwrap();
    h.bus.enqueue(command.clone()).await;
    h.bus.enqueue(command).await;
    let report = h.pump.drain().await;
    assert_eq!(report.dead_lettered, 0);

    let finished: Vec<_> = h
        .bus
        .published_events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::AccountsDeletionFinished(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].deleted_account_ids, vec![account.clone()]);
    assert!(finished[0].failed_account_ids.is_empty());
    assert!(h.engine.is_removed(&account).await);

    let record = h
        .executions
        .get::<DeleteAccountsData>(delete_accounts::OPERATION_NAME, &op)
        .await
        .unwrap();
    assert!(record.is_none());
    let outcome: DeleteAccountsOutcome = h.data(delete_accounts::OUTCOME_NAME, &op).await;
    assert_eq!(outcome.deleted_account_ids, vec![account]);
}

#[tokio::test]
async fn accounts_the_engine_cannot_block_are_kept() {
    let h = Harness::new();
    let first = h.open_account("A").await;
    let second = h.open_account("B").await;
    h.engine.refuse_block(second.clone(), "open positions").await;

    h.service
        .delete_accounts(DeleteAccountsRequest {
            operation_id: None,
            account_ids: vec![first.clone(), second.clone()],
            comment: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    assert!(h.ledger.get(&first).await.unwrap().unwrap().is_deleted);
    assert!(!h.ledger.get(&second).await.unwrap().unwrap().is_deleted);
}

#[tokio::test]
async fn give_then_revoke_temporary_capital_nets_to_zero() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;

    let give = h
        .service
        .give_temporary_capital(GiveTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("give-1")),
            account_id: account.clone(),
            event_source_id: "T1".to_string(),
            amount: dec!(50),
            reason: "promo".to_string(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let given: TemporaryCapitalData = h
        .data(TemporaryCapitalKind::Give.operation_name(), &give)
        .await;
    assert_eq!(given.state, TemporaryCapitalState::Succeeded);
    let row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(50));
    assert_eq!(row.temporary_capital, vec![TemporaryCapital::new("T1", dec!(50))]);
    assert_eq!(row.withdraw_transfer_limit, Decimal::ZERO);

    let revoke = h
        .service
        .revoke_temporary_capital(RevokeTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("revoke-1")),
            account_id: account.clone(),
            event_source_id: Some("T1".to_string()),
            reason: "promo over".to_string(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let revoked: TemporaryCapitalData = h
        .data(TemporaryCapitalKind::Revoke.operation_name(), &revoke)
        .await;
    assert_eq!(revoked.state, TemporaryCapitalState::Succeeded);
    let row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(row.balance, Decimal::ZERO);
    assert!(row.temporary_capital.is_empty());

    let changes = h.changes(&account).await;
    assert_eq!(changes.len(), 2);
    assert!(
        changes
            .iter()
            .all(|c| c.reason_type == AccountBalanceChangeReasonType::TemporaryCashAdjustment)
    );
}

#[tokio::test]
async fn refused_give_removes_the_temporary_capital_entry() {
    let h = Harness::refusing(vec![AccountBalanceChangeReasonType::TemporaryCashAdjustment]);
    let account = h.open_account("AA-1").await;

    let op = h
        .service
        .give_temporary_capital(GiveTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("give-1")),
            account_id: account.clone(),
            event_source_id: "T1".to_string(),
            amount: dec!(50),
            reason: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let data: TemporaryCapitalData = h
        .data(TemporaryCapitalKind::Give.operation_name(), &op)
        .await;
    assert_eq!(data.state, TemporaryCapitalState::Failed);
    let row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(row.balance, Decimal::ZERO);
    assert!(row.temporary_capital.is_empty());
    assert!(
        h.bus
            .published_events()
            .await
            .iter()
            .any(|e| matches!(e, Event::TemporaryCapitalFailed(_)))
    );
}

#[tokio::test]
async fn revoke_the_balance_no_longer_covers_restores_the_entry() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.service
        .give_temporary_capital(GiveTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("give-1")),
            account_id: account.clone(),
            event_source_id: "T1".to_string(),
            amount: dec!(50),
            reason: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let op = h
        .service
        .revoke_temporary_capital(RevokeTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("revoke-1")),
            account_id: account.clone(),
            event_source_id: Some("T1".to_string()),
            reason: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    // The start command takes the entry off and queues the debit.
    h.pump.drain_at_most(1).await;
    assert!(
        h.ledger
            .get(&account)
            .await
            .unwrap()
            .unwrap()
            .temporary_capital
            .is_empty()
    );
    // A charge lands before the debit does.
    h.ledger
        .update_balance(BalanceUpdate::new(
            OperationId::new("fee-1"),
            account.clone(),
            dec!(-40),
            AccountBalanceChangeReasonType::Manual,
        ))
        .await
        .unwrap();
    h.pump.drain().await;

    let data: TemporaryCapitalData = h
        .data(TemporaryCapitalKind::Revoke.operation_name(), &op)
        .await;
    assert_eq!(data.state, TemporaryCapitalState::Failed);
    assert!(data.fail_reason.unwrap().contains("Insufficient balance"));

    let row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(10));
    assert_eq!(row.temporary_capital, vec![TemporaryCapital::new("T1", dec!(50))]);
    assert!(
        h.bus
            .published_events()
            .await
            .iter()
            .any(|e| matches!(e, Event::TemporaryCapitalFailed(_)))
    );
}

#[tokio::test]
async fn revoking_unknown_entry_fails() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;

    let op = h
        .service
        .revoke_temporary_capital(RevokeTemporaryCapitalRequest {
            operation_id: None,
            account_id: account.clone(),
            event_source_id: Some("nope".to_string()),
            reason: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    h.pump.drain().await;

    let data: TemporaryCapitalData = h
        .data(TemporaryCapitalKind::Revoke.operation_name(), &op)
        .await;
    assert_eq!(data.state, TemporaryCapitalState::Failed);
    assert_eq!(h.ledger.balance_change_count().await, 0);
}

#[tokio::test]
async fn manual_charge_leaves_withdraw_limit_alone() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let request = ManualChargeRequest {
        operation_id: Some(OperationId::new("charge-1")),
        account_id: account.clone(),
        amount_delta: dec!(-20),
        reason: "fee".to_string(),
        comment: String::new(),
        audit_log: String::new(),
    };
    h.service.charge_manually(request.clone()).await.unwrap();
    h.service.charge_manually(request).await.unwrap();
    h.pump.drain().await;

    let row = h.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(row.balance, dec!(80));
    assert_eq!(row.withdraw_transfer_limit, dec!(100));
    let changes = h.changes(&account).await;
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].reason_type, AccountBalanceChangeReasonType::Manual);
}

#[tokio::test]
async fn replaying_history_out_of_order_with_duplicates_converges() {
    let original = Harness::new();
    let account = original.open_account("AA-1").await;
    let deposit_op = original.deposit(&account, "dep-1", dec!(100)).await;
    original.pump.drain().await;
    let give_op = original
        .service
        .give_temporary_capital(GiveTemporaryCapitalRequest {
            operation_id: Some(OperationId::new("give-1")),
            account_id: account.clone(),
            event_source_id: "T1".to_string(),
            amount: dec!(25),
            reason: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        })
        .await
        .unwrap();
    original.pump.drain().await;
    let history = original.bus.history().await;

    let replay = Harness::new();
    replay.open_account("AA-1").await;
    for message in history.iter().rev() {
        replay.bus.enqueue(message.clone()).await;
        replay.bus.enqueue(message.clone()).await;
    }
    let report = replay.pump.drain().await;

    assert_eq!(report.dead_lettered, 0);
    let deposit: DepositData = replay.data(deposit::OPERATION_NAME, &deposit_op).await;
    assert_eq!(deposit.state, DepositState::Succeeded);
    let give: TemporaryCapitalData = replay
        .data(TemporaryCapitalKind::Give.operation_name(), &give_op)
        .await;
    assert_eq!(give.state, TemporaryCapitalState::Succeeded);

    let replayed = replay.ledger.get(&account).await.unwrap().unwrap();
    let expected = original.ledger.get(&account).await.unwrap().unwrap();
    assert_eq!(replayed.balance, expected.balance);
    assert_eq!(replayed.temporary_capital, expected.temporary_capital);
    assert_eq!(
        replay.ledger.balance_change_count().await,
        original.ledger.balance_change_count().await
    );
}

#[tokio::test]
async fn saga_state_never_moves_backwards() {
    let h = Harness::new();
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;

    let op = h.withdraw(&account, "wd-1", dec!(30)).await;
    let mut previous = WithdrawalState::Created;
    let mut handled = 0;
    while let Some(delivery) = h.bus.try_receive().await {
        // Each message is handled twice, as a redelivery would.
        h.pump.process(delivery.clone(), Duration::ZERO).await;
        h.pump.process(delivery, Duration::ZERO).await;
        handled += 1;
        assert!(handled < 1_000, "withdrawal did not settle");

        if let Some(info) = h
            .executions
            .get::<WithdrawalData>(withdrawal::OPERATION_NAME, &op)
            .await
            .unwrap()
        {
            assert!(info.data.state >= previous);
            previous = info.data.state;
        }
    }
    assert_eq!(previous, WithdrawalState::Succeeded);
    assert_eq!(h.balance(&account).await, dec!(70));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_completes_operations_and_shuts_down() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: None,
        delay: Duration::from_millis(5),
    });
    let account = h.open_account("AA-1").await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(h.pump.clone().run(4, shutdown_rx));

    let mut operations = Vec::new();
    for i in 0..10 {
        operations.push(h.deposit(&account, &format!("dep-{i}"), dec!(10)).await);
    }

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut done = 0;
            for op in &operations {
                let data: Option<DepositData> = h
                    .executions
                    .get::<DepositData>(deposit::OPERATION_NAME, op)
                    .await
                    .unwrap()
                    .map(|info| info.data);
                if data.is_some_and(|d| d.state == DepositState::Succeeded) {
                    done += 1;
                }
            }
            if done == operations.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "deposits did not complete in time");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), workers)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.balance(&account).await, dec!(100));
    assert_eq!(h.changes(&account).await.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_puts_delayed_redeliveries_back_on_the_queue() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: None,
        delay: Duration::from_millis(200),
    });
    let account = h.open_account("AA-1").await;
    h.deposit(&account, "dep-1", dec!(100)).await;
    h.pump.drain().await;
    h.engine.set_unavailable(true).await;
    h.withdraw(&account, "wd-1", dec!(40)).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(h.pump.clone().run(2, shutdown_rx));

    let waiting = tokio::time::timeout(Duration::from_secs(5), async {
        while h.pump.pending_retries().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waiting.is_ok(), "no delivery was scheduled for retry");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), workers)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.pump.pending_retries().await, 0);
    assert_eq!(h.bus.pending().await, 1);
    let queued = h.bus.try_receive().await.unwrap();
    assert_eq!(queued.message.name(), "FreezeAmountForWithdrawal");
    assert!(h.bus.dead_letters().await.is_empty());
}
