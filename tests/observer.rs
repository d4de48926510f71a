//! Deposit detection against the in-memory chain.

use alloy::primitives::{Address, U256};
use tokio::sync::mpsc;

use custody_sweeper::blockchain::TokenType;
use custody_sweeper::incidents::{ErrorType, IncidentStatus};
use custody_sweeper::ledger::DepositStatus;
use custody_sweeper::observer::{BackupScanner, BlockPoller, InFlight};
use custody_sweeper::sweep::SweepTrigger;

mod common;
use common::{ether, Harness};

const SENDER: Address = Address::repeat_byte(0x99);

#[tokio::test]
async fn test_block_processed_twice_records_one_deposit() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.native_deposit(SENDER, user, ether("0.5"), 101);
    h.chain.set_head(110);

    let (tx, mut rx) = mpsc::channel(16);
    let mut observer = h.observer(tx.clone());

    let first = observer.on_new_block(101).await.unwrap();
    assert_eq!(first.candidates_added, 1);
    assert_eq!(first.deposits_recorded, 1);

    let second = observer.on_new_block(101).await.unwrap();
    assert_eq!(second.candidates_added, 0);
    assert_eq!(second.duplicates_skipped, 1);
    assert_eq!(second.deposits_recorded, 0);

    // A restarted observer has an empty cache; the ledger still guards.
    let mut restarted = h.observer(tx);
    let third = restarted.on_new_block(101).await.unwrap();
    assert_eq!(third.candidates_added, 0);

    let deposits = h.components.ledger.deposits_for_user("alice").unwrap();
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0].status, DepositStatus::Confirmed);
    assert_eq!(deposits[0].confirmations, 9);
    assert_eq!(deposits[0].amount, ether("0.5"));
    assert!(!deposits[0].swept);

    let job = rx.try_recv().expect("sweep queued");
    assert_eq!(job.address, user);
    assert_eq!(job.token, TokenType::Native);
    assert_eq!(job.trigger, SweepTrigger::Deposit);
    assert!(rx.try_recv().is_err(), "only one sweep per deposit");
}

#[tokio::test]
async fn test_deposit_waits_for_confirmation_threshold() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.native_deposit(SENDER, user, ether("1"), 101);
    h.chain.set_head(103);

    let (tx, _rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);

    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.candidates_added, 1);
    assert_eq!(report.deposits_recorded, 0);
    assert_eq!(observer.tracked_candidates(), 1);

    h.chain.set_head(106);
    let report = observer.on_new_block(102).await.unwrap();
    assert_eq!(report.deposits_recorded, 0, "5 confirmations is not final");
    assert!(h.components.ledger.deposits_for_user("alice").unwrap().is_empty());

    h.chain.set_head(107);
    let report = observer.on_new_block(103).await.unwrap();
    assert_eq!(report.deposits_recorded, 1);
    assert_eq!(observer.tracked_candidates(), 0);

    let deposits = h.components.ledger.deposits_for_user("alice").unwrap();
    assert_eq!(deposits[0].confirmations, 6);
    assert_eq!(deposits[0].block_number, 101);
}

#[tokio::test]
async fn test_failed_block_is_skipped_and_recorded() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.fail_block(101);
    h.chain.native_deposit(SENDER, user, ether("0.2"), 102);
    h.chain.set_head(110);

    let (tx, _rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);

    observer.handle_block(101).await;
    observer.handle_block(102).await;

    let incidents = h.components.incidents.list(None, 10).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].error_type, ErrorType::RpcError);
    assert_eq!(incidents[0].status, IncidentStatus::Pending);
    assert_eq!(incidents[0].entity_type, "block");
    assert_eq!(incidents[0].entity_id, "101");

    assert_eq!(h.components.ledger.deposits_for_user("alice").unwrap().len(), 1);

    h.chain.heal_block(101);
    observer.handle_block(101).await;
    let resolved = h.components.incidents.list(Some(IncidentStatus::Resolved), 10).unwrap();
    assert_eq!(resolved.len(), 1);
}

#[tokio::test]
async fn test_token_transfer_detected() {
    let token = Address::repeat_byte(0x70);
    let h = Harness::new(&[token]);
    let user = h.deposit_address("bob");
    h.chain.token_deposit(token, SENDER, user, ether("25"), 101);
    h.chain.set_head(120);

    let (tx, mut rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);
    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.deposits_recorded, 1);

    let deposits = h.components.ledger.deposits_for_user("bob").unwrap();
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0].token, TokenType::Erc20(token));
    assert_eq!(deposits[0].amount, ether("25"));
    assert_eq!(rx.try_recv().unwrap().token, TokenType::Erc20(token));
}

#[tokio::test]
async fn test_transfers_to_unknown_addresses_ignored() {
    let h = Harness::new(&[]);
    h.deposit_address("alice");
    h.chain.native_deposit(SENDER, Address::repeat_byte(0x42), ether("3"), 101);
    h.chain.set_head(110);

    let (tx, _rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);
    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.candidates_added, 0);
}

#[tokio::test]
async fn test_gas_top_up_is_not_a_deposit() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    let master = h.components.master_wallet.address();
    h.chain.native_deposit(master, user, ether("0.0005"), 101);
    h.chain.set_head(110);

    let (tx, _rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);
    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.candidates_added, 0);
}

#[tokio::test]
async fn test_reverted_transfer_recorded_without_sweep() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    let hash = h.chain.native_deposit(SENDER, user, ether("1"), 101);
    h.chain
        .state
        .lock()
        .unwrap()
        .receipts
        .get_mut(&hash)
        .unwrap()
        .success = false;
    h.chain.set_head(110);

    let (tx, mut rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);
    observer.on_new_block(101).await.unwrap();

    let deposits = h.components.ledger.deposits_for_user("alice").unwrap();
    assert_eq!(deposits[0].status, DepositStatus::Reverted);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_receipt_failure_keeps_candidate() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.native_deposit(SENDER, user, ether("1"), 101);
    h.chain.set_head(110);
    h.chain.state.lock().unwrap().fail_receipts = true;

    let (tx, _rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);
    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.deposits_recorded, 0);
    assert_eq!(observer.tracked_candidates(), 1);

    let open = h.components.incidents.list(Some(IncidentStatus::Pending), 10).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].entity_type, "transaction");

    h.chain.state.lock().unwrap().fail_receipts = false;
    let report = observer.on_new_block(102).await.unwrap();
    assert_eq!(report.deposits_recorded, 1);
    assert!(h
        .components
        .incidents
        .list(Some(IncidentStatus::Pending), 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_backup_scan_finds_missed_balance() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.fund(user, ether("0.3"));

    let (tx, mut rx) = mpsc::channel(16);
    let in_flight = InFlight::default();
    let scanner = BackupScanner::new(
        h.components.rpc.clone(),
        h.components.ledger.clone(),
        h.components.registry.clone(),
        h.components.incidents.clone(),
        in_flight.clone(),
        tx,
        &h.components.config,
    );

    assert_eq!(scanner.scan_once().await, 1);
    let job = rx.try_recv().unwrap();
    assert_eq!(job.trigger, SweepTrigger::BackupScan);
    assert_eq!(job.user_id, "alice");

    // Funds the observer is still confirming are left alone.
    in_flight.add(user, TokenType::Native);
    assert_eq!(scanner.scan_once().await, 0);
}

#[tokio::test]
async fn test_backup_scan_ignores_dust() {
    let h = Harness::new(&[]);
    let user = h.deposit_address("alice");
    h.chain.fund(user, U256::from(1_000u64));

    let (tx, _rx) = mpsc::channel(16);
    let scanner = BackupScanner::new(
        h.components.rpc.clone(),
        h.components.ledger.clone(),
        h.components.registry.clone(),
        h.components.incidents.clone(),
        InFlight::default(),
        tx,
        &h.components.config,
    );
    assert_eq!(scanner.scan_once().await, 0);
}

#[tokio::test]
async fn test_poller_enqueues_in_order_with_cap() {
    let h = Harness::with_config(&[], |config| {
        config.observer.start_block = Some(101);
        config.observer.max_blocks_per_poll = 3;
    });
    h.chain.set_head(105);

    let (tx, mut rx) = mpsc::channel(16);
    let mut poller = BlockPoller::new(
        h.components.rpc.clone(),
        h.components.incidents.clone(),
        &h.components.config.observer,
    );

    assert_eq!(poller.poll_once(&tx).await.unwrap(), 3);
    assert_eq!(poller.poll_once(&tx).await.unwrap(), 2);
    assert_eq!(poller.poll_once(&tx).await.unwrap(), 0);
    assert_eq!(poller.next_block(), Some(106));

    let mut seen = Vec::new();
    while let Ok(n) = rx.try_recv() {
        seen.push(n);
    }
    assert_eq!(seen, vec![101, 102, 103, 104, 105]);
}

#[tokio::test]
async fn test_wallet_created_by_cli_is_observed() {
    let h = Harness::new(&[]);
    h.deposit_address("alice");
    let (tx, mut rx) = mpsc::channel(16);
    let mut observer = h.observer(tx);

    let cli = h.second_process();
    let bob = cli.service().get_deposit_address("bob").unwrap();
    assert!(h.components.registry.user_for(&bob).is_none());

    h.chain.native_deposit(SENDER, bob, ether("1"), 101);
    h.chain.set_head(120);
    let report = observer.on_new_block(101).await.unwrap();
    assert_eq!(report.candidates_added, 1);
    assert_eq!(report.deposits_recorded, 1);
    assert_eq!(h.components.registry.user_for(&bob).as_deref(), Some("bob"));

    let job = rx.try_recv().unwrap();
    assert_eq!(job.user_id, "bob");
    assert_eq!(job.address, bob);
    assert_eq!(h.components.ledger.deposits_for_user("bob").unwrap()[0].amount, ether("1"));
}

#[tokio::test]
async fn test_backup_scan_covers_wallets_created_by_cli() {
    let h = Harness::new(&[]);
    let (tx, mut rx) = mpsc::channel(16);
    let scanner = BackupScanner::new(
        h.components.rpc.clone(),
        h.components.ledger.clone(),
        h.components.registry.clone(),
        h.components.incidents.clone(),
        InFlight::default(),
        tx,
        &h.components.config,
    );
    assert_eq!(scanner.scan_once().await, 0);

    let carol = h.second_process().service().get_deposit_address("carol").unwrap();
    h.chain.fund(carol, ether("0.4"));

    assert_eq!(scanner.scan_once().await, 1);
    let job = rx.try_recv().unwrap();
    assert_eq!(job.user_id, "carol");
    assert_eq!(job.trigger, SweepTrigger::BackupScan);
}
