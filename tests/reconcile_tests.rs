// Reconciliation tests: reindex round trips, interruption, pruned history,
// reorganizations while detached and exclusion of concurrent scans

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walletscan::{
    config, sync, ChainSource, Descriptor, LoadMode, MemoryChain, MockClock, ReconcileState, ScanError,
    Store, TimeSource, Transaction, TxOut, Wallet,
};

const T0: u64 = 1_600_000_000;
const SPACING: u64 = 600;

fn script(n: u8) -> Vec<u8> {
    vec![0x51, 0x20, n]
}

fn pay(to: &[u8], value: u64, nonce: u64) -> Transaction {
    Transaction { inputs: vec![], outputs: vec![TxOut { value, script: to.to_vec() }], nonce }
}

fn mine_to(chain: &MemoryChain, height: u64) {
    while chain.tip_height().unwrap() < height {
        let next = chain.tip_height().unwrap() + 1;
        chain.mine(T0 + next * SPACING, vec![]);
    }
}

fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Store::open(dir.path().join("wallet_db").to_str().unwrap()).expect("Failed to open store");
    (dir, Arc::new(store))
}

fn open_with(
    store: &Arc<Store>,
    chain: &MemoryChain,
    clock: &MockClock,
    scan: config::Scan,
    mode: LoadMode,
) -> Arc<Wallet> {
    Wallet::open("test", store.clone(), Arc::new(chain.clone()), Arc::new(clock.clone()), scan, mode)
        .expect("Failed to open wallet")
}

fn open(store: &Arc<Store>, chain: &MemoryChain, clock: &MockClock, mode: LoadMode) -> Arc<Wallet> {
    open_with(store, chain, clock, config::Scan { retry_backoff_ms: 1, ..Default::default() }, mode)
}

/// 150-block chain paying `script(1)` at height 101, plus a wallet that found
/// the payment through an explicit rescan.
fn funded_wallet() -> (TempDir, Arc<Store>, MemoryChain, MockClock, u64) {
    let chain = MemoryChain::new(T0);
    mine_to(&chain, 100);
    let (funded_at, _) = chain.mine(T0 + 101 * SPACING, vec![pay(&script(1), 50_000, 1)]);
    mine_to(&chain, funded_at + 49);

    let clock = MockClock::new(T0 + 151 * SPACING);
    let (dir, store) = temp_store();
    let wallet = open(&store, &chain, &clock, LoadMode::Resume);
    wallet.import_descriptor(Descriptor::watch_script(script(1)), clock.now(), false).unwrap();
    wallet.rescan(0, chain.tip_height().unwrap()).unwrap();
    assert_eq!(wallet.list_transactions()[0].confirmations, 50);
    (dir, store, chain, clock, funded_at)
}

#[tokio::test]
async fn test_reindex_round_trip_keeps_confirmations() {
    let (_dir, store, chain, clock, funded_at) = funded_wallet();
    let txid = pay(&script(1), 50_000, 1).txid();

    let rebuilt = chain.reindexed();
    let wallet = open(&store, &rebuilt, &clock, LoadMode::ChainRebuilt);
    assert_eq!(wallet.cursor(), None);
    assert_eq!(wallet.reconcile_state(), ReconcileState::Initial);
    assert!(!wallet.is_reconciled());

    let tip = wallet.reconcile().unwrap().wait().await.unwrap();
    assert_eq!(tip, 150);
    assert!(wallet.is_reconciled());
    assert_eq!(wallet.cursor().unwrap().height, 150);

    let tx = wallet.get_transaction(&txid).unwrap();
    assert_eq!(tx.confirmations, 50);
    assert_eq!(tx.block_height, Some(funded_at));
    assert!(tx.superseded.is_empty(), "same block hash after a reindex");
    assert!(wallet.descriptors().iter().all(|d| d.verified));
}

#[test]
fn test_replay_starts_inside_the_birth_window() {
    let (_dir, store, chain, clock, funded_at) = funded_wallet();
    let wallet = open(&store, &chain.reindexed(), &clock, LoadMode::ChainRebuilt);

    // birth time was corrected to the funding block; two hours at ten minutes a block
    assert_eq!(wallet.start_height_for(T0 + funded_at * SPACING).unwrap(), Some(funded_at - 12));

    let handle = wallet.reconcile().unwrap();
    assert_eq!(handle.wait_blocking(), Ok(150));
    match wallet.reconcile_state() {
        ReconcileState::Reconciled { tip } => assert_eq!(tip, 150),
        other => panic!("unexpected state {other:?}"),
    }
}

#[test]
fn test_nothing_unverified_replays_only_the_tip() {
    let chain = MemoryChain::new(T0);
    mine_to(&chain, 20);
    let clock = MockClock::new(T0);
    let (_dir, store) = temp_store();
    let wallet = open(&store, &chain, &clock, LoadMode::ChainRebuilt);
    assert_eq!(wallet.reconcile().unwrap().wait_blocking(), Ok(20));
    assert_eq!(wallet.cursor().unwrap().height, 20);
}

#[test]
fn test_second_request_while_replaying_is_rejected() {
    let (_dir, store, chain, clock, funded_at) = funded_wallet();
    let slow = config::Scan { read_retries: 3, retry_backoff_ms: 150, ..Default::default() };
    let rebuilt = chain.reindexed();
    let wallet = open_with(&store, &rebuilt, &clock, slow, LoadMode::ChainRebuilt);
    // the first replayed block answers slowly
    rebuilt.fail_reads(funded_at - 12, 3);

    let handle = wallet.reconcile().unwrap();
    assert!(handle.state().is_active());
    assert_eq!(wallet.reconcile().err(), Some(ScanError::ConcurrentReconciliation));
    assert_eq!(wallet.rescan(0, 10), Err(ScanError::ConcurrentReconciliation));
    assert_eq!(
        wallet.import_descriptor(Descriptor::watch_script(script(2)), T0, true),
        Err(ScanError::ConcurrentReconciliation)
    );

    assert_eq!(handle.wait_blocking(), Ok(150));
    // once finished a new request is accepted again
    assert_eq!(wallet.reconcile().unwrap().wait_blocking(), Ok(150));
}

#[tokio::test]
async fn test_pruned_history_fails_but_keeps_known_transactions() {
    let (_dir, store, chain, clock, _) = funded_wallet();
    let txid = pay(&script(1), 50_000, 1).txid();
    let rebuilt = chain.reindexed();
    rebuilt.prune_below(120);

    let wallet = open(&store, &rebuilt, &clock, LoadMode::ChainRebuilt);
    let err = wallet.reconcile().unwrap().wait().await.unwrap_err();
    assert_eq!(err, ScanError::ChainDataMissing { height: 89 });
    assert!(matches!(wallet.reconcile_state(), ReconcileState::Failed(ScanError::ChainDataMissing { .. })));
    assert!(!wallet.is_reconciled());
    assert!(!wallet.is_halted());

    let tx = wallet.get_transaction(&txid).expect("recorded transaction survives a failed replay");
    assert_eq!(tx.block_height, Some(101));
}

#[test]
fn test_interrupted_replay_resumes_on_reopen() {
    let (_dir, store, chain, clock, _) = funded_wallet();
    let rebuilt = chain.reindexed();
    {
        let wallet = open(&store, &rebuilt, &clock, LoadMode::ChainRebuilt);
        // the read and all three retries of block 121 fail, ending the replay there
        rebuilt.fail_reads(121, 4);
        let err = wallet.reconcile().unwrap().wait_blocking().unwrap_err();
        assert!(matches!(err, ScanError::ChainRead { height: 121, .. }), "{err:?}");
        assert_eq!(wallet.cursor().unwrap().height, 120);
    }
    assert_eq!(store.get::<u64>("cursor", b"replay").unwrap(), Some(89));

    let wallet = open(&store, &rebuilt, &clock, LoadMode::Resume);
    assert!(!wallet.is_reconciled(), "a pending replay must finish before the wallet is current");
    // [89, 120] is not read again
    rebuilt.fail_reads(100, 50);
    assert_eq!(wallet.reconcile().unwrap().wait_blocking(), Ok(150));
    assert_eq!(store.get::<u64>("cursor", b"replay").unwrap(), None);
    assert_eq!(wallet.list_transactions()[0].confirmations, 50);
    assert!(wallet.descriptors().iter().all(|d| d.verified));
}

#[test]
fn test_failed_replay_keeps_the_previous_cursor() {
    let (_dir, store, chain, clock, funded_at) = funded_wallet();
    let wallet = open(&store, &chain, &clock, LoadMode::Resume);
    let id = Descriptor::watch_script(script(1)).id();
    wallet.reimport_descriptor(&id, T0 + funded_at * SPACING).unwrap();
    chain.prune_below(95);

    let err = wallet.reconcile().unwrap().wait_blocking().unwrap_err();
    assert_eq!(err, ScanError::ChainDataMissing { height: funded_at - 12 });
    assert_eq!(wallet.cursor().unwrap().height, 150);
    assert_eq!(wallet.list_transactions()[0].confirmations, 50);
    assert_eq!(store.get::<u64>("cursor", b"replay").unwrap(), None);
}

#[test]
fn test_reorg_while_detached_replays_the_new_branch() {
    let chain = MemoryChain::new(T0);
    mine_to(&chain, 10);
    let clock = MockClock::new(T0 + 10 * SPACING);
    let (_dir, store) = temp_store();
    let orphaned = pay(&script(3), 700, 1);
    {
        let wallet = open(&store, &chain, &clock, LoadMode::Resume);
        wallet.import_descriptor(Descriptor::watch_script(script(3)), T0, true).unwrap();
        assert!(wallet.descriptors()[0].verified);
        mine_to(&chain, 13);
        chain.mine(T0 + 14 * SPACING, vec![orphaned.clone()]);
        mine_to(&chain, 15);
        sync::catch_up(&wallet, 15).unwrap();
        assert_eq!(wallet.get_transaction(&orphaned.txid()).unwrap().confirmations, 2);
    }

    // a competing branch replaces everything above height 12 while the wallet is closed
    let fork = MemoryChain::from_blocks(chain.blocks()[..=12].to_vec());
    let paid = pay(&script(3), 900, 2);
    fork.mine(T0 + 13 * SPACING, vec![paid.clone()]);
    mine_to(&fork, 20);

    let wallet = open(&store, &fork, &clock, LoadMode::Resume);
    assert_eq!(wallet.reconcile_state(), ReconcileState::Initial);
    assert_eq!(wallet.cursor(), None);
    assert!(wallet.descriptors().iter().all(|d| !d.verified));
    let stale = wallet.get_transaction(&orphaned.txid()).unwrap();
    assert_eq!((stale.confirmations, stale.block_height), (0, None));
    assert_eq!(stale.superseded.len(), 1);
    assert_eq!(stale.superseded[0].height, 14);

    assert_eq!(wallet.reconcile().unwrap().wait_blocking(), Ok(20));
    let found = wallet.get_transaction(&paid.txid()).unwrap();
    assert_eq!(found.block_height, Some(13));
    assert_eq!(found.confirmations, 8);
    assert_eq!(wallet.get_transaction(&orphaned.txid()).unwrap().confirmations, 0);
    assert_eq!(wallet.balance(), 900);
}

#[test]
fn test_reconciliation_waits_for_a_running_rescan() {
    let (_dir, store, chain, clock, _) = funded_wallet();
    let slow = config::Scan { read_retries: 3, retry_backoff_ms: 200, ..Default::default() };
    let wallet = open_with(&store, &chain, &clock, slow, LoadMode::Resume);
    assert!(wallet.is_reconciled());
    chain.fail_reads(140, 3);

    let rescanning = {
        let w = wallet.clone();
        std::thread::spawn(move || w.rescan(130, 150))
    };
    std::thread::sleep(Duration::from_millis(100));
    let handle = wallet.reconcile().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    // the replay has not started while the rescan still owns the range
    assert_eq!(handle.state(), ReconcileState::DetermineStart);

    assert!(rescanning.join().unwrap().is_ok());
    assert_eq!(handle.wait_blocking(), Ok(150));
    assert_eq!(wallet.cursor().unwrap().height, 150);
    assert_eq!(store.get::<u64>("cursor", b"replay").unwrap(), None);
    assert_eq!(wallet.list_transactions()[0].confirmations, 50);
}

#[test]
fn test_replay_follows_blocks_mined_while_it_runs() {
    let (_dir, store, chain, clock, funded_at) = funded_wallet();
    let slow = config::Scan { read_retries: 3, retry_backoff_ms: 150, ..Default::default() };
    let rebuilt = chain.reindexed();
    let wallet = open_with(&store, &rebuilt, &clock, slow, LoadMode::ChainRebuilt);
    rebuilt.fail_reads(funded_at - 12, 3);

    let handle = wallet.reconcile().unwrap();
    for _ in 0..200 {
        if matches!(handle.state(), ReconcileState::Replaying { .. }) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.state(), ReconcileState::Replaying { start: funded_at - 12, tip: 150 });

    let late = pay(&script(1), 8_000, 2);
    mine_to(&rebuilt, 152);
    rebuilt.mine(T0 + 153 * SPACING, vec![late.clone()]);
    mine_to(&rebuilt, 155);

    assert_eq!(handle.wait_blocking(), Ok(155));
    assert_eq!(wallet.cursor().unwrap().height, 155);
    assert_eq!(wallet.get_transaction(&late.txid()).unwrap().confirmations, 3);
    assert_eq!(wallet.list_transactions()[0].confirmations, 55);
    assert_eq!(wallet.balance(), 58_000);
}
