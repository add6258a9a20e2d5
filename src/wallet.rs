//! Wallet state and the wallet-facing API.
//!
//! Every mutation goes through `mutation` (the per-wallet exclusive section).
//! Readers take the `view` read lock, which the scanner swaps per block, so a
//! query never observes half of a block. Multi-block scans (rescan, live
//! catch-up, replay) additionally hold `range_lock` for their whole range so
//! two ranges never interleave.

use crate::{
    chain::{BlockHash, ChainReadError, ChainSource, OutPoint, Txid},
    clock::TimeSource,
    config,
    confirmations::{confirmations, ConfirmationStatus},
    descriptor::{BirthTimeStore, Descriptor, DescriptorId, DescriptorRecord},
    error::{ScanError, ScanResult},
    reconcile::ReconcileState,
    scan::{ScanMode, ScanSummary},
    storage::Store,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

pub(crate) const CF_DESCRIPTOR: &str = "descriptor";
pub(crate) const CF_WALLET_TX: &str = "wallet_tx";
pub(crate) const CF_CURSOR: &str = "cursor";
pub(crate) const CURSOR_KEY: &[u8] = b"cursor";
pub(crate) const REPLAY_KEY: &[u8] = b"replay";

/// Last block fully applied to the wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub height: u64,
    pub hash: BlockHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    pub hash: BlockHash,
    pub time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedOutput {
    pub vout: u32,
    pub value: u64,
    pub descriptors: Vec<DescriptorId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTx {
    pub txid: Txid,
    /// `None` while unconfirmed
    pub block: Option<BlockRef>,
    pub outputs: Vec<MatchedOutput>,
    /// Wallet outpoints this transaction spends
    pub spends: Vec<OutPoint>,
    pub time_received: u64,
    /// Earlier confirmations replaced by a re-observation in another block
    pub superseded: Vec<BlockRef>,
}

impl WalletTx {
    pub fn owns_output(&self, vout: u32) -> bool {
        self.outputs.iter().any(|o| o.vout == vout)
    }

    pub fn status(&self) -> ConfirmationStatus {
        ConfirmationStatus::from_height(self.block.map(|b| b.height))
    }
}

/// Answer to `get_transaction`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxDetails {
    pub txid: Txid,
    pub confirmations: u64,
    pub block_height: Option<u64>,
    pub block_hash: Option<BlockHash>,
    pub block_time: Option<u64>,
    pub time_received: u64,
    pub amount: u64,
    pub spends: Vec<OutPoint>,
    pub superseded: Vec<BlockRef>,
}

/// How the wallet is being attached to the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Continue from the persisted cursor
    Resume,
    /// The node rebuilt its chain state (reindex); the cursor is discarded and
    /// the wallet must be reconciled before it is current again
    ChainRebuilt,
}

#[derive(Debug, Default)]
pub(crate) struct WalletView {
    pub(crate) descriptors: BirthTimeStore,
    pub(crate) txs: HashMap<Txid, WalletTx>,
    pub(crate) cursor: Option<ChainCursor>,
}

pub struct Wallet {
    pub(crate) name: String,
    pub(crate) store: Arc<Store>,
    pub(crate) chain: Arc<dyn ChainSource>,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) scan_cfg: config::Scan,
    pub(crate) view: RwLock<WalletView>,
    mutation: Mutex<()>,
    range_lock: Mutex<()>,
    halted: AtomicBool,
    pub(crate) reconcile_state: watch::Sender<ReconcileState>,
}

pub(crate) fn map_chain_err(e: ChainReadError, height: u64) -> ScanError {
    match e {
        ChainReadError::Missing { height } => ScanError::ChainDataMissing { height },
        ChainReadError::Transient(reason) => ScanError::ChainRead { height, reason },
    }
}

/// Moves records confirmed in blocks that are no longer on the active chain
/// back to unconfirmed, keeping the dead location in `superseded`. Records
/// below the pruned height cannot be checked and are left alone.
fn detach_orphaned(chain: &dyn ChainSource, txs: &mut HashMap<Txid, WalletTx>) -> ScanResult<Vec<Txid>> {
    let lowest = chain.lowest_available_height();
    let mut hashes: HashMap<u64, Option<BlockHash>> = HashMap::new();
    let mut detached = Vec::new();
    for tx in txs.values_mut() {
        let Some(at) = tx.block else { continue };
        if at.height < lowest {
            continue;
        }
        let active = match hashes.get(&at.height) {
            Some(hash) => *hash,
            None => {
                let hash = match chain.get_block(at.height) {
                    Ok(block) => Some(block.hash()),
                    Err(ChainReadError::Missing { .. }) => None,
                    Err(e) => return Err(map_chain_err(e, at.height)),
                };
                hashes.insert(at.height, hash);
                hash
            }
        };
        if active == Some(at.hash) {
            continue;
        }
        if !tx.superseded.contains(&at) {
            tx.superseded.push(at);
        }
        tx.block = None;
        detached.push(tx.txid);
    }
    Ok(detached)
}

/// Drops everything the wallet believed about its chain position: every
/// descriptor's verified flag, the persisted cursor and the confirmations of
/// records whose block left the active chain. One batch.
pub(crate) fn forget_chain_position(
    store: &Store,
    chain: &dyn ChainSource,
    descriptors: &mut BirthTimeStore,
    txs: &mut HashMap<Txid, WalletTx>,
) -> ScanResult<()> {
    let detached = detach_orphaned(chain, txs)?;
    descriptors.invalidate_all();
    let mut batch = rocksdb::WriteBatch::default();
    for record in descriptors.records() {
        store.batch_put(&mut batch, CF_DESCRIPTOR, &record.descriptor.id().0, record, false)?;
    }
    for txid in &detached {
        if let Some(tx) = txs.get(txid) {
            store.batch_put(&mut batch, CF_WALLET_TX, &txid.0, tx, true)?;
        }
    }
    store.batch_delete(&mut batch, CF_CURSOR, CURSOR_KEY)?;
    store.write_batch(batch)?;
    if !detached.is_empty() {
        tracing::warn!(detached = detached.len(), "wallet transactions left the active chain");
    }
    Ok(())
}

impl Wallet {
    /// Loads wallet state from `store`. Undecodable records fail the load with
    /// `Corrupted` rather than starting from partial state.
    pub fn open(
        name: &str,
        store: Arc<Store>,
        chain: Arc<dyn ChainSource>,
        clock: Arc<dyn TimeSource>,
        scan_cfg: config::Scan,
        mode: LoadMode,
    ) -> ScanResult<Arc<Self>> {
        let corrupted = |e: anyhow::Error| ScanError::Corrupted(format!("{e:#}"));

        let records: Vec<DescriptorRecord> = store
            .iterate::<DescriptorRecord>(CF_DESCRIPTOR)
            .map_err(corrupted)?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        let mut txs: HashMap<Txid, WalletTx> = store
            .iterate::<WalletTx>(CF_WALLET_TX)
            .map_err(corrupted)?
            .into_iter()
            .map(|(_, tx)| (tx.txid, tx))
            .collect();
        let mut cursor: Option<ChainCursor> = store.get(CF_CURSOR, CURSOR_KEY).map_err(corrupted)?;
        let replay_pending = store.get::<u64>(CF_CURSOR, REPLAY_KEY).map_err(corrupted)?.is_some();
        let mut descriptors = BirthTimeStore::from_records(records);
        let is_new = descriptors.is_empty() && txs.is_empty() && cursor.is_none();
        let off_chain = cursor.is_some_and(|c| !Self::cursor_on_chain(chain.as_ref(), &c));

        let needs_reconcile = match mode {
            LoadMode::ChainRebuilt => {
                forget_chain_position(&store, chain.as_ref(), &mut descriptors, &mut txs)?;
                cursor = None;
                tracing::info!(wallet = name, "chain data rebuilt; wallet cursor discarded");
                true
            }
            LoadMode::Resume if off_chain => {
                // reorganized while detached: nothing above the fork point can be trusted
                forget_chain_position(&store, chain.as_ref(), &mut descriptors, &mut txs)?;
                tracing::warn!(wallet = name, cursor = ?cursor, "wallet cursor is not on the active chain");
                cursor = None;
                true
            }
            LoadMode::Resume if replay_pending => true,
            LoadMode::Resume if is_new => {
                // A fresh wallet has nothing to find below the current tip
                match chain.tip_height() {
                    Ok(tip) => {
                        let hash = chain.get_block(tip).map_err(|e| map_chain_err(e, tip))?.hash();
                        let fresh = ChainCursor { height: tip, hash };
                        store.put(CF_CURSOR, CURSOR_KEY, &fresh)?;
                        cursor = Some(fresh);
                    }
                    Err(ChainReadError::Missing { .. }) => {}
                    Err(e) => return Err(map_chain_err(e, 0)),
                }
                false
            }
            LoadMode::Resume => cursor.is_none(),
        };

        let initial = if needs_reconcile {
            ReconcileState::Initial
        } else {
            ReconcileState::Reconciled { tip: cursor.map_or(0, |c| c.height) }
        };
        if needs_reconcile {
            tracing::warn!(wallet = name, "wallet requires reconciliation before it is current");
        }
        if let Some(c) = cursor {
            crate::metrics::CURSOR_HEIGHT.set(c.height as i64);
        }

        let (reconcile_state, _) = watch::channel(initial);
        Ok(Arc::new(Self {
            name: name.to_string(),
            store,
            chain,
            clock,
            scan_cfg,
            view: RwLock::new(WalletView { descriptors, txs, cursor }),
            mutation: Mutex::new(()),
            range_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            reconcile_state,
        }))
    }

    fn cursor_on_chain(chain: &dyn ChainSource, cursor: &ChainCursor) -> bool {
        match chain.get_block(cursor.height) {
            Ok(block) => block.hash() == cursor.hash,
            Err(_) => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read_view(&self) -> RwLockReadGuard<'_, WalletView> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_view(&self) -> RwLockWriteGuard<'_, WalletView> {
        self.view.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enters the exclusive mutation section, refusing once the wallet is halted.
    pub(crate) fn lock_mutation(&self) -> ScanResult<MutexGuard<'_, ()>> {
        if self.is_halted() {
            return Err(ScanError::WalletHalted);
        }
        Ok(self.mutation.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stops further mutation after a storage or corruption failure.
    pub(crate) fn note_failure(&self, e: &ScanError) {
        if e.is_fatal() && !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(wallet = %self.name, "halting wallet mutations: {e}");
        }
    }

    /// Held for the length of a multi-block scan. Taken before `mutation`, never after.
    pub(crate) fn lock_scan_range(&self) -> MutexGuard<'_, ()> {
        self.range_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn cursor(&self) -> Option<ChainCursor> {
        self.read_view().cursor
    }

    pub fn descriptor(&self, id: &DescriptorId) -> Option<DescriptorRecord> {
        self.read_view().descriptors.get(id).cloned()
    }

    pub fn descriptors(&self) -> Vec<DescriptorRecord> {
        self.read_view().descriptors.records().cloned().collect()
    }

    pub fn get_transaction(&self, txid: &Txid) -> ScanResult<TxDetails> {
        let view = self.read_view();
        let tx = view
            .txs
            .get(txid)
            .ok_or_else(|| ScanError::NotFound(format!("transaction {txid}")))?;
        Ok(Self::details(tx, view.cursor))
    }

    /// All known transactions, oldest confirmation first, unconfirmed last.
    pub fn list_transactions(&self) -> Vec<TxDetails> {
        let view = self.read_view();
        let mut out: Vec<TxDetails> = view.txs.values().map(|tx| Self::details(tx, view.cursor)).collect();
        out.sort_by_key(|d| (d.block_height.unwrap_or(u64::MAX), d.txid));
        out
    }

    fn details(tx: &WalletTx, cursor: Option<ChainCursor>) -> TxDetails {
        TxDetails {
            txid: tx.txid,
            confirmations: confirmations(tx.block.map(|b| b.height), cursor.map(|c| c.height)),
            block_height: tx.block.map(|b| b.height),
            block_hash: tx.block.map(|b| b.hash),
            block_time: tx.block.map(|b| b.time),
            time_received: tx.time_received,
            amount: tx.outputs.iter().map(|o| o.value).sum(),
            spends: tx.spends.clone(),
            superseded: tx.superseded.clone(),
        }
    }

    /// Trusted balance: confirmed wallet outputs no wallet transaction spends.
    pub fn balance(&self) -> u64 {
        let view = self.read_view();
        let spent: HashSet<OutPoint> = view.txs.values().flat_map(|tx| tx.spends.iter().copied()).collect();
        view.txs
            .values()
            .filter(|tx| confirmations(tx.block.map(|b| b.height), view.cursor.map(|c| c.height)) > 0)
            .flat_map(|tx| {
                tx.outputs
                    .iter()
                    .filter(|o| !spent.contains(&OutPoint { txid: tx.txid, vout: o.vout }))
                    .map(|o| o.value)
            })
            .sum()
    }

    /// First height a scan for funds born at `birth_time` has to start from, or
    /// `None` when no block is recent enough to matter.
    pub fn start_height_for(&self, birth_time: u64) -> ScanResult<Option<u64>> {
        let target = birth_time.saturating_sub(self.scan_cfg.rescan_window_secs);
        self.chain
            .find_earliest_at_least(target)
            .map_err(|e| map_chain_err(e, 0))
    }

    pub(crate) fn tip(&self) -> ScanResult<u64> {
        self.chain.tip_height().map_err(|e| map_chain_err(e, 0))
    }

    pub(crate) fn persist_descriptors<'a>(
        &self,
        records: impl IntoIterator<Item = &'a DescriptorRecord>,
    ) -> ScanResult<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for record in records {
            self.store.batch_put(&mut batch, CF_DESCRIPTOR, &record.descriptor.id().0, record, false)?;
        }
        self.store.write_batch(batch).map_err(ScanError::from)
    }

    fn guard<T>(&self, result: ScanResult<T>) -> ScanResult<T> {
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    /// Adds a descriptor. With `rescan`, blocks from its birth time (minus the
    /// configured window) through the tip are scanned before returning.
    pub fn import_descriptor(
        &self,
        descriptor: Descriptor,
        birth_time: u64,
        rescan: bool,
    ) -> ScanResult<DescriptorId> {
        if rescan && self.reconciliation_active() {
            return Err(ScanError::ConcurrentReconciliation);
        }
        let id = descriptor.id();
        let effective_birth = {
            let _guard = self.lock_mutation()?;
            let mut view = self.write_view();
            let record = view.descriptors.insert(descriptor, birth_time).clone();
            let result = self.persist_descriptors([&record]);
            self.guard(result)?;
            tracing::info!(wallet = %self.name, descriptor = %id, birth_time = record.birth_time, "descriptor imported");
            record.birth_time
        };
        if rescan {
            let tip = self.tip()?;
            let start = self.start_height_for(effective_birth)?.unwrap_or(tip);
            self.rescan(start, tip)?;
        }
        Ok(id)
    }

    /// Explicit forget-and-re-import of an existing descriptor; the only path
    /// that may move a birth time later.
    pub fn reimport_descriptor(&self, id: &DescriptorId, birth_time: u64) -> ScanResult<()> {
        let _guard = self.lock_mutation()?;
        let mut view = self.write_view();
        view.descriptors.reimport(id, birth_time)?;
        let record = view.descriptors.get(id).cloned();
        let result = self.persist_descriptors(record.iter());
        self.guard(result)
    }

    /// Replays `[start, end]` through the shared scan path. The cursor only
    /// follows when the range continues directly from it; blocks beyond a gap
    /// are matched but left for the next catch-up to cover again.
    pub fn rescan(&self, start: u64, end: u64) -> ScanResult<ScanSummary> {
        if start > end {
            return Err(ScanError::InvalidRange { start, end });
        }
        let lowest = self.chain.lowest_available_height();
        if start < lowest {
            return Err(ScanError::ChainDataMissing { height: start });
        }
        let tip = self.tip()?;
        if end > tip {
            return Err(ScanError::InvalidRange { start, end });
        }
        if self.reconciliation_active() {
            return Err(ScanError::ConcurrentReconciliation);
        }
        let _range = self.lock_scan_range();
        // a reconciliation may have been claimed while we waited for the range
        if self.reconciliation_active() {
            return Err(ScanError::ConcurrentReconciliation);
        }

        let summary = self.scan_range(start, end, ScanMode::Rescan)?;
        if end >= tip {
            self.mark_verified_covering(start)?;
        }
        Ok(summary)
    }

    /// Marks verified every descriptor whose scan start height is at or above
    /// `start`, i.e. every descriptor a scan from `start` to the tip fully covered.
    pub(crate) fn mark_verified_covering(&self, start: u64) -> ScanResult<()> {
        let threshold = if start == 0 {
            0
        } else {
            self.chain
                .max_time_through(start - 1)
                .map_err(|e| map_chain_err(e, start - 1))?
                .saturating_add(self.scan_cfg.rescan_window_secs)
                .saturating_add(1)
        };

        let _guard = self.lock_mutation()?;
        let mut view = self.write_view();
        let changed = view.descriptors.mark_verified_from(threshold);
        if changed.is_empty() {
            return Ok(());
        }
        let records: Vec<DescriptorRecord> =
            changed.iter().filter_map(|id| view.descriptors.get(id).cloned()).collect();
        let result = self.persist_descriptors(records.iter());
        self.guard(result)
    }

    /// Explicit, externally triggered cursor reset. Blocks above the new cursor
    /// are applied again by the next scan; records are kept.
    pub fn reset_cursor(&self, to: Option<ChainCursor>) -> ScanResult<()> {
        let _guard = self.lock_mutation()?;
        let result = match to {
            Some(c) => self.store.put(CF_CURSOR, CURSOR_KEY, &c).map_err(ScanError::from),
            None => {
                let mut batch = rocksdb::WriteBatch::default();
                self.store
                    .batch_delete(&mut batch, CF_CURSOR, CURSOR_KEY)
                    .and_then(|_| self.store.write_batch(batch))
                    .map_err(ScanError::from)
            }
        };
        self.guard(result)?;
        self.write_view().cursor = to;
        tracing::info!(wallet = %self.name, height = ?to.map(|c| c.height), "cursor reset");
        Ok(())
    }

    pub fn reconcile_state(&self) -> ReconcileState {
        self.reconcile_state.borrow().clone()
    }

    pub fn is_reconciled(&self) -> bool {
        matches!(*self.reconcile_state.borrow(), ReconcileState::Reconciled { .. })
    }

    pub fn reconciliation_active(&self) -> bool {
        self.reconcile_state.borrow().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::clock::MockClock;
    use tempfile::TempDir;

    #[test]
    fn storage_failures_halt_further_mutation() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().to_str().unwrap()).unwrap());
        let chain = MemoryChain::new(1_000);
        chain.mine(1_600, vec![]);
        let wallet = Wallet::open(
            "halt",
            store,
            Arc::new(chain.clone()),
            Arc::new(MockClock::new(2_000)),
            config::Scan::default(),
            LoadMode::Resume,
        )
        .unwrap();

        wallet.note_failure(&ScanError::ChainDataMissing { height: 3 });
        assert!(!wallet.is_halted(), "chain errors are not fatal");

        wallet.note_failure(&ScanError::Storage("disk full".into()));
        assert!(wallet.is_halted());
        assert_eq!(
            wallet.import_descriptor(Descriptor::watch_script(vec![1]), 1_000, false),
            Err(ScanError::WalletHalted)
        );
        assert_eq!(wallet.rescan(0, 1).unwrap_err(), ScanError::WalletHalted);
        assert!(matches!(wallet.reconcile(), Err(ScanError::WalletHalted)));
        // reads keep working
        assert_eq!(wallet.cursor().map(|c| c.height), Some(1));
        assert!(wallet.list_transactions().is_empty());
    }
}
