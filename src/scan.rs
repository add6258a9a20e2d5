//! Block application shared by live sync, explicit rescans and reindex replay.

use crate::{
    chain::{Block, BlockHash, ChainReadError, OutPoint, Txid},
    descriptor::{DescriptorId, DescriptorRecord},
    error::{ScanError, ScanResult},
    metrics,
    wallet::{
        map_chain_err, BlockRef, ChainCursor, MatchedOutput, Wallet, WalletTx, CF_CURSOR,
        CF_DESCRIPTOR, CF_WALLET_TX, CURSOR_KEY, REPLAY_KEY,
    },
};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Which path drove a block into the wallet. Only logging and metrics look at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    Live,
    Rescan,
    Replay,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Live => "live",
            ScanMode::Rescan => "rescan",
            ScanMode::Replay => "replay",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockOutcome {
    pub height: u64,
    pub hash: BlockHash,
    /// Wallet records created or changed by this block
    pub matched: usize,
    pub birth_times_lowered: usize,
    pub cursor_advanced: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub start: u64,
    pub end: u64,
    pub blocks: u64,
    pub matched: usize,
    pub birth_times_lowered: usize,
}

impl ScanSummary {
    fn add(&mut self, outcome: &BlockOutcome) {
        self.blocks += 1;
        self.matched += outcome.matched;
        self.birth_times_lowered += outcome.birth_times_lowered;
    }
}

/// How a block may move the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CursorRule {
    /// Only the block directly above the cursor (or genesis, without one) moves it.
    Extend,
    /// First block of a replay: the cursor restarts here and the replay
    /// checkpoint is recorded in the same batch.
    RestartReplay,
}

/// Everything one block changes, staged before anything becomes visible.
struct StagedBlock {
    txs: BTreeMap<Txid, WalletTx>,
    lowered: BTreeMap<DescriptorId, DescriptorRecord>,
    cursor: Option<ChainCursor>,
    replay_from: Option<u64>,
}

fn merge_outputs(into: &mut Vec<MatchedOutput>, found: Vec<MatchedOutput>) {
    for out in found {
        match into.iter_mut().find(|o| o.vout == out.vout) {
            Some(existing) => {
                for id in out.descriptors {
                    if !existing.descriptors.contains(&id) {
                        existing.descriptors.push(id);
                    }
                }
            }
            None => into.push(out),
        }
    }
    into.sort_by_key(|o| o.vout);
}

impl Wallet {
    /// Applies one block: matches, record upserts, birth-time corrections and
    /// the cursor advance commit together in a single batch, cursor last.
    pub fn apply_block(&self, block: &Block, height: u64, mode: ScanMode) -> ScanResult<BlockOutcome> {
        self.apply_block_with(block, height, mode, CursorRule::Extend)
    }

    pub(crate) fn apply_block_with(
        &self,
        block: &Block,
        height: u64,
        mode: ScanMode,
        rule: CursorRule,
    ) -> ScanResult<BlockOutcome> {
        let _guard = self.lock_mutation()?;
        let hash = block.hash();
        let location = BlockRef { height, hash, time: block.time };
        let staged = self.stage_block(block, location, rule);

        let outcome = BlockOutcome {
            height,
            hash,
            matched: staged.txs.len(),
            birth_times_lowered: staged.lowered.len(),
            cursor_advanced: staged.cursor.is_some(),
        };
        if staged.txs.is_empty()
            && staged.lowered.is_empty()
            && staged.cursor.is_none()
            && staged.replay_from.is_none()
        {
            metrics::BLOCKS_SCANNED.with_label_values(&[mode.as_str()]).inc();
            return Ok(outcome);
        }

        let committed = self.commit_block(&staged);
        if let Err(e) = &committed {
            self.note_failure(e);
        }
        committed?;

        {
            let mut view = self.write_view();
            for (id, record) in &staged.lowered {
                view.descriptors.lower_if_earlier(id, record.birth_time, record.birth_height)?;
            }
            view.txs.extend(staged.txs);
            if let Some(cursor) = staged.cursor {
                view.cursor = Some(cursor);
                metrics::CURSOR_HEIGHT.set(cursor.height as i64);
            }
        }

        metrics::BLOCKS_SCANNED.with_label_values(&[mode.as_str()]).inc();
        metrics::TXS_MATCHED.inc_by(outcome.matched as u64);
        metrics::BIRTH_TIME_LOWERED.inc_by(outcome.birth_times_lowered as u64);
        if outcome.matched > 0 || outcome.birth_times_lowered > 0 {
            tracing::info!(
                wallet = %self.name,
                mode = mode.as_str(),
                height,
                matched = outcome.matched,
                lowered = outcome.birth_times_lowered,
                "block applied"
            );
        } else {
            tracing::trace!(wallet = %self.name, mode = mode.as_str(), height, "block applied");
        }
        Ok(outcome)
    }

    fn stage_block(&self, block: &Block, location: BlockRef, rule: CursorRule) -> StagedBlock {
        let view = self.read_view();
        let now = self.clock.now();
        let mut txs: BTreeMap<Txid, WalletTx> = BTreeMap::new();
        let mut owned_here: HashSet<OutPoint> = HashSet::new();
        let mut touched: HashSet<DescriptorId> = HashSet::new();

        for tx in &block.txs {
            let txid = tx.txid();
            let outputs: Vec<MatchedOutput> = tx
                .outputs
                .iter()
                .enumerate()
                .filter_map(|(vout, out)| {
                    let ids = view.descriptors.matching(&out.script);
                    (!ids.is_empty()).then(|| MatchedOutput {
                        vout: vout as u32,
                        value: out.value,
                        descriptors: ids.to_vec(),
                    })
                })
                .collect();
            let spends: Vec<OutPoint> = tx
                .inputs
                .iter()
                .filter(|input| {
                    owned_here.contains(input)
                        || view.txs.get(&input.txid).is_some_and(|t| t.owns_output(input.vout))
                })
                .copied()
                .collect();
            if outputs.is_empty() && spends.is_empty() {
                continue;
            }

            for out in &outputs {
                owned_here.insert(OutPoint { txid, vout: out.vout });
                touched.extend(out.descriptors.iter().copied());
            }

            let previous = txs.get(&txid).or_else(|| view.txs.get(&txid));
            let next = match previous {
                None => WalletTx {
                    txid,
                    block: Some(location),
                    outputs,
                    spends,
                    time_received: now,
                    superseded: Vec::new(),
                },
                Some(prev) => {
                    let mut next = prev.clone();
                    if prev.block.map(|b| b.hash) != Some(location.hash) {
                        if let Some(old) = prev.block {
                            if !next.superseded.contains(&old) {
                                next.superseded.push(old);
                            }
                        }
                        next.block = Some(location);
                    }
                    merge_outputs(&mut next.outputs, outputs);
                    for spend in spends {
                        if !next.spends.contains(&spend) {
                            next.spends.push(spend);
                        }
                    }
                    if next == *prev {
                        continue;
                    }
                    next
                }
            };
            txs.insert(txid, next);
        }

        let mut lowered = BTreeMap::new();
        for id in touched {
            if let Some(record) = view.descriptors.get(&id) {
                if location.time < record.birth_time {
                    let mut corrected = record.clone();
                    corrected.birth_time = location.time;
                    corrected.birth_height = Some(location.height);
                    lowered.insert(id, corrected);
                }
            }
        }

        // the cursor never jumps a gap: heights it skipped were never applied
        let advance = match (rule, view.cursor) {
            (CursorRule::RestartReplay, _) => true,
            (CursorRule::Extend, Some(c)) => location.height == c.height + 1,
            (CursorRule::Extend, None) => location.height == 0,
        };
        let cursor = advance.then_some(ChainCursor { height: location.height, hash: location.hash });
        let replay_from = (rule == CursorRule::RestartReplay).then_some(location.height);

        StagedBlock { txs, lowered, cursor, replay_from }
    }

    fn commit_block(&self, staged: &StagedBlock) -> ScanResult<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for (txid, tx) in &staged.txs {
            self.store.batch_put(&mut batch, CF_WALLET_TX, &txid.0, tx, true)?;
        }
        for (id, record) in &staged.lowered {
            self.store.batch_put(&mut batch, CF_DESCRIPTOR, &id.0, record, false)?;
        }
        if let Some(start) = &staged.replay_from {
            self.store.batch_put(&mut batch, CF_CURSOR, REPLAY_KEY, start, false)?;
        }
        if let Some(cursor) = &staged.cursor {
            self.store.batch_put(&mut batch, CF_CURSOR, CURSOR_KEY, cursor, false)?;
        }
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Reads `height`, retrying transient failures with a linear backoff.
    pub(crate) fn fetch_block(&self, height: u64) -> ScanResult<Block> {
        let mut attempt = 0u32;
        loop {
            match self.chain.get_block(height) {
                Ok(block) => return Ok(block),
                Err(ChainReadError::Transient(reason)) if attempt < self.scan_cfg.read_retries => {
                    attempt += 1;
                    metrics::CHAIN_READ_RETRIES.inc();
                    tracing::warn!(height, attempt, "chain read failed, retrying: {reason}");
                    std::thread::sleep(Duration::from_millis(
                        self.scan_cfg.retry_backoff_ms.saturating_mul(attempt as u64),
                    ));
                }
                Err(e) => return Err(map_chain_err(e, height)),
            }
        }
    }

    /// Applies `[start, end]` in ascending height order. Running it again over
    /// the same range leaves the wallet unchanged.
    pub fn scan_range(&self, start: u64, end: u64, mode: ScanMode) -> ScanResult<ScanSummary> {
        self.scan_range_with(start, end, mode, CursorRule::Extend)
    }

    /// `first` applies to the block at `start`; the rest of the range extends the cursor.
    pub(crate) fn scan_range_with(
        &self,
        start: u64,
        end: u64,
        mode: ScanMode,
        first: CursorRule,
    ) -> ScanResult<ScanSummary> {
        if start > end {
            return Err(ScanError::InvalidRange { start, end });
        }
        let mut summary = ScanSummary { start, end, ..Default::default() };
        for height in start..=end {
            let block = self.fetch_block(height)?;
            let rule = if height == start { first } else { CursorRule::Extend };
            let outcome = self.apply_block_with(&block, height, mode, rule)?;
            summary.add(&outcome);
        }
        tracing::info!(
            wallet = %self.name,
            mode = mode.as_str(),
            start,
            end,
            matched = summary.matched,
            "scan finished"
        );
        Ok(summary)
    }

    /// Live catch-up: applies every height above the cursor through `height`,
    /// holding the scan range so a reconciliation cannot interleave. Returns
    /// `None` when there was nothing to do or the wallet is not current.
    pub fn follow_to(&self, height: u64) -> ScanResult<Option<ScanSummary>> {
        let _range = self.lock_scan_range();
        if !self.is_reconciled() {
            tracing::debug!(wallet = %self.name, height, "wallet not reconciled; live catch-up deferred");
            return Ok(None);
        }
        let from = self.cursor().map_or(0, |c| c.height + 1);
        if from > height {
            return Ok(None);
        }
        self.scan_range(from, height, ScanMode::Live).map(Some)
    }
}
