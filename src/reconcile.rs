//! Bringing a wallet back in line with a rebuilt chain.
//!
//! A reconciliation determines where replay must begin from the earliest
//! unverified birth time, replays through the tip on a background thread and
//! publishes its progress on a watch channel.
//!
//! The replay checkpoint is written together with the first replayed block,
//! which also moves the cursor to the replay start. Until then the previous
//! cursor stays in place; after it, a checkpoint with a cursor means
//! `[checkpoint, cursor]` has been replayed.

use crate::{
    error::{ScanError, ScanResult},
    metrics,
    scan::{CursorRule, ScanMode},
    wallet::{forget_chain_position, Wallet, CF_CURSOR, REPLAY_KEY},
};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    Initial,
    DetermineStart,
    Replaying { start: u64, tip: u64 },
    Reconciled { tip: u64 },
    Failed(ScanError),
}

impl ReconcileState {
    /// A reconciliation owns the wallet's scan position.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::DetermineStart | Self::Replaying { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reconciled { .. } | Self::Failed(_))
    }
}

/// Completion signal for one reconciliation request.
pub struct ReconcileHandle {
    rx: watch::Receiver<ReconcileState>,
}

impl ReconcileHandle {
    pub fn state(&self) -> ReconcileState {
        self.rx.borrow().clone()
    }

    /// Resolves with the reconciled tip height, or the error that ended the replay.
    pub async fn wait(mut self) -> ScanResult<u64> {
        let state = self
            .rx
            .wait_for(ReconcileState::is_terminal)
            .await
            .map_err(|_| ScanError::Storage("wallet dropped during reconciliation".into()))?
            .clone();
        match state {
            ReconcileState::Reconciled { tip } => Ok(tip),
            ReconcileState::Failed(e) => Err(e),
            other => Err(ScanError::Storage(format!("unexpected reconciliation state {other:?}"))),
        }
    }

    pub fn wait_blocking(self) -> ScanResult<u64> {
        futures::executor::block_on(self.wait())
    }
}

impl Wallet {
    fn set_reconcile_state(&self, state: ReconcileState) {
        tracing::debug!(wallet = %self.name, ?state, "reconciliation state");
        self.reconcile_state.send_replace(state);
    }

    /// Starts a reconciliation on a background thread. Fails with
    /// `ConcurrentReconciliation` while another one is still running.
    pub fn reconcile(self: &Arc<Self>) -> ScanResult<ReconcileHandle> {
        if self.is_halted() {
            return Err(ScanError::WalletHalted);
        }
        let mut claimed = false;
        self.reconcile_state.send_if_modified(|state| {
            if state.is_active() {
                return false;
            }
            *state = ReconcileState::DetermineStart;
            claimed = true;
            true
        });
        if !claimed {
            return Err(ScanError::ConcurrentReconciliation);
        }

        let rx = self.reconcile_state.subscribe();
        let wallet = Arc::clone(self);
        thread::Builder::new()
            .name("wallet-reconcile".into())
            .spawn(move || wallet.run_reconciliation())
            .map_err(|e| {
                let err = ScanError::Storage(format!("could not start reconciliation: {e}"));
                self.set_reconcile_state(ReconcileState::Failed(err.clone()));
                err
            })?;
        Ok(ReconcileHandle { rx })
    }

    /// The node rebuilt its chain state while the wallet was attached: discard
    /// the cursor, invalidate verification and return to `Initial`.
    pub fn chain_rebuilt(&self) -> ScanResult<()> {
        if self.reconciliation_active() {
            return Err(ScanError::ConcurrentReconciliation);
        }
        {
            let _range = self.lock_scan_range();
            if self.reconciliation_active() {
                return Err(ScanError::ConcurrentReconciliation);
            }
            let _guard = self.lock_mutation()?;
            let mut view = self.write_view();
            let view = &mut *view;
            let result =
                forget_chain_position(&self.store, self.chain.as_ref(), &mut view.descriptors, &mut view.txs);
            if let Err(e) = &result {
                self.note_failure(e);
            }
            result?;
            view.cursor = None;
        }
        self.set_reconcile_state(ReconcileState::Initial);
        tracing::info!(wallet = %self.name, "chain rebuilt; reconciliation required");
        Ok(())
    }

    fn run_reconciliation(&self) {
        match self.replay() {
            Ok(tip) => {
                metrics::RECONCILIATIONS.with_label_values(&["reconciled"]).inc();
                tracing::info!(wallet = %self.name, tip, "wallet reconciled");
                self.set_reconcile_state(ReconcileState::Reconciled { tip });
            }
            Err(e) => {
                self.note_failure(&e);
                metrics::RECONCILIATIONS.with_label_values(&["failed"]).inc();
                tracing::error!(wallet = %self.name, "reconciliation failed: {e}");
                self.set_reconcile_state(ReconcileState::Failed(e));
            }
        }
    }

    fn replay(&self) -> ScanResult<u64> {
        let _range = self.lock_scan_range();
        let mut tip = self.tip()?;
        let min_birth = self.read_view().descriptors.get_min_birth_time();
        let start = match min_birth {
            Some(t) => self.start_height_for(t)?.unwrap_or(tip),
            None => tip,
        };

        let checkpoint: Option<u64> = self
            .store
            .get(CF_CURSOR, REPLAY_KEY)
            .map_err(|e| ScanError::Corrupted(format!("{e:#}")))?;
        let (mut from, mut first) = match (checkpoint, self.cursor()) {
            // an interrupted replay already covered [checkpoint, cursor]
            (Some(cp), Some(c)) if cp <= start => (c.height + 1, CursorRule::Extend),
            _ => (start, CursorRule::RestartReplay),
        };
        tracing::info!(wallet = %self.name, start, from, tip, ?min_birth, "replaying chain");
        self.set_reconcile_state(ReconcileState::Replaying { start, tip });

        loop {
            if from <= tip {
                self.scan_range_with(from, tip, ScanMode::Replay, first)?;
                first = CursorRule::Extend;
            }
            let latest = self.tip()?;
            if latest <= tip {
                break;
            }
            from = tip + 1;
            tip = latest;
            self.set_reconcile_state(ReconcileState::Replaying { start, tip });
        }

        self.mark_verified_covering(start)?;
        self.finish_replay()?;
        Ok(self.cursor().map_or(tip, |c| c.height))
    }

    fn finish_replay(&self) -> ScanResult<()> {
        let _guard = self.lock_mutation()?;
        let result: anyhow::Result<()> = (|| {
            let mut batch = rocksdb::WriteBatch::default();
            self.store.batch_delete(&mut batch, CF_CURSOR, REPLAY_KEY)?;
            self.store.write_batch(batch)
        })();
        result.map_err(|e| {
            let e = ScanError::from(e);
            self.note_failure(&e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_start_and_replay_are_active() {
        assert!(!ReconcileState::Initial.is_active());
        assert!(ReconcileState::DetermineStart.is_active());
        assert!(ReconcileState::Replaying { start: 1, tip: 2 }.is_active());
        assert!(!ReconcileState::Reconciled { tip: 2 }.is_active());
        assert!(ReconcileState::Failed(ScanError::ChainDataMissing { height: 0 }).is_terminal());
        assert!(!ReconcileState::Initial.is_terminal());
    }
}
