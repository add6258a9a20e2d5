use crate::{chain::ChainEvent, error::ScanResult, wallet::Wallet};
use std::sync::Arc;
use tokio::{
    sync::broadcast::{error::RecvError, Receiver},
    task,
};

/// Follows the node's block-connected notifications and feeds them through
/// the shared scan path. Gaps (missed or lagged notifications) are filled
/// from the wallet cursor, so the follower never skips a height.
pub fn spawn(
    wallet: Arc<Wallet>,
    mut events: Receiver<ChainEvent>,
    mut shutdown_rx: Receiver<()>,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(wallet = %wallet.name(), "sync task received shutdown signal");
                    break;
                }

                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(wallet = %wallet.name(), missed, "chain notifications lagged; catching up from cursor");
                            match wallet.tip() {
                                Ok(height) => ChainEvent::BlockConnected { height, hash: Default::default() },
                                Err(e) => {
                                    tracing::warn!("could not read chain tip: {e}");
                                    continue;
                                }
                            }
                        }
                        Err(RecvError::Closed) => {
                            tracing::info!(wallet = %wallet.name(), "chain notification stream closed");
                            break;
                        }
                    };
                    let w = Arc::clone(&wallet);
                    match task::spawn_blocking(move || handle_event(&w, event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(wallet = %wallet.name(), "live scan failed: {e}"),
                        Err(e) => tracing::error!("sync worker panicked: {e}"),
                    }
                }
            }
        }
        tracing::info!(wallet = %wallet.name(), "sync task shutdown complete");
    })
}

/// Applies one notification. Block events are ignored while the wallet is
/// not current; the reconciliation that makes it current also catches up.
pub fn handle_event(wallet: &Arc<Wallet>, event: ChainEvent) -> ScanResult<()> {
    match event {
        ChainEvent::BlockConnected { height, .. } => catch_up(wallet, height),
        ChainEvent::Rebuilt { tip } => {
            tracing::info!(tip, "chain state rebuilt; reconciling wallet");
            wallet.chain_rebuilt()?;
            wallet.reconcile()?;
            Ok(())
        }
    }
}

/// Scans every height above the cursor up to `height`.
pub fn catch_up(wallet: &Wallet, height: u64) -> ScanResult<()> {
    if let Some(summary) = wallet.follow_to(height)? {
        tracing::debug!(wallet = %wallet.name(), start = summary.start, end = summary.end, "caught up");
    }
    Ok(())
}
