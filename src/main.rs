use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing_subscriber::EnvFilter;
use walletscan::{
    config, metrics, storage, sync, ChainEvent, ChainSource, Descriptor, LoadMode, StoreChain,
    SystemClock, Txid, Wallet,
};

const CHAIN_POLL_INTERVAL_SECS: u64 = 2;

#[derive(Parser)]
#[command(author, version, about = "Wallet transaction scanner for a validating node")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// The node's chain state was rebuilt; discard the wallet cursor and reconcile
    #[arg(long, default_value_t = false)]
    reindex: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Cursor, reconciliation state, balance and descriptor summary
    Status,
    /// Show one wallet transaction
    Tx { txid: String },
    /// List every wallet transaction
    List,
    /// Scan an explicit height range
    Rescan { start: u64, end: u64 },
    /// Watch an output script
    Import {
        /// Output script, hex encoded
        #[arg(long)]
        script: String,
        /// Unix seconds; earliest time the script can have received funds
        #[arg(long)]
        birth_time: u64,
        /// Scan from the birth time to the tip before returning
        #[arg(long, default_value_t = false)]
        rescan: bool,
    },
    /// Replay from the earliest unverified birth time and wait for completion
    Reconcile,
    /// Follow the chain and apply new blocks until interrupted
    Follow,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("⚠️  Could not read config from '{}': {e:#}; using embedded defaults", cli.config);
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG)?
        }
    };
    init_logging(&cfg.log.level);

    if cfg.metrics.enabled {
        if let Err(e) = metrics::serve(cfg.metrics.clone()) {
            tracing::warn!("metrics disabled: {e:#}");
        }
    } else {
        metrics::register();
    }

    let db = storage::open(&cfg.storage)?;
    let chain_cfg = config::Storage { path: cfg.storage.chain_path(), chain_path: None };
    let chain_db = storage::open(&chain_cfg)?;
    let chain = Arc::new(StoreChain::new(chain_db.clone()));
    tracing::info!(wallet = %cfg.storage.path, chain = %chain_cfg.path, "databases opened");

    let mode = if cli.reindex { LoadMode::ChainRebuilt } else { LoadMode::Resume };
    let wallet = Wallet::open(
        "default",
        db.clone(),
        chain.clone(),
        Arc::new(SystemClock),
        cfg.scan.clone(),
        mode,
    )?;

    match cli.cmd.unwrap_or(Cmd::Status) {
        Cmd::Status => {
            match wallet.cursor() {
                Some(c) => println!("cursor:      {} ({})", c.height, c.hash),
                None => println!("cursor:      none"),
            }
            println!("state:       {:?}", wallet.reconcile_state());
            println!("balance:     {}", wallet.balance());
            let descriptors = wallet.descriptors();
            println!("descriptors: {}", descriptors.len());
            for d in descriptors {
                println!(
                    "  {} birth_time={} verified={}",
                    d.descriptor.label, d.birth_time, d.verified
                );
            }
        }
        Cmd::Tx { txid } => {
            let txid: Txid = txid.parse()?;
            let tx = wallet.get_transaction(&txid)?;
            println!("txid:          {}", tx.txid);
            println!("confirmations: {}", tx.confirmations);
            if let (Some(h), Some(hash)) = (tx.block_height, tx.block_hash) {
                println!("block:         {h} ({hash})");
            }
            println!("amount:        {}", tx.amount);
            println!("received:      {}", tx.time_received);
        }
        Cmd::List => {
            for tx in wallet.list_transactions() {
                println!("{} {:>6} conf {:>12}", tx.txid, tx.confirmations, tx.amount);
            }
        }
        Cmd::Rescan { start, end } => {
            let summary = wallet.rescan(start, end)?;
            println!(
                "✅ scanned {} blocks [{}, {}], {} records changed",
                summary.blocks, summary.start, summary.end, summary.matched
            );
        }
        Cmd::Import { script, birth_time, rescan } => {
            let script = hex::decode(script.trim())?;
            let id = wallet.import_descriptor(Descriptor::watch_script(script), birth_time, rescan)?;
            println!("✅ imported descriptor {id}");
        }
        Cmd::Reconcile => {
            let tip = wallet.reconcile()?.wait().await?;
            println!("✅ wallet reconciled through height {tip}");
        }
        Cmd::Follow => follow(wallet.clone(), chain).await?,
    }

    if let Err(e) = db.close() {
        tracing::warn!("wallet database close failed: {e:#}");
    }
    if let Err(e) = chain_db.close() {
        tracing::warn!("chain database close failed: {e:#}");
    }
    Ok(())
}

/// The block store has no push notifications, so the tip is polled and turned
/// into block-connected events for the sync task.
async fn follow(wallet: Arc<Wallet>, chain: Arc<StoreChain>) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (events_tx, events_rx) = broadcast::channel::<ChainEvent>(1024);

    if !wallet.is_reconciled() {
        tracing::info!("wallet not current; reconciling before following");
        wallet.reconcile()?.wait().await?;
    }
    let sync_task = sync::spawn(wallet.clone(), events_rx, shutdown_tx.subscribe());

    let mut shutdown_rx = shutdown_tx.subscribe();
    let poller = tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(CHAIN_POLL_INTERVAL_SECS));
        let mut last_seen: Option<u64> = None;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = timer.tick() => {
                    let Ok(tip) = chain.tip_height() else { continue };
                    if last_seen.map_or(true, |seen| tip > seen) {
                        if let Ok(block) = chain.get_block(tip) {
                            let _ = events_tx.send(ChainEvent::BlockConnected { height: tip, hash: block.hash() });
                        }
                        last_seen = Some(tip);
                    }
                }
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => {
            println!("\n🛑 Ctrl+C received, shutting down...");
        }
        Err(e) => tracing::error!("unable to listen for shutdown signal: {e}"),
    }
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(sync_task, poller);
    Ok(())
}
