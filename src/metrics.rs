use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::thread;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref BLOCKS_SCANNED: IntCounterVec = IntCounterVec::new(
        Opts::new("walletscan_blocks_scanned_total", "Blocks applied to a wallet, by scan mode"),
        &["mode"],
    ).expect("metric options are static");
    pub static ref TXS_MATCHED: IntCounter = IntCounter::new(
        "walletscan_txs_matched_total", "Transactions upserted because they touched a descriptor",
    ).expect("metric options are static");
    pub static ref BIRTH_TIME_LOWERED: IntCounter = IntCounter::new(
        "walletscan_birth_time_lowered_total", "Descriptor birth times corrected downward",
    ).expect("metric options are static");
    pub static ref CHAIN_READ_RETRIES: IntCounter = IntCounter::new(
        "walletscan_chain_read_retries_total", "Transient chain read failures retried",
    ).expect("metric options are static");
    pub static ref RECONCILIATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("walletscan_reconciliations_total", "Finished reconciliations, by outcome"),
        &["outcome"],
    ).expect("metric options are static");
    pub static ref CURSOR_HEIGHT: IntGauge = IntGauge::new(
        "walletscan_cursor_height", "Height of the last block applied to the wallet",
    ).expect("metric options are static");
}

/// Registers all collectors once; repeated calls are harmless.
pub fn register() {
    let _ = REGISTRY.register(Box::new(BLOCKS_SCANNED.clone()));
    let _ = REGISTRY.register(Box::new(TXS_MATCHED.clone()));
    let _ = REGISTRY.register(Box::new(BIRTH_TIME_LOWERED.clone()));
    let _ = REGISTRY.register(Box::new(CHAIN_READ_RETRIES.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILIATIONS.clone()));
    let _ = REGISTRY.register(Box::new(CURSOR_HEIGHT.clone()));
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    register();
    let bind_addr = cfg.bind.clone();
    let server = tiny_http::Server::http(&bind_addr)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", bind_addr, e))?;
    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid metrics content-type header"))?;

    thread::Builder::new()
        .name("metrics-http".into())
        .spawn(move || {
            for request in server.incoming_requests() {
                let mut buffer = vec![];
                let encoder = TextEncoder::new();
                if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
                    tracing::warn!("could not encode metrics");
                    continue;
                }
                let response = tiny_http::Response::from_data(buffer).with_header(header.clone());
                let _ = request.respond(response);
            }
        })?;
    tracing::info!("metrics served on {}", cfg.bind);
    Ok(())
}
