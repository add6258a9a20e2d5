//! Chain collaborator: block and transaction types, the read interface the
//! scanner consumes, and two implementations (in-memory and store-backed).

use crate::storage::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

macro_rules! hash_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
        pub struct $name(pub [u8; 32]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..8]))
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> anyhow::Result<Self> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    anyhow::bail!("expected 32 bytes, got {}", bytes.len());
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok($name(out))
            }
        }
    };
}
pub(crate) use hash_newtype;

hash_newtype!(Txid);
hash_newtype!(BlockHash);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
    /// Distinguishes otherwise identical transactions (coinbase heights, test fixtures)
    pub nonce: u64,
}

impl Transaction {
    pub fn txid(&self) -> Txid {
        let mut h = blake3::Hasher::new();
        h.update(&self.nonce.to_le_bytes());
        for input in &self.inputs {
            h.update(&input.txid.0);
            h.update(&input.vout.to_le_bytes());
        }
        for out in &self.outputs {
            h.update(&out.value.to_le_bytes());
            h.update(&(out.script.len() as u32).to_le_bytes());
            h.update(&out.script);
        }
        Txid(*h.finalize().as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub prev_hash: BlockHash,
    pub time: u64,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        let mut h = blake3::Hasher::new();
        h.update(&self.prev_hash.0);
        h.update(&self.time.to_le_bytes());
        for tx in &self.txs {
            h.update(&tx.txid().0);
        }
        BlockHash(*h.finalize().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainReadError {
    #[error("block {height} is not available")]
    Missing { height: u64 },
    #[error("transient read failure: {0}")]
    Transient(String),
}

/// Notifications from the validation layer, in strictly increasing height order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BlockConnected { height: u64, hash: BlockHash },
    /// Validation state was rebuilt from genesis up to `tip`
    Rebuilt { tip: u64 },
}

/// Read-only view of the validated chain.
pub trait ChainSource: Send + Sync {
    fn get_block(&self, height: u64) -> Result<Block, ChainReadError>;

    fn tip_height(&self) -> Result<u64, ChainReadError>;

    fn block_time(&self, height: u64) -> Result<u64, ChainReadError> {
        self.get_block(height).map(|b| b.time)
    }

    /// Lowest height whose block data is still held (pruned nodes return > 0).
    /// Headers, and so block times, stay available below it.
    fn lowest_available_height(&self) -> u64 {
        0
    }

    /// Largest block time in `[0, height]`. Sources with an index override this.
    fn max_time_through(&self, height: u64) -> Result<u64, ChainReadError> {
        let mut max_time = 0u64;
        for h in 0..=height {
            max_time = max_time.max(self.block_time(h)?);
        }
        Ok(max_time)
    }

    /// First height whose running-maximum block time is at least `time`.
    /// Block times are not monotone, so the running maximum keeps the search well defined.
    fn find_earliest_at_least(&self, time: u64) -> Result<Option<u64>, ChainReadError> {
        let tip = self.tip_height()?;
        // the running maximum is monotone, so bisect over it
        if self.max_time_through(tip)? < time {
            return Ok(None);
        }
        let (mut lo, mut hi) = (0u64, tip);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.max_time_through(mid)? >= time {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(Some(lo))
    }
}

struct MemoryChainInner {
    blocks: Vec<Block>,
    /// `running_max[h]` is the largest block time in `[0, h]`
    running_max: Vec<u64>,
    pruned_below: u64,
    failures: HashMap<u64, u32>,
}

/// In-process chain used by the test harness and demos. Cloning shares state.
#[derive(Clone)]
pub struct MemoryChain {
    inner: Arc<RwLock<MemoryChainInner>>,
    events: broadcast::Sender<ChainEvent>,
}

impl MemoryChain {
    pub fn new(genesis_time: u64) -> Self {
        let genesis = Block {
            prev_hash: BlockHash::default(),
            time: genesis_time,
            txs: vec![Transaction { inputs: vec![], outputs: vec![], nonce: 0 }],
        };
        Self::from_blocks(vec![genesis])
    }

    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let running_max = blocks
            .iter()
            .scan(0u64, |max, b| {
                *max = (*max).max(b.time);
                Some(*max)
            })
            .collect();
        Self {
            inner: Arc::new(RwLock::new(MemoryChainInner {
                blocks,
                running_max,
                pruned_below: 0,
                failures: HashMap::new(),
            })),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Appends a block holding `txs` plus a height-unique coinbase and notifies subscribers.
    pub fn mine(&self, time: u64, txs: Vec<Transaction>) -> (u64, BlockHash) {
        let (height, hash) = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let height = inner.blocks.len() as u64;
            let prev_hash = inner.blocks.last().map(|b| b.hash()).unwrap_or_default();
            let mut all = vec![Transaction { inputs: vec![], outputs: vec![], nonce: height }];
            all.extend(txs);
            let block = Block { prev_hash, time, txs: all };
            let hash = block.hash();
            let max = inner.running_max.last().copied().unwrap_or(0).max(time);
            inner.running_max.push(max);
            inner.blocks.push(block);
            (height, hash)
        };
        let _ = self.events.send(ChainEvent::BlockConnected { height, hash });
        (height, hash)
    }

    /// A chain rebuilt from the same block data, as after a node reindex.
    /// The new instance has its own notification stream.
    pub fn reindexed(&self) -> Self {
        Self::from_blocks(self.blocks())
    }

    /// Announces that validation state was rebuilt through the current tip.
    pub fn announce_rebuilt(&self) {
        let tip = self.tip_height().unwrap_or(0);
        let _ = self.events.send(ChainEvent::Rebuilt { tip });
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).blocks.clone()
    }

    pub fn prune_below(&self, height: u64) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).pruned_below = height;
    }

    /// The next `times` reads of `height` fail transiently.
    pub fn fail_reads(&self, height: u64, times: u32) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .failures
            .insert(height, times);
    }
}

impl ChainSource for MemoryChain {
    fn get_block(&self, height: u64) -> Result<Block, ChainReadError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(left) = inner.failures.get_mut(&height) {
            if *left > 0 {
                *left -= 1;
                return Err(ChainReadError::Transient(format!("injected failure at {height}")));
            }
        }
        if height < inner.pruned_below {
            return Err(ChainReadError::Missing { height });
        }
        inner
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or(ChainReadError::Missing { height })
    }

    fn tip_height(&self) -> Result<u64, ChainReadError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.blocks.len().saturating_sub(1) as u64)
    }

    fn block_time(&self, height: u64) -> Result<u64, ChainReadError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .blocks
            .get(height as usize)
            .map(|b| b.time)
            .ok_or(ChainReadError::Missing { height })
    }

    fn lowest_available_height(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).pruned_below
    }

    fn max_time_through(&self, height: u64) -> Result<u64, ChainReadError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .running_max
            .get(height as usize)
            .copied()
            .ok_or(ChainReadError::Missing { height })
    }

    fn find_earliest_at_least(&self, time: u64) -> Result<Option<u64>, ChainReadError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let idx = inner.running_max.partition_point(|&t| t < time);
        Ok((idx < inner.running_max.len()).then_some(idx as u64))
    }
}

const CF_BLOCK: &str = "block";
const CF_CHAIN_META: &str = "chain_meta";
const TIP_KEY: &[u8] = b"tip";

fn max_time_key(height: u64) -> [u8; 9] {
    let mut key = [b'm'; 9];
    key[1..].copy_from_slice(&height.to_be_bytes());
    key
}

/// Chain backed by the node's block store (`block` column family keyed by big-endian height).
pub struct StoreChain {
    store: Arc<Store>,
}

impl StoreChain {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Appends `block` at the next height; block, running-max time and tip
    /// pointer land in one batch.
    pub fn append(&self, block: &Block) -> anyhow::Result<u64> {
        let (height, prev_max) = match self.store.get::<u64>(CF_CHAIN_META, TIP_KEY)? {
            Some(tip) => {
                let prev_max = self
                    .store
                    .get::<u64>(CF_CHAIN_META, &max_time_key(tip))?
                    .ok_or_else(|| anyhow::anyhow!("no running-max time at height {tip}"))?;
                (tip + 1, prev_max)
            }
            None => (0, 0),
        };
        let mut batch = rocksdb::WriteBatch::default();
        self.store.batch_put(&mut batch, CF_BLOCK, &height.to_be_bytes(), block, false)?;
        self.store
            .batch_put(&mut batch, CF_CHAIN_META, &max_time_key(height), &prev_max.max(block.time), false)?;
        self.store.batch_put(&mut batch, CF_CHAIN_META, TIP_KEY, &height, false)?;
        self.store.write_batch(batch)?;
        Ok(height)
    }
}

impl ChainSource for StoreChain {
    fn get_block(&self, height: u64) -> Result<Block, ChainReadError> {
        match self.store.get::<Block>(CF_BLOCK, &height.to_be_bytes()) {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(ChainReadError::Missing { height }),
            Err(e) => Err(ChainReadError::Transient(format!("{e:#}"))),
        }
    }

    fn tip_height(&self) -> Result<u64, ChainReadError> {
        match self.store.get::<u64>(CF_CHAIN_META, TIP_KEY) {
            Ok(Some(tip)) => Ok(tip),
            Ok(None) => Err(ChainReadError::Missing { height: 0 }),
            Err(e) => Err(ChainReadError::Transient(format!("{e:#}"))),
        }
    }

    fn max_time_through(&self, height: u64) -> Result<u64, ChainReadError> {
        match self.store.get::<u64>(CF_CHAIN_META, &max_time_key(height)) {
            Ok(Some(t)) => Ok(t),
            Ok(None) => Err(ChainReadError::Missing { height }),
            Err(e) => Err(ChainReadError::Transient(format!("{e:#}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbases_make_every_block_hash_unique() {
        let chain = MemoryChain::new(1_000);
        let (h1, a) = chain.mine(1_600, vec![]);
        let (h2, b) = chain.mine(1_600, vec![]);
        assert_eq!((h1, h2), (1, 2));
        assert_ne!(a, b);
        assert_eq!(chain.get_block(2).unwrap().prev_hash, a);
    }

    #[test]
    fn earliest_block_uses_running_max_time() {
        let chain = MemoryChain::new(100);
        chain.mine(500, vec![]);
        chain.mine(300, vec![]); // out of order timestamp
        chain.mine(600, vec![]);
        assert_eq!(chain.find_earliest_at_least(50).unwrap(), Some(0));
        assert_eq!(chain.find_earliest_at_least(400).unwrap(), Some(1));
        assert_eq!(chain.find_earliest_at_least(550).unwrap(), Some(3));
        assert_eq!(chain.find_earliest_at_least(601).unwrap(), None);
    }

    #[test]
    fn indexed_time_lookups_match_a_full_walk() {
        let times = [100, 500, 300, 300, 650, 640, 700, 700, 900];
        let chain = MemoryChain::new(times[0]);
        for t in &times[1..] {
            chain.mine(*t, vec![]);
        }
        // rebuild from the same blocks to exercise the index built in from_blocks
        let copy = MemoryChain::from_blocks(chain.blocks());
        let mut max = 0;
        for (h, t) in times.iter().enumerate() {
            max = max.max(*t);
            assert_eq!(chain.max_time_through(h as u64), Ok(max));
            assert_eq!(copy.max_time_through(h as u64), Ok(max));
        }
        assert_eq!(chain.max_time_through(9), Err(ChainReadError::Missing { height: 9 }));
        for target in [0, 100, 101, 300, 500, 501, 641, 650, 701, 900, 901] {
            let walked = times
                .iter()
                .scan(0u64, |m, t| {
                    *m = (*m).max(*t);
                    Some(*m)
                })
                .position(|m| m >= target)
                .map(|h| h as u64);
            assert_eq!(chain.find_earliest_at_least(target), Ok(walked), "target {target}");
            assert_eq!(copy.find_earliest_at_least(target), Ok(walked), "target {target}");
        }
    }

    #[test]
    fn pruned_and_failing_reads() {
        let chain = MemoryChain::new(100);
        chain.mine(200, vec![]);
        chain.fail_reads(1, 1);
        assert!(matches!(chain.get_block(1), Err(ChainReadError::Transient(_))));
        assert!(chain.get_block(1).is_ok());
        chain.prune_below(1);
        assert_eq!(chain.get_block(0), Err(ChainReadError::Missing { height: 0 }));
        assert_eq!(chain.block_time(0), Ok(100));
        assert_eq!(chain.lowest_available_height(), 1);
    }

    #[test]
    fn txid_round_trips_through_hex() {
        let tx = Transaction { inputs: vec![], outputs: vec![TxOut { value: 5, script: vec![1] }], nonce: 9 };
        let id = tx.txid();
        assert_eq!(id.to_string().parse::<Txid>().unwrap(), id);
        assert!("abcd".parse::<Txid>().is_err());
    }
}
