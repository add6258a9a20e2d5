// Library interface for the wallet scanning engine
// The binaries and integration tests consume everything through these modules

pub mod config;
pub mod error;
pub mod clock;
pub mod chain;
pub mod descriptor;
pub mod storage;
pub mod confirmations;
pub mod wallet;
pub mod scan;
pub mod reconcile;
pub mod sync;
pub mod metrics;

pub use chain::{Block, BlockHash, ChainEvent, ChainSource, MemoryChain, OutPoint, StoreChain, Transaction, TxOut, Txid};
pub use clock::{MockClock, SystemClock, TimeSource};
pub use confirmations::{confirmations, ConfirmationStatus};
pub use descriptor::{BirthTimeStore, Descriptor, DescriptorId, DescriptorRecord};
pub use error::{ScanError, ScanResult};
pub use reconcile::{ReconcileHandle, ReconcileState};
pub use scan::{BlockOutcome, ScanMode, ScanSummary};
pub use storage::Store;
pub use wallet::{ChainCursor, LoadMode, TxDetails, Wallet, WalletTx};
