//! Error kinds surfaced by the scanning engine

/// Errors returned by wallet, scan and reconciliation operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    /// Malformed scan bounds
    #[error("invalid scan range [{start}, {end}]")]
    InvalidRange { start: u64, end: u64 },
    /// Unknown transaction or descriptor
    #[error("not found: {0}")]
    NotFound(String),
    /// The chain cannot serve the requested height
    #[error("chain data missing at height {height}")]
    ChainDataMissing { height: u64 },
    /// A reconciliation is already determining its start or replaying
    #[error("a reconciliation is already in progress")]
    ConcurrentReconciliation,
    /// Transient chain read failure that outlived its retries
    #[error("chain read failed at height {height}: {reason}")]
    ChainRead { height: u64, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    /// The wallet's own records could not be decoded
    #[error("wallet data corrupted: {0}")]
    Corrupted(String),
    /// A previous storage or corruption failure stopped all further mutation
    #[error("wallet halted after an unrecoverable storage failure")]
    WalletHalted,
}

impl ScanError {
    /// Failures after which the wallet must stop mutating its own state
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Corrupted(_))
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(e: anyhow::Error) -> Self {
        ScanError::Storage(format!("{e:#}"))
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
