//! Confirmation depth as a pure function of a transaction's height and the wallet cursor.

use std::fmt;

/// `cursor - tx + 1` when the transaction is confirmed at or below the cursor, else 0.
pub fn confirmations(tx_block_height: Option<u64>, cursor_height: Option<u64>) -> u64 {
    match (tx_block_height, cursor_height) {
        (Some(tx), Some(cursor)) if tx <= cursor => cursor - tx + 1,
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Unconfirmed,
    /// confirmed on chain at the given height
    Confirmed(u64),
}

impl ConfirmationStatus {
    pub fn from_height(height: Option<u64>) -> Self {
        height.map_or(Self::Unconfirmed, Self::Confirmed)
    }
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
    pub fn is_confirmed_before_or_at(&self, height: u64) -> bool {
        match self {
            Self::Confirmed(h) => *h <= height,
            Self::Unconfirmed => false,
        }
    }
    pub fn confirmed_height(&self) -> Option<u64> {
        match self {
            Self::Confirmed(h) => Some(*h),
            Self::Unconfirmed => None,
        }
    }
    pub fn depth(&self, cursor_height: Option<u64>) -> u64 {
        confirmations(self.confirmed_height(), cursor_height)
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfirmed => write!(f, "unconfirmed"),
            Self::Confirmed(h) => write!(f, "confirmed at height {h}"),
        }
    }
}
