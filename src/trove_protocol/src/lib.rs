use crate::numeric::Ratio;
use crate::state::Mode;
use candid::{CandidType, Deserialize, Principal};
use std::fmt;

pub mod access;
pub mod borrower_operations;
pub mod config;
pub mod event;
pub mod external;
pub mod fees;
pub mod liquidation;
pub mod logs;
pub mod metrics;
pub mod numeric;
pub mod pools;
pub mod protocol;
pub mod redemption;
pub mod sorted_troves;
pub mod state;
pub mod storage;
pub mod trove;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use crate::logs::{DEBUG, INFO};
pub use crate::protocol::{InMemoryProtocol, Protocol};

#[derive(CandidType, Deserialize, Clone, Debug, PartialEq)]
pub struct ProtocolStatus {
    pub price: f64,
    pub total_collateral: f64,
    pub total_debt: f64,
    pub total_collateral_ratio: f64,
    pub mode: Mode,
    pub base_rate: f64,
    pub borrowing_rate: f64,
    pub redemption_rate: f64,
    pub active_troves: u64,
    pub stability_pool_deposits: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The caller is not allowed to invoke the operation.
    Unauthorized { caller: Principal, operation: String },
    /// The trove does not exist or is closed.
    NotActive { borrower: Principal },
    InvalidPositionState(String),
    NothingToClaim,
    NothingToLiquidate,
    NothingToRedeem,
    /// Redemptions open at the given timestamp (nanoseconds).
    RedemptionBlocked { until: u64 },
    /// The partial redemption hint no longer matches the trove.
    InvalidHint,
    ExceedsMaxIterations { limit: usize },
    ListFull,
    BelowMinimumCollateralization(String),
    AmountTooLow { minimum: u128 },
    InsufficientBalance(String),
    FeeExceedsMaximum { fee: Ratio, max_fee: Ratio },
    InvalidArgument(String),
    PriceUnavailable,
    InvalidConfig(String),
    /// A token movement failed. With `committed` set the bookkeeping of the
    /// operation stays in place and the movement awaits a retry.
    TransferFailed { reason: String, committed: bool },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Unauthorized { caller, operation } => {
                write!(f, "{caller} is not allowed to call {operation}")
            }
            ProtocolError::NotActive { borrower } => {
                write!(f, "trove of {borrower} does not exist or is closed")
            }
            ProtocolError::InvalidPositionState(msg) => write!(f, "invalid position state: {msg}"),
            ProtocolError::NothingToClaim => write!(f, "no collateral available to claim"),
            ProtocolError::NothingToLiquidate => write!(f, "nothing to liquidate"),
            ProtocolError::NothingToRedeem => write!(f, "unable to redeem any amount"),
            ProtocolError::RedemptionBlocked { until } => {
                write!(f, "redemptions are not allowed before {until}")
            }
            ProtocolError::InvalidHint => write!(f, "partial redemption hint is out of date"),
            ProtocolError::ExceedsMaxIterations { limit } => {
                write!(f, "sorted list traversal exceeded {limit} steps")
            }
            ProtocolError::ListFull => write!(f, "sorted list is full"),
            ProtocolError::BelowMinimumCollateralization(msg) => {
                write!(f, "collateralization too low: {msg}")
            }
            ProtocolError::AmountTooLow { minimum } => {
                write!(f, "amount too low, minimum is {minimum}")
            }
            ProtocolError::InsufficientBalance(msg) => write!(f, "insufficient balance: {msg}"),
            ProtocolError::FeeExceedsMaximum { fee, max_fee } => {
                write!(f, "fee {fee} exceeds the accepted maximum {max_fee}")
            }
            ProtocolError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ProtocolError::PriceUnavailable => write!(f, "price unavailable"),
            ProtocolError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            ProtocolError::TransferFailed { reason, committed } => {
                if *committed {
                    write!(f, "transfer failed after commit, queued for retry: {reason}")
                } else {
                    write!(f, "transfer failed, operation rolled back: {reason}")
                }
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
