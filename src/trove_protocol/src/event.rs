use crate::access::SystemIds;
use crate::config::ProtocolConfig;
use crate::numeric::{Coll, Debt, Ratio, Stake};
use crate::state::{Interaction, Mode, State};
use crate::trove::TroveStatus;
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TroveOperation {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "adjust")]
    Adjust,
    #[serde(rename = "apply_pending_rewards")]
    ApplyPendingRewards,
    #[serde(rename = "liquidate_in_normal_mode")]
    LiquidateInNormalMode,
    #[serde(rename = "liquidate_in_recovery_mode")]
    LiquidateInRecoveryMode,
    #[serde(rename = "redeem_collateral")]
    RedeemCollateral,
}

impl TroveOperation {
    pub fn liquidation(mode: Mode) -> Self {
        match mode {
            Mode::Normal => TroveOperation::LiquidateInNormalMode,
            Mode::Recovery => TroveOperation::LiquidateInRecoveryMode,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "init")]
    Init {
        config: ProtocolConfig,
        ids: SystemIds,
        timestamp: u64,
    },

    #[serde(rename = "trove_updated")]
    TroveUpdated {
        borrower: Principal,
        coll_before: Coll,
        coll_after: Coll,
        debt_before: Debt,
        debt_after: Debt,
        stake: Stake,
        status: TroveStatus,
        operation: TroveOperation,
    },

    #[serde(rename = "trove_liquidated")]
    TroveLiquidated {
        borrower: Principal,
        debt: Debt,
        coll: Coll,
        mode: Mode,
    },

    #[serde(rename = "liquidation")]
    Liquidation {
        liquidator: Principal,
        liquidated_debt: Debt,
        liquidated_coll: Coll,
        coll_gas_compensation: Coll,
        debt_gas_compensation: Debt,
    },

    #[serde(rename = "redemption")]
    Redemption {
        redeemer: Principal,
        attempted: Debt,
        actual: Debt,
        coll_sent: Coll,
        coll_fee: Coll,
    },

    #[serde(rename = "borrowing_fee_paid")]
    BorrowingFeePaid { borrower: Principal, fee: Debt },

    #[serde(rename = "rewards_redistributed")]
    RewardsRedistributed {
        debt: Debt,
        coll: Coll,
        l_coll: u128,
        l_debt: u128,
    },

    #[serde(rename = "system_snapshots_updated")]
    SystemSnapshotsUpdated {
        total_stakes_snapshot: Stake,
        total_collateral_snapshot: Coll,
    },

    #[serde(rename = "total_stakes_updated")]
    TotalStakesUpdated { total_stakes: Stake },

    #[serde(rename = "base_rate_updated")]
    BaseRateUpdated { base_rate: Ratio },

    #[serde(rename = "last_fee_op_time_updated")]
    LastFeeOpTimeUpdated { timestamp: u64 },

    #[serde(rename = "coll_surplus_accounted")]
    CollSurplusAccounted { owner: Principal, amount: Coll },

    #[serde(rename = "coll_surplus_claimed")]
    CollSurplusClaimed { owner: Principal, amount: Coll },

    #[serde(rename = "stability_pool_offset")]
    StabilityPoolOffset { debt: Debt, coll: Coll },

    #[serde(rename = "stability_deposit_updated")]
    StabilityDepositUpdated {
        depositor: Principal,
        deposit: Debt,
        collateral_gain_paid: Coll,
    },

    #[serde(rename = "interaction_failed")]
    InteractionFailed {
        interaction: Interaction,
        reason: String,
    },
}

impl Event {
    pub fn is_trove_related(&self, filter_borrower: &Principal) -> bool {
        match self {
            Event::TroveUpdated { borrower, .. } => borrower == filter_borrower,
            Event::TroveLiquidated { borrower, .. } => borrower == filter_borrower,
            Event::BorrowingFeePaid { borrower, .. } => borrower == filter_borrower,
            Event::CollSurplusAccounted { owner, .. } => owner == filter_borrower,
            Event::CollSurplusClaimed { owner, .. } => owner == filter_borrower,
            Event::Redemption { .. } => true,
            Event::Init { .. } => false,
            Event::Liquidation { .. } => false,
            Event::RewardsRedistributed { .. } => false,
            Event::SystemSnapshotsUpdated { .. } => false,
            Event::TotalStakesUpdated { .. } => false,
            Event::BaseRateUpdated { .. } => false,
            Event::LastFeeOpTimeUpdated { .. } => false,
            Event::StabilityPoolOffset { .. } => false,
            Event::StabilityDepositUpdated { .. } => false,
            Event::InteractionFailed { .. } => false,
        }
    }
}

/// Records the current values of a trove against the values it had before
/// the operation.
pub fn record_trove_updated(
    state: &mut State,
    borrower: Principal,
    before: (Coll, Debt),
    operation: TroveOperation,
) {
    let trove = state.trove_or_default(&borrower);
    let event = Event::TroveUpdated {
        borrower,
        coll_before: before.0,
        coll_after: trove.coll,
        debt_before: before.1,
        debt_after: trove.debt,
        stake: trove.stake,
        status: trove.status,
        operation,
    };
    state.record(event);
}

pub fn record_base_rate_updated(state: &mut State) {
    let base_rate = state.base_rate;
    state.record(Event::BaseRateUpdated { base_rate });
}

pub fn record_total_stakes_updated(state: &mut State) {
    let total_stakes = state.total_stakes;
    state.record(Event::TotalStakesUpdated { total_stakes });
}
