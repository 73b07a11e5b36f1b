use crate::numeric::{compute_nominal_cr, mul_div, Coll, Debt, NominalRatio, Stake, DECIMAL_PRECISION};
use crate::sorted_troves::NominalRatioSource;
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TroveStatus {
    #[serde(rename = "non_existent")]
    NonExistent,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "closed_by_owner")]
    ClosedByOwner,
    #[serde(rename = "closed_by_liquidation")]
    ClosedByLiquidation,
    #[serde(rename = "closed_by_redemption")]
    ClosedByRedemption,
}

impl Default for TroveStatus {
    fn default() -> Self {
        Self::NonExistent
    }
}

impl fmt::Display for TroveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TroveStatus::NonExistent => write!(f, "Non-existent"),
            TroveStatus::Active => write!(f, "Active"),
            TroveStatus::ClosedByOwner => write!(f, "Closed by owner"),
            TroveStatus::ClosedByLiquidation => write!(f, "Closed by liquidation"),
            TroveStatus::ClosedByRedemption => write!(f, "Closed by redemption"),
        }
    }
}

/// Accumulator values seen by a trove when its rewards were last applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub l_coll: u128,
    pub l_debt: u128,
}

/// Cumulative collateral and debt redistributed per unit of stake, scaled
/// by 1e18, and the division remainders carried into the next
/// redistribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardState {
    pub l_coll: u128,
    pub l_debt: u128,
    pub last_coll_error_redistribution: u128,
    pub last_debt_error_redistribution: u128,
}

impl RewardState {
    pub fn snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            l_coll: self.l_coll,
            l_debt: self.l_debt,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trove {
    pub owner: Principal,
    pub status: TroveStatus,
    pub debt: Debt,
    pub coll: Coll,
    pub stake: Stake,
    /// Position of the owner in the owners array while active.
    pub array_index: usize,
    pub snapshot: RewardSnapshot,
}

impl Trove {
    pub fn new(owner: Principal) -> Self {
        Self {
            owner,
            status: TroveStatus::NonExistent,
            debt: Debt::ZERO,
            coll: Coll::ZERO,
            stake: Stake::ZERO,
            array_index: 0,
            snapshot: RewardSnapshot::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TroveStatus::Active
    }

    pub fn pending_coll_reward(&self, rewards: &RewardState) -> Coll {
        let delta = rewards.l_coll - self.snapshot.l_coll;
        if delta == 0 || !self.is_active() {
            return Coll::ZERO;
        }
        Coll::new(mul_div(self.stake.get(), delta, DECIMAL_PRECISION))
    }

    pub fn pending_debt_reward(&self, rewards: &RewardState) -> Debt {
        let delta = rewards.l_debt - self.snapshot.l_debt;
        if delta == 0 || !self.is_active() {
            return Debt::ZERO;
        }
        Debt::new(mul_div(self.stake.get(), delta, DECIMAL_PRECISION))
    }

    pub fn has_pending_rewards(&self, rewards: &RewardState) -> bool {
        self.is_active()
            && (self.snapshot.l_coll < rewards.l_coll || self.snapshot.l_debt < rewards.l_debt)
    }

    /// Collateral and debt including pending rewards.
    pub fn entire_coll_and_debt(&self, rewards: &RewardState) -> (Coll, Debt) {
        (
            self.coll + self.pending_coll_reward(rewards),
            self.debt + self.pending_debt_reward(rewards),
        )
    }
}

/// Reads nominal ratios, pending rewards included, for the sorted list.
pub struct TroveNicrView<'a> {
    pub troves: &'a BTreeMap<Principal, Trove>,
    pub rewards: &'a RewardState,
}

impl NominalRatioSource for TroveNicrView<'_> {
    fn nominal_ratio(&self, id: &Principal) -> NominalRatio {
        match self.troves.get(id) {
            Some(trove) => {
                let (coll, debt) = trove.entire_coll_and_debt(self.rewards);
                compute_nominal_cr(coll, debt)
            }
            None => NominalRatio::ZERO,
        }
    }
}
