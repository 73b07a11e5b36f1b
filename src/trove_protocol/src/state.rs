use crate::access::SystemIds;
use crate::config::{Params, ProtocolConfig};
use crate::event::{record_total_stakes_updated, record_trove_updated, Event, TroveOperation};
use crate::numeric::{
    compute_cr, compute_nominal_cr, mul_div, scaled_div_rem, Coll, Debt, NominalRatio, Price,
    Ratio, Stake,
};
use crate::pools::{ActivePool, CollSurplusPool, DefaultPool, GasPool, StabilityPool};
use crate::sorted_troves::SortedTroves;
use crate::trove::{RewardState, Trove, TroveNicrView, TroveStatus};
use crate::{ProtocolError, DEBUG};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// Like assert_eq, but returns an error instead of panicking.
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if $lhs != $rhs {
            return Err(format!("{} ({:?}) != {} ({:?}): {}",
                               std::stringify!($lhs), $lhs,
                               std::stringify!($rhs), $rhs,
                               format!($msg $(,$args)*)));
        }
    }
}

macro_rules! ensure {
    ($cond:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if !$cond {
            return Err(format!("Condition {} is false: {}",
                               std::stringify!($cond),
                               format!($msg $(,$args)*)));
        }
    }
}

/// Liquidation and borrowing policy in force, derived from the total
/// collateral ratio at the current price.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// TCR at or above the critical collateral ratio.
    #[serde(rename = "normal")]
    Normal,
    /// TCR below the critical collateral ratio.
    #[serde(rename = "recovery")]
    Recovery,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "Normal"),
            Mode::Recovery => write!(f, "Recovery"),
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Normal
    }
}

/// A token movement decided during an operation and executed once the
/// bookkeeping is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interaction {
    #[serde(rename = "transfer_coll")]
    TransferColl {
        from: Principal,
        to: Principal,
        amount: Coll,
    },
    #[serde(rename = "mint_stable")]
    MintStable { to: Principal, amount: Debt },
    #[serde(rename = "burn_stable")]
    BurnStable { from: Principal, amount: Debt },
    #[serde(rename = "transfer_stable")]
    TransferStable {
        from: Principal,
        to: Principal,
        amount: Debt,
    },
}

impl Interaction {
    /// Whether the movement takes funds from an account outside the protocol.
    pub fn is_user_debit(&self, ids: &SystemIds) -> bool {
        match self {
            Interaction::TransferColl { from, .. }
            | Interaction::TransferStable { from, .. }
            | Interaction::BurnStable { from, .. } => !ids.is_component(from),
            Interaction::MintStable { .. } => false,
        }
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interaction::TransferColl { from, to, amount } => {
                write!(f, "transfer {amount} collateral from {from} to {to}")
            }
            Interaction::MintStable { to, amount } => write!(f, "mint {amount} stable to {to}"),
            Interaction::BurnStable { from, amount } => {
                write!(f, "burn {amount} stable from {from}")
            }
            Interaction::TransferStable { from, to, amount } => {
                write!(f, "transfer {amount} stable from {from} to {to}")
            }
        }
    }
}

/// Entire position of a trove, pending rewards included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntireDebtAndColl {
    pub debt: Debt,
    pub coll: Coll,
    pub pending_debt_reward: Debt,
    pub pending_coll_reward: Coll,
}

/// The ledger: troves, reward accumulators, stakes, pools and the sorted
/// index. Token movements are queued in `outbox` and events in
/// `pending_events`; both are drained by the owner after the operation.
#[derive(Clone, Debug)]
pub struct State {
    pub config: ProtocolConfig,
    pub params: Params,
    pub ids: SystemIds,

    pub deployment_time: u64,
    /// Timestamp of the operation being executed, in nanoseconds.
    pub now: u64,

    pub troves: BTreeMap<Principal, Trove>,
    pub trove_owners: Vec<Principal>,
    pub sorted_troves: SortedTroves,

    pub total_stakes: Stake,
    pub total_stakes_snapshot: Stake,
    pub total_collateral_snapshot: Coll,
    pub rewards: RewardState,

    pub base_rate: Ratio,
    pub last_fee_operation_time: u64,

    pub active_pool: ActivePool,
    pub default_pool: DefaultPool,
    pub stability_pool: StabilityPool,
    pub coll_surplus_pool: CollSurplusPool,
    pub gas_pool: GasPool,

    pub total_coll_deposited: Coll,
    pub total_coll_withdrawn: Coll,

    pub outbox: Vec<Interaction>,
    pub failed_interactions: Vec<Interaction>,
    pub pending_events: Vec<Event>,
}

impl State {
    pub fn new(config: ProtocolConfig, ids: SystemIds, now: u64) -> Result<Self, ProtocolError> {
        let params = config.params()?;
        Ok(Self {
            sorted_troves: SortedTroves::new(params.max_troves, params.max_hint_traversal),
            params,
            config,
            deployment_time: now,
            now,
            troves: BTreeMap::new(),
            trove_owners: vec![],
            total_stakes: Stake::ZERO,
            total_stakes_snapshot: Stake::ZERO,
            total_collateral_snapshot: Coll::ZERO,
            rewards: RewardState::default(),
            base_rate: Ratio::ZERO,
            last_fee_operation_time: now,
            active_pool: ActivePool::new(&ids),
            default_pool: DefaultPool::new(&ids),
            stability_pool: StabilityPool::new(&ids),
            coll_surplus_pool: CollSurplusPool::new(&ids),
            gas_pool: GasPool::new(&ids),
            total_coll_deposited: Coll::ZERO,
            total_coll_withdrawn: Coll::ZERO,
            outbox: vec![],
            failed_interactions: vec![],
            pending_events: vec![],
            ids,
        })
    }

    pub fn record(&mut self, event: Event) {
        self.pending_events.push(event);
    }

    pub fn queue(&mut self, interaction: Interaction) {
        self.outbox.push(interaction);
    }

    // ---- Trove getters ----

    pub fn trove(&self, owner: &Principal) -> Option<&Trove> {
        self.troves.get(owner)
    }

    /// The stored trove, or an empty non-existent one.
    pub fn trove_or_default(&self, owner: &Principal) -> Trove {
        self.troves
            .get(owner)
            .cloned()
            .unwrap_or_else(|| Trove::new(*owner))
    }

    pub fn trove_status(&self, owner: &Principal) -> TroveStatus {
        self.troves
            .get(owner)
            .map(|t| t.status)
            .unwrap_or_default()
    }

    pub fn is_active(&self, owner: &Principal) -> bool {
        self.trove_status(owner) == TroveStatus::Active
    }

    pub(crate) fn require_active(&self, owner: &Principal) -> Result<(), ProtocolError> {
        if !self.is_active(owner) {
            return Err(ProtocolError::NotActive { borrower: *owner });
        }
        Ok(())
    }

    pub(crate) fn trove_mut(&mut self, owner: &Principal) -> &mut Trove {
        match self.troves.get_mut(owner) {
            Some(trove) => trove,
            None => panic!("bug: unknown trove {owner}"),
        }
    }

    pub fn trove_owners_count(&self) -> usize {
        self.trove_owners.len()
    }

    pub fn trove_owner_at(&self, index: usize) -> Option<Principal> {
        self.trove_owners.get(index).copied()
    }

    pub fn pending_coll_reward(&self, owner: &Principal) -> Coll {
        self.troves
            .get(owner)
            .map_or(Coll::ZERO, |t| t.pending_coll_reward(&self.rewards))
    }

    pub fn pending_debt_reward(&self, owner: &Principal) -> Debt {
        self.troves
            .get(owner)
            .map_or(Debt::ZERO, |t| t.pending_debt_reward(&self.rewards))
    }

    pub fn has_pending_rewards(&self, owner: &Principal) -> bool {
        self.troves
            .get(owner)
            .map_or(false, |t| t.has_pending_rewards(&self.rewards))
    }

    pub fn entire_debt_and_coll(&self, owner: &Principal) -> EntireDebtAndColl {
        let trove = self.trove_or_default(owner);
        let pending_debt_reward = trove.pending_debt_reward(&self.rewards);
        let pending_coll_reward = trove.pending_coll_reward(&self.rewards);
        EntireDebtAndColl {
            debt: trove.debt + pending_debt_reward,
            coll: trove.coll + pending_coll_reward,
            pending_debt_reward,
            pending_coll_reward,
        }
    }

    pub fn nominal_icr(&self, owner: &Principal) -> NominalRatio {
        let entire = self.entire_debt_and_coll(owner);
        compute_nominal_cr(entire.coll, entire.debt)
    }

    pub fn current_icr(&self, owner: &Principal, price: Price) -> Ratio {
        let entire = self.entire_debt_and_coll(owner);
        compute_cr(entire.coll, entire.debt, price)
    }

    // ---- System getters ----

    pub fn entire_system_coll(&self) -> Coll {
        self.active_pool.coll() + self.default_pool.coll()
    }

    pub fn entire_system_debt(&self) -> Debt {
        self.active_pool.debt() + self.default_pool.debt()
    }

    pub fn tcr(&self, price: Price) -> Ratio {
        compute_cr(self.entire_system_coll(), self.entire_system_debt(), price)
    }

    pub fn check_recovery_mode(&self, price: Price) -> bool {
        self.tcr(price) < self.params.ccr
    }

    pub fn mode(&self, price: Price) -> Mode {
        if self.check_recovery_mode(price) {
            Mode::Recovery
        } else {
            Mode::Normal
        }
    }

    pub(crate) fn check_potential_recovery_mode(
        &self,
        entire_system_coll: Coll,
        entire_system_debt: Debt,
        price: Price,
    ) -> bool {
        compute_cr(entire_system_coll, entire_system_debt, price) < self.params.ccr
    }

    /// Debt minus the gas compensation reserve.
    pub fn net_debt(&self, debt: Debt) -> Debt {
        debt.saturating_sub(self.params.gas_compensation)
    }

    /// Share of a trove's collateral paid to the liquidator.
    pub fn coll_gas_compensation(&self, entire_coll: Coll) -> Coll {
        Coll::new(entire_coll.get() / self.params.liquidation_reward_divisor)
    }

    // ---- Sorted index ----

    pub(crate) fn insert_sorted(
        &mut self,
        owner: Principal,
        nicr: NominalRatio,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<(), ProtocolError> {
        let view = TroveNicrView {
            troves: &self.troves,
            rewards: &self.rewards,
        };
        self.sorted_troves
            .insert(owner, nicr, upper_hint, lower_hint, &view)
    }

    pub(crate) fn re_insert_sorted(
        &mut self,
        owner: Principal,
        nicr: NominalRatio,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<(), ProtocolError> {
        let view = TroveNicrView {
            troves: &self.troves,
            rewards: &self.rewards,
        };
        self.sorted_troves
            .re_insert(owner, nicr, upper_hint, lower_hint, &view)
    }

    // ---- Collateral custody ----

    /// Books collateral arriving from a user into the active pool.
    pub(crate) fn pull_coll_into_active_pool(
        &mut self,
        from: Principal,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.active_pool
            .receive_coll(self.ids.borrower_operations, amount)?;
        self.total_coll_deposited += amount;
        self.queue_coll_transfer(from, self.ids.active_pool, amount);
        Ok(())
    }

    /// Pays collateral out of the active pool to an account outside the
    /// protocol.
    pub(crate) fn send_active_coll_to_account(
        &mut self,
        caller: Principal,
        to: Principal,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.active_pool.send_coll(caller, amount)?;
        self.total_coll_withdrawn += amount;
        self.queue_coll_transfer(self.ids.active_pool, to, amount);
        Ok(())
    }

    pub(crate) fn send_active_coll_to_default_pool(
        &mut self,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.active_pool.send_coll(self.ids.trove_manager, amount)?;
        self.default_pool.receive_coll(self.ids.active_pool, amount)?;
        self.queue_coll_transfer(self.ids.active_pool, self.ids.default_pool, amount);
        Ok(())
    }

    pub(crate) fn send_active_coll_to_stability_pool(
        &mut self,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.active_pool.send_coll(self.ids.trove_manager, amount)?;
        self.stability_pool
            .receive_coll(self.ids.active_pool, amount)?;
        self.queue_coll_transfer(self.ids.active_pool, self.ids.stability_pool, amount);
        Ok(())
    }

    pub(crate) fn send_active_coll_to_surplus_pool(
        &mut self,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.active_pool.send_coll(self.ids.trove_manager, amount)?;
        self.coll_surplus_pool
            .notify_receive_collateral(self.ids.active_pool, amount)?;
        self.queue_coll_transfer(self.ids.active_pool, self.ids.coll_surplus_pool, amount);
        Ok(())
    }

    pub(crate) fn send_default_coll_to_active_pool(
        &mut self,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.default_pool
            .send_coll_to_active_pool(self.ids.trove_manager, amount)?;
        self.active_pool.receive_coll(self.ids.default_pool, amount)?;
        self.queue_coll_transfer(self.ids.default_pool, self.ids.active_pool, amount);
        Ok(())
    }

    fn queue_coll_transfer(&mut self, from: Principal, to: Principal, amount: Coll) {
        if !amount.is_zero() {
            self.queue(Interaction::TransferColl { from, to, amount });
        }
    }

    // ---- Rewards and stakes ----

    /// Folds pending redistribution rewards into the trove's recorded
    /// amounts.
    pub(crate) fn apply_pending_rewards(&mut self, owner: Principal) -> Result<(), ProtocolError> {
        if !self.has_pending_rewards(&owner) {
            return Ok(());
        }
        self.require_active(&owner)?;

        let entire = self.entire_debt_and_coll(&owner);
        let before = {
            let trove = self.trove_mut(&owner);
            let before = (trove.coll, trove.debt);
            trove.coll = entire.coll;
            trove.debt = entire.debt;
            before
        };
        self.update_trove_reward_snapshots(&owner);
        self.move_pending_trove_rewards_to_active_pool(
            entire.pending_debt_reward,
            entire.pending_coll_reward,
        )?;
        record_trove_updated(self, owner, before, TroveOperation::ApplyPendingRewards);
        Ok(())
    }

    pub(crate) fn move_pending_trove_rewards_to_active_pool(
        &mut self,
        debt: Debt,
        coll: Coll,
    ) -> Result<(), ProtocolError> {
        self.default_pool
            .decrease_debt(self.ids.trove_manager, debt)?;
        self.active_pool
            .increase_debt(self.ids.trove_manager, debt)?;
        self.send_default_coll_to_active_pool(coll)
    }

    pub(crate) fn update_trove_reward_snapshots(&mut self, owner: &Principal) {
        let snapshot = self.rewards.snapshot();
        self.trove_mut(owner).snapshot = snapshot;
    }

    /// Stake for `coll` at the snapshot ratio. A zero stakes snapshot next to
    /// remaining collateral yields a zero stake.
    pub fn compute_new_stake(&self, coll: Coll) -> Stake {
        if self.total_collateral_snapshot.is_zero() {
            return Stake::new(coll.get());
        }
        Stake::new(mul_div(
            coll.get(),
            self.total_stakes_snapshot.get(),
            self.total_collateral_snapshot.get(),
        ))
    }

    pub(crate) fn update_stake_and_total_stakes(&mut self, owner: &Principal) -> Stake {
        let coll = self.trove_or_default(owner).coll;
        let new_stake = self.compute_new_stake(coll);
        let old_stake = std::mem::replace(&mut self.trove_mut(owner).stake, new_stake);
        self.total_stakes = self.total_stakes - old_stake + new_stake;
        record_total_stakes_updated(self);
        new_stake
    }

    pub(crate) fn remove_stake(&mut self, owner: &Principal) {
        let stake = std::mem::take(&mut self.trove_mut(owner).stake);
        self.total_stakes -= stake;
    }

    /// Spreads liquidated debt and collateral over all active stakes through
    /// the accumulators, then parks both in the default pool.
    pub(crate) fn redistribute_debt_and_coll(
        &mut self,
        debt: Debt,
        coll: Coll,
    ) -> Result<(), ProtocolError> {
        if debt.is_zero() {
            return Ok(());
        }
        if self.total_stakes.is_zero() {
            return Err(ProtocolError::InvalidPositionState(format!(
                "no stake left to absorb {debt} debt and {coll} collateral"
            )));
        }

        let (coll_per_unit_staked, coll_error) = scaled_div_rem(
            coll.get(),
            self.rewards.last_coll_error_redistribution,
            self.total_stakes.get(),
        );
        let (debt_per_unit_staked, debt_error) = scaled_div_rem(
            debt.get(),
            self.rewards.last_debt_error_redistribution,
            self.total_stakes.get(),
        );
        self.rewards.last_coll_error_redistribution = coll_error;
        self.rewards.last_debt_error_redistribution = debt_error;
        self.rewards.l_coll += coll_per_unit_staked;
        self.rewards.l_debt += debt_per_unit_staked;

        log!(
            DEBUG,
            "[redistribute] debt {debt} coll {coll} over {} stake, L_coll {} L_debt {}",
            self.total_stakes,
            self.rewards.l_coll,
            self.rewards.l_debt,
        );
        self.record(Event::RewardsRedistributed {
            debt,
            coll,
            l_coll: self.rewards.l_coll,
            l_debt: self.rewards.l_debt,
        });

        self.active_pool
            .decrease_debt(self.ids.trove_manager, debt)?;
        self.default_pool
            .increase_debt(self.ids.trove_manager, debt)?;
        self.send_active_coll_to_default_pool(coll)
    }

    /// Refreshes the ratio used to compute new stakes. `coll_remainder` is
    /// collateral still in the active pool that is about to leave the system.
    pub(crate) fn update_system_snapshots_exclude_coll_remainder(&mut self, coll_remainder: Coll) {
        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot =
            self.active_pool.coll() - coll_remainder + self.default_pool.coll();
        self.record(Event::SystemSnapshotsUpdated {
            total_stakes_snapshot: self.total_stakes_snapshot,
            total_collateral_snapshot: self.total_collateral_snapshot,
        });
    }

    // ---- Lifecycle ----

    /// Registers the owner of a newly opened trove; returns its array index.
    pub(crate) fn add_trove_owner(&mut self, owner: Principal) -> usize {
        self.trove_owners.push(owner);
        let index = self.trove_owners.len() - 1;
        self.trove_mut(&owner).array_index = index;
        index
    }

    fn remove_trove_owner(&mut self, owner: &Principal) {
        let index = self.trove_or_default(owner).array_index;
        assert!(
            self.trove_owners.get(index) == Some(owner),
            "bug: owners array out of sync for {owner}"
        );
        self.trove_owners.swap_remove(index);
        if let Some(moved) = self.trove_owners.get(index).copied() {
            self.trove_mut(&moved).array_index = index;
        }
    }

    /// Ends an active trove: zeroes its amounts and drops it from the owners
    /// array and the sorted index. The stake must be removed beforehand.
    pub(crate) fn deactivate_trove(
        &mut self,
        owner: Principal,
        status: TroveStatus,
    ) -> Result<(), ProtocolError> {
        assert!(
            status != TroveStatus::NonExistent && status != TroveStatus::Active,
            "bug: cannot close a trove into status {status}"
        );
        if self.trove_owners.len() <= 1 || self.sorted_troves.len() <= 1 {
            return Err(ProtocolError::InvalidPositionState(
                "only one trove in the system".to_string(),
            ));
        }
        {
            let trove = self.trove_mut(&owner);
            trove.status = status;
            trove.coll = Coll::ZERO;
            trove.debt = Debt::ZERO;
            trove.snapshot = Default::default();
        }
        self.remove_trove_owner(&owner);
        self.sorted_troves.remove(&owner)
    }

    // ---- Consistency ----

    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(self.troves, other.troves, "troves do not match");
        ensure_eq!(
            self.trove_owners,
            other.trove_owners,
            "trove_owners do not match"
        );
        ensure_eq!(self.rewards, other.rewards, "rewards do not match");
        ensure_eq!(
            self.total_stakes,
            other.total_stakes,
            "total_stakes does not match"
        );
        ensure_eq!(
            self.sorted_troves,
            other.sorted_troves,
            "sorted_troves does not match"
        );
        ensure_eq!(self.base_rate, other.base_rate, "base_rate does not match");
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let active: Vec<&Trove> = self.troves.values().filter(|t| t.is_active()).collect();

        ensure_eq!(
            active.len(),
            self.trove_owners.len(),
            "active troves and owners array disagree"
        );
        ensure_eq!(
            active.len(),
            self.sorted_troves.len(),
            "active troves and sorted index disagree"
        );
        for (index, owner) in self.trove_owners.iter().enumerate() {
            let trove = self.trove_or_default(owner);
            ensure!(trove.is_active(), "owner {} is not active", owner);
            ensure_eq!(trove.array_index, index, "stale array index of {}", owner);
            ensure!(
                self.sorted_troves.contains(owner),
                "owner {} missing from sorted index",
                owner
            );
        }
        for trove in self.troves.values().filter(|t| !t.is_active()) {
            ensure!(
                trove.coll.is_zero() && trove.debt.is_zero() && trove.stake.is_zero(),
                "closed trove {} still holds amounts",
                trove.owner
            );
        }

        let active_debt: Debt = active.iter().map(|t| t.debt).sum();
        let active_coll: Coll = active.iter().map(|t| t.coll).sum();
        let stakes: Stake = active.iter().map(|t| t.stake).sum();
        ensure_eq!(
            self.active_pool.debt(),
            active_debt,
            "active pool debt is not the sum of trove debts"
        );
        ensure_eq!(
            self.active_pool.coll(),
            active_coll,
            "active pool collateral is not the sum of trove collateral"
        );
        ensure_eq!(self.total_stakes, stakes, "total stakes drifted");

        let held = self.active_pool.coll()
            + self.default_pool.coll()
            + self.stability_pool.coll()
            + self.coll_surplus_pool.coll();
        ensure_eq!(
            held + self.total_coll_withdrawn,
            self.total_coll_deposited,
            "collateral is not conserved"
        );
        let surplus: Coll = self.coll_surplus_pool.balances().map(|(_, c)| *c).sum();
        ensure_eq!(
            surplus,
            self.coll_surplus_pool.coll(),
            "surplus balances do not add up"
        );
        ensure_eq!(
            self.gas_pool.balance(),
            Debt::new(self.params.gas_compensation.get() * active.len() as u128),
            "gas pool does not reserve one compensation per trove"
        );
        ensure!(
            self.base_rate <= Ratio::ONE,
            "base rate {} above 100%",
            self.base_rate
        );

        self.sorted_troves.check_invariants(&TroveNicrView {
            troves: &self.troves,
            rewards: &self.rewards,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::DECIMAL_PRECISION;
    use assert_matches::assert_matches;

    const E18: u128 = DECIMAL_PRECISION;

    fn owner(n: u8) -> Principal {
        Principal::from_slice(&[n])
    }

    fn state() -> State {
        State::new(ProtocolConfig::default(), SystemIds::derived(), 0).unwrap()
    }

    /// Books an active trove directly, keeping pools and the index in sync.
    fn book_trove(state: &mut State, id: Principal, coll: u128, debt: u128) {
        let mut trove = Trove::new(id);
        trove.status = TroveStatus::Active;
        trove.coll = Coll::new(coll);
        trove.debt = Debt::new(debt);
        state.troves.insert(id, trove);
        state.update_trove_reward_snapshots(&id);
        state.update_stake_and_total_stakes(&id);
        state.add_trove_owner(id);
        let bo = state.ids.borrower_operations;
        state.pull_coll_into_active_pool(id, Coll::new(coll)).unwrap();
        state.active_pool.increase_debt(bo, Debt::new(debt)).unwrap();
        state
            .gas_pool
            .deposit(bo, state.params.gas_compensation)
            .unwrap();
        let nicr = compute_nominal_cr(Coll::new(coll), Debt::new(debt));
        state.insert_sorted(id, nicr, None, None).unwrap();
    }

    #[test]
    fn first_stake_equals_collateral() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        assert_eq!(s.trove(&owner(1)).unwrap().stake, Stake::new(10 * E18));
        assert_eq!(s.total_stakes, Stake::new(10 * E18));
        assert_eq!(s.check_invariants(), Ok(()));
    }

    #[test]
    fn redistribution_credits_pending_rewards_by_stake() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        book_trove(&mut s, owner(2), 30 * E18, 2_000 * E18);

        // Move 4 coll and 400 debt out of the first trove's books into the
        // accumulators, as a liquidation would.
        s.redistribute_debt_and_coll(Debt::new(400 * E18), Coll::new(4 * E18))
            .unwrap();
        assert_eq!(s.rewards.l_coll, E18 / 10);
        assert_eq!(s.rewards.l_debt, 10 * E18);
        assert_eq!(s.pending_coll_reward(&owner(1)), Coll::new(E18));
        assert_eq!(s.pending_debt_reward(&owner(2)), Debt::new(300 * E18));
        assert_eq!(s.default_pool.debt(), Debt::new(400 * E18));
        assert_eq!(s.entire_system_debt(), Debt::new(4_000 * E18));
    }

    #[test]
    fn apply_pending_rewards_moves_amounts_back_to_active_pool() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        book_trove(&mut s, owner(2), 10 * E18, 2_000 * E18);
        s.redistribute_debt_and_coll(Debt::new(200 * E18), Coll::new(2 * E18))
            .unwrap();

        s.apply_pending_rewards(owner(1)).unwrap();
        let trove = s.trove(&owner(1)).unwrap();
        assert_eq!(trove.coll, Coll::new(11 * E18));
        assert_eq!(trove.debt, Debt::new(2_100 * E18));
        assert!(!s.has_pending_rewards(&owner(1)));
        assert_eq!(s.default_pool.debt(), Debt::new(100 * E18));
        assert_eq!(s.default_pool.coll(), Coll::new(E18));
        assert_matches!(
            s.pending_events.last(),
            Some(Event::TroveUpdated {
                operation: TroveOperation::ApplyPendingRewards,
                ..
            })
        );
    }

    #[test]
    fn redistribution_remainder_is_carried() {
        let mut s = state();
        // A snapshot ratio of 3 stake per 10 collateral books a stake of 3.
        s.total_stakes_snapshot = Stake::new(3);
        s.total_collateral_snapshot = Coll::new(10 * E18);
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        assert_eq!(s.total_stakes, Stake::new(3));
        s.redistribute_debt_and_coll(Debt::new(1), Coll::new(1)).unwrap();
        // 1e18 / 3 leaves 1e18 mod 3 for the next round.
        assert_eq!(s.rewards.l_coll, E18 / 3);
        assert_eq!(s.rewards.last_coll_error_redistribution, E18 % 3);
    }

    #[test]
    fn zero_stakes_snapshot_gives_zero_stake() {
        let mut s = state();
        s.total_collateral_snapshot = Coll::new(10 * E18);
        assert_eq!(s.compute_new_stake(Coll::new(5 * E18)), Stake::ZERO);
    }

    #[test]
    fn redistribution_without_stake_is_rejected() {
        let mut s = state();
        let before = s.clone();
        assert_matches!(
            s.redistribute_debt_and_coll(Debt::new(E18), Coll::new(E18)),
            Err(ProtocolError::InvalidPositionState(_))
        );
        assert_eq!(s.check_semantically_eq(&before), Ok(()));
    }

    #[test]
    fn out_of_order_index_breaks_invariants() {
        let mut s = state();
        book_trove(&mut s, owner(1), 30 * E18, 2_000 * E18);
        book_trove(&mut s, owner(2), 10 * E18, 2_000 * E18);
        assert_eq!(s.check_invariants(), Ok(()));

        // Swapping the collateral keeps every sum intact but not the order.
        s.trove_mut(&owner(1)).coll = Coll::new(10 * E18);
        s.trove_mut(&owner(2)).coll = Coll::new(30 * E18);
        let err = s.check_invariants().unwrap_err();
        assert!(err.contains("out of order"), "{err}");
    }

    #[test]
    fn snapshots_exclude_the_remainder() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        book_trove(&mut s, owner(2), 10 * E18, 2_000 * E18);
        s.update_system_snapshots_exclude_coll_remainder(Coll::new(E18));
        assert_eq!(s.total_stakes_snapshot, Stake::new(20 * E18));
        assert_eq!(s.total_collateral_snapshot, Coll::new(19 * E18));
        // New stakes now scale by 20/19.
        assert_eq!(s.compute_new_stake(Coll::new(19 * E18)), Stake::new(20 * E18));
    }

    #[test]
    fn deactivate_swaps_the_last_owner_into_place() {
        let mut s = state();
        for n in 1..=3 {
            book_trove(&mut s, owner(n), 10 * E18, 2_000 * E18);
        }
        s.remove_stake(&owner(1));
        s.deactivate_trove(owner(1), TroveStatus::ClosedByOwner)
            .unwrap();
        assert_eq!(s.trove_owners, vec![owner(3), owner(2)]);
        assert_eq!(s.trove(&owner(3)).unwrap().array_index, 0);
        assert_eq!(s.trove_status(&owner(1)), TroveStatus::ClosedByOwner);
        assert!(!s.sorted_troves.contains(&owner(1)));
    }

    #[test]
    fn last_trove_cannot_be_deactivated() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        assert_matches!(
            s.deactivate_trove(owner(1), TroveStatus::ClosedByOwner),
            Err(ProtocolError::InvalidPositionState(_))
        );
    }

    #[test]
    fn recovery_mode_follows_tcr() {
        let mut s = state();
        book_trove(&mut s, owner(1), 10 * E18, 2_000 * E18);
        assert_eq!(s.mode(Price::new(400 * E18)), Mode::Normal);
        // 10 * 250 / 2000 = 125% < 150%
        assert_eq!(s.mode(Price::new(250 * E18)), Mode::Recovery);
        assert_eq!(s.tcr(Price::new(250 * E18)), Ratio::new(1_250_000_000_000_000_000));
    }

    #[test]
    fn user_debits_are_told_apart_from_internal_moves() {
        let ids = SystemIds::derived();
        let user = owner(9);
        assert!(Interaction::BurnStable { from: user, amount: Debt::new(1) }.is_user_debit(&ids));
        assert!(!Interaction::BurnStable {
            from: ids.gas_pool,
            amount: Debt::new(1)
        }
        .is_user_debit(&ids));
        assert!(!Interaction::MintStable { to: user, amount: Debt::new(1) }.is_user_debit(&ids));
    }
}
