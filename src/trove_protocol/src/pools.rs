//! Balance ledgers of the protocol pools.
//!
//! Pools never move tokens themselves: they only keep the internal balances.
//! The token movement matching each balance change is queued by the caller
//! and settled after the operation completed. Every mutating entry point
//! starts with an allow-list check on the calling component.

use crate::access::{AccessList, SystemIds};
use crate::numeric::{Coll, Debt};
use crate::ProtocolError;
use candid::Principal;
use std::collections::BTreeMap;

fn ensure_covers<U>(
    available: crate::numeric::Amount<U>,
    requested: crate::numeric::Amount<U>,
    what: &str,
) -> Result<(), ProtocolError> {
    if requested > available {
        return Err(ProtocolError::InsufficientBalance(format!(
            "{what}: requested {requested}, available {available}"
        )));
    }
    Ok(())
}

/// Collateral and debt of active troves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivePool {
    coll: Coll,
    debt: Debt,
    can_send_coll: AccessList,
    can_increase_debt: AccessList,
    can_decrease_debt: AccessList,
    can_receive_coll: AccessList,
}

impl ActivePool {
    pub fn new(ids: &SystemIds) -> Self {
        Self {
            coll: Coll::ZERO,
            debt: Debt::ZERO,
            can_send_coll: AccessList::new(
                "active_pool.send_coll",
                [ids.borrower_operations, ids.trove_manager, ids.stability_pool],
            ),
            can_increase_debt: AccessList::new(
                "active_pool.increase_debt",
                [ids.borrower_operations, ids.trove_manager],
            ),
            can_decrease_debt: AccessList::new(
                "active_pool.decrease_debt",
                [ids.borrower_operations, ids.trove_manager, ids.stability_pool],
            ),
            can_receive_coll: AccessList::new(
                "active_pool.receive_coll",
                [ids.borrower_operations, ids.default_pool],
            ),
        }
    }

    pub fn coll(&self) -> Coll {
        self.coll
    }

    pub fn debt(&self) -> Debt {
        self.debt
    }

    pub fn send_coll(&mut self, caller: Principal, amount: Coll) -> Result<(), ProtocolError> {
        self.can_send_coll.check(caller)?;
        ensure_covers(self.coll, amount, "active pool collateral")?;
        self.coll -= amount;
        Ok(())
    }

    pub fn receive_coll(&mut self, caller: Principal, amount: Coll) -> Result<(), ProtocolError> {
        self.can_receive_coll.check(caller)?;
        self.coll += amount;
        Ok(())
    }

    pub fn increase_debt(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.can_increase_debt.check(caller)?;
        self.debt += amount;
        Ok(())
    }

    pub fn decrease_debt(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.can_decrease_debt.check(caller)?;
        ensure_covers(self.debt, amount, "active pool debt")?;
        self.debt -= amount;
        Ok(())
    }
}

/// Redistributed collateral and debt not yet applied to troves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultPool {
    coll: Coll,
    debt: Debt,
    trove_manager_only: AccessList,
    can_receive_coll: AccessList,
}

impl DefaultPool {
    pub fn new(ids: &SystemIds) -> Self {
        Self {
            coll: Coll::ZERO,
            debt: Debt::ZERO,
            trove_manager_only: AccessList::new("default_pool", [ids.trove_manager]),
            can_receive_coll: AccessList::new("default_pool.receive_coll", [ids.active_pool]),
        }
    }

    pub fn coll(&self) -> Coll {
        self.coll
    }

    pub fn debt(&self) -> Debt {
        self.debt
    }

    /// Releases collateral that goes back to the active pool.
    pub fn send_coll_to_active_pool(
        &mut self,
        caller: Principal,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.trove_manager_only.check(caller)?;
        ensure_covers(self.coll, amount, "default pool collateral")?;
        self.coll -= amount;
        Ok(())
    }

    pub fn receive_coll(&mut self, caller: Principal, amount: Coll) -> Result<(), ProtocolError> {
        self.can_receive_coll.check(caller)?;
        self.coll += amount;
        Ok(())
    }

    pub fn increase_debt(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.trove_manager_only.check(caller)?;
        self.debt += amount;
        Ok(())
    }

    pub fn decrease_debt(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.trove_manager_only.check(caller)?;
        ensure_covers(self.debt, amount, "default pool debt")?;
        self.debt -= amount;
        Ok(())
    }
}

/// Collateral left over after redemptions and capped liquidations, claimable
/// by the former trove owners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollSurplusPool {
    coll: Coll,
    balances: BTreeMap<Principal, Coll>,
    can_account_surplus: AccessList,
    can_claim: AccessList,
    can_receive_coll: AccessList,
}

impl CollSurplusPool {
    pub fn new(ids: &SystemIds) -> Self {
        Self {
            coll: Coll::ZERO,
            balances: BTreeMap::new(),
            can_account_surplus: AccessList::new(
                "coll_surplus_pool.account_surplus",
                [ids.trove_manager],
            ),
            can_claim: AccessList::new("coll_surplus_pool.claim_coll", [ids.borrower_operations]),
            can_receive_coll: AccessList::new(
                "coll_surplus_pool.notify_receive_collateral",
                [ids.active_pool],
            ),
        }
    }

    pub fn coll(&self) -> Coll {
        self.coll
    }

    pub fn collateral_of(&self, owner: &Principal) -> Coll {
        self.balances.get(owner).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Principal, &Coll)> {
        self.balances.iter()
    }

    pub fn account_surplus(
        &mut self,
        caller: Principal,
        owner: Principal,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.can_account_surplus.check(caller)?;
        *self.balances.entry(owner).or_default() += amount;
        Ok(())
    }

    /// Zeroes the owner's claimable balance and returns it. The caller queues
    /// the transfer afterwards.
    pub fn claim_coll(&mut self, caller: Principal, owner: Principal) -> Result<Coll, ProtocolError> {
        self.can_claim.check(caller)?;
        let claimable = self.collateral_of(&owner);
        if claimable.is_zero() {
            return Err(ProtocolError::NothingToClaim);
        }
        self.balances.remove(&owner);
        ensure_covers(self.coll, claimable, "surplus pool collateral")?;
        self.coll -= claimable;
        Ok(claimable)
    }

    pub fn notify_receive_collateral(
        &mut self,
        caller: Principal,
        amount: Coll,
    ) -> Result<(), ProtocolError> {
        self.can_receive_coll.check(caller)?;
        self.coll += amount;
        Ok(())
    }
}

/// Stablecoin reserved for liquidator gas compensation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GasPool {
    debt: Debt,
    can_deposit: AccessList,
    can_withdraw: AccessList,
}

impl GasPool {
    pub fn new(ids: &SystemIds) -> Self {
        Self {
            debt: Debt::ZERO,
            can_deposit: AccessList::new("gas_pool.deposit", [ids.borrower_operations]),
            can_withdraw: AccessList::new(
                "gas_pool.withdraw",
                [ids.borrower_operations, ids.trove_manager],
            ),
        }
    }

    pub fn balance(&self) -> Debt {
        self.debt
    }

    pub fn deposit(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.can_deposit.check(caller)?;
        self.debt += amount;
        Ok(())
    }

    pub fn withdraw(&mut self, caller: Principal, amount: Debt) -> Result<(), ProtocolError> {
        self.can_withdraw.check(caller)?;
        ensure_covers(self.debt, amount, "gas pool")?;
        self.debt -= amount;
        Ok(())
    }
}

/// Stablecoin deposits that absorb liquidated debt in exchange for the
/// liquidated collateral.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilityPool {
    total_deposits: Debt,
    coll: Coll,
    deposits: BTreeMap<Principal, Debt>,
    gains: BTreeMap<Principal, Coll>,
    can_offset: AccessList,
    can_receive_coll: AccessList,
}

impl StabilityPool {
    pub fn new(ids: &SystemIds) -> Self {
        Self {
            total_deposits: Debt::ZERO,
            coll: Coll::ZERO,
            deposits: BTreeMap::new(),
            gains: BTreeMap::new(),
            can_offset: AccessList::new("stability_pool.offset", [ids.trove_manager]),
            can_receive_coll: AccessList::new("stability_pool.receive_coll", [ids.active_pool]),
        }
    }

    pub fn total_deposits(&self) -> Debt {
        self.total_deposits
    }

    pub fn coll(&self) -> Coll {
        self.coll
    }

    pub fn deposit_of(&self, depositor: &Principal) -> Debt {
        self.deposits.get(depositor).copied().unwrap_or_default()
    }

    pub fn collateral_gain_of(&self, depositor: &Principal) -> Coll {
        self.gains.get(depositor).copied().unwrap_or_default()
    }

    pub fn depositors_count(&self) -> usize {
        self.deposits.len()
    }

    pub fn provide(&mut self, depositor: Principal, amount: Debt) {
        *self.deposits.entry(depositor).or_default() += amount;
        self.total_deposits += amount;
    }

    /// Withdraws up to `amount` of the current deposit, returning the
    /// amount actually withdrawn.
    pub fn withdraw(&mut self, depositor: Principal, amount: Debt) -> Debt {
        let deposit = self.deposit_of(&depositor);
        let withdrawn = amount.min(deposit);
        if withdrawn == deposit {
            self.deposits.remove(&depositor);
        } else {
            self.deposits.insert(depositor, deposit - withdrawn);
        }
        self.total_deposits -= withdrawn;
        withdrawn
    }

    /// Removes and returns the depositor's collateral gain.
    pub fn take_collateral_gain(&mut self, depositor: Principal) -> Coll {
        let gain = self.gains.remove(&depositor).unwrap_or_default();
        self.coll -= gain;
        gain
    }

    pub fn receive_coll(&mut self, caller: Principal, amount: Coll) -> Result<(), ProtocolError> {
        self.can_receive_coll.check(caller)?;
        self.coll += amount;
        Ok(())
    }

    /// Cancels `debt` against the deposits and credits `coll` as gains, both
    /// pro rata to the deposits. The collateral itself arrives through
    /// [`StabilityPool::receive_coll`].
    pub fn offset(&mut self, caller: Principal, debt: Debt, coll: Coll) -> Result<(), ProtocolError> {
        self.can_offset.check(caller)?;
        if debt.is_zero() {
            return Ok(());
        }
        ensure_covers(self.total_deposits, debt, "stability pool deposits")?;
        let total = self.total_deposits;

        let mut losses: BTreeMap<Principal, Debt> = self
            .deposits
            .iter()
            .map(|(depositor, deposit)| (*depositor, deposit.mul_div(debt.get(), total.get())))
            .collect();
        let mut unassigned = debt - losses.values().copied().sum::<Debt>();
        for (depositor, loss) in losses.iter_mut() {
            if unassigned.is_zero() {
                break;
            }
            let room = self.deposit_of(depositor) - *loss;
            let extra = room.min(unassigned);
            *loss += extra;
            unassigned -= extra;
        }
        assert!(unassigned.is_zero(), "bug: offset loss not fully assigned");

        let mut gains: Vec<(Principal, Coll)> = self
            .deposits
            .iter()
            .map(|(depositor, deposit)| (*depositor, coll.mul_div(deposit.get(), total.get())))
            .collect();
        let assigned: Coll = gains.iter().map(|(_, gain)| *gain).sum();
        if let Some(largest) = gains.iter_mut().max_by_key(|(depositor, _)| self.deposit_of(depositor)) {
            largest.1 += coll - assigned;
        }
        for (depositor, gain) in gains {
            if !gain.is_zero() {
                *self.gains.entry(depositor).or_default() += gain;
            }
        }

        for (depositor, loss) in losses {
            let remaining = self.deposit_of(&depositor) - loss;
            if remaining.is_zero() {
                self.deposits.remove(&depositor);
            } else {
                self.deposits.insert(depositor, remaining);
            }
        }
        self.total_deposits -= debt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn user(n: u8) -> Principal {
        Principal::from_slice(&[n])
    }

    #[test]
    fn active_pool_rejects_unknown_callers() {
        let ids = SystemIds::derived();
        let mut pool = ActivePool::new(&ids);
        pool.receive_coll(ids.borrower_operations, Coll::new(10)).unwrap();
        assert_matches!(
            pool.send_coll(ids.coll_surplus_pool, Coll::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        assert_matches!(
            pool.receive_coll(ids.trove_manager, Coll::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        assert_matches!(
            pool.send_coll(ids.trove_manager, Coll::new(11)),
            Err(ProtocolError::InsufficientBalance(_))
        );
        pool.send_coll(ids.stability_pool, Coll::new(4)).unwrap();
        assert_eq!(pool.coll(), Coll::new(6));
    }

    #[test]
    fn default_pool_is_trove_manager_only() {
        let ids = SystemIds::derived();
        let mut pool = DefaultPool::new(&ids);
        assert_matches!(
            pool.increase_debt(ids.borrower_operations, Debt::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        pool.increase_debt(ids.trove_manager, Debt::new(5)).unwrap();
        pool.decrease_debt(ids.trove_manager, Debt::new(2)).unwrap();
        assert_eq!(pool.debt(), Debt::new(3));
    }

    #[test]
    fn surplus_is_additive_and_claimed_once() {
        let ids = SystemIds::derived();
        let mut pool = CollSurplusPool::new(&ids);
        pool.notify_receive_collateral(ids.active_pool, Coll::new(30)).unwrap();
        pool.account_surplus(ids.trove_manager, user(1), Coll::new(10)).unwrap();
        pool.account_surplus(ids.trove_manager, user(1), Coll::new(20)).unwrap();
        assert_eq!(pool.collateral_of(&user(1)), Coll::new(30));

        assert_eq!(pool.claim_coll(ids.borrower_operations, user(1)), Ok(Coll::new(30)));
        assert_eq!(pool.collateral_of(&user(1)), Coll::ZERO);
        assert_eq!(pool.coll(), Coll::ZERO);
        assert_eq!(
            pool.claim_coll(ids.borrower_operations, user(1)),
            Err(ProtocolError::NothingToClaim)
        );
    }

    #[test]
    fn surplus_pool_checks_callers() {
        let ids = SystemIds::derived();
        let mut pool = CollSurplusPool::new(&ids);
        assert_matches!(
            pool.account_surplus(ids.borrower_operations, user(1), Coll::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        assert_matches!(
            pool.claim_coll(ids.trove_manager, user(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        assert_matches!(
            pool.notify_receive_collateral(ids.default_pool, Coll::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
    }

    #[test]
    fn offset_is_pro_rata_and_exact() {
        let ids = SystemIds::derived();
        let mut pool = StabilityPool::new(&ids);
        pool.provide(user(1), Debt::new(100));
        pool.provide(user(2), Debt::new(200));
        pool.provide(user(3), Debt::new(1));
        pool.receive_coll(ids.active_pool, Coll::new(50)).unwrap();

        assert_matches!(
            pool.offset(ids.borrower_operations, Debt::new(1), Coll::new(1)),
            Err(ProtocolError::Unauthorized { .. })
        );
        pool.offset(ids.trove_manager, Debt::new(151), Coll::new(50)).unwrap();

        assert_eq!(pool.total_deposits(), Debt::new(150));
        let deposits: Debt = [1, 2, 3].iter().map(|n| pool.deposit_of(&user(*n))).sum();
        assert_eq!(deposits, pool.total_deposits());
        assert_eq!(pool.deposit_of(&user(2)), Debt::new(100));

        let gains: Coll = [1, 2, 3].iter().map(|n| pool.collateral_gain_of(&user(*n))).sum();
        assert_eq!(gains, Coll::new(50));
        assert_eq!(pool.take_collateral_gain(user(2)), Coll::new(34));
        assert_eq!(pool.coll(), Coll::new(16));
    }

    #[test]
    fn offset_of_all_deposits_empties_the_pool() {
        let ids = SystemIds::derived();
        let mut pool = StabilityPool::new(&ids);
        pool.provide(user(1), Debt::new(7));
        pool.provide(user(2), Debt::new(3));
        pool.offset(ids.trove_manager, Debt::new(10), Coll::new(4)).unwrap();
        assert_eq!(pool.total_deposits(), Debt::ZERO);
        assert_eq!(pool.depositors_count(), 0);
        assert_eq!(pool.withdraw(user(1), Debt::new(5)), Debt::ZERO);
    }
}
