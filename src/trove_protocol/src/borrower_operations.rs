//! Owner-facing trove operations and stability pool deposits.

use crate::event::{record_trove_updated, Event, TroveOperation};
use crate::numeric::{compute_cr, compute_nominal_cr, Coll, Debt, Price, Ratio, Stake};
use crate::state::{Interaction, State};
use crate::trove::{Trove, TroveStatus};
use crate::{ProtocolError, INFO};
use candid::Principal;
use ic_canister_log::log;

/// Expected neighbours of a trove in the sorted index after the operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortedHints {
    pub upper: Option<Principal>,
    pub lower: Option<Principal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenTroveArgs {
    pub coll: Coll,
    /// Stablecoin the owner receives; fees and gas compensation come on top.
    pub debt_amount: Debt,
    pub max_fee: Ratio,
    pub hints: SortedHints,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustTroveArgs {
    pub coll_top_up: Coll,
    pub coll_withdrawal: Coll,
    pub debt_change: Debt,
    pub is_debt_increase: bool,
    pub max_fee: Ratio,
    pub hints: SortedHints,
}

impl AdjustTroveArgs {
    pub fn add_coll(amount: Coll, hints: SortedHints) -> Self {
        Self {
            coll_top_up: amount,
            ..Self::empty(hints)
        }
    }

    pub fn withdraw_coll(amount: Coll, hints: SortedHints) -> Self {
        Self {
            coll_withdrawal: amount,
            ..Self::empty(hints)
        }
    }

    pub fn withdraw_debt(amount: Debt, max_fee: Ratio, hints: SortedHints) -> Self {
        Self {
            debt_change: amount,
            is_debt_increase: true,
            max_fee,
            ..Self::empty(hints)
        }
    }

    pub fn repay_debt(amount: Debt, hints: SortedHints) -> Self {
        Self {
            debt_change: amount,
            ..Self::empty(hints)
        }
    }

    fn empty(hints: SortedHints) -> Self {
        Self {
            coll_top_up: Coll::ZERO,
            coll_withdrawal: Coll::ZERO,
            debt_change: Debt::ZERO,
            is_debt_increase: false,
            max_fee: Ratio::ZERO,
            hints,
        }
    }
}

fn below_mcr(what: &str, icr: Ratio, mcr: Ratio) -> ProtocolError {
    ProtocolError::BelowMinimumCollateralization(format!("{what} {icr} is below {mcr}"))
}

impl State {
    pub fn open_trove(
        &mut self,
        owner: Principal,
        args: OpenTroveArgs,
        price: Price,
    ) -> Result<Stake, ProtocolError> {
        let is_recovery_mode = self.check_recovery_mode(price);
        self.require_valid_max_fee_percentage(args.max_fee, is_recovery_mode)?;
        if self.is_active(&owner) {
            return Err(ProtocolError::InvalidPositionState(format!(
                "trove of {owner} is already active"
            )));
        }

        let mut net_debt = args.debt_amount;
        if !is_recovery_mode {
            net_debt += self.trigger_borrowing_fee(owner, args.debt_amount, args.max_fee)?;
        }
        if net_debt < self.params.min_net_debt {
            return Err(ProtocolError::AmountTooLow {
                minimum: self.params.min_net_debt.get(),
            });
        }

        let composite_debt = net_debt + self.params.gas_compensation;
        let icr = compute_cr(args.coll, composite_debt, price);
        let nicr = compute_nominal_cr(args.coll, composite_debt);

        if is_recovery_mode {
            if icr < self.params.ccr {
                return Err(below_mcr("ICR", icr, self.params.ccr));
            }
        } else {
            if icr < self.params.mcr {
                return Err(below_mcr("ICR", icr, self.params.mcr));
            }
            let new_tcr =
                self.new_tcr_from_trove_change(args.coll, true, composite_debt, true, price);
            if new_tcr < self.params.ccr {
                return Err(below_mcr("new TCR", new_tcr, self.params.ccr));
            }
        }

        let trove = Trove {
            status: TroveStatus::Active,
            coll: args.coll,
            debt: composite_debt,
            ..self.trove_or_default(&owner)
        };
        self.troves.insert(owner, trove);
        self.update_trove_reward_snapshots(&owner);
        let stake = self.update_stake_and_total_stakes(&owner);
        self.insert_sorted(owner, nicr, args.hints.upper, args.hints.lower)?;
        self.add_trove_owner(owner);
        record_trove_updated(self, owner, (Coll::ZERO, Debt::ZERO), TroveOperation::Open);

        let bo = self.ids.borrower_operations;
        self.pull_coll_into_active_pool(owner, args.coll)?;
        self.active_pool.increase_debt(bo, net_debt)?;
        self.queue(Interaction::MintStable {
            to: owner,
            amount: args.debt_amount,
        });
        self.active_pool
            .increase_debt(bo, self.params.gas_compensation)?;
        self.gas_pool.deposit(bo, self.params.gas_compensation)?;
        self.queue(Interaction::MintStable {
            to: self.ids.gas_pool,
            amount: self.params.gas_compensation,
        });

        log!(
            INFO,
            "[open_trove] {owner} opened a trove with {} collateral and {composite_debt} debt",
            args.coll,
        );
        Ok(stake)
    }

    /// Changes collateral and/or debt of an active trove. `stable_balance` is
    /// the owner's stablecoin balance, checked against repayments.
    pub fn adjust_trove(
        &mut self,
        owner: Principal,
        args: AdjustTroveArgs,
        price: Price,
        stable_balance: Debt,
    ) -> Result<(), ProtocolError> {
        let is_recovery_mode = self.check_recovery_mode(price);
        if args.is_debt_increase {
            self.require_valid_max_fee_percentage(args.max_fee, is_recovery_mode)?;
            if args.debt_change.is_zero() {
                return Err(ProtocolError::InvalidArgument(
                    "debt increase requires a non-zero debt change".to_string(),
                ));
            }
        }
        if !args.coll_top_up.is_zero() && !args.coll_withdrawal.is_zero() {
            return Err(ProtocolError::InvalidArgument(
                "cannot withdraw and add collateral at the same time".to_string(),
            ));
        }
        if args.coll_top_up.is_zero() && args.coll_withdrawal.is_zero() && args.debt_change.is_zero()
        {
            return Err(ProtocolError::InvalidArgument(
                "there must be either a collateral change or a debt change".to_string(),
            ));
        }
        self.require_active(&owner)?;

        self.apply_pending_rewards(owner)?;
        let (coll_change, is_coll_increase) = if !args.coll_top_up.is_zero() {
            (args.coll_top_up, true)
        } else {
            (args.coll_withdrawal, false)
        };

        let mut net_debt_change = args.debt_change;
        if args.is_debt_increase && !is_recovery_mode {
            net_debt_change += self.trigger_borrowing_fee(owner, args.debt_change, args.max_fee)?;
        }

        let trove = self.trove_or_default(&owner);
        let old_icr = compute_cr(trove.coll, trove.debt, price);
        let new_coll = if is_coll_increase {
            trove.coll + coll_change
        } else {
            trove.coll.checked_sub(coll_change).ok_or_else(|| {
                ProtocolError::InvalidArgument(format!(
                    "cannot withdraw {coll_change} from a trove holding {}",
                    trove.coll
                ))
            })?
        };
        let new_debt = if args.is_debt_increase {
            trove.debt + net_debt_change
        } else {
            let repayable = self.net_debt(trove.debt);
            if net_debt_change > repayable {
                return Err(ProtocolError::InvalidArgument(format!(
                    "repayment {net_debt_change} exceeds the repayable debt {repayable}"
                )));
            }
            if repayable - net_debt_change < self.params.min_net_debt {
                return Err(ProtocolError::AmountTooLow {
                    minimum: self.params.min_net_debt.get(),
                });
            }
            if stable_balance < net_debt_change {
                return Err(ProtocolError::InsufficientBalance(format!(
                    "owner holds {stable_balance}, repaying {net_debt_change}"
                )));
            }
            trove.debt - net_debt_change
        };
        let new_icr = compute_cr(new_coll, new_debt, price);

        if is_recovery_mode {
            if !args.coll_withdrawal.is_zero() {
                return Err(ProtocolError::InvalidPositionState(
                    "collateral withdrawal not permitted in recovery mode".to_string(),
                ));
            }
            if args.is_debt_increase {
                if new_icr < self.params.ccr {
                    return Err(below_mcr("new ICR", new_icr, self.params.ccr));
                }
                if new_icr < old_icr {
                    return Err(below_mcr("new ICR", new_icr, old_icr));
                }
            }
        } else {
            if new_icr < self.params.mcr {
                return Err(below_mcr("new ICR", new_icr, self.params.mcr));
            }
            let new_tcr = self.new_tcr_from_trove_change(
                coll_change,
                is_coll_increase,
                net_debt_change,
                args.is_debt_increase,
                price,
            );
            if new_tcr < self.params.ccr {
                return Err(below_mcr("new TCR", new_tcr, self.params.ccr));
            }
        }

        {
            let trove = self.trove_mut(&owner);
            trove.coll = new_coll;
            trove.debt = new_debt;
        }
        self.update_stake_and_total_stakes(&owner);
        self.re_insert_sorted(
            owner,
            compute_nominal_cr(new_coll, new_debt),
            args.hints.upper,
            args.hints.lower,
        )?;
        record_trove_updated(self, owner, (trove.coll, trove.debt), TroveOperation::Adjust);

        let bo = self.ids.borrower_operations;
        if args.is_debt_increase {
            self.active_pool.increase_debt(bo, net_debt_change)?;
            self.queue(Interaction::MintStable {
                to: owner,
                amount: args.debt_change,
            });
        } else if !net_debt_change.is_zero() {
            self.active_pool.decrease_debt(bo, net_debt_change)?;
            self.queue(Interaction::BurnStable {
                from: owner,
                amount: net_debt_change,
            });
        }
        if is_coll_increase {
            self.pull_coll_into_active_pool(owner, coll_change)?;
        } else if !coll_change.is_zero() {
            self.send_active_coll_to_account(bo, owner, coll_change)?;
        }
        Ok(())
    }

    /// Repays the trove's debt and returns its collateral to the owner.
    pub fn close_trove(
        &mut self,
        owner: Principal,
        price: Price,
        stable_balance: Debt,
    ) -> Result<(), ProtocolError> {
        self.require_active(&owner)?;
        if self.check_recovery_mode(price) {
            return Err(ProtocolError::InvalidPositionState(
                "closing a trove is not permitted in recovery mode".to_string(),
            ));
        }
        self.apply_pending_rewards(owner)?;

        let trove = self.trove_or_default(&owner);
        let gas_compensation = self.params.gas_compensation;
        let repayment = trove.debt - gas_compensation;
        if stable_balance < repayment {
            return Err(ProtocolError::InsufficientBalance(format!(
                "owner holds {stable_balance}, closing requires {repayment}"
            )));
        }
        let new_tcr = self.new_tcr_from_trove_change(trove.coll, false, trove.debt, false, price);
        if new_tcr < self.params.ccr {
            return Err(below_mcr("new TCR", new_tcr, self.params.ccr));
        }

        self.remove_stake(&owner);
        self.deactivate_trove(owner, TroveStatus::ClosedByOwner)?;
        record_trove_updated(self, owner, (trove.coll, trove.debt), TroveOperation::Close);

        let bo = self.ids.borrower_operations;
        self.active_pool.decrease_debt(bo, repayment)?;
        self.queue(Interaction::BurnStable {
            from: owner,
            amount: repayment,
        });
        self.active_pool.decrease_debt(bo, gas_compensation)?;
        self.gas_pool.withdraw(bo, gas_compensation)?;
        self.queue(Interaction::BurnStable {
            from: self.ids.gas_pool,
            amount: gas_compensation,
        });
        self.send_active_coll_to_account(bo, owner, trove.coll)?;

        log!(INFO, "[close_trove] {owner} closed their trove");
        Ok(())
    }

    /// Pays out collateral left over from a capped liquidation or a full
    /// redemption.
    pub fn claim_collateral(&mut self, owner: Principal) -> Result<Coll, ProtocolError> {
        let amount = self
            .coll_surplus_pool
            .claim_coll(self.ids.borrower_operations, owner)?;
        self.total_coll_withdrawn += amount;
        self.queue(Interaction::TransferColl {
            from: self.ids.coll_surplus_pool,
            to: owner,
            amount,
        });
        self.record(Event::CollSurplusClaimed { owner, amount });
        Ok(amount)
    }

    pub fn provide_to_stability_pool(
        &mut self,
        depositor: Principal,
        amount: Debt,
        stable_balance: Debt,
    ) -> Result<(), ProtocolError> {
        if amount.is_zero() {
            return Err(ProtocolError::AmountTooLow { minimum: 1 });
        }
        if stable_balance < amount {
            return Err(ProtocolError::InsufficientBalance(format!(
                "depositor holds {stable_balance}, depositing {amount}"
            )));
        }
        let gain = self.pay_out_collateral_gain(depositor);
        self.stability_pool.provide(depositor, amount);
        self.queue(Interaction::TransferStable {
            from: depositor,
            to: self.ids.stability_pool,
            amount,
        });
        self.record(Event::StabilityDepositUpdated {
            depositor,
            deposit: self.stability_pool.deposit_of(&depositor),
            collateral_gain_paid: gain,
        });
        Ok(())
    }

    /// Withdraws up to `amount` of the deposit together with all collateral
    /// gains. Returns what was paid out.
    pub fn withdraw_from_stability_pool(
        &mut self,
        depositor: Principal,
        amount: Debt,
        price: Price,
    ) -> Result<(Debt, Coll), ProtocolError> {
        if self.stability_pool.deposit_of(&depositor).is_zero()
            && self.stability_pool.collateral_gain_of(&depositor).is_zero()
        {
            return Err(ProtocolError::InvalidPositionState(format!(
                "{depositor} has no stability deposit"
            )));
        }
        if !amount.is_zero() {
            if let Some(lowest) = self.sorted_troves.last() {
                let icr = self.current_icr(&lowest, price);
                if icr < self.params.mcr {
                    return Err(ProtocolError::BelowMinimumCollateralization(format!(
                        "cannot withdraw while trove {lowest} has ICR {icr} below MCR"
                    )));
                }
            }
        }

        let gain = self.pay_out_collateral_gain(depositor);
        let withdrawn = self.stability_pool.withdraw(depositor, amount);
        if !withdrawn.is_zero() {
            self.queue(Interaction::TransferStable {
                from: self.ids.stability_pool,
                to: depositor,
                amount: withdrawn,
            });
        }
        self.record(Event::StabilityDepositUpdated {
            depositor,
            deposit: self.stability_pool.deposit_of(&depositor),
            collateral_gain_paid: gain,
        });
        Ok((withdrawn, gain))
    }

    fn pay_out_collateral_gain(&mut self, depositor: Principal) -> Coll {
        let gain = self.stability_pool.take_collateral_gain(depositor);
        if !gain.is_zero() {
            self.total_coll_withdrawn += gain;
            self.queue(Interaction::TransferColl {
                from: self.ids.stability_pool,
                to: depositor,
                amount: gain,
            });
        }
        gain
    }

    fn new_tcr_from_trove_change(
        &self,
        coll_change: Coll,
        is_coll_increase: bool,
        debt_change: Debt,
        is_debt_increase: bool,
        price: Price,
    ) -> Ratio {
        let coll = self.entire_system_coll();
        let debt = self.entire_system_debt();
        let new_coll = if is_coll_increase {
            coll + coll_change
        } else {
            coll.saturating_sub(coll_change)
        };
        let new_debt = if is_debt_increase {
            debt + debt_change
        } else {
            debt.saturating_sub(debt_change)
        };
        compute_cr(new_coll, new_debt, price)
    }
}
