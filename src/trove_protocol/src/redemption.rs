//! Redemption of stablecoin against the collateral of the riskiest troves
//! that are still above the minimum collateral ratio.

use crate::event::{record_trove_updated, Event, TroveOperation};
use crate::fees::require_user_accepts_fee;
use crate::numeric::{
    compute_nominal_cr, debt_to_coll, mul_div, Coll, Debt, NominalRatio, Price, Ratio,
    DECIMAL_PRECISION,
};
use crate::state::{Interaction, State};
use crate::trove::TroveStatus;
use crate::{ProtocolError, DEBUG, INFO};
use candid::Principal;
use ic_canister_log::log;
use serde::Serialize;

/// Caller-supplied positions that let the walk skip traversals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedemptionHints {
    /// Expected first trove to redeem from.
    pub first: Option<Principal>,
    /// Neighbours of the final partially redeemed trove after re-insertion.
    pub upper: Option<Principal>,
    pub lower: Option<Principal>,
    /// Expected nominal ratio of the final partially redeemed trove. Without
    /// it the partial redemption is never cancelled as stale.
    pub partial_nicr: Option<NominalRatio>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedeemArgs {
    pub amount: Debt,
    pub hints: RedemptionHints,
    /// Number of troves to visit; zero means no limit.
    pub max_iterations: usize,
    pub max_fee: Ratio,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RedemptionTotals {
    pub attempted: Debt,
    pub total_debt_to_redeem: Debt,
    pub total_coll_drawn: Coll,
    pub coll_fee: Coll,
    pub coll_to_send_to_redeemer: Coll,
    pub decayed_base_rate: Ratio,
    pub new_base_rate: Ratio,
    pub troves_visited: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SingleRedemption {
    Redeemed { debt_lot: Debt, coll_lot: Coll },
    Cancelled(CancelReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CancelReason {
    StaleNicrHint,
    BelowMinNetDebt,
}

impl State {
    pub fn redeem_collateral(
        &mut self,
        redeemer: Principal,
        args: RedeemArgs,
        price: Price,
        redeemer_balance: Debt,
    ) -> Result<RedemptionTotals, ProtocolError> {
        if args.max_fee < self.params.redemption_fee_floor || args.max_fee > Ratio::ONE {
            return Err(ProtocolError::InvalidArgument(format!(
                "max fee percentage must be between {} and 100%",
                self.params.redemption_fee_floor
            )));
        }
        let redemptions_open_at = self
            .deployment_time
            .saturating_add(self.params.bootstrap_period_nanos);
        if self.now < redemptions_open_at {
            return Err(ProtocolError::RedemptionBlocked {
                until: redemptions_open_at,
            });
        }
        let tcr = self.tcr(price);
        if tcr < self.params.mcr {
            return Err(ProtocolError::BelowMinimumCollateralization(format!(
                "cannot redeem when TCR {tcr} < MCR {}",
                self.params.mcr
            )));
        }
        if args.amount.is_zero() {
            return Err(ProtocolError::AmountTooLow { minimum: 1 });
        }
        if redeemer_balance < args.amount {
            return Err(ProtocolError::InsufficientBalance(format!(
                "redeemer holds {redeemer_balance}, redeeming {}",
                args.amount
            )));
        }

        let total_supply_at_start = self.entire_system_debt();
        let mut totals = RedemptionTotals {
            attempted: args.amount,
            ..Default::default()
        };
        let mut remaining = args.amount;
        let mut current = self.first_redemption_candidate(args.hints.first, price);
        let mut iterations_left = if args.max_iterations == 0 {
            usize::MAX
        } else {
            args.max_iterations
        };
        let mut cancelled = None;

        // Stops at the first trove below MCR rather than walking past it.
        while let Some(borrower) = current {
            if remaining.is_zero()
                || iterations_left == 0
                || self.current_icr(&borrower, price) < self.params.mcr
            {
                break;
            }
            iterations_left -= 1;
            totals.troves_visited += 1;
            // Saved before the trove may move or close.
            let next = self.sorted_troves.prev(&borrower);

            self.apply_pending_rewards(borrower)?;
            match self.redeem_collateral_from_trove(borrower, remaining, price, &args.hints)? {
                SingleRedemption::Cancelled(reason) => {
                    log!(DEBUG, "[redeem_collateral] stopped at {borrower}: {reason:?}");
                    cancelled = Some(reason);
                    break;
                }
                SingleRedemption::Redeemed { debt_lot, coll_lot } => {
                    totals.total_debt_to_redeem += debt_lot;
                    totals.total_coll_drawn += coll_lot;
                    remaining -= debt_lot;
                }
            }
            current = next;
        }

        if totals.total_coll_drawn.is_zero() {
            return Err(match cancelled {
                Some(CancelReason::StaleNicrHint) => ProtocolError::InvalidHint,
                _ => ProtocolError::NothingToRedeem,
            });
        }

        totals.decayed_base_rate = self.calc_decayed_base_rate();
        totals.new_base_rate =
            self.update_base_rate_from_redemption(totals.total_coll_drawn, price, total_supply_at_start);
        totals.coll_fee = self.redemption_fee(totals.total_coll_drawn)?;
        require_user_accepts_fee(totals.coll_fee, totals.total_coll_drawn, args.max_fee)?;
        totals.coll_to_send_to_redeemer = totals.total_coll_drawn - totals.coll_fee;

        self.send_active_coll_to_account(self.ids.trove_manager, self.ids.fee_recipient, totals.coll_fee)?;
        self.record(Event::Redemption {
            redeemer,
            attempted: args.amount,
            actual: totals.total_debt_to_redeem,
            coll_sent: totals.coll_to_send_to_redeemer,
            coll_fee: totals.coll_fee,
        });

        self.active_pool
            .decrease_debt(self.ids.trove_manager, totals.total_debt_to_redeem)?;
        self.queue(Interaction::BurnStable {
            from: redeemer,
            amount: totals.total_debt_to_redeem,
        });
        self.send_active_coll_to_account(
            self.ids.trove_manager,
            redeemer,
            totals.coll_to_send_to_redeemer,
        )?;

        log!(
            INFO,
            "[redeem_collateral] {redeemer} redeemed {} of {} for {} collateral (fee {})",
            totals.total_debt_to_redeem,
            args.amount,
            totals.coll_to_send_to_redeemer,
            totals.coll_fee,
        );
        Ok(totals)
    }

    /// A valid first hint is an active trove at or above MCR whose successor
    /// towards the tail is below MCR or absent.
    pub fn is_valid_first_redemption_hint(&self, hint: Option<Principal>, price: Price) -> bool {
        let Some(hint) = hint else {
            return false;
        };
        if !self.sorted_troves.contains(&hint) || self.current_icr(&hint, price) < self.params.mcr {
            return false;
        }
        match self.sorted_troves.next(&hint) {
            None => true,
            Some(next) => self.current_icr(&next, price) < self.params.mcr,
        }
    }

    fn first_redemption_candidate(&self, hint: Option<Principal>, price: Price) -> Option<Principal> {
        if self.is_valid_first_redemption_hint(hint, price) {
            return hint;
        }
        let mut current = self.sorted_troves.last();
        while let Some(borrower) = current {
            if self.current_icr(&borrower, price) >= self.params.mcr {
                break;
            }
            current = self.sorted_troves.prev(&borrower);
        }
        current
    }

    fn redeem_collateral_from_trove(
        &mut self,
        borrower: Principal,
        max_debt: Debt,
        price: Price,
        hints: &RedemptionHints,
    ) -> Result<SingleRedemption, ProtocolError> {
        let trove = self.trove_or_default(&borrower);
        let gas_compensation = self.params.gas_compensation;
        let debt_lot = max_debt.min(trove.debt - gas_compensation);
        let coll_lot = debt_to_coll(debt_lot, price);
        let new_debt = trove.debt - debt_lot;
        let new_coll = trove.coll - coll_lot;

        if new_debt == gas_compensation {
            self.remove_stake(&borrower);
            self.deactivate_trove(borrower, TroveStatus::ClosedByRedemption)?;
            self.redeem_close_trove(borrower, gas_compensation, new_coll)?;
            record_trove_updated(
                self,
                borrower,
                (trove.coll, trove.debt),
                TroveOperation::RedeemCollateral,
            );
        } else {
            let new_nicr = compute_nominal_cr(new_coll, new_debt);
            if let Some(hint) = hints.partial_nicr {
                if !self.within_partial_nicr_tolerance(hint, new_nicr) {
                    return Ok(SingleRedemption::Cancelled(CancelReason::StaleNicrHint));
                }
            }
            if self.net_debt(new_debt) < self.params.min_net_debt {
                return Ok(SingleRedemption::Cancelled(CancelReason::BelowMinNetDebt));
            }

            {
                let trove = self.trove_mut(&borrower);
                trove.debt = new_debt;
                trove.coll = new_coll;
            }
            self.re_insert_sorted(borrower, new_nicr, hints.upper, hints.lower)?;
            self.update_stake_and_total_stakes(&borrower);
            record_trove_updated(
                self,
                borrower,
                (trove.coll, trove.debt),
                TroveOperation::RedeemCollateral,
            );
        }
        Ok(SingleRedemption::Redeemed { debt_lot, coll_lot })
    }

    fn within_partial_nicr_tolerance(&self, hint: NominalRatio, actual: NominalRatio) -> bool {
        let tolerance = mul_div(
            hint.get(),
            self.params.partial_redemption_nicr_tolerance.get(),
            DECIMAL_PRECISION,
        );
        hint.abs_diff(actual) <= tolerance
    }

    /// Burns the gas compensation of a fully redeemed trove and parks its
    /// remaining collateral in the surplus pool for the owner.
    fn redeem_close_trove(
        &mut self,
        borrower: Principal,
        gas_compensation: Debt,
        coll: Coll,
    ) -> Result<(), ProtocolError> {
        self.gas_pool
            .withdraw(self.ids.trove_manager, gas_compensation)?;
        self.queue(Interaction::BurnStable {
            from: self.ids.gas_pool,
            amount: gas_compensation,
        });
        self.active_pool
            .decrease_debt(self.ids.trove_manager, gas_compensation)?;

        if !coll.is_zero() {
            self.coll_surplus_pool
                .account_surplus(self.ids.trove_manager, borrower, coll)?;
            self.record(Event::CollSurplusAccounted {
                owner: borrower,
                amount: coll,
            });
            self.send_active_coll_to_surplus_pool(coll)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SystemIds;
    use crate::config::ProtocolConfig;

    #[test]
    fn nicr_tolerance_is_relative_to_the_hint() {
        let s = State::new(ProtocolConfig::default(), SystemIds::derived(), 0).unwrap();
        let hint = NominalRatio::new(10_000 * DECIMAL_PRECISION);
        // default tolerance is 0.01%
        assert!(s.within_partial_nicr_tolerance(hint, NominalRatio::new(10_001 * DECIMAL_PRECISION)));
        assert!(!s.within_partial_nicr_tolerance(hint, NominalRatio::new(10_002 * DECIMAL_PRECISION)));
    }
}
