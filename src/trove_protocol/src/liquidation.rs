//! Liquidation of undercollateralized troves in normal and recovery mode.
//!
//! Every liquidated trove splits into a part offset against the stability
//! pool, a part redistributed to the remaining troves, gas compensation for
//! the liquidator and, for capped recovery mode liquidations, a surplus the
//! owner can claim later.

use crate::event::{record_trove_updated, Event, TroveOperation};
use crate::numeric::{compute_cr, debt_to_coll, Coll, Debt, Price, Ratio};
use crate::state::{Interaction, Mode, State};
use crate::trove::TroveStatus;
use crate::{ProtocolError, INFO};
use candid::Principal;
use ic_canister_log::log;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiquidationValues {
    pub entire_trove_debt: Debt,
    pub entire_trove_coll: Coll,
    pub coll_gas_compensation: Coll,
    pub debt_gas_compensation: Debt,
    pub debt_to_offset: Debt,
    pub coll_to_send_to_sp: Coll,
    pub debt_to_redistribute: Debt,
    pub coll_to_redistribute: Coll,
    pub coll_surplus: Coll,
}

/// Aggregate outcome of a liquidation call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LiquidationTotals {
    pub total_coll_in_sequence: Coll,
    pub total_debt_in_sequence: Debt,
    pub total_coll_gas_compensation: Coll,
    pub total_debt_gas_compensation: Debt,
    pub total_debt_to_offset: Debt,
    pub total_coll_to_send_to_sp: Coll,
    pub total_debt_to_redistribute: Debt,
    pub total_coll_to_redistribute: Coll,
    pub total_coll_surplus: Coll,
    pub liquidated_count: usize,
}

impl LiquidationTotals {
    fn add(&mut self, single: &LiquidationValues) {
        if single.entire_trove_debt.is_zero() {
            return;
        }
        self.total_coll_gas_compensation += single.coll_gas_compensation;
        self.total_debt_gas_compensation += single.debt_gas_compensation;
        self.total_debt_in_sequence += single.entire_trove_debt;
        self.total_coll_in_sequence += single.entire_trove_coll;
        self.total_debt_to_offset += single.debt_to_offset;
        self.total_coll_to_send_to_sp += single.coll_to_send_to_sp;
        self.total_debt_to_redistribute += single.debt_to_redistribute;
        self.total_coll_to_redistribute += single.coll_to_redistribute;
        self.total_coll_surplus += single.coll_surplus;
        self.liquidated_count += 1;
    }
}

/// Splits debt and collateral between the stability pool, up to its
/// deposits, and redistribution.
fn offset_and_redistribution_vals(
    debt: Debt,
    coll: Coll,
    debt_in_stability_pool: Debt,
) -> (Debt, Coll, Debt, Coll) {
    if debt_in_stability_pool.is_zero() {
        return (Debt::ZERO, Coll::ZERO, debt, coll);
    }
    let debt_to_offset = debt.min(debt_in_stability_pool);
    let coll_to_send_to_sp = coll.mul_div(debt_to_offset.get(), debt.get());
    (
        debt_to_offset,
        coll_to_send_to_sp,
        debt - debt_to_offset,
        coll - coll_to_send_to_sp,
    )
}

impl State {
    /// Liquidates a single trove under the policy of the current mode.
    pub fn liquidate(
        &mut self,
        borrower: Principal,
        liquidator: Principal,
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        self.require_active(&borrower)?;
        self.batch_liquidate_troves(&[borrower], liquidator, price)
    }

    /// Liquidates up to `n` troves, starting from the lowest collateral ratio.
    pub fn liquidate_troves(
        &mut self,
        n: usize,
        liquidator: Principal,
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        let totals = if self.check_recovery_mode(price) {
            self.totals_from_liquidate_troves_sequence_recovery_mode(n, price)?
        } else {
            self.totals_from_liquidate_troves_sequence_normal_mode(n, price)?
        };
        self.finish_liquidation(totals, liquidator)
    }

    /// Liquidates the listed troves that qualify, skipping the others.
    pub fn batch_liquidate_troves(
        &mut self,
        borrowers: &[Principal],
        liquidator: Principal,
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        if borrowers.is_empty() {
            return Err(ProtocolError::InvalidArgument(
                "borrowers array must not be empty".to_string(),
            ));
        }
        let totals = if self.check_recovery_mode(price) {
            self.totals_from_batch_liquidate_recovery_mode(borrowers, price)?
        } else {
            self.totals_from_batch_liquidate_normal_mode(borrowers, price)?
        };
        self.finish_liquidation(totals, liquidator)
    }

    fn finish_liquidation(
        &mut self,
        totals: LiquidationTotals,
        liquidator: Principal,
    ) -> Result<LiquidationTotals, ProtocolError> {
        if totals.total_debt_in_sequence.is_zero() {
            return Err(ProtocolError::NothingToLiquidate);
        }

        self.offset_with_stability_pool(totals.total_debt_to_offset, totals.total_coll_to_send_to_sp)?;
        self.redistribute_debt_and_coll(
            totals.total_debt_to_redistribute,
            totals.total_coll_to_redistribute,
        )?;
        if !totals.total_coll_surplus.is_zero() {
            self.send_active_coll_to_surplus_pool(totals.total_coll_surplus)?;
        }

        self.update_system_snapshots_exclude_coll_remainder(totals.total_coll_gas_compensation);

        let liquidated_coll = totals.total_coll_in_sequence
            - totals.total_coll_gas_compensation
            - totals.total_coll_surplus;
        self.record(Event::Liquidation {
            liquidator,
            liquidated_debt: totals.total_debt_in_sequence,
            liquidated_coll,
            coll_gas_compensation: totals.total_coll_gas_compensation,
            debt_gas_compensation: totals.total_debt_gas_compensation,
        });

        self.send_gas_compensation(
            liquidator,
            totals.total_debt_gas_compensation,
            totals.total_coll_gas_compensation,
        )?;

        log!(
            INFO,
            "[liquidation] {} troves, debt {} coll {}, offset {}, redistributed {}",
            totals.liquidated_count,
            totals.total_debt_in_sequence,
            totals.total_coll_in_sequence,
            totals.total_debt_to_offset,
            totals.total_debt_to_redistribute,
        );
        Ok(totals)
    }

    /// Cancels `debt` against stability pool deposits, burning the deposited
    /// stablecoin, and hands `coll` to the depositors.
    fn offset_with_stability_pool(&mut self, debt: Debt, coll: Coll) -> Result<(), ProtocolError> {
        if debt.is_zero() {
            return Ok(());
        }
        self.stability_pool
            .offset(self.ids.trove_manager, debt, coll)?;
        self.active_pool
            .decrease_debt(self.ids.stability_pool, debt)?;
        self.queue(Interaction::BurnStable {
            from: self.ids.stability_pool,
            amount: debt,
        });
        self.send_active_coll_to_stability_pool(coll)?;
        self.record(Event::StabilityPoolOffset { debt, coll });
        Ok(())
    }

    fn send_gas_compensation(
        &mut self,
        liquidator: Principal,
        debt: Debt,
        coll: Coll,
    ) -> Result<(), ProtocolError> {
        if !debt.is_zero() {
            self.gas_pool.withdraw(self.ids.trove_manager, debt)?;
            self.queue(Interaction::TransferStable {
                from: self.ids.gas_pool,
                to: liquidator,
                amount: debt,
            });
        }
        if !coll.is_zero() {
            self.send_active_coll_to_account(self.ids.trove_manager, liquidator, coll)?;
        }
        Ok(())
    }

    fn liquidation_values_for(&self, borrower: &Principal) -> LiquidationValues {
        let entire = self.entire_debt_and_coll(borrower);
        LiquidationValues {
            entire_trove_debt: entire.debt,
            entire_trove_coll: entire.coll,
            coll_gas_compensation: self.coll_gas_compensation(entire.coll),
            debt_gas_compensation: self.params.gas_compensation,
            ..Default::default()
        }
    }

    /// Pulls the trove's pending rewards into the active pool, removes its
    /// stake and closes it.
    fn close_liquidated_trove(
        &mut self,
        borrower: Principal,
        values: &LiquidationValues,
        mode: Mode,
    ) -> Result<(), ProtocolError> {
        let entire = self.entire_debt_and_coll(&borrower);
        let trove = self.trove_or_default(&borrower);
        self.move_pending_trove_rewards_to_active_pool(
            entire.pending_debt_reward,
            entire.pending_coll_reward,
        )?;
        self.remove_stake(&borrower);
        self.deactivate_trove(borrower, TroveStatus::ClosedByLiquidation)?;
        self.record(Event::TroveLiquidated {
            borrower,
            debt: values.entire_trove_debt,
            coll: values.entire_trove_coll,
            mode,
        });
        record_trove_updated(
            self,
            borrower,
            (trove.coll, trove.debt),
            TroveOperation::liquidation(mode),
        );
        Ok(())
    }

    fn liquidate_normal_mode(
        &mut self,
        borrower: Principal,
        debt_in_stability_pool: Debt,
    ) -> Result<LiquidationValues, ProtocolError> {
        let mut values = self.liquidation_values_for(&borrower);
        let coll_to_liquidate = values.entire_trove_coll - values.coll_gas_compensation;
        (
            values.debt_to_offset,
            values.coll_to_send_to_sp,
            values.debt_to_redistribute,
            values.coll_to_redistribute,
        ) = offset_and_redistribution_vals(
            values.entire_trove_debt,
            coll_to_liquidate,
            debt_in_stability_pool,
        );
        self.close_liquidated_trove(borrower, &values, Mode::Normal)?;
        Ok(values)
    }

    /// Applies the recovery mode policy to one trove. Returns empty values
    /// when the trove is skipped.
    fn liquidate_recovery_mode(
        &mut self,
        borrower: Principal,
        icr: Ratio,
        debt_in_stability_pool: Debt,
        tcr: Ratio,
        price: Price,
    ) -> Result<LiquidationValues, ProtocolError> {
        if self.trove_owners.len() <= 1 {
            return Ok(LiquidationValues::default());
        }
        let mut values = self.liquidation_values_for(&borrower);
        let coll_to_liquidate = values.entire_trove_coll - values.coll_gas_compensation;

        if icr <= Ratio::ONE {
            values.debt_to_redistribute = values.entire_trove_debt;
            values.coll_to_redistribute = coll_to_liquidate;
        } else if icr < self.params.mcr {
            (
                values.debt_to_offset,
                values.coll_to_send_to_sp,
                values.debt_to_redistribute,
                values.coll_to_redistribute,
            ) = offset_and_redistribution_vals(
                values.entire_trove_debt,
                coll_to_liquidate,
                debt_in_stability_pool,
            );
        } else if icr < tcr && values.entire_trove_debt <= debt_in_stability_pool {
            assert!(
                !debt_in_stability_pool.is_zero(),
                "bug: capped liquidation with an empty stability pool"
            );
            values = self.capped_offset_vals(values, price);
        } else {
            return Ok(LiquidationValues::default());
        }

        self.close_liquidated_trove(borrower, &values, Mode::Recovery)?;
        if !values.coll_surplus.is_zero() {
            self.coll_surplus_pool.account_surplus(
                self.ids.trove_manager,
                borrower,
                values.coll_surplus,
            )?;
            self.record(Event::CollSurplusAccounted {
                owner: borrower,
                amount: values.coll_surplus,
            });
        }
        Ok(values)
    }

    /// The stability pool absorbs the whole debt against collateral worth
    /// MCR times the debt; whatever is left becomes the owner's surplus.
    fn capped_offset_vals(&self, values: LiquidationValues, price: Price) -> LiquidationValues {
        let capped_coll_portion = debt_to_coll(
            self.params.mcr.apply(values.entire_trove_debt),
            price,
        )
        .min(values.entire_trove_coll);
        let coll_gas_compensation = self.coll_gas_compensation(capped_coll_portion);
        LiquidationValues {
            coll_gas_compensation,
            debt_to_offset: values.entire_trove_debt,
            coll_to_send_to_sp: capped_coll_portion - coll_gas_compensation,
            debt_to_redistribute: Debt::ZERO,
            coll_to_redistribute: Coll::ZERO,
            coll_surplus: values.entire_trove_coll - capped_coll_portion,
            ..values
        }
    }

    fn totals_from_liquidate_troves_sequence_normal_mode(
        &mut self,
        n: usize,
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        let mut totals = LiquidationTotals::default();
        let mut remaining_in_sp = self.stability_pool.total_deposits();
        for _ in 0..n {
            let Some(borrower) = self.sorted_troves.last() else {
                break;
            };
            if self.trove_owners.len() <= 1 {
                break;
            }
            let icr = self.current_icr(&borrower, price);
            if icr >= self.params.mcr {
                break;
            }
            let single = self.liquidate_normal_mode(borrower, remaining_in_sp)?;
            remaining_in_sp -= single.debt_to_offset;
            totals.add(&single);
        }
        Ok(totals)
    }

    fn totals_from_liquidate_troves_sequence_recovery_mode(
        &mut self,
        n: usize,
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        let mut totals = LiquidationTotals::default();
        let mut remaining_in_sp = self.stability_pool.total_deposits();
        let mut system_debt = self.entire_system_debt();
        let mut system_coll = self.entire_system_coll();
        let mut back_to_normal_mode = false;

        let first = self.sorted_troves.first();
        let mut current = self.sorted_troves.last();
        for _ in 0..n {
            let Some(borrower) = current else {
                break;
            };
            // The head is never liquidated by a sequence.
            if Some(borrower) == first {
                break;
            }
            let next = self.sorted_troves.prev(&borrower);
            let icr = self.current_icr(&borrower, price);

            if !back_to_normal_mode {
                if icr >= self.params.mcr && remaining_in_sp.is_zero() {
                    break;
                }
                let tcr = compute_cr(system_coll, system_debt, price);
                let single =
                    self.liquidate_recovery_mode(borrower, icr, remaining_in_sp, tcr, price)?;
                remaining_in_sp -= single.debt_to_offset;
                system_debt -= single.debt_to_offset;
                system_coll -= single.coll_to_send_to_sp
                    + single.coll_gas_compensation
                    + single.coll_surplus;
                totals.add(&single);
                back_to_normal_mode =
                    !self.check_potential_recovery_mode(system_coll, system_debt, price);
            } else if icr < self.params.mcr {
                let single = self.liquidate_normal_mode(borrower, remaining_in_sp)?;
                remaining_in_sp -= single.debt_to_offset;
                totals.add(&single);
            } else {
                break;
            }
            current = next;
        }
        Ok(totals)
    }

    fn totals_from_batch_liquidate_normal_mode(
        &mut self,
        borrowers: &[Principal],
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        let mut totals = LiquidationTotals::default();
        let mut remaining_in_sp = self.stability_pool.total_deposits();
        for borrower in borrowers {
            if !self.is_active(borrower) || self.trove_owners.len() <= 1 {
                continue;
            }
            let icr = self.current_icr(borrower, price);
            if icr < self.params.mcr {
                let single = self.liquidate_normal_mode(*borrower, remaining_in_sp)?;
                remaining_in_sp -= single.debt_to_offset;
                totals.add(&single);
            }
        }
        Ok(totals)
    }

    fn totals_from_batch_liquidate_recovery_mode(
        &mut self,
        borrowers: &[Principal],
        price: Price,
    ) -> Result<LiquidationTotals, ProtocolError> {
        let mut totals = LiquidationTotals::default();
        let mut remaining_in_sp = self.stability_pool.total_deposits();
        let mut system_debt = self.entire_system_debt();
        let mut system_coll = self.entire_system_coll();
        let mut back_to_normal_mode = false;

        for borrower in borrowers {
            if !self.is_active(borrower) {
                continue;
            }
            let icr = self.current_icr(borrower, price);

            if !back_to_normal_mode {
                if icr >= self.params.mcr && remaining_in_sp.is_zero() {
                    continue;
                }
                let tcr = compute_cr(system_coll, system_debt, price);
                let single =
                    self.liquidate_recovery_mode(*borrower, icr, remaining_in_sp, tcr, price)?;
                remaining_in_sp -= single.debt_to_offset;
                system_debt -= single.debt_to_offset;
                system_coll -= single.coll_to_send_to_sp
                    + single.coll_gas_compensation
                    + single.coll_surplus;
                totals.add(&single);
                back_to_normal_mode =
                    !self.check_potential_recovery_mode(system_coll, system_debt, price);
            } else if icr < self.params.mcr && self.trove_owners.len() > 1 {
                let single = self.liquidate_normal_mode(*borrower, remaining_in_sp)?;
                remaining_in_sp -= single.debt_to_offset;
                totals.add(&single);
            }
        }
        Ok(totals)
    }
}
