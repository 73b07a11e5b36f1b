//! Base rate bookkeeping and the borrowing and redemption fees derived from it.

use crate::config::MINUTE_NANOS;
use crate::event::{record_base_rate_updated, Event};
use crate::numeric::{dec_pow, mul_div, Coll, Debt, Price, Ratio, DECIMAL_PRECISION};
use crate::state::{Interaction, State};
use crate::ProtocolError;
use candid::Principal;

/// Fails when `fee` is a larger fraction of `amount` than the caller accepted.
pub fn require_user_accepts_fee<U>(
    fee: crate::numeric::Amount<U>,
    amount: crate::numeric::Amount<U>,
    max_fee: Ratio,
) -> Result<(), ProtocolError> {
    if amount.is_zero() {
        return Ok(());
    }
    let fee_fraction = Ratio::new(mul_div(fee.get(), DECIMAL_PRECISION, amount.get()));
    if fee_fraction > max_fee {
        return Err(ProtocolError::FeeExceedsMaximum {
            fee: fee_fraction,
            max_fee,
        });
    }
    Ok(())
}

impl State {
    pub fn minutes_passed_since_last_fee_op(&self) -> u64 {
        self.now.saturating_sub(self.last_fee_operation_time) / MINUTE_NANOS
    }

    pub fn calc_decayed_base_rate(&self) -> Ratio {
        let decay = dec_pow(
            self.params.minute_decay_factor,
            self.minutes_passed_since_last_fee_op(),
        );
        self.base_rate.mul(decay)
    }

    pub fn borrowing_rate(&self) -> Ratio {
        self.calc_borrowing_rate(self.base_rate)
    }

    pub fn borrowing_rate_with_decay(&self) -> Ratio {
        self.calc_borrowing_rate(self.calc_decayed_base_rate())
    }

    fn calc_borrowing_rate(&self, base_rate: Ratio) -> Ratio {
        self.params
            .borrowing_fee_floor
            .saturating_add(base_rate)
            .min(self.params.max_borrowing_fee)
    }

    pub fn borrowing_fee(&self, debt: Debt) -> Debt {
        self.borrowing_rate().apply(debt)
    }

    pub fn borrowing_fee_with_decay(&self, debt: Debt) -> Debt {
        self.borrowing_rate_with_decay().apply(debt)
    }

    pub fn redemption_rate(&self) -> Ratio {
        self.calc_redemption_rate(self.base_rate)
    }

    pub fn redemption_rate_with_decay(&self) -> Ratio {
        self.calc_redemption_rate(self.calc_decayed_base_rate())
    }

    fn calc_redemption_rate(&self, base_rate: Ratio) -> Ratio {
        self.params
            .redemption_fee_floor
            .saturating_add(base_rate)
            .min(Ratio::ONE)
    }

    /// Fee on `coll_drawn` at the current (already updated) base rate.
    pub fn redemption_fee(&self, coll_drawn: Coll) -> Result<Coll, ProtocolError> {
        let fee = self.redemption_rate().apply(coll_drawn);
        if fee >= coll_drawn {
            return Err(ProtocolError::InvalidArgument(
                "fee would eat up all redeemed collateral".to_string(),
            ));
        }
        Ok(fee)
    }

    pub fn redemption_fee_with_decay(&self, coll_drawn: Coll) -> Coll {
        self.redemption_rate_with_decay().apply(coll_drawn)
    }

    fn update_last_fee_op_time(&mut self) {
        let elapsed = self.now.saturating_sub(self.last_fee_operation_time);
        if elapsed >= MINUTE_NANOS {
            self.last_fee_operation_time = self.now;
            self.record(Event::LastFeeOpTimeUpdated {
                timestamp: self.now,
            });
        }
    }

    pub(crate) fn decay_base_rate_from_borrowing(&mut self) {
        let decayed = self.calc_decayed_base_rate();
        assert!(decayed <= Ratio::ONE, "bug: base rate above 100%");
        self.base_rate = decayed;
        record_base_rate_updated(self);
        self.update_last_fee_op_time();
    }

    /// Decays the base rate, then raises it by the redeemed fraction of the
    /// supply divided by beta.
    pub(crate) fn update_base_rate_from_redemption(
        &mut self,
        coll_drawn: Coll,
        price: Price,
        total_supply: Debt,
    ) -> Ratio {
        let decayed = self.calc_decayed_base_rate();
        let redeemed_fraction = if total_supply.is_zero() {
            Ratio::ONE
        } else {
            Ratio::new(mul_div(coll_drawn.get(), price.get(), total_supply.get()))
        };
        let increase = Ratio::new(redeemed_fraction.get() / self.params.base_rate_beta);
        let new_base_rate = decayed.saturating_add(increase).min(Ratio::ONE);
        assert!(
            new_base_rate > Ratio::ZERO,
            "bug: base rate is zero after redemption"
        );
        self.base_rate = new_base_rate;
        record_base_rate_updated(self);
        self.update_last_fee_op_time();
        new_base_rate
    }

    /// Charges the borrowing fee on a debt increase: decays the base rate,
    /// checks the caller's limit and mints the fee to the fee recipient.
    pub(crate) fn trigger_borrowing_fee(
        &mut self,
        borrower: Principal,
        amount: Debt,
        max_fee: Ratio,
    ) -> Result<Debt, ProtocolError> {
        self.decay_base_rate_from_borrowing();
        let fee = self.borrowing_fee(amount);
        require_user_accepts_fee(fee, amount, max_fee)?;
        if !fee.is_zero() {
            self.queue(Interaction::MintStable {
                to: self.ids.fee_recipient,
                amount: fee,
            });
            self.record(Event::BorrowingFeePaid { borrower, fee });
        }
        Ok(fee)
    }

    /// Recovery mode accepts any limit up to 100%; normal mode also requires
    /// the limit to cover the fee floor.
    pub(crate) fn require_valid_max_fee_percentage(
        &self,
        max_fee: Ratio,
        is_recovery_mode: bool,
    ) -> Result<(), ProtocolError> {
        if is_recovery_mode {
            if max_fee > Ratio::ONE {
                return Err(ProtocolError::InvalidArgument(
                    "max fee percentage must be less than or equal to 100%".to_string(),
                ));
            }
        } else if max_fee < self.params.borrowing_fee_floor || max_fee > Ratio::ONE {
            return Err(ProtocolError::InvalidArgument(format!(
                "max fee percentage must be between {} and 100%",
                self.params.borrowing_fee_floor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SystemIds;
    use crate::config::ProtocolConfig;
    use assert_matches::assert_matches;

    const E18: u128 = DECIMAL_PRECISION;

    fn state() -> State {
        State::new(ProtocolConfig::default(), SystemIds::derived(), 0).unwrap()
    }

    #[test]
    fn base_rate_halves_in_about_twelve_hours() {
        let mut s = state();
        s.base_rate = Ratio::new(E18 / 10);
        s.now = 720 * MINUTE_NANOS;
        let decayed = s.calc_decayed_base_rate().get();
        let half = E18 / 20;
        assert!(decayed.abs_diff(half) < E18 / 10_000, "decayed to {decayed}");
    }

    #[test]
    fn fee_time_only_moves_after_a_full_minute() {
        let mut s = state();
        s.now = MINUTE_NANOS - 1;
        s.decay_base_rate_from_borrowing();
        assert_eq!(s.last_fee_operation_time, 0);
        s.now = MINUTE_NANOS;
        s.decay_base_rate_from_borrowing();
        assert_eq!(s.last_fee_operation_time, MINUTE_NANOS);
    }

    #[test]
    fn borrowing_rate_is_capped() {
        let mut s = state();
        assert_eq!(s.borrowing_rate(), s.params.borrowing_fee_floor);
        s.base_rate = Ratio::new(E18 / 2);
        assert_eq!(s.borrowing_rate(), s.params.max_borrowing_fee);
        assert_eq!(
            s.borrowing_fee(Debt::new(1_000 * E18)),
            Debt::new(50 * E18)
        );
    }

    #[test]
    fn redemption_raises_base_rate_by_fraction_over_beta() {
        let mut s = state();
        // 10 coll at price 100 out of a 10_000 supply: 10%, halved by beta.
        let rate = s.update_base_rate_from_redemption(
            Coll::new(10 * E18),
            Price::new(100 * E18),
            Debt::new(10_000 * E18),
        );
        assert_eq!(rate, Ratio::new(E18 / 20));
        assert_eq!(
            s.redemption_fee(Coll::new(10 * E18)).unwrap(),
            Coll::new(E18 / 2 + E18 / 20)
        );
    }

    #[test]
    fn fee_above_limit_is_rejected() {
        let mut s = state();
        s.base_rate = Ratio::new(E18 / 50);
        assert_matches!(
            s.trigger_borrowing_fee(
                Principal::anonymous(),
                Debt::new(1_000 * E18),
                Ratio::new(E18 / 100)
            ),
            Err(ProtocolError::FeeExceedsMaximum { .. })
        );
    }

    #[test]
    fn borrowing_fee_is_minted_to_fee_recipient() {
        let mut s = state();
        let fee = s
            .trigger_borrowing_fee(Principal::anonymous(), Debt::new(2_000 * E18), Ratio::ONE)
            .unwrap();
        assert_eq!(fee, Debt::new(10 * E18));
        assert_eq!(
            s.outbox,
            vec![Interaction::MintStable {
                to: s.ids.fee_recipient,
                amount: fee
            }]
        );
    }

    #[test]
    fn max_fee_bounds_depend_on_mode() {
        let s = state();
        assert!(s
            .require_valid_max_fee_percentage(Ratio::new(E18 / 1000), true)
            .is_ok());
        assert_matches!(
            s.require_valid_max_fee_percentage(Ratio::new(E18 / 1000), false),
            Err(ProtocolError::InvalidArgument(_))
        );
    }
}
