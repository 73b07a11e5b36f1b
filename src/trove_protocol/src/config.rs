//! Protocol parameters.
//!
//! Ratios are written as decimals (`1.1` is 110%) and converted to 1e18 fixed
//! point once, when the ledger is created.

use crate::numeric::{Debt, Ratio, DECIMAL_PRECISION};
use crate::ProtocolError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const SEC_NANOS: u64 = 1_000_000_000;
pub const MINUTE_NANOS: u64 = 60 * SEC_NANOS;

pub const DEFAULT_MINIMUM_COLLATERAL_RATIO: Decimal = dec!(1.1); // 110%
pub const DEFAULT_CRITICAL_COLLATERAL_RATIO: Decimal = dec!(1.5); // 150%
pub const DEFAULT_GAS_COMPENSATION: u128 = 200 * DECIMAL_PRECISION;
pub const DEFAULT_MIN_NET_DEBT: u128 = 1_800 * DECIMAL_PRECISION;
pub const DEFAULT_LIQUIDATION_REWARD_DIVISOR: u128 = 200; // 0.5%
pub const DEFAULT_BORROWING_FEE_FLOOR: Decimal = dec!(0.005);
pub const DEFAULT_MAX_BORROWING_FEE: Decimal = dec!(0.05);
pub const DEFAULT_REDEMPTION_FEE_FLOOR: Decimal = dec!(0.005);
pub const DEFAULT_BASE_RATE_BETA: u128 = 2;
// 12-hour half-life per minute.
pub const DEFAULT_MINUTE_DECAY_FACTOR: Decimal = dec!(0.999037758833783);
pub const DEFAULT_BOOTSTRAP_PERIOD_SECS: u64 = 14 * 24 * 60 * 60;
pub const DEFAULT_MAX_HINT_TRAVERSAL: usize = 1_000;
pub const DEFAULT_PARTIAL_REDEMPTION_NICR_TOLERANCE: Decimal = dec!(0.0001);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Below this ratio a trove can be liquidated.
    pub minimum_collateral_ratio: Decimal,
    /// Below this system ratio the protocol is in recovery mode.
    pub critical_collateral_ratio: Decimal,
    /// Debt reserved in every trove to pay the liquidator.
    pub gas_compensation: u128,
    pub min_net_debt: u128,
    /// Collateral share paid to the liquidator is `coll / divisor`.
    pub liquidation_reward_divisor: u128,
    pub borrowing_fee_floor: Decimal,
    pub max_borrowing_fee: Decimal,
    pub redemption_fee_floor: Decimal,
    /// Redeemed fraction of the supply is divided by beta before it is
    /// added to the base rate.
    pub base_rate_beta: u128,
    pub minute_decay_factor: Decimal,
    /// Redemptions are rejected for this long after deployment.
    pub bootstrap_period_secs: u64,
    /// Upper bound on the nodes visited when a sorted-list hint is stale.
    pub max_hint_traversal: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_troves: Option<usize>,
    /// Relative distance between the partial redemption hint and the
    /// trove's new nominal ratio that is still accepted.
    pub partial_redemption_nicr_tolerance: Decimal,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            minimum_collateral_ratio: DEFAULT_MINIMUM_COLLATERAL_RATIO,
            critical_collateral_ratio: DEFAULT_CRITICAL_COLLATERAL_RATIO,
            gas_compensation: DEFAULT_GAS_COMPENSATION,
            min_net_debt: DEFAULT_MIN_NET_DEBT,
            liquidation_reward_divisor: DEFAULT_LIQUIDATION_REWARD_DIVISOR,
            borrowing_fee_floor: DEFAULT_BORROWING_FEE_FLOOR,
            max_borrowing_fee: DEFAULT_MAX_BORROWING_FEE,
            redemption_fee_floor: DEFAULT_REDEMPTION_FEE_FLOOR,
            base_rate_beta: DEFAULT_BASE_RATE_BETA,
            minute_decay_factor: DEFAULT_MINUTE_DECAY_FACTOR,
            bootstrap_period_secs: DEFAULT_BOOTSTRAP_PERIOD_SECS,
            max_hint_traversal: DEFAULT_MAX_HINT_TRAVERSAL,
            max_troves: None,
            partial_redemption_nicr_tolerance: DEFAULT_PARTIAL_REDEMPTION_NICR_TOLERANCE,
        }
    }
}

impl ProtocolConfig {
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let config: ProtocolConfig = serde_json::from_str(json)
            .map_err(|e| ProtocolError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |msg: &str| Err(ProtocolError::InvalidConfig(msg.to_string()));
        if self.minimum_collateral_ratio <= Decimal::ONE {
            return invalid("minimum collateral ratio must be above 100%");
        }
        if self.critical_collateral_ratio < self.minimum_collateral_ratio {
            return invalid("critical collateral ratio must not be below the minimum ratio");
        }
        if self.gas_compensation == 0 || self.min_net_debt == 0 {
            return invalid("gas compensation and minimum net debt must be positive");
        }
        if self.liquidation_reward_divisor == 0 {
            return invalid("liquidation reward divisor must be positive");
        }
        if self.borrowing_fee_floor > self.max_borrowing_fee || self.max_borrowing_fee > Decimal::ONE
        {
            return invalid("borrowing fee floor must not exceed the maximum borrowing fee");
        }
        if self.redemption_fee_floor > Decimal::ONE {
            return invalid("redemption fee floor must not exceed 100%");
        }
        if self.base_rate_beta == 0 {
            return invalid("base rate beta must be positive");
        }
        if self.minute_decay_factor <= Decimal::ZERO || self.minute_decay_factor >= Decimal::ONE {
            return invalid("minute decay factor must be in (0, 1)");
        }
        if self.max_hint_traversal == 0 {
            return invalid("hint traversal bound must be positive");
        }
        if self.max_troves == Some(0) {
            return invalid("trove capacity must be positive");
        }
        if self.partial_redemption_nicr_tolerance.is_sign_negative() {
            return invalid("partial redemption tolerance must not be negative");
        }
        self.params().map(|_| ())
    }

    /// Converts the configuration to the fixed-point form used by the ledger.
    pub fn params(&self) -> Result<Params, ProtocolError> {
        let ratio = |name: &str, value: Decimal| {
            Ratio::from_decimal(value)
                .ok_or_else(|| ProtocolError::InvalidConfig(format!("{name} is out of range")))
        };
        Ok(Params {
            mcr: ratio("minimum_collateral_ratio", self.minimum_collateral_ratio)?,
            ccr: ratio("critical_collateral_ratio", self.critical_collateral_ratio)?,
            gas_compensation: Debt::new(self.gas_compensation),
            min_net_debt: Debt::new(self.min_net_debt),
            liquidation_reward_divisor: self.liquidation_reward_divisor,
            borrowing_fee_floor: ratio("borrowing_fee_floor", self.borrowing_fee_floor)?,
            max_borrowing_fee: ratio("max_borrowing_fee", self.max_borrowing_fee)?,
            redemption_fee_floor: ratio("redemption_fee_floor", self.redemption_fee_floor)?,
            base_rate_beta: self.base_rate_beta,
            minute_decay_factor: ratio("minute_decay_factor", self.minute_decay_factor)?,
            bootstrap_period_nanos: self.bootstrap_period_secs.saturating_mul(SEC_NANOS),
            max_hint_traversal: self.max_hint_traversal,
            max_troves: self.max_troves,
            partial_redemption_nicr_tolerance: ratio(
                "partial_redemption_nicr_tolerance",
                self.partial_redemption_nicr_tolerance,
            )?,
        })
    }
}

/// Fixed-point view of [`ProtocolConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub mcr: Ratio,
    pub ccr: Ratio,
    pub gas_compensation: Debt,
    pub min_net_debt: Debt,
    pub liquidation_reward_divisor: u128,
    pub borrowing_fee_floor: Ratio,
    pub max_borrowing_fee: Ratio,
    pub redemption_fee_floor: Ratio,
    pub base_rate_beta: u128,
    pub minute_decay_factor: Ratio,
    pub bootstrap_period_nanos: u64,
    pub max_hint_traversal: usize,
    pub max_troves: Option<usize>,
    pub partial_redemption_nicr_tolerance: Ratio,
}

impl Default for Params {
    fn default() -> Self {
        match ProtocolConfig::default().params() {
            Ok(params) => params,
            Err(e) => panic!("bug: default config is invalid: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_config_is_valid() {
        let config = ProtocolConfig::default();
        assert_eq!(config.validate(), Ok(()));
        let params = config.params().unwrap();
        assert_eq!(params.mcr.get(), 1_100_000_000_000_000_000);
        assert_eq!(params.ccr.get(), 1_500_000_000_000_000_000);
        assert_eq!(params.bootstrap_period_nanos, 14 * 24 * 3600 * SEC_NANOS);
    }

    #[test]
    fn json_round_trip() {
        let config = ProtocolConfig {
            max_troves: Some(50),
            bootstrap_period_secs: 0,
            ..Default::default()
        };
        let parsed = ProtocolConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let config = ProtocolConfig {
            critical_collateral_ratio: dec!(1.05),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(ProtocolError::InvalidConfig(_)));

        let config = ProtocolConfig {
            minute_decay_factor: dec!(1),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(ProtocolError::InvalidConfig(_)));

        assert_matches!(
            ProtocolConfig::from_json("{\"gas_compensation\": 1}"),
            Err(ProtocolError::InvalidConfig(_))
        );
    }
}
