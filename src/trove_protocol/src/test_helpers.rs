//! Fixtures shared by the unit tests.

use crate::access::SystemIds;
use crate::borrower_operations::{OpenTroveArgs, SortedHints};
use crate::config::{ProtocolConfig, SEC_NANOS};
use crate::external::{
    CollateralToken, InMemoryCollateralToken, InMemoryStableToken, ManualClock, ManualPriceFeed,
    StableToken,
};
use crate::numeric::{Coll, Debt, Price, Ratio, Stake, DECIMAL_PRECISION};
use crate::{InMemoryProtocol, ProtocolError};
use candid::Principal;

pub const E18: u128 = DECIMAL_PRECISION;
pub const DAY_NANOS: u64 = 24 * 60 * 60 * SEC_NANOS;

pub fn user(n: u8) -> Principal {
    Principal::from_slice(&[0x01, 0x55, n])
}

pub fn price(units: u128) -> Price {
    Price::new(units * E18)
}

pub fn coll(units: u128) -> Coll {
    Coll::new(units * E18)
}

pub fn debt(units: u128) -> Debt {
    Debt::new(units * E18)
}

/// Protocol with the default configuration, deployed at time zero.
pub fn new_protocol(price_units: u128) -> InMemoryProtocol {
    new_protocol_with(ProtocolConfig::default(), price_units)
}

pub fn new_protocol_with(config: ProtocolConfig, price_units: u128) -> InMemoryProtocol {
    match InMemoryProtocol::new(
        config,
        SystemIds::derived(),
        ManualPriceFeed::new(price(price_units)),
        InMemoryStableToken::new(),
        InMemoryCollateralToken::new(),
        ManualClock::new(0),
    ) {
        Ok(protocol) => protocol,
        Err(err) => panic!("failed to create the protocol: {err}"),
    }
}

/// Credits the owner with the collateral and opens a trove borrowing
/// `debt_units` whole stablecoins.
pub fn open_trove(
    protocol: &mut InMemoryProtocol,
    owner: Principal,
    coll_units: u128,
    debt_units: u128,
) -> Result<Stake, ProtocolError> {
    protocol.collateral_token_mut().credit(owner, coll(coll_units));
    protocol.open_trove(
        owner,
        OpenTroveArgs {
            coll: coll(coll_units),
            debt_amount: debt(debt_units),
            max_fee: Ratio::ONE,
            hints: SortedHints::default(),
        },
    )
}

pub fn skip_bootstrap(protocol: &mut InMemoryProtocol) {
    let period = protocol.state().params.bootstrap_period_nanos;
    protocol.clock_mut().advance(period + DAY_NANOS);
}

/// Token balances held by each pool identity match the internal bookkeeping,
/// and every stablecoin in circulation is backed by trove debt.
pub fn check_custody(protocol: &InMemoryProtocol) -> Result<(), String> {
    let state = protocol.state();
    let ids = state.ids;
    let collateral = protocol.collateral_token();
    let pairs = [
        ("active pool", collateral.balance_of(ids.active_pool), state.active_pool.coll()),
        ("default pool", collateral.balance_of(ids.default_pool), state.default_pool.coll()),
        (
            "stability pool",
            collateral.balance_of(ids.stability_pool),
            state.stability_pool.coll(),
        ),
        (
            "surplus pool",
            collateral.balance_of(ids.coll_surplus_pool),
            state.coll_surplus_pool.coll(),
        ),
    ];
    for (pool, held, booked) in pairs {
        if held != booked {
            return Err(format!("{pool} holds {held} collateral, books {booked}"));
        }
    }

    let stable = protocol.stable_token();
    if stable.balance_of(ids.gas_pool) != state.gas_pool.balance() {
        return Err(format!(
            "gas pool holds {}, books {}",
            stable.balance_of(ids.gas_pool),
            state.gas_pool.balance()
        ));
    }
    if stable.balance_of(ids.stability_pool) != state.stability_pool.total_deposits() {
        return Err(format!(
            "stability pool holds {} stable, books {}",
            stable.balance_of(ids.stability_pool),
            state.stability_pool.total_deposits()
        ));
    }
    if stable.total_supply() != state.entire_system_debt() {
        return Err(format!(
            "stable supply {} differs from system debt {}",
            stable.total_supply(),
            state.entire_system_debt()
        ));
    }
    Ok(())
}
