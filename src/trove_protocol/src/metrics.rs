use crate::numeric::Price;
use crate::state::State;
use ic_metrics_encoder::MetricsEncoder;

/// Writes the system gauges in the Prometheus text format. The ratio gauges
/// are only emitted when a price is available.
pub fn encode_metrics<W: std::io::Write>(
    w: &mut MetricsEncoder<W>,
    state: &State,
    price: Option<Price>,
) -> std::io::Result<()> {
    w.encode_gauge(
        "trove_active_count",
        state.trove_owners_count() as f64,
        "Count of active troves.",
    )?;

    w.encode_gauge(
        "trove_total_collateral",
        state.entire_system_coll().to_f64(),
        "Collateral in active and default pools.",
    )?;

    w.encode_gauge(
        "trove_total_debt",
        state.entire_system_debt().to_f64(),
        "Debt in active and default pools.",
    )?;

    w.gauge_vec("trove_pool_collateral", "Collateral held by each pool.")?
        .value(&[("pool", "active")], state.active_pool.coll().to_f64())?
        .value(&[("pool", "default")], state.default_pool.coll().to_f64())?
        .value(&[("pool", "stability")], state.stability_pool.coll().to_f64())?
        .value(&[("pool", "surplus")], state.coll_surplus_pool.coll().to_f64())?;

    w.gauge_vec("trove_pool_debt", "Debt tracked by each pool.")?
        .value(&[("pool", "active")], state.active_pool.debt().to_f64())?
        .value(&[("pool", "default")], state.default_pool.debt().to_f64())?;

    w.encode_gauge(
        "trove_stability_pool_deposits",
        state.stability_pool.total_deposits().to_f64(),
        "Stablecoin deposited in the stability pool.",
    )?;

    w.encode_gauge(
        "trove_stability_pool_depositors_count",
        state.stability_pool.depositors_count() as f64,
        "Count of stability pool depositors.",
    )?;

    w.encode_gauge(
        "trove_gas_pool_balance",
        state.gas_pool.balance().to_f64(),
        "Stablecoin reserved for gas compensation.",
    )?;

    w.encode_gauge(
        "trove_total_stakes",
        state.total_stakes.to_f64(),
        "Sum of the stakes of active troves.",
    )?;

    w.encode_gauge(
        "trove_base_rate",
        state.base_rate.to_f64(),
        "Base rate before decay.",
    )?;

    w.encode_gauge(
        "trove_failed_interactions_count",
        state.failed_interactions.len() as f64,
        "Token movements waiting for a retry.",
    )?;

    if let Some(price) = price {
        w.encode_gauge("trove_price", price.to_f64(), "Collateral price.")?;

        let tcr = state.tcr(price);
        if state.entire_system_debt().is_zero() {
            return Ok(());
        }
        w.encode_gauge("trove_total_collateral_ratio", tcr.to_f64(), "TCR.")?;
        w.encode_gauge(
            "trove_recovery_mode",
            if state.check_recovery_mode(price) { 1.0 } else { 0.0 },
            "Whether the system is in recovery mode.",
        )?;
    }
    Ok(())
}
