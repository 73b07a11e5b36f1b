use crate::borrower_operations::SortedHints;
use crate::external::StableToken;
use crate::numeric::{scaled_div_rem, Coll, Ratio};
use crate::redemption::{RedeemArgs, RedemptionHints};
use crate::test_helpers::*;
use crate::{InMemoryProtocol, ProtocolError};
use ethnum::U256;
use proptest::collection::vec as pvec;
use proptest::prelude::*;

const USERS: u8 = 6;

#[derive(Clone, Debug)]
enum Op {
    Open { user: u8, coll: u128, debt: u128 },
    AddColl { user: u8, coll: u128 },
    WithdrawColl { user: u8, coll: u128 },
    Borrow { user: u8, debt: u128 },
    Repay { user: u8, debt: u128 },
    Close { user: u8 },
    Provide { user: u8, debt: u128 },
    WithdrawDeposit { user: u8, debt: u128 },
    Claim { user: u8 },
    Liquidate { user: u8 },
    LiquidateTroves { n: usize },
    Redeem { user: u8, debt: u128 },
    SetPrice { units: u128 },
    AdvanceDays { days: u64 },
}

fn arb_user() -> impl Strategy<Value = u8> {
    0..USERS
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (arb_user(), 20..400u128, 1_800..20_000u128)
            .prop_map(|(user, coll, debt)| Op::Open { user, coll, debt }),
        1 => (arb_user(), 1..50u128).prop_map(|(user, coll)| Op::AddColl { user, coll }),
        1 => (arb_user(), 1..50u128).prop_map(|(user, coll)| Op::WithdrawColl { user, coll }),
        1 => (arb_user(), 1..3_000u128).prop_map(|(user, debt)| Op::Borrow { user, debt }),
        1 => (arb_user(), 1..3_000u128).prop_map(|(user, debt)| Op::Repay { user, debt }),
        1 => arb_user().prop_map(|user| Op::Close { user }),
        2 => (arb_user(), 1..10_000u128).prop_map(|(user, debt)| Op::Provide { user, debt }),
        1 => (arb_user(), 0..10_000u128).prop_map(|(user, debt)| Op::WithdrawDeposit { user, debt }),
        1 => arb_user().prop_map(|user| Op::Claim { user }),
        2 => arb_user().prop_map(|user| Op::Liquidate { user }),
        1 => (1..5usize).prop_map(|n| Op::LiquidateTroves { n }),
        2 => (arb_user(), 1..8_000u128).prop_map(|(user, debt)| Op::Redeem { user, debt }),
        2 => (40..300u128).prop_map(|units| Op::SetPrice { units }),
        1 => (0..20u64).prop_map(|days| Op::AdvanceDays { days }),
    ]
}

fn apply(protocol: &mut InMemoryProtocol, op: &Op) -> Result<(), ProtocolError> {
    let hints = SortedHints::default();
    let liquidator = user(200);
    match *op {
        Op::Open { user: u, coll, debt: d } => open_trove(protocol, user(u), coll, d).map(|_| ()),
        Op::AddColl { user: u, coll: c } => {
            protocol.collateral_token_mut().credit(user(u), coll(c));
            protocol.add_coll(user(u), coll(c), hints)
        }
        Op::WithdrawColl { user: u, coll: c } => protocol.withdraw_coll(user(u), coll(c), hints),
        Op::Borrow { user: u, debt: d } => {
            protocol.withdraw_debt(user(u), debt(d), Ratio::ONE, hints)
        }
        Op::Repay { user: u, debt: d } => protocol.repay_debt(user(u), debt(d), hints),
        Op::Close { user: u } => protocol.close_trove(user(u)),
        Op::Provide { user: u, debt: d } => protocol.provide_to_stability_pool(user(u), debt(d)),
        Op::WithdrawDeposit { user: u, debt: d } => protocol
            .withdraw_from_stability_pool(user(u), debt(d))
            .map(|_| ()),
        Op::Claim { user: u } => protocol.claim_collateral(user(u)).map(|_| ()),
        Op::Liquidate { user: u } => protocol.liquidate(liquidator, user(u)).map(|_| ()),
        Op::LiquidateTroves { n } => protocol.liquidate_troves(liquidator, n).map(|_| ()),
        Op::Redeem { user: u, debt: d } => protocol
            .redeem_collateral(
                user(u),
                RedeemArgs {
                    amount: debt(d),
                    hints: RedemptionHints::default(),
                    max_iterations: 0,
                    max_fee: Ratio::ONE,
                },
            )
            .map(|_| ()),
        Op::SetPrice { units } => {
            protocol.price_feed_mut().set_price(price(units));
            Ok(())
        }
        Op::AdvanceDays { days } => {
            protocol.clock_mut().advance(days * DAY_NANOS);
            Ok(())
        }
    }
}

fn snapshot(protocol: &InMemoryProtocol) -> (Coll, Coll, u128, u128, usize) {
    let s = protocol.state();
    (
        s.total_coll_deposited,
        s.total_coll_withdrawn,
        s.rewards.l_coll,
        s.rewards.l_debt,
        protocol.events().len(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operations_preserve_invariants(ops in pvec(arb_op(), 1..60)) {
        let mut protocol = new_protocol(200);
        for op in &ops {
            let before = snapshot(&protocol);
            let state_before = protocol.state().clone();
            let result = apply(&mut protocol, op);

            if let Err(ProtocolError::TransferFailed { committed: true, .. }) = result {
                prop_assert!(false, "in-memory ledgers never fail unless told to");
            }
            if result.is_err() {
                // Rejected operations leave no trace.
                prop_assert_eq!(protocol.state().check_semantically_eq(&state_before), Ok(()));
                prop_assert_eq!(protocol.events().len(), before.4);
            }

            if let Err(msg) = protocol.state().check_invariants() {
                prop_assert!(false, "after {:?}: {}", op, msg);
            }
            if let Err(msg) = check_custody(&protocol) {
                prop_assert!(false, "after {:?}: {}", op, msg);
            }

            let after = snapshot(&protocol);
            prop_assert!(after.0 >= before.0);
            prop_assert!(after.1 >= before.1);
            prop_assert!(after.2 >= before.2, "L_coll decreased");
            prop_assert!(after.3 >= before.3, "L_debt decreased");
            prop_assert!(protocol.state().base_rate <= Ratio::ONE);
        }
    }

    #[test]
    fn redistribution_carry_loses_nothing(
        amounts in pvec(1..1_000_000 * E18, 1..20),
        divisor in E18 / 1_000..1_000_000_000 * E18,
    ) {
        // The per-unit shares and the carried remainder together account for
        // every distributed unit.
        let mut carry = 0u128;
        let mut distributed = U256::ZERO;
        let mut shares = U256::ZERO;
        for amount in amounts {
            let (per_unit, rest) = scaled_div_rem(amount, carry, divisor);
            prop_assert!(rest < divisor);
            carry = rest;
            distributed += U256::from(amount);
            shares += U256::from(per_unit);
        }
        prop_assert_eq!(
            shares * U256::from(divisor) + U256::from(carry),
            distributed * U256::from(E18)
        );
    }
}

#[test]
fn rejected_open_leaves_no_trace() {
    let mut protocol = new_protocol(200);
    open_trove(&mut protocol, user(1), 100, 5_000).unwrap();
    let before = protocol.state().clone();
    let events = protocol.events().len();

    // 10 collateral at 200 is worth 2_000, well below 110% of the debt.
    let err = open_trove(&mut protocol, user(2), 10, 5_000).unwrap_err();
    assert!(matches!(err, ProtocolError::BelowMinimumCollateralization(_)));
    assert_eq!(protocol.state().check_semantically_eq(&before), Ok(()));
    assert_eq!(protocol.events().len(), events);
    assert_eq!(protocol.collateral_token().balance(&user(2)), coll(10));
    check_custody(&protocol).unwrap();
}

#[test]
fn custody_holds_across_a_trove_lifecycle() {
    let mut protocol = new_protocol(200);
    open_trove(&mut protocol, user(1), 100, 5_000).unwrap();
    open_trove(&mut protocol, user(2), 50, 2_000).unwrap();
    check_custody(&protocol).unwrap();

    protocol.provide_to_stability_pool(user(1), debt(1_000)).unwrap();
    check_custody(&protocol).unwrap();

    // user 2 owes the borrowing fee on top of what they received.
    let owed = protocol.trove(&user(2)).unwrap().debt - debt(200);
    let shortfall = owed - protocol.stable_token().balance(&user(2));
    protocol
        .stable_token_mut()
        .transfer(user(1), user(2), shortfall)
        .unwrap();
    protocol.close_trove(user(2)).unwrap();
    check_custody(&protocol).unwrap();

    assert_eq!(protocol.collateral_token().balance(&user(2)), coll(50));
    assert!(protocol.trove(&user(2)).unwrap().debt.is_zero());
    assert!(protocol.stable_token().balance(&user(2)).is_zero());
}
