//! The ledger object callers talk to.
//!
//! Every entry point runs against a checkpoint of the state: if the
//! bookkeeping fails, the checkpoint is restored and nothing was moved. Token
//! movements collected during the operation are settled afterwards, debits
//! from users first. A failure on the very first movement still rolls the
//! operation back; a failure later on keeps the bookkeeping, records the
//! failure and parks the remaining movements for
//! [`Protocol::retry_failed_interactions`].

use crate::access::SystemIds;
use crate::borrower_operations::{AdjustTroveArgs, OpenTroveArgs, SortedHints};
use crate::config::ProtocolConfig;
use crate::event::Event;
use crate::external::{
    Clock, CollateralToken, InMemoryCollateralToken, InMemoryStableToken, ManualClock,
    ManualPriceFeed, PriceFeed, StableToken, TransferError,
};
use crate::liquidation::LiquidationTotals;
use crate::numeric::{Coll, Debt, NominalRatio, Price, Ratio, Stake};
use crate::redemption::{RedeemArgs, RedemptionTotals};
use crate::state::{Interaction, State};
use crate::storage::EventLog;
use crate::trove::Trove;
use crate::{ProtocolError, ProtocolStatus, DEBUG, INFO};
use candid::Principal;
use ic_canister_log::log;
use ic_metrics_encoder::MetricsEncoder;
use std::collections::BTreeMap;

pub type InMemoryProtocol =
    Protocol<ManualPriceFeed, InMemoryStableToken, InMemoryCollateralToken, ManualClock>;

pub struct Protocol<P, S, C, K> {
    state: State,
    events: EventLog,
    price_feed: P,
    stable_token: S,
    collateral_token: C,
    clock: K,
}

impl<P, S, C, K> Protocol<P, S, C, K>
where
    P: PriceFeed,
    S: StableToken,
    C: CollateralToken,
    K: Clock,
{
    pub fn new(
        config: ProtocolConfig,
        ids: SystemIds,
        price_feed: P,
        stable_token: S,
        collateral_token: C,
        clock: K,
    ) -> Result<Self, ProtocolError> {
        let now = clock.now_nanos();
        let state = State::new(config.clone(), ids, now)?;
        let mut events = EventLog::default();
        events.record(&Event::Init {
            config,
            ids,
            timestamp: now,
        });
        log!(INFO, "[init] trove protocol initialized at {now}");
        Ok(Self {
            state,
            events,
            price_feed,
            stable_token,
            collateral_token,
            clock,
        })
    }

    // ---- Collaborators ----

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn price_feed_mut(&mut self) -> &mut P {
        &mut self.price_feed
    }

    pub fn stable_token(&self) -> &S {
        &self.stable_token
    }

    pub fn stable_token_mut(&mut self) -> &mut S {
        &mut self.stable_token
    }

    pub fn collateral_token(&self) -> &C {
        &self.collateral_token
    }

    pub fn collateral_token_mut(&mut self) -> &mut C {
        &mut self.collateral_token
    }

    pub fn clock_mut(&mut self) -> &mut K {
        &mut self.clock
    }

    pub fn fetch_price(&mut self) -> Result<Price, ProtocolError> {
        self.price_feed.fetch_price()
    }

    fn sync_clock(&mut self) {
        self.state.now = self.clock.now_nanos();
    }

    // ---- Queries ----

    pub fn trove(&self, owner: &Principal) -> Option<&Trove> {
        self.state.trove(owner)
    }

    pub fn entire_system_coll(&self) -> Coll {
        self.state.entire_system_coll()
    }

    pub fn entire_system_debt(&self) -> Debt {
        self.state.entire_system_debt()
    }

    pub fn nominal_icr(&self, borrower: &Principal) -> NominalRatio {
        self.state.nominal_icr(borrower)
    }

    pub fn current_icr(&mut self, borrower: &Principal) -> Result<Ratio, ProtocolError> {
        let price = self.fetch_price()?;
        Ok(self.state.current_icr(borrower, price))
    }

    pub fn pending_coll_reward(&self, borrower: &Principal) -> Coll {
        self.state.pending_coll_reward(borrower)
    }

    pub fn pending_debt_reward(&self, borrower: &Principal) -> Debt {
        self.state.pending_debt_reward(borrower)
    }

    pub fn tcr(&mut self) -> Result<Ratio, ProtocolError> {
        let price = self.fetch_price()?;
        Ok(self.state.tcr(price))
    }

    pub fn check_recovery_mode(&mut self) -> Result<bool, ProtocolError> {
        let price = self.fetch_price()?;
        Ok(self.state.check_recovery_mode(price))
    }

    /// Redemption rate at the current time, base rate decay included.
    pub fn redemption_rate(&mut self) -> Ratio {
        self.sync_clock();
        self.state.redemption_rate_with_decay()
    }

    /// Borrowing rate at the current time, base rate decay included.
    pub fn borrowing_rate(&mut self) -> Ratio {
        self.sync_clock();
        self.state.borrowing_rate_with_decay()
    }

    pub fn coll_surplus_of(&self, owner: &Principal) -> Coll {
        self.state.coll_surplus_pool.collateral_of(owner)
    }

    pub fn stability_deposit_of(&self, depositor: &Principal) -> Debt {
        self.state.stability_pool.deposit_of(depositor)
    }

    pub fn failed_interactions(&self) -> &[Interaction] {
        &self.state.failed_interactions
    }

    pub fn get_events(&self, start: usize, length: usize) -> Vec<Event> {
        self.events.get_events(start, length)
    }

    pub fn status(&mut self) -> Result<ProtocolStatus, ProtocolError> {
        let price = self.fetch_price()?;
        self.sync_clock();
        let s = &self.state;
        Ok(ProtocolStatus {
            price: price.to_f64(),
            total_collateral: s.entire_system_coll().to_f64(),
            total_debt: s.entire_system_debt().to_f64(),
            total_collateral_ratio: s.tcr(price).to_f64(),
            mode: s.mode(price),
            base_rate: s.calc_decayed_base_rate().to_f64(),
            borrowing_rate: s.borrowing_rate_with_decay().to_f64(),
            redemption_rate: s.redemption_rate_with_decay().to_f64(),
            active_troves: s.trove_owners_count() as u64,
            stability_pool_deposits: s.stability_pool.total_deposits().to_f64(),
        })
    }

    /// Prometheus exposition of the system gauges.
    pub fn encode_metrics(&mut self) -> std::io::Result<Vec<u8>> {
        let price = self.fetch_price().ok();
        let now_millis = self.clock.now_nanos() / 1_000_000;
        let mut writer = MetricsEncoder::new(vec![], now_millis as i64);
        crate::metrics::encode_metrics(&mut writer, &self.state, price)?;
        Ok(writer.into_inner())
    }

    // ---- Borrower operations ----

    pub fn open_trove(
        &mut self,
        caller: Principal,
        args: OpenTroveArgs,
    ) -> Result<Stake, ProtocolError> {
        self.require_user(caller, "open_trove")?;
        let price = self.fetch_price()?;
        self.execute("open_trove", |s| s.open_trove(caller, args, price))
    }

    pub fn adjust_trove(
        &mut self,
        caller: Principal,
        args: AdjustTroveArgs,
    ) -> Result<(), ProtocolError> {
        self.require_user(caller, "adjust_trove")?;
        let price = self.fetch_price()?;
        let balance = self.stable_token.balance_of(caller);
        self.execute("adjust_trove", |s| s.adjust_trove(caller, args, price, balance))
    }

    pub fn add_coll(
        &mut self,
        caller: Principal,
        amount: Coll,
        hints: SortedHints,
    ) -> Result<(), ProtocolError> {
        self.adjust_trove(caller, AdjustTroveArgs::add_coll(amount, hints))
    }

    pub fn withdraw_coll(
        &mut self,
        caller: Principal,
        amount: Coll,
        hints: SortedHints,
    ) -> Result<(), ProtocolError> {
        self.adjust_trove(caller, AdjustTroveArgs::withdraw_coll(amount, hints))
    }

    pub fn withdraw_debt(
        &mut self,
        caller: Principal,
        amount: Debt,
        max_fee: Ratio,
        hints: SortedHints,
    ) -> Result<(), ProtocolError> {
        self.adjust_trove(caller, AdjustTroveArgs::withdraw_debt(amount, max_fee, hints))
    }

    pub fn repay_debt(
        &mut self,
        caller: Principal,
        amount: Debt,
        hints: SortedHints,
    ) -> Result<(), ProtocolError> {
        self.adjust_trove(caller, AdjustTroveArgs::repay_debt(amount, hints))
    }

    pub fn close_trove(&mut self, caller: Principal) -> Result<(), ProtocolError> {
        self.require_user(caller, "close_trove")?;
        let price = self.fetch_price()?;
        let balance = self.stable_token.balance_of(caller);
        self.execute("close_trove", |s| s.close_trove(caller, price, balance))
    }

    pub fn claim_collateral(&mut self, caller: Principal) -> Result<Coll, ProtocolError> {
        self.require_user(caller, "claim_collateral")?;
        self.execute("claim_collateral", |s| s.claim_collateral(caller))
    }

    pub fn provide_to_stability_pool(
        &mut self,
        caller: Principal,
        amount: Debt,
    ) -> Result<(), ProtocolError> {
        self.require_user(caller, "provide_to_stability_pool")?;
        let balance = self.stable_token.balance_of(caller);
        self.execute("provide_to_stability_pool", |s| {
            s.provide_to_stability_pool(caller, amount, balance)
        })
    }

    pub fn withdraw_from_stability_pool(
        &mut self,
        caller: Principal,
        amount: Debt,
    ) -> Result<(Debt, Coll), ProtocolError> {
        self.require_user(caller, "withdraw_from_stability_pool")?;
        let price = self.fetch_price()?;
        self.execute("withdraw_from_stability_pool", |s| {
            s.withdraw_from_stability_pool(caller, amount, price)
        })
    }

    // ---- Trove manager ----

    pub fn liquidate(
        &mut self,
        caller: Principal,
        borrower: Principal,
    ) -> Result<LiquidationTotals, ProtocolError> {
        self.require_user(caller, "liquidate")?;
        let price = self.fetch_price()?;
        self.execute("liquidate", |s| s.liquidate(borrower, caller, price))
    }

    pub fn liquidate_troves(
        &mut self,
        caller: Principal,
        n: usize,
    ) -> Result<LiquidationTotals, ProtocolError> {
        self.require_user(caller, "liquidate_troves")?;
        let price = self.fetch_price()?;
        self.execute("liquidate_troves", |s| s.liquidate_troves(n, caller, price))
    }

    pub fn batch_liquidate_troves(
        &mut self,
        caller: Principal,
        borrowers: &[Principal],
    ) -> Result<LiquidationTotals, ProtocolError> {
        self.require_user(caller, "batch_liquidate_troves")?;
        let price = self.fetch_price()?;
        self.execute("batch_liquidate_troves", |s| {
            s.batch_liquidate_troves(borrowers, caller, price)
        })
    }

    pub fn redeem_collateral(
        &mut self,
        caller: Principal,
        args: RedeemArgs,
    ) -> Result<RedemptionTotals, ProtocolError> {
        self.require_user(caller, "redeem_collateral")?;
        let price = self.fetch_price()?;
        let balance = self.stable_token.balance_of(caller);
        self.execute("redeem_collateral", |s| {
            s.redeem_collateral(caller, args, price, balance)
        })
    }

    /// Executes the token movements parked by earlier settlement failures, in
    /// order. Returns how many were executed.
    pub fn retry_failed_interactions(&mut self) -> Result<usize, ProtocolError> {
        let pending = std::mem::take(&mut self.state.failed_interactions);
        for (index, interaction) in pending.iter().enumerate() {
            if let Err(err) = self.perform(interaction) {
                let reason = format!("{interaction}: {err}");
                log!(
                    INFO,
                    "[retry_failed_interactions] {} token movements still pending: {reason}",
                    pending.len() - index,
                );
                self.state.failed_interactions.extend_from_slice(&pending[index..]);
                self.state.record(Event::InteractionFailed {
                    interaction: *interaction,
                    reason: reason.clone(),
                });
                self.commit_events();
                return Err(ProtocolError::TransferFailed {
                    reason,
                    committed: true,
                });
            }
        }
        if !pending.is_empty() {
            log!(
                INFO,
                "[retry_failed_interactions] settled {} token movements",
                pending.len()
            );
        }
        Ok(pending.len())
    }

    // ---- Execution ----

    fn require_user(&self, caller: Principal, operation: &str) -> Result<(), ProtocolError> {
        if self.state.ids.is_component(&caller) {
            return Err(ProtocolError::Unauthorized {
                caller,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn execute<R>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut State) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        let checkpoint = self.state.clone();
        self.sync_clock();
        match f(&mut self.state) {
            Ok(result) => {
                #[cfg(any(test, feature = "self_check"))]
                if let Err(msg) = self.state.check_invariants() {
                    panic!("bug: [{operation}] invariant violated: {msg}");
                }
                self.settle(operation, checkpoint)?;
                Ok(result)
            }
            Err(err) => {
                log!(DEBUG, "[{operation}] rejected: {err}");
                self.state = checkpoint;
                Err(err)
            }
        }
    }

    fn settle(&mut self, operation: &'static str, checkpoint: State) -> Result<(), ProtocolError> {
        let ids = self.state.ids;
        let (mut interactions, internal): (Vec<Interaction>, Vec<Interaction>) =
            std::mem::take(&mut self.state.outbox)
                .into_iter()
                .partition(|i| i.is_user_debit(&ids));
        interactions.extend(internal);

        if let Err(reason) = self.check_user_debits(&interactions) {
            return Err(self.roll_back(operation, checkpoint, reason));
        }
        for (index, interaction) in interactions.iter().enumerate() {
            if let Err(err) = self.perform(interaction) {
                let reason = format!("{interaction}: {err}");
                if index == 0 {
                    return Err(self.roll_back(operation, checkpoint, reason));
                }
                log!(
                    INFO,
                    "[{operation}] settlement stopped, {} token movements deferred: {reason}",
                    interactions.len() - index,
                );
                self.state
                    .failed_interactions
                    .extend_from_slice(&interactions[index..]);
                self.state.record(Event::InteractionFailed {
                    interaction: *interaction,
                    reason: reason.clone(),
                });
                self.commit_events();
                return Err(ProtocolError::TransferFailed {
                    reason,
                    committed: true,
                });
            }
        }
        log!(
            DEBUG,
            "[{operation}] settled {} token movements",
            interactions.len()
        );
        self.commit_events();
        Ok(())
    }

    fn roll_back(&mut self, operation: &str, checkpoint: State, reason: String) -> ProtocolError {
        log!(INFO, "[{operation}] rolled back: {reason}");
        self.state = checkpoint;
        ProtocolError::TransferFailed {
            reason,
            committed: false,
        }
    }

    /// Users must hold everything the operation takes from them before any
    /// token moves.
    fn check_user_debits(&self, interactions: &[Interaction]) -> Result<(), String> {
        let ids = self.state.ids;
        let mut coll_needed: BTreeMap<Principal, Coll> = BTreeMap::new();
        let mut stable_needed: BTreeMap<Principal, Debt> = BTreeMap::new();
        for interaction in interactions.iter().filter(|i| i.is_user_debit(&ids)) {
            match *interaction {
                Interaction::TransferColl { from, amount, .. } => {
                    *coll_needed.entry(from).or_default() += amount;
                }
                Interaction::BurnStable { from, amount }
                | Interaction::TransferStable { from, amount, .. } => {
                    *stable_needed.entry(from).or_default() += amount;
                }
                Interaction::MintStable { .. } => {}
            }
        }
        for (account, needed) in coll_needed {
            let balance = self.collateral_token.balance_of(account);
            if balance < needed {
                return Err(format!(
                    "{account} holds {balance} collateral, {needed} required"
                ));
            }
        }
        for (account, needed) in stable_needed {
            let balance = self.stable_token.balance_of(account);
            if balance < needed {
                return Err(format!("{account} holds {balance} stable, {needed} required"));
            }
        }
        Ok(())
    }

    fn perform(&mut self, interaction: &Interaction) -> Result<(), TransferError> {
        match *interaction {
            Interaction::TransferColl { from, to, amount } => {
                self.collateral_token.transfer(from, to, amount)
            }
            Interaction::MintStable { to, amount } => self.stable_token.mint(to, amount),
            Interaction::BurnStable { from, amount } => self.stable_token.burn(from, amount),
            Interaction::TransferStable { from, to, amount } => {
                self.stable_token.transfer(from, to, amount)
            }
        }
    }

    fn commit_events(&mut self) {
        for event in std::mem::take(&mut self.state.pending_events) {
            self.events.record(&event);
        }
    }
}
