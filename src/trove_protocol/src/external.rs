//! Collaborators the ledger consumes: price oracle, stablecoin, collateral
//! token and clock. In-memory implementations are provided for simulations
//! and tests; they can be told to fail on demand.

use crate::numeric::{Amount, Coll, CollUnit, Debt, DebtUnit, Price};
use crate::ProtocolError;
use candid::Principal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferError {
    InsufficientFunds { balance: u128, needed: u128 },
    Rejected(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InsufficientFunds { balance, needed } => {
                write!(f, "insufficient funds: balance {balance}, needed {needed}")
            }
            TransferError::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

pub trait PriceFeed {
    /// Collateral price in stablecoin, 1e18 fixed point.
    fn fetch_price(&mut self) -> Result<Price, ProtocolError>;
}

pub trait StableToken {
    fn mint(&mut self, to: Principal, amount: Debt) -> Result<(), TransferError>;
    fn burn(&mut self, from: Principal, amount: Debt) -> Result<(), TransferError>;
    fn transfer(&mut self, from: Principal, to: Principal, amount: Debt)
        -> Result<(), TransferError>;
    fn balance_of(&self, account: Principal) -> Debt;
    fn total_supply(&self) -> Debt;
}

pub trait CollateralToken {
    fn transfer(&mut self, from: Principal, to: Principal, amount: Coll)
        -> Result<(), TransferError>;
    fn balance_of(&self, account: Principal) -> Coll;
}

pub trait Clock {
    fn now_nanos(&self) -> u64;
}

/// Token ledger kept in memory.
#[derive(Clone, Debug)]
pub struct InMemoryLedger<Unit> {
    balances: BTreeMap<Principal, Amount<Unit>>,
    total_supply: Amount<Unit>,
    failing_accounts: BTreeSet<Principal>,
    reject_all: bool,
}

pub type InMemoryStableToken = InMemoryLedger<DebtUnit>;
pub type InMemoryCollateralToken = InMemoryLedger<CollUnit>;

impl<Unit> Default for InMemoryLedger<Unit> {
    fn default() -> Self {
        Self {
            balances: BTreeMap::new(),
            total_supply: Amount::ZERO,
            failing_accounts: BTreeSet::new(),
            reject_all: false,
        }
    }
}

impl<Unit> InMemoryLedger<Unit> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `amount` out of thin air for `account`.
    pub fn credit(&mut self, account: Principal, amount: Amount<Unit>) {
        *self.balances.entry(account).or_default() += amount;
        self.total_supply += amount;
    }

    pub fn balance(&self, account: &Principal) -> Amount<Unit> {
        self.balances.get(account).copied().unwrap_or_default()
    }

    pub fn supply(&self) -> Amount<Unit> {
        self.total_supply
    }

    /// Every later movement touching `account` is rejected.
    pub fn fail_for(&mut self, account: Principal) {
        self.failing_accounts.insert(account);
    }

    pub fn set_reject_all(&mut self, reject: bool) {
        self.reject_all = reject;
    }

    pub fn heal(&mut self) {
        self.failing_accounts.clear();
        self.reject_all = false;
    }

    fn check_available(&self, accounts: &[Principal]) -> Result<(), TransferError> {
        if self.reject_all {
            return Err(TransferError::Rejected("ledger unavailable".to_string()));
        }
        match accounts.iter().find(|a| self.failing_accounts.contains(a)) {
            Some(account) => Err(TransferError::Rejected(format!(
                "account {account} is blocked"
            ))),
            None => Ok(()),
        }
    }

    fn debit(&mut self, account: Principal, amount: Amount<Unit>) -> Result<(), TransferError> {
        let balance = self.balance(&account);
        match balance.checked_sub(amount) {
            Some(rest) => {
                if rest.is_zero() {
                    self.balances.remove(&account);
                } else {
                    self.balances.insert(account, rest);
                }
                Ok(())
            }
            None => Err(TransferError::InsufficientFunds {
                balance: balance.get(),
                needed: amount.get(),
            }),
        }
    }

    fn move_funds(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Amount<Unit>,
    ) -> Result<(), TransferError> {
        self.check_available(&[from, to])?;
        self.debit(from, amount)?;
        *self.balances.entry(to).or_default() += amount;
        Ok(())
    }
}

impl StableToken for InMemoryLedger<DebtUnit> {
    fn mint(&mut self, to: Principal, amount: Debt) -> Result<(), TransferError> {
        self.check_available(&[to])?;
        self.credit(to, amount);
        Ok(())
    }

    fn burn(&mut self, from: Principal, amount: Debt) -> Result<(), TransferError> {
        self.check_available(&[from])?;
        self.debit(from, amount)?;
        self.total_supply -= amount;
        Ok(())
    }

    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Debt,
    ) -> Result<(), TransferError> {
        self.move_funds(from, to, amount)
    }

    fn balance_of(&self, account: Principal) -> Debt {
        self.balance(&account)
    }

    fn total_supply(&self) -> Debt {
        self.total_supply
    }
}

impl CollateralToken for InMemoryLedger<CollUnit> {
    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Coll,
    ) -> Result<(), TransferError> {
        self.move_funds(from, to, amount)
    }

    fn balance_of(&self, account: Principal) -> Coll {
        self.balance(&account)
    }
}

/// Price feed returning whatever was last set.
#[derive(Clone, Debug, Default)]
pub struct ManualPriceFeed {
    price: Option<Price>,
}

impl ManualPriceFeed {
    pub fn new(price: Price) -> Self {
        Self { price: Some(price) }
    }

    pub fn set_price(&mut self, price: Price) {
        self.price = Some(price);
    }

    pub fn clear(&mut self) {
        self.price = None;
    }
}

impl PriceFeed for ManualPriceFeed {
    fn fetch_price(&mut self) -> Result<Price, ProtocolError> {
        match self.price {
            Some(price) if !price.is_zero() => Ok(price),
            _ => Err(ProtocolError::PriceUnavailable),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: u64,
}

impl ManualClock {
    pub fn new(now_nanos: u64) -> Self {
        Self { now: now_nanos }
    }

    pub fn advance(&mut self, nanos: u64) {
        self.now = self.now.saturating_add(nanos);
    }

    pub fn set(&mut self, now_nanos: u64) {
        self.now = now_nanos;
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now
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
    fn stable_token_tracks_supply() {
        let mut token = InMemoryStableToken::new();
        token.mint(user(1), Debt::new(100)).unwrap();
        token.transfer(user(1), user(2), Debt::new(40)).unwrap();
        token.burn(user(2), Debt::new(10)).unwrap();

        assert_eq!(token.balance_of(user(1)), Debt::new(60));
        assert_eq!(token.balance_of(user(2)), Debt::new(30));
        assert_eq!(StableToken::total_supply(&token), Debt::new(90));
        assert_matches!(
            token.burn(user(2), Debt::new(31)),
            Err(TransferError::InsufficientFunds { balance: 30, needed: 31 })
        );
    }

    #[test]
    fn blocked_accounts_reject_movements() {
        let mut token = InMemoryCollateralToken::new();
        token.credit(user(1), Coll::new(10));
        token.fail_for(user(2));
        assert_matches!(
            CollateralToken::transfer(&mut token, user(1), user(2), Coll::new(1)),
            Err(TransferError::Rejected(_))
        );
        assert_eq!(token.balance(&user(1)), Coll::new(10));

        token.heal();
        CollateralToken::transfer(&mut token, user(1), user(2), Coll::new(1)).unwrap();
        assert_eq!(token.balance(&user(2)), Coll::new(1));
    }

    #[test]
    fn price_feed_without_price_fails() {
        let mut feed = ManualPriceFeed::default();
        assert_eq!(feed.fetch_price(), Err(ProtocolError::PriceUnavailable));
        feed.set_price(Price::new(5));
        assert_eq!(feed.fetch_price(), Ok(Price::new(5)));
    }
}
