//! Component identities and per-operation allow-lists.

use crate::ProtocolError;
use candid::Principal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identities of the protocol components. Pools only accept commands from
/// the identities listed for each of their mutating operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemIds {
    pub trove_manager: Principal,
    pub borrower_operations: Principal,
    pub active_pool: Principal,
    pub default_pool: Principal,
    pub stability_pool: Principal,
    pub coll_surplus_pool: Principal,
    pub gas_pool: Principal,
    pub fee_recipient: Principal,
}

impl SystemIds {
    /// Deterministic identities derived from a one-byte tag each.
    pub fn derived() -> Self {
        let id = |tag: u8| Principal::from_slice(&[0xfe, 0x70, tag]);
        Self {
            trove_manager: id(1),
            borrower_operations: id(2),
            active_pool: id(3),
            default_pool: id(4),
            stability_pool: id(5),
            coll_surplus_pool: id(6),
            gas_pool: id(7),
            fee_recipient: id(8),
        }
    }

    pub fn is_component(&self, principal: &Principal) -> bool {
        [
            self.trove_manager,
            self.borrower_operations,
            self.active_pool,
            self.default_pool,
            self.stability_pool,
            self.coll_surplus_pool,
            self.gas_pool,
        ]
        .contains(principal)
    }
}

impl Default for SystemIds {
    fn default() -> Self {
        Self::derived()
    }
}

/// Set of identities allowed to invoke one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessList {
    operation: &'static str,
    allowed: BTreeSet<Principal>,
}

impl AccessList {
    pub fn new(operation: &'static str, allowed: impl IntoIterator<Item = Principal>) -> Self {
        Self {
            operation,
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn allows(&self, caller: &Principal) -> bool {
        self.allowed.contains(caller)
    }

    pub fn check(&self, caller: Principal) -> Result<(), ProtocolError> {
        if self.allows(&caller) {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized {
                caller,
                operation: self.operation.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn derived_ids_are_distinct() {
        let ids = SystemIds::derived();
        let all: BTreeSet<Principal> = [
            ids.trove_manager,
            ids.borrower_operations,
            ids.active_pool,
            ids.default_pool,
            ids.stability_pool,
            ids.coll_surplus_pool,
            ids.gas_pool,
            ids.fee_recipient,
        ]
        .into_iter()
        .collect();
        assert_eq!(all.len(), 8);
        assert!(!ids.is_component(&ids.fee_recipient));
    }

    #[test]
    fn rejects_callers_outside_the_list() {
        let ids = SystemIds::derived();
        let list = AccessList::new("account_surplus", [ids.trove_manager]);
        assert_eq!(list.check(ids.trove_manager), Ok(()));
        assert_matches!(
            list.check(ids.borrower_operations),
            Err(ProtocolError::Unauthorized { operation, .. }) if operation == "account_surplus"
        );
    }
}
