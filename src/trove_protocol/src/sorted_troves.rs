//! Doubly-linked list of active troves ordered by nominal collateral ratio,
//! highest at the head.
//!
//! The list stores no ratios: they are read from a [`NominalRatioSource`]
//! whenever a position is checked, so that pending rewards are taken into
//! account. Callers pass neighbour hints; a hint is only an optimization and
//! every position is verified before a node is linked.

use crate::numeric::NominalRatio;
use crate::ProtocolError;
use candid::Principal;
use std::collections::BTreeMap;

pub trait NominalRatioSource {
    fn nominal_ratio(&self, id: &Principal) -> NominalRatio;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Node {
    /// Neighbour with a lower or equal ratio.
    next: Option<Principal>,
    /// Neighbour with a higher or equal ratio.
    prev: Option<Principal>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortedTroves {
    head: Option<Principal>,
    tail: Option<Principal>,
    nodes: BTreeMap<Principal, Node>,
    max_size: Option<usize>,
    max_traversal: usize,
}

impl SortedTroves {
    pub fn new(max_size: Option<usize>, max_traversal: usize) -> Self {
        Self {
            head: None,
            tail: None,
            nodes: BTreeMap::new(),
            max_size,
            max_traversal,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.max_size.map_or(false, |max| self.nodes.len() >= max)
    }

    pub fn contains(&self, id: &Principal) -> bool {
        self.nodes.contains_key(id)
    }

    /// Trove with the highest nominal ratio.
    pub fn first(&self) -> Option<Principal> {
        self.head
    }

    /// Trove with the lowest nominal ratio.
    pub fn last(&self) -> Option<Principal> {
        self.tail
    }

    pub fn next(&self, id: &Principal) -> Option<Principal> {
        self.nodes.get(id).and_then(|n| n.next)
    }

    pub fn prev(&self, id: &Principal) -> Option<Principal> {
        self.nodes.get(id).and_then(|n| n.prev)
    }

    /// Iterates from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = Principal> + '_ {
        std::iter::successors(self.head, move |id| self.next(id))
    }

    pub fn insert(
        &mut self,
        id: Principal,
        nicr: NominalRatio,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<(), ProtocolError> {
        if self.is_full() {
            return Err(ProtocolError::ListFull);
        }
        if self.contains(&id) {
            return Err(ProtocolError::InvalidPositionState(format!(
                "trove {id} is already in the sorted list"
            )));
        }
        if nicr == NominalRatio::ZERO {
            return Err(ProtocolError::InvalidArgument(
                "nominal ratio must be positive".to_string(),
            ));
        }

        let (prev, next) = if self.valid_insert_position(nicr, prev_hint, next_hint, source) {
            (prev_hint, next_hint)
        } else {
            self.find_insert_position(nicr, prev_hint, next_hint, source)?
        };
        self.link(id, prev, next);
        Ok(())
    }

    pub fn remove(&mut self, id: &Principal) -> Result<(), ProtocolError> {
        let node = self.nodes.remove(id).ok_or_else(|| {
            ProtocolError::InvalidPositionState(format!("trove {id} is not in the sorted list"))
        })?;
        match node.prev {
            Some(prev) => self.node_mut(&prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(&next).prev = node.prev,
            None => self.tail = node.prev,
        }
        Ok(())
    }

    /// Moves an existing node to the position matching its new ratio.
    pub fn re_insert(
        &mut self,
        id: Principal,
        new_nicr: NominalRatio,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<(), ProtocolError> {
        if !self.contains(&id) {
            return Err(ProtocolError::InvalidPositionState(format!(
                "trove {id} is not in the sorted list"
            )));
        }
        if new_nicr == NominalRatio::ZERO {
            return Err(ProtocolError::InvalidArgument(
                "nominal ratio must be positive".to_string(),
            ));
        }
        let checkpoint = self.clone();
        self.remove(&id)?;
        if let Err(e) = self.insert(id, new_nicr, prev_hint, next_hint, source) {
            *self = checkpoint;
            return Err(e);
        }
        Ok(())
    }

    /// Whether `nicr` fits between `prev` and `next` as they are linked now.
    pub fn valid_insert_position(
        &self,
        nicr: NominalRatio,
        prev: Option<Principal>,
        next: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> bool {
        match (prev, next) {
            (None, None) => self.is_empty(),
            (None, Some(next)) => self.head == Some(next) && nicr >= source.nominal_ratio(&next),
            (Some(prev), None) => self.tail == Some(prev) && nicr <= source.nominal_ratio(&prev),
            (Some(prev), Some(next)) => {
                self.next(&prev) == Some(next)
                    && source.nominal_ratio(&prev) >= nicr
                    && nicr >= source.nominal_ratio(&next)
            }
        }
    }

    /// Corrects stale hints by walking the list from them, or from the head
    /// when no hint is usable.
    pub fn find_insert_position(
        &self,
        nicr: NominalRatio,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<(Option<Principal>, Option<Principal>), ProtocolError> {
        let prev = prev_hint
            .filter(|p| self.contains(p) && nicr <= source.nominal_ratio(p));
        let next = next_hint
            .filter(|n| self.contains(n) && nicr >= source.nominal_ratio(n));

        match (prev, next) {
            (None, None) => match self.head {
                Some(head) => self.descend_list(nicr, head, source),
                None => Ok((None, None)),
            },
            (None, Some(next)) => self.ascend_list(nicr, next, source),
            (Some(prev), _) => self.descend_list(nicr, prev, source),
        }
    }

    fn descend_list(
        &self,
        nicr: NominalRatio,
        start: Principal,
        source: &impl NominalRatioSource,
    ) -> Result<(Option<Principal>, Option<Principal>), ProtocolError> {
        if self.head == Some(start) && nicr >= source.nominal_ratio(&start) {
            return Ok((None, Some(start)));
        }
        let mut prev = Some(start);
        let mut next = self.next(&start);
        let mut steps = 0;
        while let Some(current) = prev {
            if self.valid_insert_position(nicr, prev, next, source) {
                break;
            }
            steps += 1;
            if steps > self.max_traversal {
                return Err(ProtocolError::ExceedsMaxIterations {
                    limit: self.max_traversal,
                });
            }
            prev = self.next(&current);
            next = prev.and_then(|p| self.next(&p));
        }
        Ok((prev, next))
    }

    fn ascend_list(
        &self,
        nicr: NominalRatio,
        start: Principal,
        source: &impl NominalRatioSource,
    ) -> Result<(Option<Principal>, Option<Principal>), ProtocolError> {
        if self.tail == Some(start) && nicr <= source.nominal_ratio(&start) {
            return Ok((Some(start), None));
        }
        let mut next = Some(start);
        let mut prev = self.prev(&start);
        let mut steps = 0;
        while let Some(current) = next {
            if self.valid_insert_position(nicr, prev, next, source) {
                break;
            }
            steps += 1;
            if steps > self.max_traversal {
                return Err(ProtocolError::ExceedsMaxIterations {
                    limit: self.max_traversal,
                });
            }
            next = self.prev(&current);
            prev = next.and_then(|n| self.prev(&n));
        }
        Ok((prev, next))
    }

    fn link(&mut self, id: Principal, prev: Option<Principal>, next: Option<Principal>) {
        self.nodes.insert(id, Node { next, prev });
        match prev {
            Some(p) => self.node_mut(&p).next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.node_mut(&n).prev = Some(id),
            None => self.tail = Some(id),
        }
    }

    fn node_mut(&mut self, id: &Principal) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(node) => node,
            None => panic!("bug: sorted list links to unknown trove {id}"),
        }
    }

    /// Verifies the links and the descending order.
    pub fn check_invariants(&self, source: &impl NominalRatioSource) -> Result<(), String> {
        self.check_links()?;
        let ids: Vec<Principal> = self.iter().collect();
        for pair in ids.windows(2) {
            if source.nominal_ratio(&pair[0]) < source.nominal_ratio(&pair[1]) {
                return Err(format!("sorted list out of order at {}", pair[1]));
            }
        }
        Ok(())
    }

    /// Verifies that the forward and backward links describe the same list.
    pub fn check_links(&self) -> Result<(), String> {
        let ids: Vec<Principal> = self.iter().take(self.nodes.len() + 1).collect();
        if ids.len() != self.nodes.len() {
            return Err(format!(
                "sorted list walk visits {} nodes, {} stored",
                ids.len(),
                self.nodes.len()
            ));
        }
        if self.tail != ids.last().copied() {
            return Err("sorted list tail does not match the last node".to_string());
        }
        for pair in ids.windows(2) {
            if self.prev(&pair[1]) != Some(pair[0]) {
                return Err(format!("broken prev link at {}", pair[1]));
            }
        }
        if self.head.is_some() && self.head.and_then(|h| self.prev(&h)).is_some() {
            return Err("sorted list head has a predecessor".to_string());
        }
        Ok(())
    }
}
