//! Bidirectional network hops
//!
//! A [`Topology`] pairs the rules describing a hop in the client→server
//! direction (`forward`) with the rules for the return path (`reverse`).
//! Composition superimposes application or route fragments onto both
//! directions, flipping the fragment for the return path.

use crate::core::array::RuleArray;
use crate::core::error::AlgebraError;
use crate::core::rule::Rule;
use std::ops::Index;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub forward: RuleArray,
    pub reverse: RuleArray,
}

impl Topology {
    pub fn new(forward: RuleArray, reverse: RuleArray) -> Self {
        Self { forward, reverse }
    }

    /// Topology whose return path is the element-wise reversal of `forward`.
    pub fn symmetric(forward: RuleArray) -> Self {
        let reverse = forward.flipped();
        Self { forward, reverse }
    }

    /// `forward·r` followed by `reverse·flip(r)`. The fragment wins over
    /// topology elements on conflicting fields.
    pub fn compose_rule(&self, rule: &Rule) -> Result<RuleArray, AlgebraError> {
        let outbound = self.forward.broadcast(rule, false)?;
        let inbound = self.reverse.broadcast(&rule.flipped(), false)?;
        Ok(outbound.concat(&inbound))
    }

    /// [`compose_rule`](Self::compose_rule) for each element, keeping the
    /// array's order on the outside.
    pub fn compose_array(&self, array: &RuleArray) -> Result<RuleArray, AlgebraError> {
        let mut out = RuleArray::new();
        for rule in array {
            out.extend(self.compose_rule(rule)?);
        }
        Ok(out)
    }

    /// Chains `self` then `next`:
    /// forward = `self.forward · (next.forward ∪ next.reverse)`,
    /// reverse = `self.reverse · flip(next.forward ∪ next.reverse)`.
    pub fn compose_topology(&self, next: &Topology) -> Result<Topology, AlgebraError> {
        let both = next.forward.concat(&next.reverse);
        Ok(Topology {
            forward: self.forward.cross(&both)?,
            reverse: self.reverse.cross(&both.flipped())?,
        })
    }

    pub fn len(&self) -> usize {
        self.forward.len() + self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }

    /// Flattened access: forward elements first, then reverse.
    pub fn get(&self, index: usize) -> Option<&Rule> {
        match index.checked_sub(self.forward.len()) {
            None => self.forward.get(index),
            Some(offset) => self.reverse.get(offset),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.forward.iter().chain(self.reverse.iter())
    }

    /// Forward and reverse rules as one array.
    pub fn to_array(&self) -> RuleArray {
        self.forward.concat(&self.reverse)
    }
}

impl Index<usize> for Topology {
    type Output = Rule;

    fn index(&self, index: usize) -> &Self::Output {
        match index.checked_sub(self.forward.len()) {
            None => &self.forward[index],
            Some(offset) => &self.reverse[offset],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::Chain;

    fn chain(chain: Chain) -> RuleArray {
        RuleArray::from(Rule::new().with_chain(chain))
    }

    #[test]
    fn test_symmetric_reverse_is_flipped_forward() {
        let topo = Topology::symmetric(chain(Chain::Output));
        assert_eq!(topo.reverse, chain(Chain::Input));
    }

    #[test]
    fn test_flattened_indexing() {
        let topo = Topology::new(
            chain(Chain::Output).concat(&chain(Chain::Forward)),
            chain(Chain::Input),
        );

        assert_eq!(topo.len(), 3);
        assert_eq!(topo[0].chain, Some(Chain::Output));
        assert_eq!(topo[1].chain, Some(Chain::Forward));
        assert_eq!(topo[2].chain, Some(Chain::Input));
        assert!(topo.get(3).is_none());
        assert_eq!(topo.iter().count(), 3);
    }

    #[test]
    fn test_compose_array_keeps_outer_order() {
        let topo = Topology::symmetric(chain(Chain::Output));
        let apps: RuleArray = [22, 80].into_iter().map(|p| Rule::new().tcp_dport(p)).collect();

        let out = topo.compose_array(&apps).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], Rule::new().with_chain(Chain::Output).tcp_dport(22));
        assert_eq!(out[1], Rule::new().with_chain(Chain::Input).tcp_sport(22));
        assert_eq!(out[2], Rule::new().with_chain(Chain::Output).tcp_dport(80));
        assert_eq!(out[3], Rule::new().with_chain(Chain::Input).tcp_sport(80));
    }

    #[test]
    fn test_compose_topology_cardinality() {
        let client = Topology::new(chain(Chain::Output), chain(Chain::Input));
        let router = Topology::new(chain(Chain::Forward), chain(Chain::Forward));

        let chained = client.compose_topology(&router).unwrap();
        assert_eq!(chained.forward.len(), 2);
        assert_eq!(chained.reverse.len(), 2);
        // Elements of the first hop keep their placement
        assert!(chained.forward.iter().all(|r| r.chain == Some(Chain::Output)));
        assert!(chained.reverse.iter().all(|r| r.chain == Some(Chain::Input)));
    }
}
