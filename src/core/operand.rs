//! Composition entry points over mixed operands
//!
//! Policy authors compose rules, arrays and topologies freely. [`Operand`] is
//! the closed set of values the composition operators accept.

use crate::core::array::RuleArray;
use crate::core::error::AlgebraError;
use crate::core::rule::Rule;
use crate::core::topology::Topology;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Rule(Rule),
    Array(RuleArray),
    Topology(Topology),
}

impl Operand {
    fn kind(&self) -> &'static str {
        match self {
            Operand::Rule(_) => "Rule",
            Operand::Array(_) => "RuleArray",
            Operand::Topology(_) => "Topology",
        }
    }

    fn unsupported(op: &'static str, lhs: &Operand, rhs: &Operand) -> AlgebraError {
        AlgebraError::UnsupportedOperand {
            op,
            lhs: lhs.kind(),
            rhs: rhs.kind(),
        }
    }

    /// Superimposes `other` onto `self`.
    ///
    /// | lhs      | rhs      | result                                    |
    /// |----------|----------|-------------------------------------------|
    /// | Rule     | Rule     | `lhs.combine(rhs)`                        |
    /// | Array    | Rule     | broadcast, array elements win             |
    /// | Rule     | Array    | broadcast, the rule wins                  |
    /// | Array    | Array    | cross product, `lhs`-major                |
    /// | Topology | Rule     | [`Topology::compose_rule`]                |
    /// | Topology | Array    | [`Topology::compose_array`]               |
    /// | Rule     | Topology | [`Topology::compose_rule`]                |
    /// | Array    | Topology | [`Topology::compose_array`]               |
    /// | Topology | Topology | [`Topology::compose_topology`]            |
    pub fn combine(&self, other: &Operand) -> Result<Operand, AlgebraError> {
        Ok(match (self, other) {
            (Operand::Rule(a), Operand::Rule(b)) => Operand::Rule(a.combine(b)?),
            (Operand::Array(x), Operand::Rule(r)) => Operand::Array(x.broadcast(r, true)?),
            (Operand::Rule(r), Operand::Array(x)) => Operand::Array(x.broadcast(r, false)?),
            (Operand::Array(x), Operand::Array(y)) => Operand::Array(x.cross(y)?),
            (Operand::Topology(t), Operand::Rule(r)) | (Operand::Rule(r), Operand::Topology(t)) => {
                Operand::Array(t.compose_rule(r)?)
            }
            (Operand::Topology(t), Operand::Array(x)) | (Operand::Array(x), Operand::Topology(t)) => {
                Operand::Array(t.compose_array(x)?)
            }
            (Operand::Topology(x), Operand::Topology(y)) => Operand::Topology(x.compose_topology(y)?),
        })
    }

    /// Sequence append. Topologies are not sequences and are rejected.
    pub fn concat(&self, other: &Operand) -> Result<Operand, AlgebraError> {
        let as_array = |operand: &Operand| match operand {
            Operand::Rule(rule) => Some(RuleArray::from(rule.clone())),
            Operand::Array(array) => Some(array.clone()),
            Operand::Topology(_) => None,
        };

        match (as_array(self), as_array(other)) {
            (Some(x), Some(y)) => Ok(Operand::Array(x.concat(&y))),
            _ => Err(Self::unsupported("concat", self, other)),
        }
    }

    /// Removes `other`'s values from `self`.
    ///
    /// | lhs   | rhs   | result                                     |
    /// |-------|-------|---------------------------------------------|
    /// | Rule  | Rule  | [`Rule::diff`]                              |
    /// | Array | Rule  | each element diffed against the rule        |
    /// | Rule  | Array | the rule with every element removed in turn |
    /// | Array | Array | [`RuleArray::remove`]                       |
    pub fn diff(&self, other: &Operand) -> Result<Operand, AlgebraError> {
        match (self, other) {
            (Operand::Rule(a), Operand::Rule(b)) => Ok(Operand::Rule(a.diff(b))),
            (Operand::Array(x), Operand::Rule(r)) => Ok(Operand::Array(x.diff_each(r))),
            (Operand::Rule(r), Operand::Array(x)) => Ok(Operand::Rule(x.subtract_from(r))),
            (Operand::Array(x), Operand::Array(y)) => Ok(Operand::Array(x.remove(y))),
            _ => Err(Self::unsupported("diff", self, other)),
        }
    }

    /// Flattens the operand into installation order.
    pub fn into_rules(self) -> RuleArray {
        match self {
            Operand::Rule(rule) => RuleArray::from(rule),
            Operand::Array(array) => array,
            Operand::Topology(topology) => topology.to_array(),
        }
    }
}

impl From<Rule> for Operand {
    fn from(rule: Rule) -> Self {
        Operand::Rule(rule)
    }
}

impl From<RuleArray> for Operand {
    fn from(array: RuleArray) -> Self {
        Operand::Array(array)
    }
}

impl From<Topology> for Operand {
    fn from(topology: Topology) -> Self {
        Operand::Topology(topology)
    }
}
