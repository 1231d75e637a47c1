//! Ordered rule sequences
//!
//! A [`RuleArray`] is installation-ordered: element 0 is evaluated first once
//! the array is appended to a chain. All operations return fresh arrays.

use crate::core::error::AlgebraError;
use crate::core::rule::{Rule, Target};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Index;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleArray {
    rules: Vec<Rule>,
}

impl RuleArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Rule> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn as_slice(&self) -> &[Rule] {
        &self.rules
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    /// `self` followed by `other`
    #[must_use]
    pub fn concat(&self, other: &RuleArray) -> RuleArray {
        self.iter().chain(other.iter()).cloned().collect()
    }

    /// Elements of `self` not structurally equal to any element of `other`.
    #[must_use]
    pub fn remove(&self, other: &RuleArray) -> RuleArray {
        self.iter()
            .filter(|rule| !other.contains(rule))
            .cloned()
            .collect()
    }

    /// Combines every element with `rule`.
    ///
    /// With `lhs_priority` the array elements win on conflicting fields,
    /// otherwise `rule` does.
    pub fn broadcast(&self, rule: &Rule, lhs_priority: bool) -> Result<RuleArray, AlgebraError> {
        self.iter()
            .map(|element| {
                if lhs_priority {
                    element.combine(rule)
                } else {
                    rule.combine(element)
                }
            })
            .collect()
    }

    /// `combine(i, j)` for every pair, `self`-major. Elements of `self` win.
    pub fn cross(&self, other: &RuleArray) -> Result<RuleArray, AlgebraError> {
        let mut out = Vec::with_capacity(self.len() * other.len());
        for lhs in self {
            for rhs in other {
                out.push(lhs.combine(rhs)?);
            }
        }
        Ok(RuleArray { rules: out })
    }

    /// Each element diffed against `rule`.
    #[must_use]
    pub fn diff_each(&self, rule: &Rule) -> RuleArray {
        self.iter().map(|element| element.diff(rule)).collect()
    }

    /// `rule` with every element's values removed from it in turn.
    #[must_use]
    pub fn subtract_from(&self, rule: &Rule) -> Rule {
        self.iter().fold(rule.clone(), |rest, element| rest.diff(element))
    }

    /// Element-wise direction reversal
    #[must_use]
    pub fn flipped(&self) -> RuleArray {
        self.iter().map(Rule::flipped).collect()
    }

    /// Copy with every target replaced.
    #[must_use]
    pub fn retarget(&self, target: &Target) -> RuleArray {
        self.iter()
            .cloned()
            .map(|rule| rule.with_target(target.clone()))
            .collect()
    }

    /// Element-wise [`Rule::resolved`]
    pub fn resolved(&self) -> Result<RuleArray, AlgebraError> {
        self.iter().map(Rule::resolved).collect()
    }

    /// Elements the given rule subsumes, in order.
    pub fn matching<'a>(&'a self, general: &'a Rule) -> impl Iterator<Item = &'a Rule> + 'a {
        self.iter().filter(move |rule| general.subsumes(rule))
    }

    /// SHA-256 over the rendered rules, one per line, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for rule in self {
            hasher.update(rule.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl Index<usize> for RuleArray {
    type Output = Rule;

    fn index(&self, index: usize) -> &Self::Output {
        &self.rules[index]
    }
}

impl From<Vec<Rule>> for RuleArray {
    fn from(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl From<Rule> for RuleArray {
    fn from(rule: Rule) -> Self {
        Self { rules: vec![rule] }
    }
}

impl FromIterator<Rule> for RuleArray {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

impl Extend<Rule> for RuleArray {
    fn extend<I: IntoIterator<Item = Rule>>(&mut self, iter: I) {
        self.rules.extend(iter);
    }
}

impl IntoIterator for RuleArray {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.into_iter()
    }
}

impl<'a> IntoIterator for &'a RuleArray {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

impl fmt::Display for RuleArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.iter().enumerate() {
            writeln!(f, "{i:>3}  {rule}")?;
        }
        Ok(())
    }
}
