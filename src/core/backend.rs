//! Packet filter backend interface
//!
//! The rule algebra never talks to the kernel. Everything that mutates or
//! queries live rule sets goes through [`PacketFilterBackend`], implemented by
//! [`IptablesBackend`](crate::core::iptables::IptablesBackend) for real hosts and
//! [`MemoryBackend`](crate::core::memory::MemoryBackend) for tests and dry runs.

use crate::core::array::RuleArray;
use crate::core::error::BackendError;
use crate::core::rule::{Chain, Family, Rule, Table, Target};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where `install` places a rule in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "at", content = "index")]
pub enum Position {
    /// Tail of the chain
    #[default]
    Append,
    /// 1-based rule number; existing rules from that number move down
    Insert(u32),
}

impl Position {
    pub const HEAD: Position = Position::Insert(1);
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Append => f.write_str("append"),
            Position::Insert(index) => write!(f, "insert@{index}"),
        }
    }
}

/// Packet and byte counters of an installed rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

/// Live rule-set operations.
///
/// Rules passed in are expected to be [resolved](Rule::resolved); backends place
/// them with [`Rule::location`].
pub trait PacketFilterBackend {
    fn install(&mut self, rule: &Rule, position: Position) -> Result<(), BackendError>;

    /// Removes the first rule equal to `rule`.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotFound`] when no such rule is installed.
    fn delete(&mut self, rule: &Rule) -> Result<(), BackendError>;

    fn exists(&self, rule: &Rule) -> Result<bool, BackendError>;

    /// Installed rules that `general` subsumes, in chain order.
    ///
    /// Every call takes a fresh snapshot, so iterating twice sees the same
    /// rules unless the rule set changed in between.
    fn matches(&self, general: &Rule) -> Result<RuleArray, BackendError>;

    fn counters(&self, rule: &Rule) -> Result<Counters, BackendError>;

    /// Built-in and user-defined chains of one table.
    fn chains(&self, family: Family, table: Table) -> Result<Vec<Chain>, BackendError>;

    fn set_default_policy(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
        target: &Target,
    ) -> Result<(), BackendError>;

    fn flush_chain(&mut self, family: Family, table: Table, chain: &Chain)
    -> Result<(), BackendError>;

    /// # Errors
    ///
    /// [`BackendError::ChainBusy`] when the chain still holds rules or is
    /// referenced by a jump.
    fn delete_chain(&mut self, family: Family, table: Table, chain: &Chain)
    -> Result<(), BackendError>;
}
