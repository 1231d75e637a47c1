//! Core policy logic
//!
//! - [`rule`], [`matches`]: rule descriptors and the rule-level algebra
//! - [`array`], [`topology`], [`operand`]: ordered rule collections and
//!   direction-aware composition
//! - [`address`], [`iface`]: address-scoped fragments and network discovery
//! - [`node`]: per-host lifecycle (start, stop, lock, panic, flush)
//! - [`backend`], [`iptables`], [`memory`]: packet filter backends
//! - [`schema`], [`profiles`]: textual rule descriptions and node profiles
//! - [`error`]: error taxonomy

pub mod address;
pub mod array;
pub mod backend;
pub mod error;
pub mod iface;
pub mod iptables;
pub mod matches;
pub mod memory;
pub mod node;
pub mod operand;
pub mod profiles;
pub mod rule;
pub mod schema;
pub mod topology;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
