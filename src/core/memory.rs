//! In-memory packet filter
//!
//! Mirrors the iptables object model (families → tables → chains → rules with
//! counters and default policies) closely enough that lifecycle code behaves
//! the same against it as against a live host, including the error classes
//! iptables reports. Every mutating call is recorded so tests can assert on
//! issue order.

use crate::core::array::RuleArray;
use crate::core::backend::{Counters, PacketFilterBackend, Position};
use crate::core::error::BackendError;
use crate::core::rule::{Chain, Family, Rule, Table, Target};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use strum::IntoEnumIterator;

/// A mutating call received by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Install { rule: Rule, position: Position },
    Delete(Rule),
    SetPolicy {
        family: Family,
        table: Table,
        chain: Chain,
        target: Target,
    },
    FlushChain {
        family: Family,
        table: Table,
        chain: Chain,
    },
    DeleteChain {
        family: Family,
        table: Table,
        chain: Chain,
    },
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    /// `None` for user-defined chains
    policy: Option<Target>,
    rules: Vec<(Rule, Counters)>,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    tables: BTreeMap<(Family, Table), BTreeMap<Chain, ChainState>>,
    calls: Vec<BackendCall>,
    /// Rules whose install/delete fails with the given error
    faults: Vec<(Rule, BackendError)>,
    /// Tables whose chain listing fails with the given error
    listing_faults: BTreeMap<(Family, Table), BackendError>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_chain(chain: &Chain) -> BackendError {
    BackendError::NotFound(format!("No chain/target/match by that name: {chain}"))
}

fn missing_rule() -> BackendError {
    BackendError::NotFound("Bad rule (does a matching rule exist in that chain?)".to_string())
}

impl MemoryBackend {
    /// Backend with every built-in chain of every table present, policy ACCEPT.
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for family in Family::iter() {
            for table in Table::iter() {
                let chains = table
                    .builtin_chains()
                    .iter()
                    .map(|chain| {
                        (
                            chain.clone(),
                            ChainState {
                                policy: Some(Target::Accept),
                                rules: Vec::new(),
                            },
                        )
                    })
                    .collect();
                tables.insert((family, table), chains);
            }
        }

        Self {
            tables,
            calls: Vec::new(),
            faults: Vec::new(),
            listing_faults: BTreeMap::new(),
        }
    }

    fn table(&self, family: Family, table: Table) -> &BTreeMap<Chain, ChainState> {
        // Every (family, table) pair is created in `new`
        &self.tables[&(family, table)]
    }

    fn chain_mut(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
    ) -> Result<&mut ChainState, BackendError> {
        self.tables
            .get_mut(&(family, table))
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| missing_chain(chain))
    }

    fn fault(&self, rule: &Rule) -> Option<BackendError> {
        self.faults
            .iter()
            .find(|(faulty, _)| faulty == rule)
            .map(|(_, error)| error.clone())
    }

    /// Makes every later install or delete of `rule` fail with `error`.
    pub fn inject_fault(&mut self, rule: Rule, error: BackendError) {
        self.faults.push((rule, error));
    }

    /// Makes every later `chains` call for `(family, table)` fail with `error`.
    pub fn inject_listing_fault(&mut self, family: Family, table: Table, error: BackendError) {
        self.listing_faults.insert((family, table), error);
    }

    pub fn create_chain(
        &mut self,
        family: Family,
        table: Table,
        name: &str,
    ) -> Result<Chain, BackendError> {
        let chain = Chain::user(name).map_err(|e| BackendError::Command {
            message: e.to_string(),
            stderr: None,
            exit_code: Some(2),
        })?;

        let chains = self
            .tables
            .get_mut(&(family, table))
            .ok_or_else(|| missing_chain(&chain))?;
        if chains.contains_key(&chain) {
            return Err(BackendError::Command {
                message: format!("Chain already exists: {chain}"),
                stderr: None,
                exit_code: Some(1),
            });
        }
        chains.insert(chain.clone(), ChainState::default());
        Ok(chain)
    }

    /// Adds to the counters of the first installed rule equal to `rule`.
    pub fn record_traffic(&mut self, rule: &Rule, packets: u64, bytes: u64) -> bool {
        let (family, table, chain) = rule.location();
        let Ok(state) = self.chain_mut(family, table, &chain) else {
            return false;
        };
        match state.rules.iter_mut().find(|(installed, _)| installed == rule) {
            Some((_, counters)) => {
                counters.packets += packets;
                counters.bytes += bytes;
                true
            }
            None => false,
        }
    }

    pub fn policy(&self, family: Family, table: Table, chain: &Chain) -> Option<Target> {
        self.table(family, table)
            .get(chain)
            .and_then(|state| state.policy.clone())
    }

    /// Installed rules of one chain, top to bottom.
    pub fn rules(&self, family: Family, table: Table, chain: &Chain) -> RuleArray {
        self.table(family, table)
            .get(chain)
            .map(|state| state.rules.iter().map(|(rule, _)| rule.clone()).collect())
            .unwrap_or_default()
    }

    /// Every installed rule, grouped by family, table and chain.
    pub fn all_rules(&self) -> RuleArray {
        self.tables
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(|state| state.rules.iter().map(|(rule, _)| rule.clone()))
            .collect()
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Rule set in `iptables -S` form, one block per non-trivial table.
    ///
    /// Tables with only built-in chains, ACCEPT policies and no rules are omitted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for ((family, table), chains) in &self.tables {
            let pristine = chains.iter().all(|(chain, state)| {
                chain.is_builtin() && state.rules.is_empty() && state.policy == Some(Target::Accept)
            });
            if pristine {
                continue;
            }

            let _ = writeln!(out, "# {family} {table}");
            for (chain, state) in chains {
                match &state.policy {
                    Some(policy) => {
                        let _ = writeln!(out, "-P {chain} {policy}");
                    }
                    None => {
                        let _ = writeln!(out, "-N {chain}");
                    }
                }
            }
            for (chain, state) in chains {
                for (rule, counters) in &state.rules {
                    let _ = writeln!(
                        out,
                        "-A {chain} {} -c {} {}",
                        rule.spec_args().join(" "),
                        counters.packets,
                        counters.bytes
                    );
                }
            }
        }
        out
    }
}

impl PacketFilterBackend for MemoryBackend {
    fn install(&mut self, rule: &Rule, position: Position) -> Result<(), BackendError> {
        self.calls.push(BackendCall::Install {
            rule: rule.clone(),
            position,
        });
        if let Some(error) = self.fault(rule) {
            return Err(error);
        }

        let (family, table, chain) = rule.location();
        if let Some(Target::Jump(name)) = &rule.target {
            let jump = Chain::User(name.clone());
            if !self.table(family, table).contains_key(&jump) {
                return Err(missing_chain(&jump));
            }
        }

        let state = self.chain_mut(family, table, &chain)?;
        let entry = (rule.clone(), Counters::default());
        match position {
            Position::Append => state.rules.push(entry),
            Position::Insert(index) => {
                let slot = usize::try_from(index).unwrap_or(usize::MAX);
                if slot == 0 || slot > state.rules.len() + 1 {
                    return Err(BackendError::Command {
                        message: "Index of insertion too big.".to_string(),
                        stderr: None,
                        exit_code: Some(1),
                    });
                }
                state.rules.insert(slot - 1, entry);
            }
        }
        Ok(())
    }

    fn delete(&mut self, rule: &Rule) -> Result<(), BackendError> {
        self.calls.push(BackendCall::Delete(rule.clone()));
        if let Some(error) = self.fault(rule) {
            return Err(error);
        }

        let (family, table, chain) = rule.location();
        let state = self.chain_mut(family, table, &chain)?;
        let index = state
            .rules
            .iter()
            .position(|(installed, _)| installed == rule)
            .ok_or_else(missing_rule)?;
        state.rules.remove(index);
        Ok(())
    }

    fn exists(&self, rule: &Rule) -> Result<bool, BackendError> {
        let (family, table, chain) = rule.location();
        Ok(self
            .table(family, table)
            .get(&chain)
            .is_some_and(|state| state.rules.iter().any(|(installed, _)| installed == rule)))
    }

    fn matches(&self, general: &Rule) -> Result<RuleArray, BackendError> {
        Ok(self
            .all_rules()
            .into_iter()
            .filter(|rule| general.subsumes(rule))
            .collect())
    }

    fn counters(&self, rule: &Rule) -> Result<Counters, BackendError> {
        let (family, table, chain) = rule.location();
        self.table(family, table)
            .get(&chain)
            .ok_or_else(|| missing_chain(&chain))?
            .rules
            .iter()
            .find(|(installed, _)| installed == rule)
            .map(|(_, counters)| *counters)
            .ok_or_else(missing_rule)
    }

    fn chains(&self, family: Family, table: Table) -> Result<Vec<Chain>, BackendError> {
        if let Some(error) = self.listing_faults.get(&(family, table)) {
            return Err(error.clone());
        }
        Ok(self.table(family, table).keys().cloned().collect())
    }

    fn set_default_policy(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
        target: &Target,
    ) -> Result<(), BackendError> {
        self.calls.push(BackendCall::SetPolicy {
            family,
            table,
            chain: chain.clone(),
            target: target.clone(),
        });

        if !target.is_policy() {
            return Err(BackendError::Command {
                message: format!("Bad policy name: {target}"),
                stderr: None,
                exit_code: Some(2),
            });
        }

        let state = self.chain_mut(family, table, chain)?;
        match &mut state.policy {
            Some(policy) => {
                *policy = target.clone();
                Ok(())
            }
            None => Err(BackendError::Command {
                message: format!("Bad built-in chain name: {chain}"),
                stderr: None,
                exit_code: Some(1),
            }),
        }
    }

    fn flush_chain(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
    ) -> Result<(), BackendError> {
        self.calls.push(BackendCall::FlushChain {
            family,
            table,
            chain: chain.clone(),
        });
        self.chain_mut(family, table, chain)?.rules.clear();
        Ok(())
    }

    fn delete_chain(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
    ) -> Result<(), BackendError> {
        self.calls.push(BackendCall::DeleteChain {
            family,
            table,
            chain: chain.clone(),
        });

        if chain.is_builtin() {
            return Err(BackendError::Command {
                message: format!("Cannot delete built-in chain: {chain}"),
                stderr: None,
                exit_code: Some(1),
            });
        }

        let chains = self.table(family, table);
        let state = chains.get(chain).ok_or_else(|| missing_chain(chain))?;
        if !state.rules.is_empty() {
            return Err(BackendError::ChainBusy(format!(
                "Directory not empty: {chain}"
            )));
        }

        let referenced = chains.values().any(|other| {
            other
                .rules
                .iter()
                .any(|(rule, _)| rule.target == Some(Target::Jump(chain.to_string())))
        });
        if referenced {
            return Err(BackendError::ChainBusy(format!("Too many links: {chain}")));
        }

        if let Some(chains) = self.tables.get_mut(&(family, table)) {
            chains.remove(chain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh() -> Rule {
        Rule::new()
            .with_chain(Chain::Input)
            .tcp_dport(22)
            .resolved()
            .unwrap()
    }

    #[test]
    fn test_builtin_chains_start_accepting() {
        let backend = MemoryBackend::new();
        for chain in Table::Filter.builtin_chains() {
            assert_eq!(
                backend.policy(Family::Ipv6, Table::Filter, chain),
                Some(Target::Accept)
            );
        }
    }

    #[test]
    fn test_install_and_delete() {
        let mut backend = MemoryBackend::new();
        backend.install(&ssh(), Position::Append).unwrap();
        assert!(backend.exists(&ssh()).unwrap());

        backend.delete(&ssh()).unwrap();
        assert!(!backend.exists(&ssh()).unwrap());

        let err = backend.delete(&ssh()).unwrap_err();
        assert!(err.is_ignorable());
    }

    #[test]
    fn test_insert_index_bounds() {
        let mut backend = MemoryBackend::new();
        assert!(backend.install(&ssh(), Position::Insert(2)).is_err());
        backend.install(&ssh(), Position::HEAD).unwrap();
        backend.install(&ssh(), Position::Insert(2)).unwrap();
        assert_eq!(
            backend.rules(Family::Ipv4, Table::Filter, &Chain::Input).len(),
            2
        );
    }

    #[test]
    fn test_jump_to_missing_chain() {
        let mut backend = MemoryBackend::new();
        let jump = Rule::new()
            .with_chain(Chain::Input)
            .with_target(Target::Jump("ssh-in".to_string()))
            .resolved()
            .unwrap();

        assert!(matches!(
            backend.install(&jump, Position::Append),
            Err(BackendError::NotFound(_))
        ));

        backend
            .create_chain(Family::Ipv4, Table::Filter, "ssh-in")
            .unwrap();
        backend.install(&jump, Position::Append).unwrap();
    }

    #[test]
    fn test_delete_chain_busy_and_builtin() {
        let mut backend = MemoryBackend::new();
        let chain = backend
            .create_chain(Family::Ipv4, Table::Filter, "ssh-in")
            .unwrap();
        let inside = Rule::new()
            .with_chain(chain.clone())
            .tcp_dport(22)
            .resolved()
            .unwrap();
        backend.install(&inside, Position::Append).unwrap();

        assert!(matches!(
            backend.delete_chain(Family::Ipv4, Table::Filter, &chain),
            Err(BackendError::ChainBusy(_))
        ));
        assert!(matches!(
            backend.delete_chain(Family::Ipv4, Table::Filter, &Chain::Input),
            Err(BackendError::Command { .. })
        ));

        backend
            .flush_chain(Family::Ipv4, Table::Filter, &chain)
            .unwrap();
        backend
            .delete_chain(Family::Ipv4, Table::Filter, &chain)
            .unwrap();
        assert!(
            !backend
                .chains(Family::Ipv4, Table::Filter)
                .unwrap()
                .contains(&chain)
        );
    }

    #[test]
    fn test_policy_only_on_builtin_chains() {
        let mut backend = MemoryBackend::new();
        let chain = backend
            .create_chain(Family::Ipv4, Table::Filter, "custom")
            .unwrap();

        assert!(
            backend
                .set_default_policy(Family::Ipv4, Table::Filter, &chain, &Target::Drop)
                .is_err()
        );
        assert!(
            backend
                .set_default_policy(Family::Ipv4, Table::Filter, &Chain::Input, &Target::Log)
                .is_err()
        );
        backend
            .set_default_policy(Family::Ipv4, Table::Filter, &Chain::Input, &Target::Drop)
            .unwrap();
        assert_eq!(
            backend.policy(Family::Ipv4, Table::Filter, &Chain::Input),
            Some(Target::Drop)
        );
    }

    #[test]
    fn test_counters_and_matches() {
        let mut backend = MemoryBackend::new();
        backend.install(&ssh(), Position::Append).unwrap();
        assert!(backend.record_traffic(&ssh(), 3, 180));

        assert_eq!(
            backend.counters(&ssh()).unwrap(),
            Counters {
                packets: 3,
                bytes: 180
            }
        );

        let general = Rule::new().tcp_dport(22);
        assert_eq!(backend.matches(&general).unwrap().len(), 1);
        assert!(
            backend
                .matches(&Rule::new().tcp_dport(80))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_injected_fault_is_returned() {
        let mut backend = MemoryBackend::new();
        backend.inject_fault(ssh(), BackendError::PermissionDenied("nope".to_string()));
        assert!(matches!(
            backend.install(&ssh(), Position::Append),
            Err(BackendError::PermissionDenied(_))
        ));
        assert_eq!(backend.calls().len(), 1);
    }

    #[test]
    fn test_render_skips_pristine_tables() {
        let mut backend = MemoryBackend::new();
        assert!(backend.render().is_empty());

        backend.install(&ssh(), Position::Append).unwrap();
        let rendered = backend.render();
        assert!(rendered.contains("# ipv4 filter"));
        assert!(rendered.contains("-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT -c 0 0"));
        assert!(!rendered.contains("ipv6"));
    }
}
