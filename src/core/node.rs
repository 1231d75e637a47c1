//! Per-host policy lifecycle
//!
//! A [`Node`] owns one host's resolved rule set and drives it against a
//! [`PacketFilterBackend`]:
//!
//! ```text
//! Stopped ──start──▶ Running ──lock──▶ Locked
//!    ▲                  │                │
//!    └──────stop────────┴──panic──▶ Panicked
//!
//! flush: any state ──▶ Flushed
//! ```
//!
//! Lifecycle operations never stop at the first backend error. Every rule is
//! attempted and the outcome is returned as a [`Report`]; `panic` additionally
//! always finishes by forcing DROP policies on the filter table.

use crate::core::array::RuleArray;
use crate::core::backend::{Counters, PacketFilterBackend, Position};
use crate::core::error::{AlgebraError, BackendError, Error, Result};
use crate::core::iptables;
use crate::core::rule::{Chain, Family, Rule, Table, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeState {
    #[default]
    Stopped,
    Running,
    Locked,
    Panicked,
    Flushed,
}

/// Lifecycle operation, as reported and audited
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Start,
    Stop,
    SetPolicy,
    Lock,
    Panic,
    Flush,
}

/// One backend call that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub subject: String,
    pub error: BackendError,
}

/// Outcome of a lifecycle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub operation: Operation,
    /// Backend calls that succeeded
    pub applied: usize,
    /// Calls whose "not found / busy" error counted as already satisfied
    pub skipped: usize,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            applied: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, subject: impl fmt::Display, result: std::result::Result<(), BackendError>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(error) => {
                warn!("{} failed for {}: {}", self.operation, subject, error);
                self.failures.push(Failure {
                    subject: subject.to_string(),
                    error,
                });
            }
        }
    }

    /// Like `record`, but "not found / busy" errors count as skipped.
    fn record_tolerant(
        &mut self,
        subject: impl fmt::Display,
        result: std::result::Result<(), BackendError>,
    ) {
        match result {
            Err(error) if error.is_ignorable() => {
                debug!("{} skipped {}: {}", self.operation, subject, error);
                self.skipped += 1;
            }
            other => self.record(subject, other),
        }
    }

    fn absorb(&mut self, other: Report) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} applied, {} skipped, {} failed",
            self.operation,
            self.applied,
            self.skipped,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.subject, failure.error)?;
        }
        Ok(())
    }
}

/// Installation state of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatus {
    pub rule: Rule,
    pub installed: bool,
    pub counters: Option<Counters>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    hostname: String,
    rules: RuleArray,
    /// Subset of `rules` re-installed by `lock`
    lock_rules: RuleArray,
    final_rules: RuleArray,
    policy: BTreeMap<(Family, Chain), Target>,
    state: NodeState,
}

fn policy_subject(family: Family, chain: &Chain, target: &Target) -> String {
    format!("{family} filter {chain} policy {target}")
}

fn chain_subject(family: Family, table: Table, chain: &Chain) -> String {
    format!("{family} {table} {chain}")
}

impl Node {
    /// Node with no rules and ACCEPT policies on the filter table's built-in
    /// chains for both families.
    pub fn new(hostname: impl Into<String>) -> Self {
        let policy = Family::iter()
            .flat_map(|family| {
                Table::Filter
                    .builtin_chains()
                    .iter()
                    .map(move |chain| ((family, chain.clone()), Target::Accept))
            })
            .collect();

        Self {
            hostname: hostname.into(),
            rules: RuleArray::new(),
            lock_rules: RuleArray::new(),
            final_rules: RuleArray::new(),
            policy,
            state: NodeState::Stopped,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn rules(&self) -> &RuleArray {
        &self.rules
    }

    pub fn lock_rules(&self) -> &RuleArray {
        &self.lock_rules
    }

    pub fn final_rules(&self) -> &RuleArray {
        &self.final_rules
    }

    pub fn policy(&self) -> &BTreeMap<(Family, Chain), Target> {
        &self.policy
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// `rules ++ final_rules`, the set `start` installs
    pub fn all_rules(&self) -> RuleArray {
        self.rules.concat(&self.final_rules)
    }

    /// Resolves and appends rules. With `survives_lock` they are also
    /// re-installed after a lock-down.
    ///
    /// # Errors
    ///
    /// Nothing is added when any rule fails to resolve.
    pub fn add_rules(
        &mut self,
        rules: &RuleArray,
        survives_lock: bool,
    ) -> std::result::Result<(), AlgebraError> {
        let resolved = rules.resolved()?;
        if survives_lock {
            self.lock_rules.extend(resolved.iter().cloned());
        }
        self.rules.extend(resolved);
        Ok(())
    }

    /// Resolves and appends rules that stay installed through lock-down.
    pub fn add_final_rules(&mut self, rules: &RuleArray) -> std::result::Result<(), AlgebraError> {
        let resolved = rules.resolved()?;
        self.final_rules.extend(resolved);
        Ok(())
    }

    /// Sets the default policy `set_policy` applies to one filter chain.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for user-defined chains, chains outside the filter
    /// table and targets other than ACCEPT/DROP.
    pub fn set_policy_entry(&mut self, family: Family, chain: Chain, target: Target) -> Result<()> {
        if !Table::Filter.builtin_chains().contains(&chain) {
            return Err(Error::Validation {
                field: "policy".to_string(),
                message: format!("{chain} is not a built-in filter chain"),
            });
        }
        if !target.is_policy() {
            return Err(Error::Validation {
                field: "policy".to_string(),
                message: format!("{target} cannot be a default policy"),
            });
        }
        self.policy.insert((family, chain), target);
        Ok(())
    }

    /// Drops a policy entry so `set_policy` leaves that chain untouched.
    pub fn clear_policy_entry(&mut self, family: Family, chain: &Chain) -> Option<Target> {
        self.policy.remove(&(family, chain.clone()))
    }

    /// Installs `rules ++ final_rules`.
    ///
    /// Inserting at a fixed position issues the inserts in reverse so the
    /// chain ends up in array order.
    pub fn start(
        &mut self,
        backend: &mut dyn PacketFilterBackend,
        insert_at: Option<Position>,
    ) -> Report {
        let position = insert_at.unwrap_or_default();
        let mut rules: Vec<Rule> = self.all_rules().into_iter().collect();
        if matches!(position, Position::Insert(_)) {
            rules.reverse();
        }

        if self.state == NodeState::Running {
            warn!("{} is already running, rules will be duplicated", self.hostname);
        }
        info!(
            "Starting {} ({} rules, {})",
            self.hostname,
            rules.len(),
            position
        );

        let mut report = Report::new(Operation::Start);
        for rule in &rules {
            report.record(rule, backend.install(rule, position));
        }

        self.state = NodeState::Running;
        report
    }

    /// Removes `rules ++ final_rules`. Rules already gone are skipped.
    pub fn stop(&mut self, backend: &mut dyn PacketFilterBackend) -> Report {
        info!("Stopping {}", self.hostname);

        let mut report = Report::new(Operation::Stop);
        for rule in &self.all_rules() {
            report.record_tolerant(rule, backend.delete(rule));
        }

        self.state = NodeState::Stopped;
        report
    }

    /// Applies every configured `(family, chain)` policy to the filter table.
    pub fn set_policy(&self, backend: &mut dyn PacketFilterBackend) -> Report {
        info!("Setting {} default policies on {}", self.policy.len(), self.hostname);

        let mut report = Report::new(Operation::SetPolicy);
        for ((family, chain), target) in &self.policy {
            report.record(
                policy_subject(*family, chain, target),
                backend.set_default_policy(*family, Table::Filter, chain, target),
            );
        }
        report
    }

    /// Fail-safe deny-by-default.
    ///
    /// For both families: flushes every filter chain, deletes user-defined
    /// filter chains, then sets DROP on every built-in filter chain. "Not found"
    /// and "busy" errors are skipped; other errors are reported but never stop
    /// the DROP policies from being attempted.
    pub fn panic(&mut self, backend: &mut dyn PacketFilterBackend) -> Report {
        warn!("Panic on {}: dropping all traffic", self.hostname);

        let mut report = Report::new(Operation::Panic);
        for family in Family::iter() {
            let chains = match backend.chains(family, Table::Filter) {
                Ok(chains) => chains,
                Err(error) => {
                    report.record_tolerant(format!("{family} {}", Table::Filter), Err(error));
                    Table::Filter.builtin_chains().to_vec()
                }
            };

            for chain in &chains {
                report.record_tolerant(
                    chain_subject(family, Table::Filter, chain),
                    backend.flush_chain(family, Table::Filter, chain),
                );
            }
            for chain in chains.iter().filter(|chain| !chain.is_builtin()) {
                report.record_tolerant(
                    chain_subject(family, Table::Filter, chain),
                    backend.delete_chain(family, Table::Filter, chain),
                );
            }
            for chain in Table::Filter.builtin_chains() {
                report.record_tolerant(
                    policy_subject(family, chain, &Target::Drop),
                    backend.set_default_policy(family, Table::Filter, chain, &Target::Drop),
                );
            }
        }

        self.state = NodeState::Panicked;
        report
    }

    /// Panics, then re-installs the lock-surviving rules and `final_rules`.
    pub fn lock(&mut self, backend: &mut dyn PacketFilterBackend) -> Report {
        info!("Locking down {}", self.hostname);

        let mut report = Report::new(Operation::Lock);
        report.absorb(self.panic(backend));

        for rule in &self.lock_rules.concat(&self.final_rules) {
            report.record(rule, backend.install(rule, Position::Append));
        }

        self.state = NodeState::Locked;
        report
    }

    /// Flushes every chain of every table in both families. Policies stay as they are.
    pub fn flush(&mut self, backend: &mut dyn PacketFilterBackend) -> Report {
        info!("Flushing all tables on {}", self.hostname);

        let mut report = Report::new(Operation::Flush);
        for family in Family::iter() {
            for table in Table::iter() {
                let chains = match backend.chains(family, table) {
                    Ok(chains) => chains,
                    Err(error) => {
                        report.record_tolerant(format!("{family} {table}"), Err(error));
                        continue;
                    }
                };
                for chain in &chains {
                    report.record_tolerant(
                        chain_subject(family, table, chain),
                        backend.flush_chain(family, table, chain),
                    );
                }
            }
        }

        self.state = NodeState::Flushed;
        report
    }

    /// Installation state and counters of every rule `start` installs.
    ///
    /// # Errors
    ///
    /// Backend errors other than "not found".
    pub fn status(
        &self,
        backend: &dyn PacketFilterBackend,
    ) -> std::result::Result<Vec<RuleStatus>, BackendError> {
        self.all_rules()
            .into_iter()
            .map(|rule| {
                let installed = backend.exists(&rule)?;
                let counters = if installed {
                    match backend.counters(&rule) {
                        Ok(counters) => Some(counters),
                        Err(error) if error.is_ignorable() => None,
                        Err(error) => return Err(error),
                    }
                } else {
                    None
                };
                Ok(RuleStatus {
                    rule,
                    installed,
                    counters,
                })
            })
            .collect()
    }

    /// Copy of the rule set with every target set to LOG.
    pub fn log_rules(&self) -> RuleArray {
        self.all_rules().retarget(&Target::Log)
    }

    /// Command lines `set_policy` and `start` would run, in issue order.
    pub fn plan(&self, insert_at: Option<Position>) -> Vec<String> {
        let position = insert_at.unwrap_or_default();
        let mut rules: Vec<Rule> = self.all_rules().into_iter().collect();
        if matches!(position, Position::Insert(_)) {
            rules.reverse();
        }

        self.policy
            .iter()
            .map(|((family, chain), target)| {
                format!(
                    "{} -t filter -P {chain} {target}",
                    iptables::default_program(*family)
                )
            })
            .chain(rules.iter().map(|rule| iptables::command_line(rule, position)))
            .collect()
    }

    /// SHA-256 fingerprint of the rule set (see [`RuleArray::fingerprint`]).
    pub fn fingerprint(&self) -> String {
        self.all_rules().fingerprint()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# {} ({})", self.hostname, self.state)?;
        for line in self.plan(None) {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
