//! iptables/ip6tables backend
//!
//! Each [`PacketFilterBackend`] call runs one `iptables` or `ip6tables`
//! invocation (chosen by the rule's family). Queries parse `-S -v` listings back
//! into typed rules, so `matches`, `counters` and `chains` always reflect the
//! live kernel state at call time.
//!
//! # Environment Variables
//!
//! - `BALEFUL_IPTABLES` / `BALEFUL_IP6TABLES`: override the configured program
//!   paths at runtime (used by tests to point at a stub program).
//!
//! The same variables, when set at build time, change the compiled-in defaults.

use crate::config::AppConfig;
use crate::core::array::RuleArray;
use crate::core::backend::{Counters, PacketFilterBackend, Position};
use crate::core::error::{BackendError, BackendErrorPattern, SchemaError};
use crate::core::matches::MatchParams;
use crate::core::rule::{Chain, Family, Rule, Table, Target};
use std::process::Command;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

pub const DEFAULT_IPTABLES: &str = match option_env!("BALEFUL_IPTABLES") {
    Some(path) => path,
    None => "iptables",
};

pub const DEFAULT_IP6TABLES: &str = match option_env!("BALEFUL_IP6TABLES") {
    Some(path) => path,
    None => "ip6tables",
};

/// Default program for a family
pub fn default_program(family: Family) -> &'static str {
    match family {
        Family::Ipv4 => DEFAULT_IPTABLES,
        Family::Ipv6 => DEFAULT_IP6TABLES,
    }
}

/// Arguments installing `rule` at `position`: `-t TABLE -A CHAIN …` or
/// `-t TABLE -I CHAIN N …`.
pub fn install_args(rule: &Rule, position: Position) -> Vec<String> {
    let (_, table, chain) = rule.location();
    let mut args = vec!["-t".to_string(), table.to_string()];
    match position {
        Position::Append => args.extend(["-A".to_string(), chain.to_string()]),
        Position::Insert(index) => {
            args.extend(["-I".to_string(), chain.to_string(), index.to_string()]);
        }
    }
    args.extend(rule.spec_args());
    args
}

/// Full command line `start` would run for a rule, with default program names.
pub fn command_line(rule: &Rule, position: Position) -> String {
    let (family, _, _) = rule.location();
    let mut parts = vec![default_program(family).to_string()];
    parts.extend(install_args(rule, position));
    parts.join(" ")
}

/// Chains of a table as listed by `-S`: `-P CHAIN POLICY` and `-N CHAIN` lines.
pub fn parse_chains(listing: &str) -> Vec<(Chain, Option<Target>)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some("-P"), Some(chain), Some(policy)) => {
                    Some((chain.parse().ok()?, Some(policy.parse().ok()?)))
                }
                (Some("-N"), Some(chain), _) => Some((chain.parse().ok()?, None)),
                _ => None,
            }
        })
        .collect()
}

/// Value following the option at `i`
fn operand<'a>(rest: &[&'a str], i: usize, option: &str) -> Result<&'a str, SchemaError> {
    rest.get(i + 1)
        .copied()
        .ok_or_else(|| SchemaError::invalid(option, ""))
}

/// Parses one `-A CHAIN …` line of `-S -v` output.
///
/// Returns `Ok(None)` for lines that are not rule definitions.
///
/// # Errors
///
/// [`SchemaError`] for options, match modules or values outside the typed model.
pub fn parse_rule(
    family: Family,
    table: Table,
    line: &str,
) -> Result<Option<(Rule, Counters)>, SchemaError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [flag, chain, rest @ ..] = tokens.as_slice() else {
        return Ok(None);
    };
    if *flag != "-A" {
        return Ok(None);
    }

    let mut rule = Rule::new()
        .with_family(family)
        .with_table(table)
        .with_chain(chain.parse()?);
    let mut counters = Counters::default();
    let mut negate = false;
    let mut i = 0;

    while i < rest.len() {
        let option = rest[i];
        if negate && option != "-f" {
            return Err(SchemaError::invalid("negation", option));
        }

        match option {
            "!" => {
                negate = true;
                i += 1;
                continue;
            }
            "-f" => {
                rule.fragment = Some(!negate);
                negate = false;
                i += 1;
                continue;
            }
            "-s" | "-d" => {
                let raw = operand(rest, i, option)?;
                let net = raw.parse().map_err(|_| SchemaError::invalid(option, raw))?;
                if option == "-s" {
                    rule.src = Some(net);
                } else {
                    rule.dst = Some(net);
                }
            }
            "-i" => rule.in_interface = Some(operand(rest, i, option)?.to_string()),
            "-o" => rule.out_interface = Some(operand(rest, i, option)?.to_string()),
            "-p" => {
                let raw = operand(rest, i, option)?;
                rule.protocol = Some(
                    raw.parse()
                        .map_err(|_| SchemaError::UnknownProtocol(raw.to_string()))?,
                );
            }
            "-c" => {
                let packets = operand(rest, i, option)?;
                let bytes = rest.get(i + 2).copied().unwrap_or_default();
                counters = Counters {
                    packets: packets
                        .parse()
                        .map_err(|_| SchemaError::invalid("packets", packets))?,
                    bytes: bytes
                        .parse()
                        .map_err(|_| SchemaError::invalid("bytes", bytes))?,
                };
                i += 3;
                continue;
            }
            "-m" => {
                let module = operand(rest, i, option)?;
                let mut params = Vec::new();
                let mut j = i + 2;
                while let Some(key) = rest.get(j).filter(|k| k.starts_with("--")) {
                    let param = rest.get(j + 1).copied().unwrap_or_default();
                    params.push((*key, param));
                    j += 2;
                }
                let group = MatchParams::from_params(module, Some(family), params)?;
                rule = rule.with_match(group);
                i = j;
                continue;
            }
            "-j" => {
                rule.target = Some(operand(rest, i, option)?.parse()?);
                // Target options (e.g. --reject-with) are not modelled
                i += 2;
                while rest.get(i).is_some_and(|k| k.starts_with("--")) {
                    i += 2;
                }
                continue;
            }
            other => return Err(SchemaError::invalid("option", other)),
        }
        i += 2;
    }

    Ok(Some((rule, counters)))
}

/// Backend driving the `iptables`/`ip6tables` programs.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    iptables: String,
    ip6tables: String,
    /// Pass `-w` so calls wait for the xtables lock instead of failing
    wait: bool,
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new(DEFAULT_IPTABLES, DEFAULT_IP6TABLES)
    }
}

impl IptablesBackend {
    pub fn new(iptables: impl Into<String>, ip6tables: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
            wait: true,
        }
    }

    /// Backend using the configured programs, unless overridden by environment.
    pub fn from_config(config: &AppConfig) -> Self {
        let iptables = std::env::var("BALEFUL_IPTABLES").unwrap_or_else(|_| config.iptables.clone());
        let ip6tables =
            std::env::var("BALEFUL_IP6TABLES").unwrap_or_else(|_| config.ip6tables.clone());
        Self::new(iptables, ip6tables).with_wait(config.wait_for_lock)
    }

    #[must_use]
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn program(&self, family: Family) -> &str {
        match family {
            Family::Ipv4 => &self.iptables,
            Family::Ipv6 => &self.ip6tables,
        }
    }

    /// Runs one invocation and returns its stdout.
    fn run(&self, family: Family, args: &[String]) -> Result<String, BackendError> {
        let program = self.program(family);
        let mut command = Command::new(program);
        if self.wait {
            command.arg("-w");
        }
        command.args(args);

        debug!("Running {} {}", program, args.join(" "));

        let output = command.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!("{program}: command not found"))
            } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                BackendError::PermissionDenied(format!("{program}: {e}"))
            } else {
                BackendError::Command {
                    message: format!("failed to run {program}: {e}"),
                    stderr: None,
                    exit_code: None,
                }
            }
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr.into_owned()
            };
            Err(BackendErrorPattern::classify(&message, output.status.code()))
        }
    }

    fn table_args(table: Table, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-t".to_string(), table.to_string()];
        args.extend(rest.iter().map(|s| (*s).to_string()));
        args
    }

    fn list(
        &self,
        family: Family,
        table: Table,
        chain: Option<&Chain>,
    ) -> Result<Vec<(Rule, Counters)>, BackendError> {
        let mut args = Self::table_args(table, &["-S"]);
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }
        args.push("-v".to_string());

        let listing = self.run(family, &args)?;
        let mut rules = Vec::new();
        for line in listing.lines() {
            match parse_rule(family, table, line) {
                Ok(Some(entry)) => rules.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Skipping unrecognised {} rule '{}': {}", family, line, e),
            }
        }
        Ok(rules)
    }

    fn find(&self, rule: &Rule) -> Result<Option<Counters>, BackendError> {
        let (family, table, chain) = rule.location();
        Ok(self
            .list(family, table, Some(&chain))?
            .into_iter()
            .find(|(installed, _)| installed == rule)
            .map(|(_, counters)| counters))
    }
}

impl PacketFilterBackend for IptablesBackend {
    fn install(&mut self, rule: &Rule, position: Position) -> Result<(), BackendError> {
        let (family, _, _) = rule.location();
        self.run(family, &install_args(rule, position)).map(|_| ())
    }

    fn delete(&mut self, rule: &Rule) -> Result<(), BackendError> {
        let (family, table, chain) = rule.location();
        let mut args = Self::table_args(table, &["-D", chain.as_str()]);
        args.extend(rule.spec_args());
        self.run(family, &args).map(|_| ())
    }

    fn exists(&self, rule: &Rule) -> Result<bool, BackendError> {
        let (family, table, chain) = rule.location();
        let mut args = Self::table_args(table, &["-C", chain.as_str()]);
        args.extend(rule.spec_args());
        match self.run(family, &args) {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn matches(&self, general: &Rule) -> Result<RuleArray, BackendError> {
        let families: Vec<Family> = match general.family {
            Some(family) => vec![family],
            None => Family::iter().collect(),
        };
        let tables: Vec<Table> = match general.table {
            Some(table) => vec![table],
            None => Table::iter().collect(),
        };

        let mut found = RuleArray::new();
        for family in families {
            for table in &tables {
                match self.list(family, *table, general.chain.as_ref()) {
                    Ok(rules) => found.extend(
                        rules
                            .into_iter()
                            .map(|(rule, _)| rule)
                            .filter(|rule| general.subsumes(rule)),
                    ),
                    Err(e @ (BackendError::PermissionDenied(_) | BackendError::Unavailable(_))) => {
                        return Err(e);
                    }
                    // Table or chain absent on this host
                    Err(e) => debug!("Skipping {} {}: {}", family, table, e),
                }
            }
        }
        Ok(found)
    }

    fn counters(&self, rule: &Rule) -> Result<Counters, BackendError> {
        self.find(rule)?.ok_or_else(|| {
            BackendError::NotFound(format!("rule not installed: {}", rule.spec_args().join(" ")))
        })
    }

    fn chains(&self, family: Family, table: Table) -> Result<Vec<Chain>, BackendError> {
        let listing = self.run(family, &Self::table_args(table, &["-S"]))?;
        Ok(parse_chains(&listing)
            .into_iter()
            .map(|(chain, _)| chain)
            .collect())
    }

    fn set_default_policy(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
        target: &Target,
    ) -> Result<(), BackendError> {
        let args = Self::table_args(table, &["-P", chain.as_str(), target.as_str()]);
        self.run(family, &args).map(|_| ())
    }

    fn flush_chain(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
    ) -> Result<(), BackendError> {
        let args = Self::table_args(table, &["-F", chain.as_str()]);
        self.run(family, &args).map(|_| ())
    }

    fn delete_chain(
        &mut self,
        family: Family,
        table: Table,
        chain: &Chain,
    ) -> Result<(), BackendError> {
        let args = Self::table_args(table, &["-X", chain.as_str()]);
        self.run(family, &args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matches::{CtState, IcmpType, PortRange};

    const LISTING: &str = "\
-P INPUT DROP
-P FORWARD DROP
-P OUTPUT ACCEPT
-N ssh-in
-A INPUT -i lo -c 12 1008 -j ACCEPT
-A INPUT -s 192.168.1.0/24 -p tcp -m tcp --dport 22 -c 5 300 -j ssh-in
-A INPUT -p icmp -m icmp --icmp-type 8 -c 0 0 -j ACCEPT
-A INPUT -m conntrack --ctstate RELATED,ESTABLISHED -c 90 12000 -j ACCEPT
-A OUTPUT ! -f -p udp -m udp --sport 1024:65535 --dport 53 -c 0 0 -j ACCEPT
-A INPUT -p tcp -m tcp --dport 113 -c 0 0 -j REJECT --reject-with tcp-reset
";

    fn parse_all(listing: &str) -> Vec<(Rule, Counters)> {
        listing
            .lines()
            .filter_map(|line| parse_rule(Family::Ipv4, Table::Filter, line).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_chains() {
        let chains = parse_chains(LISTING);
        assert_eq!(chains.len(), 4);
        assert_eq!(chains[0], (Chain::Input, Some(Target::Drop)));
        assert_eq!(chains[3], (Chain::User("ssh-in".to_string()), None));
    }

    #[test]
    fn test_parse_rules_with_counters() {
        let rules = parse_all(LISTING);
        assert_eq!(rules.len(), 6);

        let (loopback, counters) = &rules[0];
        assert_eq!(loopback.in_interface.as_deref(), Some("lo"));
        assert_eq!(
            *counters,
            Counters {
                packets: 12,
                bytes: 1008
            }
        );

        let (ssh, _) = &rules[1];
        assert_eq!(ssh.target, Some(Target::Jump("ssh-in".to_string())));
        assert_eq!(ssh.src, Some("192.168.1.0/24".parse().unwrap()));
    }

    #[test]
    fn test_parse_numeric_icmp_and_ctstate() {
        let rules = parse_all(LISTING);
        let expected_ping = Rule::new()
            .with_family(Family::Ipv4)
            .with_table(Table::Filter)
            .with_chain(Chain::Input)
            .with_protocol(crate::core::rule::Protocol::Icmp)
            .icmp_type(IcmpType::EchoRequest)
            .with_target(Target::Accept);
        assert_eq!(rules[2].0, expected_ping);

        let stateful = Rule::new().ctstate(&[CtState::Established, CtState::Related]);
        assert!(stateful.subsumes(&rules[3].0));
    }

    #[test]
    fn test_parse_negated_fragment_and_port_range() {
        let rules = parse_all(LISTING);
        let (dns, _) = &rules[4];
        assert_eq!(dns.fragment, Some(false));
        assert!(
            Rule::new()
                .udp_sport(PortRange::new(1024, 65535))
                .udp_dport(53)
                .subsumes(dns)
        );
    }

    #[test]
    fn test_parse_ignores_target_options() {
        let rules = parse_all(LISTING);
        assert_eq!(rules[5].0.target, Some(Target::Reject));
    }

    #[test]
    fn test_parse_rejects_unknown_module() {
        let line = "-A INPUT -m multiport --dports 80,443 -j ACCEPT";
        assert_eq!(
            parse_rule(Family::Ipv4, Table::Filter, line),
            Err(SchemaError::UnsupportedMatchModule("multiport".to_string()))
        );
        assert!(parse_rule(Family::Ipv4, Table::Filter, "-P INPUT DROP")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rendered_rule_parses_back() {
        let rule = Rule::new()
            .with_chain(Chain::Output)
            .with_dst("10.0.0.1".parse().unwrap())
            .tcp_dport(443)
            .resolved()
            .unwrap();

        let line = format!("-A OUTPUT {}", rule.spec_args().join(" "));
        let (parsed, _) = parse_rule(Family::Ipv4, Table::Filter, &line)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_install_args() {
        let rule = Rule::new()
            .with_chain(Chain::Input)
            .udp_dport(123)
            .resolved()
            .unwrap();

        assert_eq!(
            install_args(&rule, Position::HEAD).join(" "),
            "-t filter -I INPUT 1 -p udp -m udp --dport 123 -j ACCEPT"
        );
        assert_eq!(
            command_line(&rule, Position::Append),
            format!(
                "{DEFAULT_IPTABLES} -t filter -A INPUT -p udp -m udp --dport 123 -j ACCEPT"
            )
        );
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let mut backend = IptablesBackend::new(
            "/nonexistent/baleful-iptables",
            "/nonexistent/baleful-ip6tables",
        );
        let rule = Rule::new().resolved().unwrap();
        assert!(matches!(
            backend.install(&rule, Position::Append),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn test_failing_program_is_command_error() {
        let backend = IptablesBackend::new("false", "false").with_wait(false);
        let rule = Rule::new().resolved().unwrap();
        match backend.exists(&rule) {
            Err(BackendError::Command { exit_code, .. }) => assert_eq!(exit_code, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_succeeding_program_installs() {
        let mut backend = IptablesBackend::new("true", "true");
        let rule = Rule::new().tcp_dport(22).resolved().unwrap();
        backend.install(&rule, Position::Append).unwrap();
        assert!(backend.exists(&rule).unwrap());
    }
}
