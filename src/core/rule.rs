//! Rule descriptors and the rule-level algebra
//!
//! A [`Rule`] is one directional filter-rule descriptor. Every field is optional:
//! an unset field means "no constraint" for selectors and "not decided yet" for
//! placement. Rules are assembled from fragments with [`Rule::combine`], where the
//! left operand is the specific fragment and the right operand supplies fallback
//! context.
//!
//! # Example
//!
//! ```
//! use baleful::core::rule::{Chain, Rule};
//!
//! let app = Rule::new().tcp_dport(22);
//! let route = Rule::new()
//!     .with_src("192.168.1.10".parse().unwrap())
//!     .with_dst("192.168.1.1".parse().unwrap());
//!
//! let outbound = app.combine(&route).unwrap().with_chain(Chain::Output);
//! let inbound = outbound.flipped();
//!
//! assert_eq!(inbound.chain, Some(Chain::Input));
//! assert_eq!(inbound.src, route.dst);
//! ```

use crate::core::error::{AlgebraError, SchemaError};
use crate::core::matches::{
    ConntrackMatch, CtState, IcmpMatch, IcmpType, MatchKind, MatchParams, PortMatch, PortRange,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Maximum user chain name length accepted by xtables
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Address family a rule is evaluated in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Family {
    #[strum(to_string = "ipv4", serialize = "inet", serialize = "4")]
    Ipv4,
    #[strum(to_string = "ipv6", serialize = "inet6", serialize = "6")]
    Ipv6,
}

impl Family {
    pub fn of(net: &IpNetwork) -> Self {
        match net {
            IpNetwork::V4(_) => Family::Ipv4,
            IpNetwork::V6(_) => Family::Ipv6,
        }
    }

    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }
}

/// Netfilter table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Table {
    #[default]
    Filter,
    Nat,
    Mangle,
    Raw,
    Security,
}

impl Table {
    /// Built-in chains of the table, in kernel hook order.
    pub fn builtin_chains(self) -> &'static [Chain] {
        const FILTER: &[Chain] = &[Chain::Input, Chain::Forward, Chain::Output];
        const NAT: &[Chain] = &[
            Chain::Prerouting,
            Chain::Input,
            Chain::Output,
            Chain::Postrouting,
        ];
        const MANGLE: &[Chain] = &[
            Chain::Prerouting,
            Chain::Input,
            Chain::Forward,
            Chain::Output,
            Chain::Postrouting,
        ];
        const RAW: &[Chain] = &[Chain::Prerouting, Chain::Output];

        match self {
            Table::Filter | Table::Security => FILTER,
            Table::Nat => NAT,
            Table::Mangle => MANGLE,
            Table::Raw => RAW,
        }
    }
}

/// Chain a rule is placed in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
    /// User-defined chain
    User(String),
}

impl Chain {
    /// Creates a user-defined chain after checking the name.
    pub fn user(name: impl Into<String>) -> Result<Self, SchemaError> {
        let name = name.into();
        validate_chain_name(&name)?;
        Ok(Chain::User(name))
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Chain::User(_))
    }

    /// Direction-reversed chain: INPUT↔OUTPUT, PREROUTING↔POSTROUTING.
    #[must_use]
    pub fn flipped(&self) -> Chain {
        match self {
            Chain::Input => Chain::Output,
            Chain::Output => Chain::Input,
            Chain::Prerouting => Chain::Postrouting,
            Chain::Postrouting => Chain::Prerouting,
            other => other.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
            Chain::User(name) => name,
        }
    }
}

fn validate_chain_name(name: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CHAIN_NAME_LEN
        && !name.starts_with(['-', '!'])
        && !name.chars().any(|c| c.is_whitespace() || c.is_control());

    if valid {
        Ok(())
    } else {
        Err(SchemaError::UnknownChain(name.to_string()))
    }
}

impl FromStr for Chain {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let builtin = [
            Chain::Prerouting,
            Chain::Input,
            Chain::Forward,
            Chain::Output,
            Chain::Postrouting,
        ]
        .into_iter()
        .find(|chain| chain.as_str().eq_ignore_ascii_case(s));

        match builtin {
            Some(chain) => Ok(chain),
            None => Chain::user(s),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Chain {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Chain> for String {
    fn from(chain: Chain) -> Self {
        chain.as_str().to_string()
    }
}

/// Action taken by a matching rule, or a chain's default policy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    Accept,
    Drop,
    Reject,
    Log,
    Return,
    /// Jump to a user-defined chain
    Jump(String),
}

impl Target {
    pub fn as_str(&self) -> &str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Reject => "REJECT",
            Target::Log => "LOG",
            Target::Return => "RETURN",
            Target::Jump(chain) => chain,
        }
    }

    /// Targets a built-in chain may use as its default policy.
    pub fn is_policy(&self) -> bool {
        matches!(self, Target::Accept | Target::Drop)
    }
}

impl FromStr for Target {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let builtin = [
            Target::Accept,
            Target::Drop,
            Target::Reject,
            Target::Log,
            Target::Return,
        ]
        .into_iter()
        .find(|target| target.as_str().eq_ignore_ascii_case(s));

        match builtin {
            Some(target) => Ok(target),
            None => validate_chain_name(s)
                .map(|()| Target::Jump(s.to_string()))
                .map_err(|_| SchemaError::UnknownTarget(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Target {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.as_str().to_string()
    }
}

/// Layer-4 protocol selector
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[serde(rename = "ipv6-icmp", alias = "icmpv6")]
    #[strum(to_string = "ipv6-icmp", serialize = "icmpv6")]
    Ipv6Icmp,
    Sctp,
    Gre,
    Esp,
    Ah,
    All,
}

impl Protocol {
    /// Family the protocol only exists in, if any.
    pub fn family(self) -> Option<Family> {
        match self {
            Protocol::Icmp => Some(Family::Ipv4),
            Protocol::Ipv6Icmp => Some(Family::Ipv6),
            _ => None,
        }
    }
}

/// One directional filter-rule descriptor.
///
/// `src`/`dst` prefixes of length zero are the family's "any" prefix and compare
/// equal to an unset address.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub family: Option<Family>,
    pub table: Option<Table>,
    pub chain: Option<Chain>,
    pub target: Option<Target>,
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub protocol: Option<Protocol>,
    /// `Some(true)` matches only second and later fragments, `Some(false)` only heads
    pub fragment: Option<bool>,
    pub matches: BTreeMap<MatchKind, MatchParams>,
}

fn fill<T: Clone>(lhs: &Option<T>, rhs: &Option<T>) -> Option<T> {
    lhs.clone().or_else(|| rhs.clone())
}

fn strip<T: Clone + PartialEq>(lhs: &Option<T>, rhs: &Option<T>) -> Option<T> {
    match (lhs, rhs) {
        (Some(l), Some(r)) if l == r => None,
        _ => lhs.clone(),
    }
}

fn covers<T: PartialEq>(general: &Option<T>, specific: &Option<T>) -> bool {
    general.is_none() || general == specific
}

fn bound(net: Option<IpNetwork>) -> Option<IpNetwork> {
    net.filter(|n| n.prefix() != 0)
}

/// Keeps the left prefix when it is bound, preserving an explicit "any" prefix
/// only when neither side is bound.
fn fill_prefix(lhs: Option<IpNetwork>, rhs: Option<IpNetwork>) -> Option<IpNetwork> {
    bound(lhs).or(bound(rhs)).or(lhs).or(rhs)
}

fn strip_prefix(lhs: Option<IpNetwork>, rhs: Option<IpNetwork>) -> Option<IpNetwork> {
    match (bound(lhs), bound(rhs)) {
        (Some(l), Some(r)) if l == r => None,
        _ => lhs,
    }
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Builders ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn with_family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: Table) -> Self {
        self.table = Some(table);
        self
    }

    #[must_use]
    pub fn with_chain(mut self, chain: Chain) -> Self {
        self.chain = Some(chain);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn with_src(mut self, src: IpNetwork) -> Self {
        self.src = Some(src);
        self
    }

    #[must_use]
    pub fn with_dst(mut self, dst: IpNetwork) -> Self {
        self.dst = Some(dst);
        self
    }

    #[must_use]
    pub fn with_in_interface(mut self, name: impl Into<String>) -> Self {
        self.in_interface = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_out_interface(mut self, name: impl Into<String>) -> Self {
        self.out_interface = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    #[must_use]
    pub fn with_fragment(mut self, fragment: bool) -> Self {
        self.fragment = Some(fragment);
        self
    }

    /// Adds a match group, merging into an existing group of the same module.
    /// Values already present win.
    #[must_use]
    pub fn with_match(mut self, params: MatchParams) -> Self {
        let merged = match self.matches.get(&params.kind()) {
            Some(existing) => existing.combine(&params),
            None => params,
        };
        self.matches.insert(merged.kind(), merged);
        self
    }

    #[must_use]
    pub fn tcp_dport(self, port: impl Into<PortRange>) -> Self {
        self.with_match(MatchParams::Tcp(PortMatch::dport(port)))
    }

    #[must_use]
    pub fn tcp_sport(self, port: impl Into<PortRange>) -> Self {
        self.with_match(MatchParams::Tcp(PortMatch::sport(port)))
    }

    #[must_use]
    pub fn udp_dport(self, port: impl Into<PortRange>) -> Self {
        self.with_match(MatchParams::Udp(PortMatch::dport(port)))
    }

    #[must_use]
    pub fn udp_sport(self, port: impl Into<PortRange>) -> Self {
        self.with_match(MatchParams::Udp(PortMatch::sport(port)))
    }

    #[must_use]
    pub fn icmp_type(self, icmp_type: IcmpType) -> Self {
        self.with_match(MatchParams::Icmp(IcmpMatch {
            icmp_type: Some(icmp_type),
        }))
    }

    #[must_use]
    pub fn icmp6_type(self, icmp_type: IcmpType) -> Self {
        self.with_match(MatchParams::Icmp6(IcmpMatch {
            icmp_type: Some(icmp_type),
        }))
    }

    #[must_use]
    pub fn ctstate(self, states: &[CtState]) -> Self {
        self.with_match(MatchParams::Conntrack(ConntrackMatch::states(states)))
    }

    // ─── Views ────────────────────────────────────────────────────────────

    /// Source prefix unless it is the "any" prefix
    pub fn bound_src(&self) -> Option<IpNetwork> {
        bound(self.src)
    }

    /// Destination prefix unless it is the "any" prefix
    pub fn bound_dst(&self) -> Option<IpNetwork> {
        bound(self.dst)
    }

    /// Match groups that carry at least one parameter.
    pub fn active_matches(&self) -> impl Iterator<Item = &MatchParams> {
        self.matches.values().filter(|params| !params.is_empty())
    }

    /// Family the rule is pinned to by its explicit family, addresses, protocol
    /// or family-specific match modules.
    ///
    /// # Errors
    ///
    /// [`AlgebraError::TypeMismatch`] when two of those sources disagree.
    pub fn address_family(&self) -> Result<Option<Family>, AlgebraError> {
        let sources = self
            .family
            .into_iter()
            .chain(self.src.iter().map(Family::of))
            .chain(self.dst.iter().map(Family::of))
            .chain(self.protocol.and_then(Protocol::family))
            .chain(self.matches.values().flat_map(MatchParams::address_families));

        let mut pinned: Option<Family> = None;
        for found in sources {
            match pinned {
                None => pinned = Some(found),
                Some(expected) if expected != found => {
                    return Err(AlgebraError::TypeMismatch { expected, found });
                }
                Some(_) => {}
            }
        }
        Ok(pinned)
    }

    /// Protocol as set, or implied by a protocol-specific match module.
    pub fn effective_protocol(&self) -> Option<Protocol> {
        self.protocol.or_else(|| {
            self.active_matches().find_map(|params| match params.kind() {
                MatchKind::Tcp => Some(Protocol::Tcp),
                MatchKind::Udp => Some(Protocol::Udp),
                MatchKind::Icmp => Some(Protocol::Icmp),
                MatchKind::Icmp6 => Some(Protocol::Ipv6Icmp),
                MatchKind::IpRange | MatchKind::Conntrack => None,
            })
        })
    }

    /// `(family, table, chain)` the rule is installed in, with unset parts defaulted.
    pub fn location(&self) -> (Family, Table, Chain) {
        (
            self.address_family()
                .ok()
                .flatten()
                .unwrap_or(Family::Ipv4),
            self.table.unwrap_or_default(),
            self.chain.clone().unwrap_or(Chain::Output),
        )
    }

    /// Copy with every placement field decided: family inferred from the rule's
    /// contents (IPv4 when nothing pins it), table `filter`, chain `OUTPUT`,
    /// target `ACCEPT`, protocol implied by match modules.
    ///
    /// # Errors
    ///
    /// [`AlgebraError::TypeMismatch`] when the rule mixes address families.
    pub fn resolved(&self) -> Result<Rule, AlgebraError> {
        let family = self.address_family()?.unwrap_or(Family::Ipv4);
        let mut resolved = self.clone();
        resolved.family = Some(family);
        resolved.table = Some(self.table.unwrap_or_default());
        resolved.chain = Some(self.chain.clone().unwrap_or(Chain::Output));
        resolved.target = Some(self.target.clone().unwrap_or(Target::Accept));
        resolved.protocol = self.effective_protocol();
        resolved.matches.retain(|_, params| !params.is_empty());
        Ok(resolved)
    }

    // ─── Algebra ──────────────────────────────────────────────────────────

    /// Field-wise merge where `self` wins: every field set on `self` is kept and
    /// only unset fields are taken from `other`. Match groups of the same module
    /// are merged parameter by parameter.
    ///
    /// # Errors
    ///
    /// [`AlgebraError::TypeMismatch`] when the operands are pinned to different
    /// address families.
    pub fn combine(&self, other: &Rule) -> Result<Rule, AlgebraError> {
        if let (Some(expected), Some(found)) = (self.address_family()?, other.address_family()?)
            && expected != found
        {
            return Err(AlgebraError::TypeMismatch { expected, found });
        }

        let mut matches = self.matches.clone();
        for (kind, params) in &other.matches {
            let merged = match matches.get(kind) {
                Some(existing) => existing.combine(params),
                None => params.clone(),
            };
            matches.insert(*kind, merged);
        }

        let combined = Rule {
            family: self.family.or(other.family),
            table: self.table.or(other.table),
            chain: fill(&self.chain, &other.chain),
            target: fill(&self.target, &other.target),
            src: fill_prefix(self.src, other.src),
            dst: fill_prefix(self.dst, other.dst),
            in_interface: fill(&self.in_interface, &other.in_interface),
            out_interface: fill(&self.out_interface, &other.out_interface),
            protocol: self.protocol.or(other.protocol),
            fragment: self.fragment.or(other.fragment),
            matches,
        };

        combined.address_family()?;
        Ok(combined)
    }

    /// Removes every field whose value equals the corresponding value in `other`.
    /// Fields unset in `other` are unaffected and emptied match groups are dropped.
    #[must_use]
    pub fn diff(&self, other: &Rule) -> Rule {
        let matches = self
            .matches
            .iter()
            .filter_map(|(kind, params)| {
                let remaining = match other.matches.get(kind) {
                    Some(theirs) => params.diff(theirs),
                    None => (!params.is_empty()).then(|| params.clone()),
                };
                remaining.map(|params| (*kind, params))
            })
            .collect();

        Rule {
            family: strip(&self.family, &other.family),
            table: strip(&self.table, &other.table),
            chain: strip(&self.chain, &other.chain),
            target: strip(&self.target, &other.target),
            src: strip_prefix(self.src, other.src),
            dst: strip_prefix(self.dst, other.dst),
            in_interface: strip(&self.in_interface, &other.in_interface),
            out_interface: strip(&self.out_interface, &other.out_interface),
            protocol: strip(&self.protocol, &other.protocol),
            fragment: strip(&self.fragment, &other.fragment),
            matches,
        }
    }

    /// Direction reversal in place. Applying it twice restores the rule.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.src, &mut self.dst);
        std::mem::swap(&mut self.in_interface, &mut self.out_interface);
        self.chain = self.chain.as_ref().map(Chain::flipped);
        for params in self.matches.values_mut() {
            params.flip();
        }
    }

    #[must_use]
    pub fn flipped(&self) -> Rule {
        let mut rule = self.clone();
        rule.flip();
        rule
    }

    /// True when every field `self` constrains is present in `specific` with
    /// an equal value. A rule with nothing set subsumes every rule.
    pub fn subsumes(&self, specific: &Rule) -> bool {
        let family_covered = self.family.is_none()
            || specific.family == self.family
            || specific.address_family().ok().flatten() == self.family;

        let protocol_covered = self.protocol.is_none()
            || self.effective_protocol() == specific.effective_protocol();

        let matches_covered = self.active_matches().all(|general| {
            specific
                .matches
                .get(&general.kind())
                .is_some_and(|params| general.subsumes(params))
        });

        family_covered
            && protocol_covered
            && matches_covered
            && covers(&self.table, &specific.table)
            && covers(&self.chain, &specific.chain)
            && covers(&self.target, &specific.target)
            && covers(&self.bound_src(), &specific.bound_src())
            && covers(&self.bound_dst(), &specific.bound_dst())
            && covers(&self.in_interface, &specific.in_interface)
            && covers(&self.out_interface, &specific.out_interface)
            && covers(&self.fragment, &specific.fragment)
    }

    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Rule::default()
    }

    // ─── Rendering ────────────────────────────────────────────────────────

    /// Rule specification as iptables arguments (everything after `-A CHAIN`).
    pub fn spec_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let family = self
            .address_family()
            .ok()
            .flatten()
            .unwrap_or(Family::Ipv4);

        if let Some(src) = self.bound_src() {
            args.extend(["-s".to_string(), src.to_string()]);
        }
        if let Some(dst) = self.bound_dst() {
            args.extend(["-d".to_string(), dst.to_string()]);
        }
        if let Some(iface) = &self.in_interface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_interface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(protocol) = self.effective_protocol() {
            args.extend(["-p".to_string(), protocol.to_string()]);
        }
        match self.fragment {
            Some(true) => args.push("-f".to_string()),
            Some(false) => args.extend(["!".to_string(), "-f".to_string()]),
            None => {}
        }
        for params in self.active_matches() {
            args.extend(["-m".to_string(), params.kind().to_string()]);
            for (option, value) in params.options(family) {
                args.extend([option.to_string(), value]);
            }
        }
        if let Some(target) = &self.target {
            args.extend(["-j".to_string(), target.to_string()]);
        }

        args
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family
            && self.table == other.table
            && self.chain == other.chain
            && self.target == other.target
            && self.bound_src() == other.bound_src()
            && self.bound_dst() == other.bound_dst()
            && self.in_interface == other.in_interface
            && self.out_interface == other.out_interface
            && self.protocol == other.protocol
            && self.fragment == other.fragment
            && self.active_matches().eq(other.active_matches())
    }
}

impl Eq for Rule {}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(family) = self.family {
            parts.push(family.to_string());
        }
        if let Some(table) = self.table {
            parts.push(table.to_string());
        }
        if let Some(chain) = &self.chain {
            parts.push(chain.to_string());
        }
        parts.extend(self.spec_args());

        if parts.is_empty() {
            f.write_str("(any)")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}
