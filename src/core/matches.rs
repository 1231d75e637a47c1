//! Match-module parameter groups
//!
//! Every iptables match module a [`Rule`](crate::core::rule::Rule) can carry is a
//! closed variant of [`MatchParams`]. Each variant knows how to merge, diff,
//! direction-reverse and subsume itself, so the rule algebra never deals with
//! free-form key/value maps.
//!
//! | Module      | Parameters                 | Reversal                         |
//! |-------------|----------------------------|----------------------------------|
//! | `tcp`/`udp` | `sport`, `dport`           | swaps `sport` and `dport`        |
//! | `icmp`      | `icmp-type`                | `echo-request` ↔ `echo-reply`    |
//! | `icmp6`     | `icmpv6-type`              | `echo-request` ↔ `echo-reply`    |
//! | `iprange`   | `src-range`, `dst-range`   | swaps the two ranges             |
//! | `conntrack` | `ctstate`                  | none                             |

use crate::core::error::SchemaError;
use crate::core::rule::Family;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Tag identifying a match module. Doubles as the key of a rule's match map.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum MatchKind {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "icmp6")]
    Icmp6,
    #[strum(serialize = "iprange")]
    IpRange,
    #[strum(serialize = "conntrack")]
    Conntrack,
}

/// Single port or inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

impl From<u16> for PortRange {
    fn from(port: u16) -> Self {
        Self::single(port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = SchemaError;

    /// Accepts `22`, `1024:65535` and `1024-65535`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| SchemaError::invalid("port", s))
        };

        match s.split_once([':', '-']) {
            Some((start, end)) => {
                let (start, end) = crate::validators::validate_port_range(parse(start)?, parse(end)?)
                    .map_err(|_| SchemaError::invalid("port", s))?;
                Ok(Self::new(start, end))
            }
            None => {
                let port = crate::validators::validate_port(parse(s)?)
                    .map_err(|_| SchemaError::invalid("port", s))?;
                Ok(Self::single(port))
            }
        }
    }
}

/// Inclusive address range used by the `iprange` module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl AddrRange {
    pub fn family(&self) -> Family {
        Family::of_addr(&self.start)
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for AddrRange {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::invalid("address range", s);
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: IpAddr = start.trim().parse().map_err(|_| invalid())?;
        let end: IpAddr = end.trim().parse().map_err(|_| invalid())?;

        if start.is_ipv4() != end.is_ipv4() {
            return Err(invalid());
        }

        Ok(Self { start, end })
    }
}

/// ICMP and ICMPv6 message types known to the reversal table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum IcmpType {
    EchoRequest,
    EchoReply,
    DestinationUnreachable,
    Redirect,
    TimeExceeded,
    ParameterProblem,
    PacketTooBig,
    RouterSolicitation,
    RouterAdvertisement,
    NeighbourSolicitation,
    NeighbourAdvertisement,
}

impl IcmpType {
    /// Reverses the direction of request/reply pairs.
    pub fn flipped(self) -> Self {
        match self {
            IcmpType::EchoRequest => IcmpType::EchoReply,
            IcmpType::EchoReply => IcmpType::EchoRequest,
            other => other,
        }
    }

    /// Numeric type as listed by `iptables -S` / `ip6tables -S`
    pub fn code(self, family: Family) -> Option<u8> {
        let code = match (family, self) {
            (Family::Ipv4, IcmpType::EchoReply) => 0,
            (Family::Ipv4, IcmpType::DestinationUnreachable) => 3,
            (Family::Ipv4, IcmpType::Redirect) => 5,
            (Family::Ipv4, IcmpType::EchoRequest) => 8,
            (Family::Ipv4, IcmpType::RouterAdvertisement) => 9,
            (Family::Ipv4, IcmpType::RouterSolicitation) => 10,
            (Family::Ipv4, IcmpType::TimeExceeded) => 11,
            (Family::Ipv4, IcmpType::ParameterProblem) => 12,
            (Family::Ipv6, IcmpType::DestinationUnreachable) => 1,
            (Family::Ipv6, IcmpType::PacketTooBig) => 2,
            (Family::Ipv6, IcmpType::TimeExceeded) => 3,
            (Family::Ipv6, IcmpType::ParameterProblem) => 4,
            (Family::Ipv6, IcmpType::EchoRequest) => 128,
            (Family::Ipv6, IcmpType::EchoReply) => 129,
            (Family::Ipv6, IcmpType::RouterSolicitation) => 133,
            (Family::Ipv6, IcmpType::RouterAdvertisement) => 134,
            (Family::Ipv6, IcmpType::NeighbourSolicitation) => 135,
            (Family::Ipv6, IcmpType::NeighbourAdvertisement) => 136,
            (Family::Ipv6, IcmpType::Redirect) => 137,
            _ => return None,
        };
        Some(code)
    }

    /// Parses a type name, a numeric type or `type/code` (code ignored).
    pub fn parse(family: Family, value: &str) -> Result<Self, SchemaError> {
        if let Ok(named) = value.parse::<IcmpType>() {
            return Ok(named);
        }

        let numeric = value.split('/').next().unwrap_or(value);
        let code: u8 = numeric
            .parse()
            .map_err(|_| SchemaError::invalid("icmp type", value))?;

        <IcmpType as strum::IntoEnumIterator>::iter()
            .find(|t| t.code(family) == Some(code))
            .ok_or_else(|| SchemaError::invalid("icmp type", value))
    }
}

/// Connection tracking states for the `conntrack` module
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum CtState {
    New,
    Established,
    Related,
    Invalid,
    Untracked,
}

/// Parameters of the `tcp` and `udp` modules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortMatch {
    pub sport: Option<PortRange>,
    pub dport: Option<PortRange>,
}

impl PortMatch {
    pub fn dport(port: impl Into<PortRange>) -> Self {
        Self {
            sport: None,
            dport: Some(port.into()),
        }
    }

    pub fn sport(port: impl Into<PortRange>) -> Self {
        Self {
            sport: Some(port.into()),
            dport: None,
        }
    }
}

/// Parameters of the `icmp` and `icmp6` modules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IcmpMatch {
    pub icmp_type: Option<IcmpType>,
}

/// Parameters of the `iprange` module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RangeMatch {
    pub src_range: Option<AddrRange>,
    pub dst_range: Option<AddrRange>,
}

/// Parameters of the `conntrack` module
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConntrackMatch {
    pub ctstate: Option<BTreeSet<CtState>>,
}

impl ConntrackMatch {
    pub fn states(states: &[CtState]) -> Self {
        Self {
            ctstate: Some(states.iter().copied().collect()),
        }
    }
}

/// A match-module parameter group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchParams {
    Tcp(PortMatch),
    Udp(PortMatch),
    Icmp(IcmpMatch),
    Icmp6(IcmpMatch),
    IpRange(RangeMatch),
    Conntrack(ConntrackMatch),
}

/// Field-wise "keep left if set" merge
fn fill<T: Clone>(lhs: &Option<T>, rhs: &Option<T>) -> Option<T> {
    lhs.clone().or_else(|| rhs.clone())
}

/// Drops the left value when both sides carry the same value
fn strip<T: Clone + PartialEq>(lhs: &Option<T>, rhs: &Option<T>) -> Option<T> {
    match (lhs, rhs) {
        (Some(l), Some(r)) if l == r => None,
        _ => lhs.clone(),
    }
}

/// True when every value the general side sets is set identically on the specific side
fn covers<T: PartialEq>(general: &Option<T>, specific: &Option<T>) -> bool {
    general.is_none() || general == specific
}

impl MatchParams {
    pub fn kind(&self) -> MatchKind {
        match self {
            MatchParams::Tcp(_) => MatchKind::Tcp,
            MatchParams::Udp(_) => MatchKind::Udp,
            MatchParams::Icmp(_) => MatchKind::Icmp,
            MatchParams::Icmp6(_) => MatchKind::Icmp6,
            MatchParams::IpRange(_) => MatchKind::IpRange,
            MatchParams::Conntrack(_) => MatchKind::Conntrack,
        }
    }

    /// Returns `true` when no parameter of the group is set.
    pub fn is_empty(&self) -> bool {
        match self {
            MatchParams::Tcp(p) | MatchParams::Udp(p) => p.sport.is_none() && p.dport.is_none(),
            MatchParams::Icmp(p) | MatchParams::Icmp6(p) => p.icmp_type.is_none(),
            MatchParams::IpRange(p) => p.src_range.is_none() && p.dst_range.is_none(),
            MatchParams::Conntrack(p) => p.ctstate.is_none(),
        }
    }

    /// Address family this group pins the rule to, if any.
    pub fn family(&self) -> Option<Family> {
        match self {
            MatchParams::Icmp(_) => Some(Family::Ipv4),
            MatchParams::Icmp6(_) => Some(Family::Ipv6),
            MatchParams::IpRange(p) => p
                .src_range
                .or(p.dst_range)
                .map(|range| range.family()),
            _ => None,
        }
    }

    /// Families of every address carried by the group (used for mismatch checks).
    pub(crate) fn address_families(&self) -> Vec<Family> {
        match self {
            MatchParams::IpRange(p) => p
                .src_range
                .iter()
                .chain(p.dst_range.iter())
                .flat_map(|r| [Family::of_addr(&r.start), Family::of_addr(&r.end)])
                .collect(),
            other => other.family().into_iter().collect(),
        }
    }

    /// Merges two groups of the same module; `self` wins where both are set.
    ///
    /// Groups of different modules never meet because the rule's match map is
    /// keyed by [`MatchKind`]; `self` is returned unchanged in that case.
    pub fn combine(&self, other: &MatchParams) -> MatchParams {
        match (self, other) {
            (MatchParams::Tcp(a), MatchParams::Tcp(b)) => MatchParams::Tcp(PortMatch {
                sport: fill(&a.sport, &b.sport),
                dport: fill(&a.dport, &b.dport),
            }),
            (MatchParams::Udp(a), MatchParams::Udp(b)) => MatchParams::Udp(PortMatch {
                sport: fill(&a.sport, &b.sport),
                dport: fill(&a.dport, &b.dport),
            }),
            (MatchParams::Icmp(a), MatchParams::Icmp(b)) => MatchParams::Icmp(IcmpMatch {
                icmp_type: fill(&a.icmp_type, &b.icmp_type),
            }),
            (MatchParams::Icmp6(a), MatchParams::Icmp6(b)) => MatchParams::Icmp6(IcmpMatch {
                icmp_type: fill(&a.icmp_type, &b.icmp_type),
            }),
            (MatchParams::IpRange(a), MatchParams::IpRange(b)) => MatchParams::IpRange(RangeMatch {
                src_range: fill(&a.src_range, &b.src_range),
                dst_range: fill(&a.dst_range, &b.dst_range),
            }),
            (MatchParams::Conntrack(a), MatchParams::Conntrack(b)) => {
                MatchParams::Conntrack(ConntrackMatch {
                    ctstate: fill(&a.ctstate, &b.ctstate),
                })
            }
            _ => self.clone(),
        }
    }

    /// Removes every parameter whose value equals the other group's.
    /// Returns `None` when nothing is left.
    pub fn diff(&self, other: &MatchParams) -> Option<MatchParams> {
        let remaining = match (self, other) {
            (MatchParams::Tcp(a), MatchParams::Tcp(b)) => MatchParams::Tcp(PortMatch {
                sport: strip(&a.sport, &b.sport),
                dport: strip(&a.dport, &b.dport),
            }),
            (MatchParams::Udp(a), MatchParams::Udp(b)) => MatchParams::Udp(PortMatch {
                sport: strip(&a.sport, &b.sport),
                dport: strip(&a.dport, &b.dport),
            }),
            (MatchParams::Icmp(a), MatchParams::Icmp(b)) => MatchParams::Icmp(IcmpMatch {
                icmp_type: strip(&a.icmp_type, &b.icmp_type),
            }),
            (MatchParams::Icmp6(a), MatchParams::Icmp6(b)) => MatchParams::Icmp6(IcmpMatch {
                icmp_type: strip(&a.icmp_type, &b.icmp_type),
            }),
            (MatchParams::IpRange(a), MatchParams::IpRange(b)) => MatchParams::IpRange(RangeMatch {
                src_range: strip(&a.src_range, &b.src_range),
                dst_range: strip(&a.dst_range, &b.dst_range),
            }),
            (MatchParams::Conntrack(a), MatchParams::Conntrack(b)) => {
                MatchParams::Conntrack(ConntrackMatch {
                    ctstate: strip(&a.ctstate, &b.ctstate),
                })
            }
            _ => self.clone(),
        };

        (!remaining.is_empty()).then_some(remaining)
    }

    /// Direction reversal. An involution for every variant.
    pub fn flip(&mut self) {
        match self {
            MatchParams::Tcp(p) | MatchParams::Udp(p) => std::mem::swap(&mut p.sport, &mut p.dport),
            MatchParams::Icmp(p) | MatchParams::Icmp6(p) => {
                p.icmp_type = p.icmp_type.map(IcmpType::flipped);
            }
            MatchParams::IpRange(p) => std::mem::swap(&mut p.src_range, &mut p.dst_range),
            MatchParams::Conntrack(_) => {}
        }
    }

    /// True when every parameter set on `self` is set to the same value on `specific`.
    pub fn subsumes(&self, specific: &MatchParams) -> bool {
        match (self, specific) {
            (MatchParams::Tcp(g), MatchParams::Tcp(s)) | (MatchParams::Udp(g), MatchParams::Udp(s)) => {
                covers(&g.sport, &s.sport) && covers(&g.dport, &s.dport)
            }
            (MatchParams::Icmp(g), MatchParams::Icmp(s))
            | (MatchParams::Icmp6(g), MatchParams::Icmp6(s)) => covers(&g.icmp_type, &s.icmp_type),
            (MatchParams::IpRange(g), MatchParams::IpRange(s)) => {
                covers(&g.src_range, &s.src_range) && covers(&g.dst_range, &s.dst_range)
            }
            (MatchParams::Conntrack(g), MatchParams::Conntrack(s)) => covers(&g.ctstate, &s.ctstate),
            _ => false,
        }
    }

    /// Parameters as `(iptables option, value)` pairs, in listing order.
    pub fn options(&self, family: Family) -> Vec<(&'static str, String)> {
        let mut options = Vec::with_capacity(2);
        match self {
            MatchParams::Tcp(p) | MatchParams::Udp(p) => {
                if let Some(sport) = p.sport {
                    options.push(("--sport", sport.to_string()));
                }
                if let Some(dport) = p.dport {
                    options.push(("--dport", dport.to_string()));
                }
            }
            MatchParams::Icmp(p) => {
                if let Some(icmp_type) = p.icmp_type {
                    options.push(("--icmp-type", icmp_value(icmp_type, family)));
                }
            }
            MatchParams::Icmp6(p) => {
                if let Some(icmp_type) = p.icmp_type {
                    options.push(("--icmpv6-type", icmp_value(icmp_type, family)));
                }
            }
            MatchParams::IpRange(p) => {
                if let Some(range) = p.src_range {
                    options.push(("--src-range", range.to_string()));
                }
                if let Some(range) = p.dst_range {
                    options.push(("--dst-range", range.to_string()));
                }
            }
            MatchParams::Conntrack(p) => {
                if let Some(states) = &p.ctstate {
                    let joined = states
                        .iter()
                        .map(CtState::as_ref)
                        .collect::<Vec<_>>()
                        .join(",");
                    options.push(("--ctstate", joined));
                }
            }
        }
        options
    }

    /// Parameters as `(name, value)` pairs using profile spelling.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            MatchParams::Icmp(p) | MatchParams::Icmp6(p) => p
                .icmp_type
                .map(|t| ("icmp-type", t.to_string()))
                .into_iter()
                .collect(),
            // Family only affects ICMP spelling, handled above
            other => other
                .options(Family::Ipv4)
                .into_iter()
                .map(|(option, value)| (option.trim_start_matches("--"), value))
                .collect(),
        }
    }

    /// Builds a group from textual parameters.
    ///
    /// Keys are accepted in profile spelling (`dport`, `icmp_type`) and iptables
    /// spelling (`--dport`, `--icmp-type`).
    ///
    /// # Errors
    ///
    /// - [`SchemaError::UnsupportedMatchModule`] for modules outside [`MatchKind`]
    /// - [`SchemaError::UnknownMatchKey`] for parameters the module does not have
    /// - [`SchemaError::InvalidValue`] for unparsable values, or an ICMP module
    ///   of the other family when `family` is known
    pub fn from_params<'a, I>(
        module: &str,
        family: Option<Family>,
        params: I,
    ) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let kind: MatchKind = module
            .parse()
            .map_err(|_| SchemaError::UnsupportedMatchModule(module.to_string()))?;

        let mut group = match kind {
            MatchKind::Tcp => MatchParams::Tcp(PortMatch::default()),
            MatchKind::Udp => MatchParams::Udp(PortMatch::default()),
            MatchKind::Icmp => MatchParams::Icmp(IcmpMatch::default()),
            MatchKind::Icmp6 => MatchParams::Icmp6(IcmpMatch::default()),
            MatchKind::IpRange => MatchParams::IpRange(RangeMatch::default()),
            MatchKind::Conntrack => MatchParams::Conntrack(ConntrackMatch::default()),
        };

        if let Some(family) = family {
            match (kind, family) {
                (MatchKind::Icmp, Family::Ipv6) | (MatchKind::Icmp6, Family::Ipv4) => {
                    return Err(SchemaError::invalid(module, family.to_string()));
                }
                _ => {}
            }
        }

        for (key, value) in params {
            let normalized = key.trim_start_matches("--").replace('_', "-");
            let unknown = || SchemaError::UnknownMatchKey {
                module: module.to_string(),
                key: key.to_string(),
            };

            match (&mut group, normalized.as_str()) {
                (MatchParams::Tcp(p) | MatchParams::Udp(p), "sport" | "source-port") => {
                    p.sport = Some(value.parse()?);
                }
                (MatchParams::Tcp(p) | MatchParams::Udp(p), "dport" | "destination-port") => {
                    p.dport = Some(value.parse()?);
                }
                (MatchParams::Icmp(p), "icmp-type") => {
                    p.icmp_type = Some(IcmpType::parse(Family::Ipv4, value)?);
                }
                (MatchParams::Icmp6(p), "icmpv6-type" | "icmp-type") => {
                    p.icmp_type = Some(IcmpType::parse(Family::Ipv6, value)?);
                }
                (MatchParams::IpRange(p), "src-range") => p.src_range = Some(value.parse()?),
                (MatchParams::IpRange(p), "dst-range") => p.dst_range = Some(value.parse()?),
                (MatchParams::Conntrack(p), "ctstate") => {
                    let states = value
                        .split(',')
                        .map(|state| {
                            state
                                .trim()
                                .parse::<CtState>()
                                .map_err(|_| SchemaError::invalid("ctstate", value))
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    p.ctstate = Some(states);
                }
                _ => return Err(unknown()),
            }
        }

        Ok(group)
    }
}

/// iptables lists ICMP types numerically; names are accepted on input.
fn icmp_value(icmp_type: IcmpType, family: Family) -> String {
    icmp_type
        .code(family)
        .map_or_else(|| icmp_type.to_string(), |code| code.to_string())
}
