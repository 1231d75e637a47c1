//! Network interface information and interface-scoped rules
//!
//! [`NetworkInfoProvider`] answers three questions about the host: which
//! interfaces exist, which addresses they carry and which gateways they route
//! through. [`interface_rules`] turns those answers into address-scoped rules,
//! for example "traffic leaving through eth0 towards its gateway only".
//!
//! Gateways are read from `/proc/net/route` and `/proc/net/ipv6_route`;
//! interfaces and addresses come from the `network-interface` crate.

use crate::core::array::RuleArray;
use crate::core::error::{Error, Result};
use crate::core::rule::{Chain, Family, Rule, Table};
use ipnetwork::IpNetwork;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub addr: IpAddr,
    pub netmask: Option<IpAddr>,
}

impl InterfaceAddress {
    pub fn family(&self) -> Family {
        Family::of_addr(&self.addr)
    }

    /// The address as a host prefix (/32 or /128)
    pub fn host(&self) -> IpNetwork {
        IpNetwork::from(self.addr)
    }

    /// Network the address lives in, when the netmask is known and contiguous.
    pub fn subnet(&self) -> Option<IpNetwork> {
        let with_mask = IpNetwork::with_netmask(self.addr, self.netmask?).ok()?;
        IpNetwork::new(with_mask.network(), with_mask.prefix()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub addr: IpAddr,
    pub interface: String,
}

/// Source of host network facts
pub trait NetworkInfoProvider {
    fn interfaces(&self) -> Result<Vec<String>>;

    fn addresses(&self, name: &str, family: Family) -> Result<Vec<InterfaceAddress>>;

    fn gateways(&self, family: Family) -> Result<Vec<Gateway>>;
}

/// Live host information
#[derive(Debug, Clone, Default)]
pub struct SystemNetworkInfo;

impl SystemNetworkInfo {
    fn snapshot() -> Result<BTreeMap<String, Vec<InterfaceAddress>>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| Error::Internal(format!("failed to enumerate interfaces: {e}")))?;

        // One entry per address, so the same name can appear several times
        let mut by_name: BTreeMap<String, Vec<InterfaceAddress>> = BTreeMap::new();
        for iface in interfaces {
            let addresses = by_name.entry(iface.name).or_default();
            addresses.extend(iface.addr.iter().map(|addr| InterfaceAddress {
                addr: addr.ip(),
                netmask: addr.netmask(),
            }));
        }
        Ok(by_name)
    }
}

impl NetworkInfoProvider for SystemNetworkInfo {
    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(Self::snapshot()?.into_keys().collect())
    }

    fn addresses(&self, name: &str, family: Family) -> Result<Vec<InterfaceAddress>> {
        let mut snapshot = Self::snapshot()?;
        let addresses = snapshot.remove(name).ok_or_else(|| Error::Validation {
            field: "interface".to_string(),
            message: format!("no such interface: {name}"),
        })?;
        Ok(addresses
            .into_iter()
            .filter(|a| a.family() == family)
            .collect())
    }

    fn gateways(&self, family: Family) -> Result<Vec<Gateway>> {
        let (path, parse): (&str, fn(&str) -> Vec<Gateway>) = match family {
            Family::Ipv4 => ("/proc/net/route", parse_ipv4_routes),
            Family::Ipv6 => ("/proc/net/ipv6_route", parse_ipv6_routes),
        };

        match std::fs::read_to_string(path) {
            Ok(table) => Ok(parse(&table)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not present, assuming no {} gateways", path, family);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Default-route gateways from `/proc/net/route`.
///
/// Columns: `Iface Destination Gateway Flags …`, addresses as little-endian hex.
pub fn parse_ipv4_routes(table: &str) -> Vec<Gateway> {
    const RTF_GATEWAY: u32 = 0x2;

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [iface, destination, gateway, flags, ..] = fields.as_slice() else {
                return None;
            };
            let flags = u32::from_str_radix(flags, 16).ok()?;
            if *destination != "00000000" || flags & RTF_GATEWAY == 0 {
                return None;
            }
            let raw = u32::from_str_radix(gateway, 16).ok()?;
            Some(Gateway {
                addr: IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes())),
                interface: (*iface).to_string(),
            })
        })
        .collect()
}

/// Default-route gateways from `/proc/net/ipv6_route`.
///
/// Columns: `dest dest_len src src_len next_hop metric refcnt use flags iface`.
pub fn parse_ipv6_routes(table: &str) -> Vec<Gateway> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [dest, dest_len, _, _, next_hop, _, _, _, _, iface] = fields.as_slice() else {
                return None;
            };
            if u128::from_str_radix(dest, 16).ok()? != 0 || *dest_len != "00" {
                return None;
            }
            let hop = u128::from_str_radix(next_hop, 16).ok()?;
            if hop == 0 {
                return None;
            }
            Some(Gateway {
                addr: IpAddr::V6(Ipv6Addr::from(hop)),
                interface: (*iface).to_string(),
            })
        })
        .collect()
}

/// Fixed network facts, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkInfo {
    addresses: BTreeMap<String, Vec<InterfaceAddress>>,
    gateways: Vec<Gateway>,
}

impl StaticNetworkInfo {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_interface(mut self, name: &str) -> Self {
        self.addresses.entry(name.to_string()).or_default();
        self
    }

    #[must_use]
    pub fn with_address(mut self, name: &str, addr: IpAddr, netmask: Option<IpAddr>) -> Self {
        self.addresses
            .entry(name.to_string())
            .or_default()
            .push(InterfaceAddress { addr, netmask });
        self
    }

    #[must_use]
    pub fn with_gateway(mut self, name: &str, addr: IpAddr) -> Self {
        self.addresses.entry(name.to_string()).or_default();
        self.gateways.push(Gateway {
            addr,
            interface: name.to_string(),
        });
        self
    }
}

impl NetworkInfoProvider for StaticNetworkInfo {
    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.addresses.keys().cloned().collect())
    }

    fn addresses(&self, name: &str, family: Family) -> Result<Vec<InterfaceAddress>> {
        let addresses = self.addresses.get(name).ok_or_else(|| Error::Validation {
            field: "interface".to_string(),
            message: format!("no such interface: {name}"),
        })?;
        Ok(addresses
            .iter()
            .filter(|a| a.family() == family)
            .copied()
            .collect())
    }

    fn gateways(&self, family: Family) -> Result<Vec<Gateway>> {
        Ok(self
            .gateways
            .iter()
            .filter(|g| Family::of_addr(&g.addr) == family)
            .cloned()
            .collect())
    }
}

/// Address an interface rule may be restricted to on one side
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    /// No address restriction
    #[default]
    Any,
    /// The interface's gateways
    Gateway,
    /// The interface's subnets
    Subnet,
    /// The interface's own addresses
    Host,
}

/// How [`interface_rules`] scopes its rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceScope {
    pub family: Family,
    pub table: Option<Table>,
    pub chain: Option<Chain>,
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Restrict to `in_interface` where the chain sees inbound traffic
    pub restrict_in: bool,
    /// Restrict to `out_interface` where the chain sees outbound traffic
    pub restrict_out: bool,
}

impl Default for InterfaceScope {
    fn default() -> Self {
        Self {
            family: Family::Ipv4,
            table: None,
            chain: None,
            src: Endpoint::Any,
            dst: Endpoint::Any,
            restrict_in: true,
            restrict_out: true,
        }
    }
}

fn candidates(
    provider: &dyn NetworkInfoProvider,
    name: &str,
    family: Family,
    endpoint: Endpoint,
) -> Result<Vec<Option<IpNetwork>>> {
    let gateways = || -> Result<Vec<IpAddr>> {
        Ok(provider
            .gateways(family)?
            .into_iter()
            .filter(|g| g.interface == name)
            .map(|g| g.addr)
            .collect())
    };

    Ok(match endpoint {
        // One open slot per gateway, so pairing with the other side stays aligned
        Endpoint::Any => gateways()?.iter().map(|_| None).collect(),
        Endpoint::Gateway => gateways()?
            .into_iter()
            .map(|addr| Some(IpNetwork::from(addr)))
            .collect(),
        Endpoint::Subnet => provider
            .addresses(name, family)?
            .iter()
            .filter_map(InterfaceAddress::subnet)
            .map(Some)
            .collect(),
        Endpoint::Host => provider
            .addresses(name, family)?
            .iter()
            .map(|a| Some(a.host()))
            .collect(),
    })
}

/// Rules restricting traffic to one interface.
///
/// The interface restriction follows the chain: INPUT and PREROUTING see
/// `in_interface`, OUTPUT and POSTROUTING `out_interface`, FORWARD both.
/// Without a chain no interface restriction is added.
///
/// Source and destination candidates are paired up in order, the shorter list
/// deciding the number of rules. [`Endpoint::Any`] contributes one open slot
/// per gateway of the interface. When the source side has no candidates at
/// all, a single rule without address restriction comes first.
///
/// # Errors
///
/// [`Error::Validation`] when the interface does not exist.
pub fn interface_rules(
    provider: &dyn NetworkInfoProvider,
    name: &str,
    scope: &InterfaceScope,
) -> Result<RuleArray> {
    if !provider.interfaces()?.iter().any(|iface| iface == name) {
        return Err(Error::Validation {
            field: "interface".to_string(),
            message: format!("no such interface: {name}"),
        });
    }

    let mut base = Rule::new().with_family(scope.family);
    base.table = scope.table;
    base.chain = scope.chain.clone();

    let (inbound, outbound) = match &scope.chain {
        Some(Chain::Input | Chain::Prerouting) => (true, false),
        Some(Chain::Output | Chain::Postrouting) => (false, true),
        Some(Chain::Forward) => (true, true),
        Some(Chain::User(_)) | None => (false, false),
    };
    if inbound && scope.restrict_in {
        base.in_interface = Some(name.to_string());
    }
    if outbound && scope.restrict_out {
        base.out_interface = Some(name.to_string());
    }

    let sources = candidates(provider, name, scope.family, scope.src)?;
    let destinations = candidates(provider, name, scope.family, scope.dst)?;

    let mut rules = RuleArray::new();
    if sources.is_empty() {
        debug!(
            "Interface {} has no {} {} candidates, adding an unrestricted rule",
            name, scope.family, scope.src
        );
        rules.push(base.clone());
    }
    for (src, dst) in sources.iter().zip(&destinations) {
        let mut rule = base.clone();
        rule.src = *src;
        rule.dst = *dst;
        rules.push(rule);
    }
    if rules.is_empty() {
        warn!(
            "Interface {} has no {} {} candidates, no rules generated",
            name, scope.family, scope.dst
        );
    }
    Ok(rules)
}
