//! Textual rule descriptions
//!
//! [`RuleSpec`] is the on-disk form of a [`Rule`]: every field is a plain
//! string so profiles stay readable and diff cleanly, and match modules are
//! nested `module -> parameter -> value` maps:
//!
//! ```json
//! {
//!   "chain": "INPUT",
//!   "src": "192.168.1.0/24",
//!   "protocol": "tcp",
//!   "matches": { "tcp": { "dport": 22 } }
//! }
//! ```
//!
//! Conversion into [`Rule`] validates every name and value and rejects unknown
//! keys with a [`SchemaError`].

use crate::core::error::SchemaError;
use crate::core::matches::MatchParams;
use crate::core::rule::{Chain, Family, Protocol, Rule, Table, Target};
use crate::validators::validate_interface;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "in")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "out")]
    pub out_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub matches: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

fn parse_field<T, F>(value: Option<&String>, parse: F) -> Result<Option<T>, SchemaError>
where
    F: FnOnce(&str) -> Result<T, SchemaError>,
{
    value.map(|v| parse(v.trim())).transpose()
}

fn parse_network(key: &str, value: &str) -> Result<IpNetwork, SchemaError> {
    value
        .parse::<IpNetwork>()
        .map_err(|_| SchemaError::invalid(key, value))
}

fn parse_interface(key: &str, value: &str) -> Result<String, SchemaError> {
    match validate_interface(value) {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => Err(SchemaError::invalid(key, value)),
    }
}

/// Flattens a JSON parameter value into the text iptables would take.
fn param_text(module: &str, key: &str, value: &serde_json::Value) -> Result<String, SchemaError> {
    use serde_json::Value;

    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|item| param_text(module, key, item))
            .collect::<Result<Vec<_>, _>>()
            .map(|parts| parts.join(",")),
        other => Err(SchemaError::invalid(
            format!("{module}.{key}"),
            other.to_string(),
        )),
    }
}

impl TryFrom<&RuleSpec> for Rule {
    type Error = SchemaError;

    fn try_from(spec: &RuleSpec) -> Result<Self, Self::Error> {
        let family = parse_field(spec.family.as_ref(), |v| {
            v.parse::<Family>()
                .map_err(|_| SchemaError::invalid("family", v))
        })?;
        let src = parse_field(spec.src.as_ref(), |v| parse_network("src", v))?;
        let dst = parse_field(spec.dst.as_ref(), |v| parse_network("dst", v))?;

        // icmp and icmp6 groups must agree with a declared or address-implied family
        let match_family = family
            .or_else(|| src.as_ref().map(Family::of))
            .or_else(|| dst.as_ref().map(Family::of));

        let mut rule = Rule {
            family,
            table: parse_field(spec.table.as_ref(), |v| {
                v.parse::<Table>()
                    .map_err(|_| SchemaError::UnknownTable(v.to_string()))
            })?,
            chain: parse_field(spec.chain.as_ref(), str::parse::<Chain>)?,
            target: parse_field(spec.target.as_ref(), str::parse::<Target>)?,
            src,
            dst,
            in_interface: parse_field(spec.in_interface.as_ref(), |v| {
                parse_interface("in_interface", v)
            })?,
            out_interface: parse_field(spec.out_interface.as_ref(), |v| {
                parse_interface("out_interface", v)
            })?,
            protocol: parse_field(spec.protocol.as_ref(), |v| {
                v.parse::<Protocol>()
                    .map_err(|_| SchemaError::UnknownProtocol(v.to_string()))
            })?,
            fragment: spec.fragment,
            matches: BTreeMap::new(),
        };

        for (module, params) in &spec.matches {
            let texts = params
                .iter()
                .map(|(key, value)| Ok((key.as_str(), param_text(module, key, value)?)))
                .collect::<Result<Vec<_>, SchemaError>>()?;
            let group = MatchParams::from_params(
                module,
                match_family,
                texts.iter().map(|(key, value)| (*key, value.as_str())),
            )?;
            rule = rule.with_match(group);
        }

        Ok(rule)
    }
}

impl TryFrom<RuleSpec> for Rule {
    type Error = SchemaError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        Rule::try_from(&spec)
    }
}

impl From<&Rule> for RuleSpec {
    fn from(rule: &Rule) -> Self {
        let matches = rule
            .active_matches()
            .map(|params| {
                let values = params
                    .params()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), serde_json::Value::String(value)))
                    .collect();
                (params.kind().to_string(), values)
            })
            .collect();

        RuleSpec {
            family: rule.family.map(|f| f.to_string()),
            table: rule.table.map(|t| t.to_string()),
            chain: rule.chain.as_ref().map(ToString::to_string),
            target: rule.target.as_ref().map(ToString::to_string),
            src: rule.src.map(|n| n.to_string()),
            dst: rule.dst.map(|n| n.to_string()),
            in_interface: rule.in_interface.clone(),
            out_interface: rule.out_interface.clone(),
            protocol: rule.protocol.map(|p| p.to_string()),
            fragment: rule.fragment,
            matches,
        }
    }
}

impl From<Rule> for RuleSpec {
    fn from(rule: Rule) -> Self {
        RuleSpec::from(&rule)
    }
}
