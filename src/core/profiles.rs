//! Node profile management
//!
//! Profiles are standalone JSON files describing one host as a [`NodeProfile`].
//! They are stored in the application's data directory under `profiles/`.
//!
//! ```json
//! {
//!   "hostname": "ponos",
//!   "policy": { "ipv4": { "INPUT": "DROP", "FORWARD": "DROP" } },
//!   "rules": [
//!     { "app": "ssh", "hop": "stateful-server", "survives_lock": true },
//!     { "app": "dns", "hop": "client", "route": { "dst": "192.168.1.1" } },
//!     {
//!       "app": "http",
//!       "hop": "client",
//!       "interface": { "name": "eth0", "scope": { "chain": "OUTPUT", "dst": "subnet" } }
//!     }
//!   ],
//!   "final_rules": [
//!     { "hop": "loopback" }
//!   ]
//! }
//! ```

use crate::core::address::Route;
use crate::core::array::RuleArray;
use crate::core::error::{Error, Result};
use crate::core::iface::{InterfaceScope, NetworkInfoProvider, SystemNetworkInfo, interface_rules};
use crate::core::node::Node;
use crate::core::rule::{Chain, Family, Rule, Target};
use crate::core::schema::RuleSpec;
use crate::library::{App, Hop};
use crate::utils::get_data_dir;
use crate::validators::validate_hostname;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The canonical name for the initial/fallback profile.
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Flows accepted per profile list
pub const MAX_FLOWS: usize = 10_000;

/// Error type for profile operations
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Invalid profile name: {0}")]
    InvalidName(String),

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile too large: {0}")]
    TooLarge(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,
}

/// One policy entry: optional rule, route, application and hop fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop: Option<String>,
    /// Restricts the flow to a host interface and its addresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<InterfaceRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub survives_lock: bool,
}

/// Interface name plus the [`InterfaceScope`] passed to [`interface_rules`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceRef {
    pub name: String,
    #[serde(default)]
    pub scope: InterfaceScope,
}

fn unknown_name(field: &str, name: &str) -> Error {
    Error::Validation {
        field: field.to_string(),
        message: format!("unknown {field} '{name}'"),
    }
}

impl Flow {
    /// Expands the flow into concrete rules using the live host's interfaces.
    ///
    /// # Errors
    ///
    /// See [`Flow::resolve_with`].
    pub fn resolve(&self) -> Result<RuleArray> {
        self.resolve_with(&SystemNetworkInfo)
    }

    /// Expands the flow into concrete rules.
    ///
    /// `rule` is combined with `route`, broadcast over the interface rules,
    /// crossed with the application's fragments (the flow's own fields win)
    /// and composed with the hop topology. Without a hop the rules stay
    /// one-directional.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] for unparsable rule text, [`Error::Validation`] for
    /// unknown application, hop or interface names, [`Error::Algebra`] for
    /// family conflicts between the fragments.
    pub fn resolve_with(&self, provider: &dyn NetworkInfoProvider) -> Result<RuleArray> {
        let mut base = match &self.rule {
            Some(spec) => Rule::try_from(spec)?,
            None => Rule::new(),
        };
        if let Some(route) = &self.route {
            base = base.combine(&route.rule())?;
        }

        let scoped = match &self.interface {
            Some(iface) => {
                interface_rules(provider, &iface.name, &iface.scope)?.broadcast(&base, false)?
            }
            None => RuleArray::from(base),
        };

        let fragments = match &self.app {
            Some(name) => {
                let app: App = name.parse().map_err(|_| unknown_name("app", name))?;
                scoped.cross(&app.rules())?
            }
            None => scoped,
        };

        match &self.hop {
            Some(name) => {
                let hop: Hop = name.parse().map_err(|_| unknown_name("hop", name))?;
                Ok(hop.topology().compose_array(&fragments)?)
            }
            None => Ok(fragments),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeProfile {
    pub hostname: String,
    /// Overrides of the default ACCEPT policies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policy: BTreeMap<Family, BTreeMap<Chain, Target>>,
    #[serde(default)]
    pub rules: Vec<Flow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub final_rules: Vec<Flow>,
}

impl NodeProfile {
    /// Resolves every flow and builds the node.
    ///
    /// # Errors
    ///
    /// The first flow or policy entry that fails; no partially built node is
    /// returned.
    pub fn build_node(&self) -> Result<Node> {
        self.build_node_with(&SystemNetworkInfo)
    }

    /// [`NodeProfile::build_node`] with interface flows resolved against `provider`.
    ///
    /// # Errors
    ///
    /// As [`NodeProfile::build_node`].
    pub fn build_node_with(&self, provider: &dyn NetworkInfoProvider) -> Result<Node> {
        validate_hostname(&self.hostname).map_err(|message| Error::Validation {
            field: "hostname".to_string(),
            message,
        })?;
        let mut node = Node::new(self.hostname.clone());

        for (family, chains) in &self.policy {
            for (chain, target) in chains {
                node.set_policy_entry(*family, chain.clone(), target.clone())?;
            }
        }
        for flow in &self.rules {
            node.add_rules(&flow.resolve_with(provider)?, flow.survives_lock)?;
        }
        for flow in &self.final_rules {
            node.add_final_rules(&flow.resolve_with(provider)?)?;
        }

        tracing::debug!(
            "Built node {} with {} rules and {} final rules",
            node.hostname(),
            node.rules().len(),
            node.final_rules().len()
        );
        Ok(node)
    }
}

/// Validates a profile name for filesystem safety.
///
/// Constraints:
/// - Alphanumeric, underscores, and hyphens only
/// - Max 64 chars
/// - Rejects "." and ".."
pub fn validate_profile_name(name: &str) -> std::result::Result<(), ProfileError> {
    if name.is_empty() {
        return Err(ProfileError::InvalidName("Name cannot be empty".into()));
    }

    if name.len() > 64 {
        return Err(ProfileError::InvalidName(
            "Name too long (max 64 chars)".into(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ProfileError::InvalidName(
            "Name contains invalid characters (use only a-z, 0-9, _, -)".into(),
        ));
    }

    // Prevent path traversal
    if name == "." || name == ".." {
        return Err(ProfileError::InvalidName("Invalid name".into()));
    }

    Ok(())
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut checksum_path = path.to_path_buf();
    checksum_path.set_extension("json.sha256");
    checksum_path
}

/// Gets the directory where profiles are stored, creating it if needed.
pub async fn get_profiles_dir() -> std::result::Result<PathBuf, ProfileError> {
    let mut path = get_data_dir().ok_or(ProfileError::DataDirUnavailable)?;
    path.push("profiles");

    if !tokio::fs::try_exists(&path).await? {
        tokio::fs::create_dir_all(&path).await?;
    }

    Ok(path)
}

/// Path of a named profile inside `dir`, after validating the name.
pub fn profile_path_in(dir: &Path, name: &str) -> std::result::Result<PathBuf, ProfileError> {
    validate_profile_name(name)?;
    Ok(dir.join(format!("{name}.json")))
}

/// Profile names found in `dir`, sorted.
pub async fn list_profiles_in(dir: &Path) -> std::result::Result<Vec<String>, ProfileError> {
    let mut profiles = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        if path.is_file()
            && path.extension().and_then(|s| s.to_str()) == Some("json")
            && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            && validate_profile_name(name).is_ok()
        {
            profiles.push(name.to_string());
        }
    }

    profiles.sort();
    Ok(profiles)
}

/// Reads a profile file.
///
/// A `.sha256` sidecar written by [`save_profile_file`] is checked; a mismatch
/// only warns since profiles are meant to be edited by hand.
pub async fn load_profile_file(path: &Path) -> std::result::Result<NodeProfile, ProfileError> {
    if !tokio::fs::try_exists(path).await? {
        return Err(ProfileError::NotFound(path.display().to_string()));
    }

    let json = tokio::fs::read_to_string(path).await?;

    if let Ok(expected) = tokio::fs::read_to_string(checksum_path(path)).await {
        let actual = checksum(&json);
        if expected.trim() != actual {
            tracing::warn!(
                "Profile {} checksum mismatch (expected: {}, got: {})",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }

    let profile: NodeProfile = serde_json::from_str(&json)?;

    let flows = profile.rules.len() + profile.final_rules.len();
    if flows > MAX_FLOWS {
        return Err(ProfileError::TooLarge(format!(
            "{} contains {flows} flows (max: {MAX_FLOWS})",
            path.display()
        )));
    }

    Ok(profile)
}

/// Writes a profile atomically with mode 0600 and a checksum sidecar.
pub async fn save_profile_file(
    path: &Path,
    profile: &NodeProfile,
) -> std::result::Result<(), ProfileError> {
    let json = serde_json::to_string_pretty(profile)?;

    let mut temp_path = path.to_path_buf();
    temp_path.set_extension("json.tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        // Restrictive permissions before any policy content is written
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        tokio::fs::write(&temp_path, &json).await?;
    }

    tokio::fs::rename(temp_path, path).await?;
    tokio::fs::write(checksum_path(path), checksum(&json)).await?;

    Ok(())
}

/// Lists all profile names in the data directory.
pub async fn list_profiles() -> std::result::Result<Vec<String>, ProfileError> {
    list_profiles_in(&get_profiles_dir().await?).await
}

/// Loads a profile by name from the data directory.
pub async fn load_profile(name: &str) -> std::result::Result<NodeProfile, ProfileError> {
    let path = profile_path_in(&get_profiles_dir().await?, name)?;
    load_profile_file(&path).await.map_err(|e| match e {
        ProfileError::NotFound(_) => ProfileError::NotFound(name.to_string()),
        other => other,
    })
}

/// Saves a profile by name into the data directory.
pub async fn save_profile(name: &str, profile: &NodeProfile) -> std::result::Result<(), ProfileError> {
    let path = profile_path_in(&get_profiles_dir().await?, name)?;
    save_profile_file(&path, profile).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::AlgebraError;
    use crate::core::iface::StaticNetworkInfo;
    use crate::core::rule::Protocol;

    #[test]
    fn test_validate_profile_name() {
        assert!(validate_profile_name("web-01_edge").is_ok());
        assert!(validate_profile_name("").is_err());
        assert!(validate_profile_name("..").is_err());
        assert!(validate_profile_name("a/b").is_err());
        assert!(validate_profile_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_flow_app_and_hop() {
        let flow = Flow {
            app: Some("ssh".to_string()),
            hop: Some("server".to_string()),
            route: Some(
                Route::new(Some("10.0.0.5".parse().unwrap()), Some("10.0.0.1".parse().unwrap()))
                    .unwrap(),
            ),
            ..Flow::default()
        };

        let rules = flow.resolve().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].chain, Some(Chain::Input));
        assert_eq!(rules[0].src, Some("10.0.0.5/32".parse().unwrap()));
        assert_eq!(rules[0].protocol, Some(Protocol::Tcp));
        assert_eq!(rules[1].chain, Some(Chain::Output));
        assert_eq!(rules[1].dst, Some("10.0.0.5/32".parse().unwrap()));
    }

    #[test]
    fn test_flow_rule_overrides_app() {
        let flow: Flow = serde_json::from_str(
            r#"{ "app": "ssh", "rule": { "target": "DROP", "matches": { "tcp": { "dport": 2222 } } } }"#,
        )
        .unwrap();

        let rules = flow.resolve().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], Rule::new()
            .with_protocol(Protocol::Tcp)
            .tcp_dport(2222)
            .with_target(Target::Drop));
    }

    #[test]
    fn test_flow_errors() {
        let unknown = Flow {
            app: Some("gopher".to_string()),
            ..Flow::default()
        };
        assert!(matches!(unknown.resolve(), Err(Error::Validation { .. })));

        let mixed: Flow = serde_json::from_str(
            r#"{ "app": "ping6", "route": { "dst": "192.0.2.1" } }"#,
        )
        .unwrap();
        assert!(matches!(
            mixed.resolve(),
            Err(Error::Algebra(AlgebraError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_profile_build_node() {
        let profile: NodeProfile = serde_json::from_str(
            r#"{
                "hostname": "ponos",
                "policy": { "ipv4": { "INPUT": "DROP" } },
                "rules": [
                    { "app": "ssh", "hop": "server", "survives_lock": true },
                    { "app": "http", "hop": "server" }
                ],
                "final_rules": [ { "hop": "loopback" } ]
            }"#,
        )
        .unwrap();

        let node = profile.build_node().unwrap();
        assert_eq!(node.hostname(), "ponos");
        assert_eq!(node.rules().len(), 4);
        assert_eq!(node.lock_rules().len(), 2);
        assert_eq!(node.final_rules().len(), 4);
        assert_eq!(
            node.policy().get(&(Family::Ipv4, Chain::Input)),
            Some(&Target::Drop)
        );
        assert_eq!(
            node.policy().get(&(Family::Ipv6, Chain::Input)),
            Some(&Target::Accept)
        );
    }

    #[test]
    fn test_interface_flow_uses_provider() {
        let provider = StaticNetworkInfo::new()
            .with_address(
                "eth0",
                "192.168.1.10".parse().unwrap(),
                Some("255.255.255.0".parse().unwrap()),
            )
            .with_gateway("eth0", "192.168.1.1".parse().unwrap());
        let profile: NodeProfile = serde_json::from_str(
            r#"{
                "hostname": "ponos",
                "rules": [
                    {
                        "app": "dns",
                        "interface": {
                            "name": "eth0",
                            "scope": { "chain": "OUTPUT", "dst": "gateway" }
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        let node = profile.build_node_with(&provider).unwrap();
        // One interface rule crossed with dns over udp and tcp
        assert_eq!(node.rules().len(), 2);
        for rule in node.rules() {
            assert_eq!(rule.chain, Some(Chain::Output));
            assert_eq!(rule.out_interface.as_deref(), Some("eth0"));
            assert_eq!(rule.dst, Some("192.168.1.1/32".parse().unwrap()));
            assert_eq!(rule.family, Some(Family::Ipv4));
        }
        assert_eq!(node.rules()[0].protocol, Some(Protocol::Udp));

        let missing = NodeProfile {
            hostname: "ponos".to_string(),
            rules: vec![Flow {
                interface: Some(InterfaceRef {
                    name: "wlan9".to_string(),
                    scope: InterfaceScope::default(),
                }),
                ..Flow::default()
            }],
            ..NodeProfile::default()
        };
        assert!(matches!(
            missing.build_node_with(&provider),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_profile_rejects_bad_hostname() {
        let profile = NodeProfile {
            hostname: "not a host".to_string(),
            ..NodeProfile::default()
        };
        assert!(matches!(profile.build_node(), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_profile_rejects_bad_policy() {
        let profile: NodeProfile = serde_json::from_str(
            r#"{ "hostname": "ponos", "policy": { "ipv4": { "INPUT": "LOG" } } }"#,
        )
        .unwrap();
        assert!(profile.build_node().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_profile_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = profile_path_in(dir.path(), "ponos").unwrap();
        let profile = NodeProfile {
            hostname: "ponos".to_string(),
            rules: vec![Flow {
                app: Some("dns".to_string()),
                hop: Some("client".to_string()),
                ..Flow::default()
            }],
            ..NodeProfile::default()
        };

        save_profile_file(&path, &profile).await.unwrap();
        assert!(checksum_path(&path).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = load_profile_file(&path).await.unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(list_profiles_in(dir.path()).await.unwrap(), vec!["ponos"]);
    }

    #[tokio::test]
    async fn test_load_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = profile_path_in(dir.path(), "absent").unwrap();
        assert!(matches!(
            load_profile_file(&path).await,
            Err(ProfileError::NotFound(_))
        ));
    }
}
