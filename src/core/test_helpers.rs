//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::address::Route;
use crate::core::array::RuleArray;
use crate::core::node::Node;
use crate::core::rule::{Chain, Rule};
use crate::library::{App, Hop};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex for tests that need exclusive access to environment variables.
///
/// Prefer [`EnvVarGuard`], which holds this lock and restores the variable
/// even when the test panics.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Sets an environment variable for the lifetime of the guard.
///
/// ```ignore
/// let _env = EnvVarGuard::set("BALEFUL_IPTABLES", "/usr/sbin/iptables-legacy");
/// // ... test with custom env state ...
/// ```
pub struct EnvVarGuard {
    key: &'static str,
    previous: Option<std::ffi::OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        // A test that panicked while holding the lock already restored its variable
        let lock = ENV_VAR_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::env::var_os(key);
        // SAFETY: every env mutation in the test suite holds ENV_VAR_MUTEX
        unsafe {
            std::env::set_var(key, value);
        }
        Self {
            key,
            previous,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // SAFETY: ENV_VAR_MUTEX is still held by `_lock`
        unsafe {
            match &self.previous {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }
}

/// Client 192.168.1.10 talking to server 192.168.1.1
pub fn lan_route() -> Route {
    Route::new(
        Some("192.168.1.10".parse().unwrap()),
        Some("192.168.1.1".parse().unwrap()),
    )
    .unwrap()
}

/// `tcp dport <port>` in INPUT
pub fn input_port(port: u16) -> Rule {
    Rule::new().with_chain(Chain::Input).tcp_dport(port)
}

/// SSH served on this host for the LAN route, both directions.
pub fn ssh_server_rules() -> RuleArray {
    let app = App::Ssh.rules().broadcast(&lan_route().rule(), false).unwrap();
    Hop::Server.topology().compose_array(&app).unwrap()
}

/// Node serving SSH (lock-surviving) and HTTP, with loopback as final rules.
pub fn sample_node() -> Node {
    let mut node = Node::new("ponos");
    node.add_rules(&ssh_server_rules(), true).unwrap();
    node.add_rules(
        &Hop::Server.topology().compose_array(&App::Http.rules()).unwrap(),
        false,
    )
    .unwrap();
    node.add_final_rules(&Hop::Loopback.topology().to_array())
        .unwrap();
    node
}

/// Writes an executable stand-in for iptables into `dir`.
///
/// The script drops `-w`, appends its arguments to `<dir>/calls.log`, prints
/// `listing` for `-S`, and answers `-C` with the "no such rule" error.
pub fn write_mock_iptables(dir: &Path, listing: &str) -> PathBuf {
    let log = dir.join("calls.log");
    let listing_path = dir.join("listing.txt");
    std::fs::write(&listing_path, listing).unwrap();

    let script = format!(
        r#"#!/bin/sh
[ "$1" = "-w" ] && shift
echo "$*" >> "{log}"
case " $* " in
  *" -S "*) cat "{listing}" ;;
  *" -C "*) echo "iptables: Bad rule (does a matching rule exist in that chain?)." >&2; exit 1 ;;
esac
exit 0
"#,
        log = log.display(),
        listing = listing_path.display(),
    );

    let path = dir.join("iptables");
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Argument lines recorded by a [`write_mock_iptables`] script.
pub fn mock_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
