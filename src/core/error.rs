use crate::core::rule::Family;
use thiserror::Error;

/// Core error types for baleful
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rule algebra rejected its operands
    #[error("Algebra error: {0}")]
    Algebra(#[from] AlgebraError),

    /// A textual rule description named something the schema does not know
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Packet filter backend failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Profile storage failed
    #[error("Profile error: {0}")]
    Profile(#[from] crate::core::profiles::ProfileError),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by `combine`, `diff`, `broadcast`, `cross` and composition.
///
/// Algebra operations fail fast: no partially merged value is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlgebraError {
    /// IPv4 and IPv6 values met in one rule
    #[error("address family mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Family, found: Family },

    /// Operator applied outside its operand set
    #[error("unsupported operands for {op}: {lhs} and {rhs}")]
    UnsupportedOperand {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
}

/// Errors raised while turning text (profiles, backend listings) into typed rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown parameter '{key}' for match module '{module}'")]
    UnknownMatchKey { module: String, key: String },

    #[error("unsupported match module '{0}'")]
    UnsupportedMatchModule(String),

    #[error("unknown chain '{0}'")]
    UnknownChain(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

impl SchemaError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Failures reported by a [`PacketFilterBackend`](crate::core::backend::PacketFilterBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Rule or chain does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Chain is non-empty or still referenced
    #[error("chain busy: {0}")]
    ChainBusy(String),

    /// Caller lacks CAP_NET_ADMIN
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend program missing or unreachable
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend command failed for any other reason
    #[error("{message}")]
    Command {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },
}

impl BackendError {
    /// Returns `true` for the "not found / busy" class that `stop` and `panic`
    /// treat as already satisfied.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, BackendError::NotFound(_) | BackendError::ChainBusy(_))
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns, their classification and translations
pub struct BackendErrorPattern;

impl BackendErrorPattern {
    /// Maps raw backend stderr onto a [`BackendError`] variant.
    pub fn classify(msg: &str, exit_code: Option<i32>) -> BackendError {
        let lower = msg.to_lowercase();
        let trimmed = msg.trim().to_string();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return BackendError::PermissionDenied(trimmed);
        }

        // `iptables -D`/`-C` on a missing rule
        if lower.contains("does a matching rule exist")
            || lower.contains("bad rule")
            || lower.contains("no chain/target/match by that name")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return BackendError::NotFound(trimmed);
        }

        if lower.contains("directory not empty")
            || lower.contains("too many links")
            || lower.contains("device or resource busy")
            || lower.contains("resource busy")
        {
            return BackendError::ChainBusy(trimmed);
        }

        if lower.contains("command not found") || lower.contains("no such file") {
            return BackendError::Unavailable(trimmed);
        }

        BackendError::Command {
            message: trimmed.clone(),
            stderr: Some(trimmed),
            exit_code,
        }
    }

    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run baleful as root or with CAP_NET_ADMIN")
                .with_suggestion("Use --dry-run to preview changes without privileges")
                .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables  (Arch)")
                .with_help("https://netfilter.org/projects/iptables/index.html");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("another app is currently holding") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Enable wait_for_lock in the configuration")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Missing rule
        if lower.contains("does a matching rule exist") || lower.contains("bad rule") {
            return ErrorTranslation::new("Rule is not installed")
                .with_suggestion("The rule may already have been removed")
                .with_suggestion("Inspect installed rules: sudo iptables -S");
        }

        // Chain errors
        if lower.contains("no chain/target/match by that name")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Chain, target or match module not found")
                .with_suggestion("Ensure user-defined chains exist before jumping to them")
                .with_suggestion("Check that the kernel module for the match is available")
                .with_help("https://man7.org/linux/man-pages/man8/iptables-extensions.8.html");
        }

        // Chain deletion refused
        if lower.contains("directory not empty") || lower.contains("too many links") {
            return ErrorTranslation::new("Chain is not empty or still referenced")
                .with_suggestion("Flush the chain before deleting it")
                .with_suggestion("Remove rules that jump to the chain");
        }

        // Resource busy
        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying iptables")
                .with_suggestion("Wait a moment and try again");
        }

        // Invalid arguments
        if lower.contains("bad argument")
            || lower.contains("invalid")
            || lower.contains("unknown option")
        {
            return ErrorTranslation::new("Invalid rule arguments")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure IP addresses match the rule's address family")
                .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
