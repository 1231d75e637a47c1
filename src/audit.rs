/// Audit logging for privileged lifecycle operations
///
/// Every operation that touches the live packet filter (start, stop, lock,
/// panic, flush, set-policy) is appended to a JSON-lines file in the state
/// directory together with its outcome and a fingerprint of the rule set.
use crate::core::node::{Node, Operation, Report};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub operation: Operation,

    pub hostname: String,

    /// Whether every backend call succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// First failure, if any
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        operation: Operation,
        hostname: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            operation,
            hostname: hostname.into(),
            success,
            details,
            error,
        }
    }

    /// Event describing one lifecycle report for `node`.
    pub fn from_report(node: &Node, report: &Report, dry_run: bool) -> Self {
        Self::new(
            report.operation,
            node.hostname(),
            report.is_success(),
            serde_json::json!({
                "rule_count": node.rules().len() + node.final_rules().len(),
                "applied": report.applied,
                "skipped": report.skipped,
                "failure_count": report.failures.len(),
                "fingerprint": node.fingerprint(),
                "dry_run": dry_run,
            }),
            report
                .failures
                .first()
                .map(|failure| format!("{}: {}", failure.subject, failure.error)),
        )
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Most recent events first. Unparsable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Records a lifecycle report. Audit failures are logged, never raised.
pub async fn log_report(node: &Node, report: &Report, dry_run: bool) {
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit
                .log(&AuditEvent::from_report(node, report, dry_run))
                .await
            {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryBackend;
    use crate::core::rule::Rule;

    #[test]
    fn test_event_from_report() {
        let mut node = Node::new("ponos");
        node.add_rules(&Rule::new().tcp_dport(22).into(), false)
            .unwrap();
        let mut backend = MemoryBackend::new();
        let report = node.start(&mut backend, None);

        let event = AuditEvent::from_report(&node, &report, true);
        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["applied"], 1);
        assert_eq!(event.details["fingerprint"], node.fingerprint());
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            Operation::SetPolicy,
            "ponos",
            false,
            serde_json::json!({"failure_count": 2}),
            Some("permission denied".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"set-policy\""));
        assert!(json.contains("permission denied"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","operation":"panic","hostname":"ponos","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.operation, Operation::Panic);
    }

    #[tokio::test]
    async fn test_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        for operation in [Operation::Start, Operation::Lock] {
            let event = AuditEvent::new(operation, "ponos", true, serde_json::json!({}), None);
            audit.log(&event).await.unwrap();
        }

        let recent = audit.read_recent(5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation, Operation::Lock);
        assert_eq!(recent[1].operation, Operation::Start);
    }
}
