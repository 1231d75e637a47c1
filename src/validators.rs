//! Input validation for values that end up on an iptables command line
//!
//! Rules are passed to iptables as separate arguments, never through a shell,
//! but names still have to satisfy the kernel's limits or the backend rejects
//! them half-way through a lifecycle operation.

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A single trailing `+` is the iptables prefix wildcard (`eth+`).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);

    if stem == "." || stem == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a node hostname (RFC 1123 labels).
///
/// # Errors
///
/// Returns `Err` for empty names, names over 253 characters and labels that
/// are empty, longer than 63 characters, start or end with `-`, or contain
/// anything but ASCII alphanumerics and `-`.
pub fn validate_hostname(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }
    if name.len() > 253 {
        return Err("Hostname too long (max 253 characters)".to_string());
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("Invalid hostname label '{label}'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("Hostname label '{label}' starts or ends with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("Hostname label '{label}' contains invalid characters"));
        }
    }

    Ok(name.to_string())
}
