//! Field checks used by `AgentConfig::validate`.
//!
//! Each check returns a static message so callers can prefix it with the
//! offending key.

use std::net::IpAddr;
use std::ops::RangeInclusive;

/// Port 0 is reserved; everything else in `u16` is usable.
pub fn is_valid_port(port: u16) -> Result<(), &'static str> {
    if port > 0 {
        Ok(())
    } else {
        Err("Port number must be greater than 0")
    }
}

/// Accepts an IP address or an RFC 1123 host name.
pub fn is_valid_host(host: &str) -> Result<(), &'static str> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if host.is_empty() || host.len() > 253 {
        return Err("Host name must be 1 to 253 characters long");
    }
    let labels_ok = host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if labels_ok {
        Ok(())
    } else {
        Err("Invalid host name")
    }
}

/// Non-empty and free of NUL bytes.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// `value` lies within `range`.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Non-empty string.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}
