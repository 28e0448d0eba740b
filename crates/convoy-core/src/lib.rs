pub mod constants;
pub mod errors;
pub mod logging;
pub mod model;

/// Hostname used for the submitter role. Falls back to a fixed string so
/// that role accounting still works on hosts with broken name resolution.
pub fn hostname() -> String {
    whoami::hostname().unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_hostname_is_nonempty() {
        assert!(!super::hostname().is_empty());
    }
}
