//! Small helpers shared across modules.

/// Normalize a listen address: a bare `:port` (and a bare `PORT` env value)
/// is shorthand for all interfaces.
///
/// - `":8080"` → `"0.0.0.0:8080"`
/// - `"127.0.0.1:8080"` passes through unchanged.
pub fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_string()
}

/// Parse a boolean-ish environment value (`1`, `true`, `yes`, `on`).
pub fn env_flag(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split a comma-separated environment value into trimmed, non-empty items.
pub fn env_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bare_port() {
        assert_eq!(normalize_listen_addr(":8080"), "0.0.0.0:8080");
    }

    #[test]
    fn normalize_full_addr_passthrough() {
        assert_eq!(normalize_listen_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn env_flag_truthy() {
        assert!(env_flag("1"));
        assert!(env_flag("true"));
        assert!(env_flag("Yes"));
        assert!(env_flag(" on "));
    }

    #[test]
    fn env_flag_falsy() {
        assert!(!env_flag("0"));
        assert!(!env_flag("false"));
        assert!(!env_flag(""));
    }

    #[test]
    fn env_list_splits_and_trims() {
        assert_eq!(env_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(env_list("").is_empty());
    }
}
