//! Window key formatting.

use std::fmt;

/// The namespaced store key holding one identifier's counter.
///
/// Formatted as `prefix:identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    /// Build the key for `identifier` under `prefix`.
    pub fn new(prefix: &str, identifier: &str) -> Self {
        Self(format!("{}:{}", prefix, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WindowKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_format() {
        let key = WindowKey::new("rl", "user42");
        assert_eq!(key.as_str(), "rl:user42");
        assert_eq!(key.to_string(), "rl:user42");
    }

    #[test]
    fn test_identifier_may_contain_separator() {
        let key = WindowKey::new("limiter", "10.0.0.1:8080");
        assert_eq!(key.as_str(), "limiter:10.0.0.1:8080");
    }

    #[test]
    fn test_window_key_equality() {
        assert_eq!(WindowKey::new("a", "b"), WindowKey::new("a", "b"));
        assert_ne!(WindowKey::new("a", "b"), WindowKey::new("a2", "b"));
    }
}
