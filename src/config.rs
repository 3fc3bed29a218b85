//! Typed configuration for the persistence and sync plugins.

/// Options controlling the persistence plugin.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Trailing-edge debounce window, in milliseconds, between a `Change`
    /// and the scheduled snapshot write it triggers. A burst of mutations
    /// inside this window collapses to a single write.
    pub debounce_ms: u64,
    /// Snapshot key override. Defaults to `"persist:" + collection` when
    /// `None`.
    pub key: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            key: None,
        }
    }
}

impl PersistenceConfig {
    /// Resolves the effective snapshot key for `collection`.
    #[must_use]
    pub fn resolve_key(&self, collection: &str) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| format!("persist:{collection}"))
    }
}

/// Options controlling the sync plugin.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval, in milliseconds, between periodic pulls.
    pub pull_interval_ms: u64,
    /// Whether a local `Change` triggers an immediate push.
    pub push_on_change: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_interval_ms: 300_000,
            push_on_change: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_defaults_match_contract() {
        let cfg = PersistenceConfig::default();
        assert_eq!(cfg.debounce_ms, 100);
        assert_eq!(cfg.resolve_key("todos"), "persist:todos");
    }

    #[test]
    fn persistence_key_override_is_used_verbatim() {
        let cfg = PersistenceConfig {
            debounce_ms: 100,
            key: Some("custom-key".to_string()),
        };
        assert_eq!(cfg.resolve_key("todos"), "custom-key");
    }

    #[test]
    fn sync_defaults_match_contract() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.pull_interval_ms, 300_000);
        assert!(cfg.push_on_change);
    }
}
