//! Harness registry -- a named collection of available harness adapters.
//!
//! The registry lets the runner look up harnesses by name at runtime
//! (e.g. when an agent type prefers a specific CLI).

use std::collections::HashMap;
use std::sync::Arc;

use super::trait_def::AgentHarness;

/// A collection of registered [`AgentHarness`] implementations, keyed by
/// name.
#[derive(Default)]
pub struct HarnessRegistry {
    harnesses: HashMap<String, Arc<dyn AgentHarness>>,
}

impl HarnessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a harness adapter under the name it reports.
    ///
    /// If a harness with the same name is already registered, it is
    /// replaced and the old one is returned.
    pub fn register(
        &mut self,
        harness: impl AgentHarness + 'static,
    ) -> Option<Arc<dyn AgentHarness>> {
        let name = harness.name().to_owned();
        self.harnesses.insert(name, Arc::new(harness))
    }

    /// Look up a harness by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentHarness>> {
        self.harnesses.get(name).cloned()
    }

    /// List the names of all registered harnesses.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<&str> {
        self.harnesses.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("harnesses", &self.harnesses.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::claude_code::ClaudeCodeHarness;
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = HarnessRegistry::new();
        assert!(registry.is_empty());

        registry.register(ClaudeCodeHarness::new());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("claude-code").is_some());
        assert!(registry.get("codex").is_none());
        assert_eq!(registry.list(), vec!["claude-code"]);
    }

    #[test]
    fn reregister_replaces() {
        let mut registry = HarnessRegistry::new();
        assert!(registry.register(ClaudeCodeHarness::new()).is_none());
        let old = registry.register(ClaudeCodeHarness::with_binary("/opt/claude"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }
}
