//! Connection registry: which domain each live connection is bound to.

use dashmap::DashMap;

/// Maps connection identity to its current domain. Holds no counters; the
/// presence service keeps those consistent with the bindings here.
pub struct ConnectionRegistry {
    bindings: DashMap<String, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    /// Bind a newly connected connection to `domain`.
    pub fn bind(&self, connection_id: &str, domain: &str) {
        self.bindings
            .insert(connection_id.to_string(), domain.to_string());
    }

    /// Move a connection to `new_domain`, returning the domain it left.
    /// Unknown connections are left alone and yield `None`.
    pub fn rebind(&self, connection_id: &str, new_domain: &str) -> Option<String> {
        let mut entry = self.bindings.get_mut(connection_id)?;
        Some(std::mem::replace(entry.value_mut(), new_domain.to_string()))
    }

    /// Remove a connection's binding. Returns `None` if it was never bound or
    /// was already removed.
    pub fn unbind(&self, connection_id: &str) -> Option<String> {
        self.bindings.remove(connection_id).map(|(_, domain)| domain)
    }

    pub fn domain_of(&self, connection_id: &str) -> Option<String> {
        self.bindings.get(connection_id).map(|e| e.value().clone())
    }

    /// Number of connections currently bound to `domain`.
    #[cfg(test)]
    pub fn count_bound_to(&self, domain: &str) -> usize {
        self.bindings.iter().filter(|e| e.value() == domain).count()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup() {
        let registry = ConnectionRegistry::new();
        registry.bind("c1", "a.com");
        assert_eq!(registry.domain_of("c1").as_deref(), Some("a.com"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebind_returns_previous_domain() {
        let registry = ConnectionRegistry::new();
        registry.bind("c1", "a.com");

        assert_eq!(registry.rebind("c1", "b.com").as_deref(), Some("a.com"));
        assert_eq!(registry.domain_of("c1").as_deref(), Some("b.com"));
    }

    #[test]
    fn rebind_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.rebind("ghost", "b.com").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unbind_twice_returns_none_second_time() {
        let registry = ConnectionRegistry::new();
        registry.bind("c1", "a.com");

        assert_eq!(registry.unbind("c1").as_deref(), Some("a.com"));
        assert!(registry.unbind("c1").is_none());
        assert!(registry.domain_of("c1").is_none());
    }

    #[test]
    fn count_bound_to_follows_bindings() {
        let registry = ConnectionRegistry::new();
        registry.bind("c1", "a.com");
        registry.bind("c2", "a.com");
        registry.bind("c3", "b.com");
        registry.rebind("c2", "b.com");

        assert_eq!(registry.count_bound_to("a.com"), 1);
        assert_eq!(registry.count_bound_to("b.com"), 2);
    }
}
