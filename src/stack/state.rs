use std::fmt;

/// Lifecycle of a stack. Transitions only move forward; `Disposing` is
/// reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    NotStarted,
    NetworkReady,
    /// Storage and catalog are ready.
    DependenciesReady,
    /// Bucket bootstrapped and query engine ready.
    ServiceReady,
    /// Fixtures applied; the stack is ready for use.
    FixturesLoaded,
    Disposing,
    Disposed,
}

impl LifecycleState {
    pub fn is_ready(self) -> bool {
        self == LifecycleState::FixturesLoaded
    }

    pub fn is_disposed(self) -> bool {
        matches!(self, LifecycleState::Disposing | LifecycleState::Disposed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::NotStarted => "not started",
            LifecycleState::NetworkReady => "network ready",
            LifecycleState::DependenciesReady => "dependencies ready",
            LifecycleState::ServiceReady => "service ready",
            LifecycleState::FixturesLoaded => "ready",
            LifecycleState::Disposing => "disposing",
            LifecycleState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// A startup stage, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Network creation.
    Network,
    /// Storage and catalog start.
    Dependencies,
    /// Bucket bootstrap and query-engine start.
    Services,
    /// Fixture scripts.
    Fixtures,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Network => "network",
            Stage::Dependencies => "dependencies",
            Stage::Services => "services",
            Stage::Fixtures => "fixtures",
        };
        f.write_str(s)
    }
}

/// The three services of the fixed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Storage,
    Catalog,
    QueryEngine,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Storage, Service::Catalog, Service::QueryEngine];

    /// Short role used in container names and labels.
    pub fn role(self) -> &'static str {
        match self {
            Service::Storage => "storage",
            Service::Catalog => "catalog",
            Service::QueryEngine => "query-engine",
        }
    }

    /// Stable in-network alias.
    pub fn alias(self) -> &'static str {
        match self {
            Service::Storage => "minio",
            Service::Catalog => "iceberg-rest",
            Service::QueryEngine => "trino",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::Storage => "storage",
            Service::Catalog => "catalog",
            Service::QueryEngine => "query engine",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        assert!(LifecycleState::NotStarted < LifecycleState::NetworkReady);
        assert!(LifecycleState::ServiceReady < LifecycleState::FixturesLoaded);
        assert!(LifecycleState::FixturesLoaded < LifecycleState::Disposing);
        assert!(LifecycleState::FixturesLoaded.is_ready());
        assert!(!LifecycleState::ServiceReady.is_ready());
        assert!(LifecycleState::Disposing.is_disposed());
    }

    #[test]
    fn test_roles_and_aliases_are_distinct() {
        let roles: std::collections::HashSet<_> = Service::ALL.iter().map(|s| s.role()).collect();
        let aliases: std::collections::HashSet<_> =
            Service::ALL.iter().map(|s| s.alias()).collect();
        assert_eq!(roles.len(), 3);
        assert_eq!(aliases.len(), 3);
    }
}
