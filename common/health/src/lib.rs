use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, warn};

/// Health reporting for the long-lived components of a process.
///
/// A process hosting a broker connection can only be trusted with work
/// if the connection and everything hanging off it is running. Each
/// component exposes a [`HealthCheck`] computed from state it already
/// holds, and the registry combines them on demand:
///   - with [`HealthStrategy::All`] the process is as healthy as its
///     least healthy component
///   - with [`HealthStrategy::Any`] the process is as healthy as its
///     healthiest component
///   - a registry with no component is unhealthy.
///
/// Checks are synchronous and must never perform I/O: they report the
/// last known state, which the component refreshes in the background.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthState {
    /// Fully operational
    Healthy,
    /// Operational, but part of the component is not working
    Degraded,
    /// Not operational
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a single health check: a tri-state plus an optional diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub state: HealthState,
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            message: Some(message.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.state, message),
            None => write!(f, "{}", self.state),
        }
    }
}

/// A synchronous, non-blocking health probe.
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> HealthStatus;
}

impl<F> HealthCheck for F
where
    F: Fn() -> HealthStatus + Send + Sync,
{
    fn check(&self) -> HealthStatus {
        self()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthStrategy {
    /// All components must be healthy for the registry to be healthy
    All,
    /// At least one component must be healthy for the registry to be healthy
    Any,
}

impl std::str::FromStr for HealthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "all" => Ok(HealthStrategy::All),
            "any" => Ok(HealthStrategy::Any),
            _ => Err(format!("Unknown Health Strategy: {s}, must be ALL or ANY")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("a health check named '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Combined status of every registered check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    /// The overall state, combined according to the registry strategy
    pub state: HealthState,
    /// Current status of each registered component, for display
    pub components: HashMap<String, HealthStatus>,
}

impl RegistryStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    strategy: HealthStrategy,
    checks: Arc<RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self::new_with_strategy(name, HealthStrategy::All)
    }

    pub fn new_with_strategy(name: &str, strategy: HealthStrategy) -> Self {
        Self {
            name: name.to_owned(),
            strategy,
            checks: Default::default(),
        }
    }

    /// Registers a check under a unique name.
    pub fn register<H>(&self, component: &str, check: H) -> Result<(), HealthError>
    where
        H: HealthCheck + 'static,
    {
        let mut checks = match self.checks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if checks.contains_key(component) {
            return Err(HealthError::AlreadyRegistered(component.to_owned()));
        }
        drop(checks.insert(component.to_owned(), Arc::new(check)));
        Ok(())
    }

    /// Removes a check, returns whether it was registered.
    pub fn deregister(&self, component: &str) -> bool {
        let mut checks = match self.checks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        checks.remove(component).is_some()
    }

    /// Runs every registered check and combines the results.
    pub fn get_status(&self) -> RegistryStatus {
        let checks = match self.checks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let components: HashMap<String, HealthStatus> = checks
            .iter()
            .map(|(name, check)| (name.clone(), check.check()))
            .collect();

        let states = components.values().map(|status| status.state);
        let state = match self.strategy {
            HealthStrategy::All => states.max(),
            HealthStrategy::Any => states.min(),
        }
        // unhealthy if no component has registered yet
        .unwrap_or(HealthState::Unhealthy);

        let result = RegistryStatus { state, components };
        match result.state {
            HealthState::Healthy => info!("{} health check ok", self.name),
            _ => warn!(
                "{} health check {}: {:?}",
                self.name, result.state, result.components
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{HealthError, HealthRegistry, HealthState, HealthStatus, HealthStrategy};
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    /// A check whose answer can be flipped from the test body.
    #[derive(Clone, Default)]
    struct Switch(Arc<AtomicU8>);

    impl Switch {
        fn set(&self, state: HealthState) {
            let value = match state {
                HealthState::Healthy => 0,
                HealthState::Degraded => 1,
                HealthState::Unhealthy => 2,
            };
            self.0.store(value, Ordering::SeqCst);
        }

        fn check(&self) -> impl Fn() -> HealthStatus + Send + Sync + 'static {
            let value = self.0.clone();
            move || match value.load(Ordering::SeqCst) {
                0 => HealthStatus::healthy(),
                1 => HealthStatus::degraded("partially down"),
                _ => HealthStatus::unhealthy("down"),
            }
        }
    }

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert_eq!(registry.get_status().state, HealthState::Unhealthy);
        assert!(!registry.get_status().is_healthy());
    }

    #[test]
    fn one_component() {
        let registry = HealthRegistry::new("liveness");
        let switch = Switch::default();
        registry.register("one", switch.check()).unwrap();

        let status = registry.get_status();
        assert!(status.is_healthy());
        assert_eq!(status.components.len(), 1);

        switch.set(HealthState::Unhealthy);
        let status = registry.get_status();
        assert_eq!(status.state, HealthState::Unhealthy);
        assert_eq!(
            status.components.get("one"),
            Some(&HealthStatus::unhealthy("down"))
        );
    }

    #[test]
    fn several_components_all_strategy() {
        let registry = HealthRegistry::new("liveness");
        let one = Switch::default();
        let two = Switch::default();
        registry.register("one", one.check()).unwrap();
        registry.register("two", two.check()).unwrap();
        assert!(registry.get_status().is_healthy());

        // One degraded component degrades the whole registry
        two.set(HealthState::Degraded);
        assert_eq!(registry.get_status().state, HealthState::Degraded);

        // The worst component wins
        one.set(HealthState::Unhealthy);
        assert_eq!(registry.get_status().state, HealthState::Unhealthy);

        // Recovering brings it back to green
        one.set(HealthState::Healthy);
        two.set(HealthState::Healthy);
        assert!(registry.get_status().is_healthy());
    }

    #[test]
    fn any_strategy() {
        let registry = HealthRegistry::new_with_strategy("liveness", HealthStrategy::Any);
        let one = Switch::default();
        let two = Switch::default();
        one.set(HealthState::Unhealthy);
        two.set(HealthState::Unhealthy);
        registry.register("one", one.check()).unwrap();
        registry.register("two", two.check()).unwrap();
        assert_eq!(registry.get_status().state, HealthState::Unhealthy);

        // First component going healthy is enough in Any strategy
        one.set(HealthState::Healthy);
        assert!(registry.get_status().is_healthy());

        // Best component wins
        one.set(HealthState::Degraded);
        assert_eq!(registry.get_status().state, HealthState::Degraded);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HealthRegistry::new("liveness");
        registry.register("one", HealthStatus::healthy).unwrap();
        assert_eq!(
            registry.register("one", HealthStatus::healthy),
            Err(HealthError::AlreadyRegistered("one".to_string()))
        );

        assert!(registry.deregister("one"));
        assert!(!registry.deregister("one"));
        registry.register("one", HealthStatus::healthy).unwrap();
    }

    #[test]
    fn status_display() {
        assert_eq!(HealthStatus::healthy().to_string(), "healthy");
        assert_eq!(
            HealthStatus::degraded("consumer lagging").to_string(),
            "degraded: consumer lagging"
        );
    }

    #[test]
    fn health_strategy_from_str() {
        assert_eq!(
            "ALL".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::All
        );
        assert_eq!(
            "ANY".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::Any
        );
        assert_eq!(
            "all".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::All
        );
        assert_eq!(
            "any".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::Any
        );
        assert!("invalid".parse::<HealthStrategy>().is_err());
    }
}
