//! Backend strategies.
//!
//! A [`Registry`] is built once at process start and passed to whatever
//! needs machine services. Built-in backends are added per host OS by
//! [`Registry::with_host_defaults`]; callers can register more.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::machine::{firecracker, qemu, MachineService};
use crate::store::Store;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Kernel build options of a unikernel image, as `CONFIG_*` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KConfig(BTreeMap<String, String>);

impl KConfig {
    /// Parse a `.config` file. Comments and blank lines are skipped.
    pub fn parse(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
            .collect()
    }

    /// Value of an option.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether a boolean option is set to `y`.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key) == Some("y")
    }

    /// Whether no option is known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for KConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether a backend can run an image, given its source and build options.
pub type CompatibleFn = Arc<dyn Fn(&str, &KConfig) -> bool + Send + Sync>;

/// Construct a backend's machine service.
pub type ConstructorFn =
    Arc<dyn Fn(Arc<HostConfig>, Store) -> Result<Arc<dyn MachineService>> + Send + Sync>;

/// A registered backend.
#[derive(Clone)]
pub struct Strategy {
    /// Driver name.
    pub name: String,
    /// Compatibility predicate.
    pub compatible: CompatibleFn,
    /// Service constructor.
    pub constructor: ConstructorFn,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish()
    }
}

impl Strategy {
    /// Create a strategy.
    pub fn new<C, N>(name: impl Into<String>, compatible: C, constructor: N) -> Self
    where
        C: Fn(&str, &KConfig) -> bool + Send + Sync + 'static,
        N: Fn(Arc<HostConfig>, Store) -> Result<Arc<dyn MachineService>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            compatible: Arc::new(compatible),
            constructor: Arc::new(constructor),
        }
    }

    /// Build the service.
    pub fn service(&self, config: Arc<HostConfig>, store: Store) -> Result<Arc<dyn MachineService>> {
        (self.constructor)(config, store)
    }

    /// Whether this backend can run the image.
    pub fn is_compatible(&self, source: &str, kconfig: &KConfig) -> bool {
        (self.compatible)(source, kconfig)
    }
}

// Images built without KVM support only run emulated.
fn qemu_compatible(_source: &str, kconfig: &KConfig) -> bool {
    kconfig.is_empty() || kconfig.is_enabled("CONFIG_PLAT_KVM")
}

fn firecracker_compatible(_source: &str, kconfig: &KConfig) -> bool {
    kconfig.is_empty()
        || (kconfig.is_enabled("CONFIG_PLAT_KVM")
            && kconfig.is_enabled("CONFIG_KVM_VMM_FIRECRACKER"))
}

/// QEMU strategy.
pub fn qemu_strategy() -> Strategy {
    Strategy::new(qemu::DRIVER_NAME, qemu_compatible, |config, store| {
        Ok(Arc::new(qemu::QemuService::new(config, store)) as Arc<dyn MachineService>)
    })
}

/// Firecracker strategy.
pub fn firecracker_strategy() -> Strategy {
    Strategy::new(
        firecracker::DRIVER_NAME,
        firecracker_compatible,
        |config, store| {
            Ok(Arc::new(firecracker::FirecrackerService::new(config, store))
                as Arc<dyn MachineService>)
        },
    )
}

/// Ordered set of strategies. Registration order is iteration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    strategies: Vec<Strategy>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The backends this host can run.
    pub fn with_host_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        registry.register(qemu_strategy());

        #[cfg(target_os = "linux")]
        registry.register(firecracker_strategy());

        registry
    }

    /// Add a strategy, replacing one with the same name in place.
    pub fn register(&mut self, strategy: Strategy) {
        match self.strategies.iter_mut().find(|s| s.name == strategy.name) {
            Some(existing) => *existing = strategy,
            None => self.strategies.push(strategy),
        }
    }

    /// All strategies, in registration order.
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Names of all strategies.
    pub fn driver_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }

    /// Look up a strategy by name.
    pub fn get(&self, name: &str) -> Result<&Strategy> {
        self.strategies
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::DriverNotFound(name.to_string()))
    }

    /// Strategies able to run the image.
    pub fn compatible(&self, source: &str, kconfig: &KConfig) -> Vec<&Strategy> {
        self.strategies
            .iter()
            .filter(|s| s.is_compatible(source, kconfig))
            .collect()
    }

    /// Build every registered service.
    pub fn services(
        &self,
        config: &Arc<HostConfig>,
        store: &Store,
    ) -> Result<Vec<Arc<dyn MachineService>>> {
        self.strategies
            .iter()
            .map(|s| s.service(config.clone(), store.clone()))
            .collect()
    }
}
