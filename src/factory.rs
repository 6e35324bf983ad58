//! Provider factory.
//!
//! Turns a [`BackendType`] into a working [`RuntimeProvider`]:
//!
//! - constructors are registered per backend type
//! - configuration is merged from four layers, highest priority first:
//!   agent override > team override > process-wide base > backend default
//! - `get_provider()` caches one instance per backend; `create_provider()`
//!   always builds a fresh one
//! - `select_runtime_type()` resolves explicit override > team policy >
//!   process default
//!
//! # Environment Layer
//!
//! ```text
//! AGENT_RUNTIME_CPU=1                    base        cpu = 1
//! AGENT_RUNTIME_TEAM_ALPHA_CPU=2         team alpha  cpu = 2
//! AGENT_RUNTIME_AGENT_A7_MEMORY=2Gi      agent a7    memory = "2Gi"
//! AGENT_RUNTIME_TEAM_ALPHA_BACKEND=microvm
//! ```
//!
//! Keys and scope ids are lower-cased. Values are coerced to bool, then
//! number, then string.

use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_NAMESPACE, DEFAULT_SPAWN_TIMEOUT, ENV_PREFIX,
    MICROVM_RUNTIME_CLASS,
};
use crate::error::{Error, Result};
use crate::runtime::{BackendType, ResourceLimits, RuntimeProvider, SpawnConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Loosely typed configuration values, keyed by lower-case name.
pub type ConfigMap = Map<String, Value>;

/// Constructor registered for a backend.
pub type ProviderConstructor =
    Arc<dyn Fn(ProviderConfig) -> Result<Arc<dyn RuntimeProvider>> + Send + Sync>;

// =============================================================================
// Configuration Layers
// =============================================================================

/// Team/agent scope used to pick configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigScope {
    pub team_id: Option<String>,
    pub agent_id: Option<String>,
}

impl ConfigScope {
    #[must_use]
    pub fn team(team_id: impl Into<String>) -> Self {
        Self {
            team_id: Some(team_id.into()),
            agent_id: None,
        }
    }

    #[must_use]
    pub fn agent(team_id: Option<&str>, agent_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.map(str::to_string),
            agent_id: Some(agent_id.into()),
        }
    }
}

impl From<&SpawnConfig> for ConfigScope {
    fn from(config: &SpawnConfig) -> Self {
        Self {
            team_id: config.team_id.clone(),
            agent_id: config.agent_id.clone(),
        }
    }
}

/// Base, per-team and per-agent configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigLayers {
    pub base: ConfigMap,
    pub teams: HashMap<String, ConfigMap>,
    pub agents: HashMap<String, ConfigMap>,
}

impl ConfigLayers {
    /// Reads layers from the process environment using [`ENV_PREFIX`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(ENV_PREFIX, std::env::vars())
    }

    /// Parses layers from `(name, value)` pairs.
    ///
    /// Variables not starting with `{prefix}_` are ignored.
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut layers = Self::default();
        let prefix = format!("{prefix}_");

        for (name, raw) in vars {
            let Some(rest) = name.as_ref().strip_prefix(&prefix) else {
                continue;
            };
            let value = coerce_value(raw.as_ref());

            let scoped = |rest: &str, tag: &str| -> Option<(String, String)> {
                let rest = rest.strip_prefix(tag)?;
                let (id, key) = rest.split_once('_')?;
                (!id.is_empty() && !key.is_empty())
                    .then(|| (id.to_ascii_lowercase(), key.to_ascii_lowercase()))
            };

            if let Some((team, key)) = scoped(rest, "TEAM_") {
                layers.teams.entry(team).or_default().insert(key, value);
            } else if let Some((agent, key)) = scoped(rest, "AGENT_") {
                layers.agents.entry(agent).or_default().insert(key, value);
            } else if !rest.is_empty() {
                layers.base.insert(rest.to_ascii_lowercase(), value);
            }
        }
        layers
    }

    /// Parses layers from a YAML document with `base`, `teams` and `agents`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let layers: Self = serde_yaml::from_str(yaml)?;
        Ok(layers)
    }

    /// Overlays `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: ConfigLayers) {
        self.base.extend(other.base);
        for (team, map) in other.teams {
            self.teams.entry(team).or_default().extend(map);
        }
        for (agent, map) in other.agents {
            self.agents.entry(agent).or_default().extend(map);
        }
    }

    /// Merges `defaults` with the layers that apply to `scope`.
    #[must_use]
    pub fn resolve(&self, defaults: &ConfigMap, scope: &ConfigScope) -> ConfigMap {
        let mut merged = defaults.clone();
        merged.extend(self.base.clone());
        let lookup = |layer: &HashMap<String, ConfigMap>, id: Option<&str>| {
            id.and_then(|id| layer.get(&id.to_ascii_lowercase())).cloned()
        };
        if let Some(team) = lookup(&self.teams, scope.team_id.as_deref()) {
            merged.extend(team);
        }
        if let Some(agent) = lookup(&self.agents, scope.agent_id.as_deref()) {
            merged.extend(agent);
        }
        merged
    }
}

/// Coerces a raw string to bool, then number, then string.
#[must_use]
pub fn coerce_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Built-in defaults for a backend, the lowest-priority layer.
#[must_use]
pub fn backend_defaults(backend: BackendType) -> ConfigMap {
    let limits = ResourceLimits::default();
    let mut map = ConfigMap::new();
    map.insert("cpu".into(), Value::from(limits.cpu));
    map.insert("memory".into(), Value::from(limits.memory));
    map.insert(
        "spawn_timeout_ms".into(),
        Value::from(duration_ms(DEFAULT_SPAWN_TIMEOUT)),
    );
    map.insert(
        "command_timeout_ms".into(),
        Value::from(duration_ms(DEFAULT_COMMAND_TIMEOUT)),
    );
    match backend {
        BackendType::MicroVm => {
            map.insert("namespace".into(), Value::from(DEFAULT_NAMESPACE));
            map.insert("runtime_class".into(), Value::from(MICROVM_RUNTIME_CLASS));
        }
        BackendType::Worktree => {
            let base = std::env::temp_dir().join("agent-worktrees");
            map.insert("base_dir".into(), Value::from(base.to_string_lossy().into_owned()));
        }
        BackendType::RemoteSandbox => {}
    }
    map
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: std::time::Duration) -> u64 {
    d.as_millis() as u64
}

// =============================================================================
// Provider Config
// =============================================================================

/// Fully resolved configuration handed to a provider constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub backend: BackendType,
    pub values: ConfigMap,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(backend: BackendType, values: ConfigMap) -> Self {
        Self { backend, values }
    }

    /// Backend defaults only.
    #[must_use]
    pub fn defaults(backend: BackendType) -> Self {
        Self::new(backend, backend_defaults(backend))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value; numbers and bools are rendered.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Millisecond value as a `Duration`.
    #[must_use]
    pub fn get_duration_ms(&self, key: &str) -> Option<std::time::Duration> {
        self.get_u64(key).map(std::time::Duration::from_millis)
    }

    /// Resource limits from the `cpu`, `memory` and `disk` keys.
    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            cpu: self.get_f64("cpu").unwrap_or(defaults.cpu),
            memory: self.get_str("memory").unwrap_or(defaults.memory),
            disk: self.get_str("disk"),
            max_agents: self
                .get_u64("max_agents")
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Deserializes the values into a backend-specific config type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|e| Error::Configuration(format!("invalid {} config: {e}", self.backend)))
    }
}

// =============================================================================
// Provider Factory
// =============================================================================

/// Backend selection inputs for [`ProviderFactory::select_runtime_type`].
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    pub explicit: Option<BackendType>,
    pub team_id: Option<String>,
}

impl From<&SpawnConfig> for SelectionOptions {
    fn from(config: &SpawnConfig) -> Self {
        Self {
            explicit: config.backend,
            team_id: config.team_id.clone(),
        }
    }
}

struct CachedProvider {
    provider: Arc<dyn RuntimeProvider>,
    access_count: u64,
}

/// Factory statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub registered: Vec<BackendType>,
    /// Access count per cached singleton.
    pub cached: HashMap<BackendType, u64>,
}

/// Registry of provider constructors plus the singleton cache.
///
/// Constructed explicitly by the application's composition root; there is
/// no process-global instance.
pub struct ProviderFactory {
    constructors: RwLock<HashMap<BackendType, ProviderConstructor>>,
    instances: Mutex<HashMap<BackendType, CachedProvider>>,
    layers: RwLock<ConfigLayers>,
    team_policies: RwLock<HashMap<String, BackendType>>,
    default_backend: RwLock<BackendType>,
}

impl ProviderFactory {
    /// Creates a factory with the given configuration layers.
    ///
    /// A base `default_backend` key seeds the process default, and a team
    /// `backend` key seeds that team's policy.
    #[must_use]
    pub fn new(layers: ConfigLayers) -> Self {
        let default_backend = layers
            .base
            .get("default_backend")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(BackendType::Worktree);

        let team_policies = layers
            .teams
            .iter()
            .filter_map(|(team, map)| {
                let backend = map.get("backend")?.as_str()?.parse().ok()?;
                Some((team.clone(), backend))
            })
            .collect();

        Self {
            constructors: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            layers: RwLock::new(layers),
            team_policies: RwLock::new(team_policies),
            default_backend: RwLock::new(default_backend),
        }
    }

    /// Creates a factory configured from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ConfigLayers::from_env())
    }

    /// Registers the constructor for a backend.
    ///
    /// # Errors
    ///
    /// `ProviderAlreadyRegistered` if the backend already has a constructor.
    pub fn register_provider<F>(&self, backend: BackendType, constructor: F) -> Result<()>
    where
        F: Fn(ProviderConfig) -> Result<Arc<dyn RuntimeProvider>> + Send + Sync + 'static,
    {
        let mut constructors = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if constructors.contains_key(&backend) {
            return Err(Error::ProviderAlreadyRegistered(backend));
        }
        constructors.insert(backend, Arc::new(constructor));
        tracing::debug!(%backend, "registered provider constructor");
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, backend: BackendType) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&backend)
    }

    /// Registered backends in fallback order.
    #[must_use]
    pub fn registered_backends(&self) -> Vec<BackendType> {
        let constructors = self.constructors.read().unwrap_or_else(PoisonError::into_inner);
        let mut backends: Vec<BackendType> = constructors.keys().copied().collect();
        backends.sort();
        backends
    }

    /// Resolves the configuration a provider for `backend` would receive.
    #[must_use]
    pub fn resolve_config(&self, backend: BackendType, scope: &ConfigScope) -> ProviderConfig {
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        ProviderConfig::new(backend, layers.resolve(&backend_defaults(backend), scope))
    }

    /// Overlays additional configuration at runtime.
    pub fn merge_layers(&self, layers: ConfigLayers) {
        self.layers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(layers);
    }

    fn constructor(&self, backend: BackendType) -> Result<ProviderConstructor> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&backend)
            .cloned()
            .ok_or(Error::ProviderNotRegistered(backend))
    }

    /// Builds a fresh provider instance. Never cached.
    pub fn create_provider(
        &self,
        backend: BackendType,
        scope: &ConfigScope,
    ) -> Result<Arc<dyn RuntimeProvider>> {
        let constructor = self.constructor(backend)?;
        let config = self.resolve_config(backend, scope);
        let provider = constructor(config)?;
        tracing::info!(%backend, "created provider instance");
        Ok(provider)
    }

    /// Returns the cached provider for `backend`, constructing it first.
    ///
    /// Only the first call's scope is used to configure the instance; later
    /// calls receive the same instance regardless of scope and only bump its
    /// access counter. Use [`Self::create_provider`] for scoped instances.
    pub fn get_provider(
        &self,
        backend: BackendType,
        scope: &ConfigScope,
    ) -> Result<Arc<dyn RuntimeProvider>> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = instances.get_mut(&backend) {
            cached.access_count += 1;
            tracing::trace!(%backend, access_count = cached.access_count, "provider cache hit");
            return Ok(Arc::clone(&cached.provider));
        }

        let provider = self.create_provider(backend, scope)?;
        instances.insert(
            backend,
            CachedProvider {
                provider: Arc::clone(&provider),
                access_count: 1,
            },
        );
        Ok(provider)
    }

    /// Returns the cached provider without constructing one.
    #[must_use]
    pub fn cached_provider(&self, backend: BackendType) -> Option<Arc<dyn RuntimeProvider>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&backend)
            .map(|c| Arc::clone(&c.provider))
    }

    /// Drops every cached provider after shutting it down.
    pub async fn clear_cache(&self) {
        let drained: Vec<(BackendType, Arc<dyn RuntimeProvider>)> = {
            let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            instances.drain().map(|(k, v)| (k, v.provider)).collect()
        };
        for (backend, provider) in drained {
            provider.shutdown().await;
            tracing::debug!(%backend, "evicted cached provider");
        }
    }

    // =========================================================================
    // Backend Selection
    // =========================================================================

    /// Picks the backend for a spawn: explicit > team policy > default.
    #[must_use]
    pub fn select_runtime_type(&self, options: &SelectionOptions) -> BackendType {
        if let Some(explicit) = options.explicit {
            return explicit;
        }
        if let Some(backend) = options.team_id.as_deref().and_then(|t| self.team_policy(t)) {
            return backend;
        }
        *self.default_backend.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the backend a team's spawns use when not explicitly chosen.
    pub fn set_team_policy(&self, team_id: &str, backend: BackendType) {
        self.team_policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(team_id.to_ascii_lowercase(), backend);
        tracing::info!(team = team_id, %backend, "team runtime policy updated");
    }

    /// Backend pinned for a team, if any.
    #[must_use]
    pub fn team_policy(&self, team_id: &str) -> Option<BackendType> {
        self.team_policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&team_id.to_ascii_lowercase())
            .copied()
    }

    /// Removes a team's policy; returns the previous backend.
    pub fn clear_team_policy(&self, team_id: &str) -> Option<BackendType> {
        self.team_policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&team_id.to_ascii_lowercase())
    }

    /// Sets the process-wide default backend.
    pub fn set_default_backend(&self, backend: BackendType) {
        *self.default_backend.write().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    #[must_use]
    pub fn stats(&self) -> FactoryStats {
        let cached = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, v.access_count))
            .collect();
        FactoryStats {
            registered: self.registered_backends(),
            cached,
        }
    }
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new(ConfigLayers::default())
    }
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("registered", &self.registered_backends())
            .finish_non_exhaustive()
    }
}
