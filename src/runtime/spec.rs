//! Spawn-time configuration types.
//!
//! This module defines what a caller hands to a provider:
//! - `BackendType`: which isolation technology backs a runtime
//! - `ResourceLimits`: CPU/memory/disk bounds, fixed for the runtime's lifetime
//! - `SpawnConfig`: everything needed to create a runtime
//! - `ExecOptions`: per-command execution options

use crate::constants::DEFAULT_IMAGE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Backend Type
// =============================================================================

/// Isolation technology backing a runtime.
///
/// The set is closed: the factory and orchestrator key their registries on
/// this enum rather than on free-form names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendType {
    /// Hosted sandbox service reached over the network.
    #[serde(rename = "remote-sandbox")]
    RemoteSandbox,
    /// VM-isolated pod on a container orchestration cluster.
    #[serde(rename = "microvm")]
    MicroVm,
    /// Directory-isolated worktree on the local filesystem.
    #[serde(rename = "worktree")]
    Worktree,
}

impl BackendType {
    /// All backend types, in default fallback order.
    pub const ALL: [BackendType; 3] = [Self::RemoteSandbox, Self::MicroVm, Self::Worktree];

    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RemoteSandbox => "remote-sandbox",
            Self::MicroVm => "microvm",
            Self::Worktree => "worktree",
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "remote-sandbox" | "remote" | "sandbox" | "e2b" => Ok(Self::RemoteSandbox),
            "microvm" | "micro-vm" | "kata" => Ok(Self::MicroVm),
            "worktree" | "local" => Ok(Self::Worktree),
            other => Err(Error::Configuration(format!("unknown backend type '{other}'"))),
        }
    }
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Resource limits attached to a runtime at spawn time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Fractional CPU cores.
    pub cpu: f64,
    /// Memory as a sized string (e.g. `512Mi`, `2Gi`).
    pub memory: String,
    /// Ephemeral disk as a sized string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    /// Maximum number of agents sharing this runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: 0.5,
            memory: "512Mi".to_string(),
            disk: None,
            max_agents: None,
        }
    }
}

impl ResourceLimits {
    /// Validates that every quantity parses and is positive.
    pub fn validate(&self) -> Result<()> {
        if !self.cpu.is_finite() || self.cpu <= 0.0 {
            return Err(Error::Configuration(format!(
                "cpu limit must be positive, got {}",
                self.cpu
            )));
        }
        if self.memory_bytes()? == 0 {
            return Err(Error::Configuration("memory limit must be positive".to_string()));
        }
        if let Some(disk) = &self.disk {
            parse_quantity(disk)?;
        }
        if self.max_agents == Some(0) {
            return Err(Error::Configuration("maxAgents must be at least 1".to_string()));
        }
        Ok(())
    }

    /// CPU limit in millicores.
    #[must_use]
    pub fn cpu_millis(&self) -> u64 {
        cores_to_millis(self.cpu)
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_quantity(&self.memory)
    }

    /// Disk limit in bytes, if set.
    pub fn disk_bytes(&self) -> Result<Option<u64>> {
        self.disk.as_deref().map(parse_quantity).transpose()
    }
}

// =============================================================================
// Network & Volumes
// =============================================================================

/// Network access granted to a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NetworkPolicy {
    /// No network access.
    #[default]
    Isolated,
    /// Egress only to the listed hosts.
    Egress { allowed_hosts: Vec<String> },
    /// Unrestricted network access.
    Unrestricted,
}

/// Volume source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Empty directory scoped to the runtime.
    EmptyDir,
    /// Host path mount.
    HostPath { path: String },
    /// ConfigMap reference.
    ConfigMap { name: String },
    /// Secret reference.
    Secret { name: String },
}

/// Volume mounted into a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name (unique within the runtime).
    pub name: String,
    /// Mount path inside the runtime.
    pub mount_path: String,
    /// Read-only mount.
    #[serde(default)]
    pub read_only: bool,
    /// Where the volume's data comes from.
    pub source: VolumeSource,
}

// =============================================================================
// Spawn Config
// =============================================================================

/// Everything a provider needs to create a runtime.
///
/// Owned by the caller; providers clone it and never mutate the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    /// Explicit backend selection (overrides team policy and defaults).
    #[serde(default)]
    pub backend: Option<BackendType>,
    /// Image reference.
    pub image: String,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Network policy.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Labels attached to the runtime.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Time allowed for the runtime to reach `running`.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Team scope for configuration and policy lookup.
    #[serde(default)]
    pub team_id: Option<String>,
    /// Agent scope for configuration lookup.
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE)
    }
}

impl SpawnConfig {
    /// Creates a config for the given image with default limits.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            backend: None,
            image: image.into(),
            resources: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            volumes: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            timeout: None,
            team_id: None,
            agent_id: None,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Scopes the spawn to a team and, optionally, an agent.
    #[must_use]
    pub fn scoped(mut self, team_id: Option<&str>, agent_id: Option<&str>) -> Self {
        self.team_id = team_id.map(str::to_string);
        self.agent_id = agent_id.map(str::to_string);
        self
    }

    /// Validates the config before any backend is contacted.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::Configuration("image must not be empty".to_string()));
        }
        self.resources.validate()?;
        let mut names = std::collections::HashSet::new();
        for volume in &self.volumes {
            if !names.insert(volume.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate volume name '{}'",
                    volume.name
                )));
            }
            if !volume.mount_path.starts_with('/') {
                return Err(Error::Configuration(format!(
                    "mount path for volume '{}' must be absolute",
                    volume.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Exec Options
// =============================================================================

/// Options for running a command inside a runtime.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory override.
    pub working_dir: Option<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Command timeout override.
    pub timeout: Option<Duration>,
    /// Bytes written to stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
}

impl ExecOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

// =============================================================================
// Quantity Parsing Helpers
// =============================================================================

const KI: f64 = 1024.0;

/// Parses a Kubernetes-style quantity (`512Mi`, `2G`, `1024`) to bytes.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    let suffixes: [(&str, f64); 8] = [
        ("Ki", KI),
        ("Mi", KI * KI),
        ("Gi", KI * KI * KI),
        ("Ti", KI * KI * KI * KI),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    let (number, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s, 1.0));

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid quantity '{s}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Configuration(format!("invalid quantity '{s}'")));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bytes = (value * multiplier).round() as u64;
    Ok(bytes)
}

/// Formats bytes as the largest exact binary quantity.
#[must_use]
pub fn format_quantity(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("Gi", 1 << 30), ("Mi", 1 << 20), ("Ki", 1 << 10)];
    for (suffix, size) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{suffix}", bytes / size);
        }
    }
    bytes.to_string()
}

/// Converts fractional cores to millicores.
#[must_use]
pub fn cores_to_millis(cores: f64) -> u64 {
    if !cores.is_finite() || cores <= 0.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (cores * 1000.0).round() as u64;
    millis
}
