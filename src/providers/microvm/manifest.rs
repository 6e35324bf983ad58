//! Pod manifest for a VM-isolated agent runtime.
//!
//! Translates a [`SpawnConfig`] into the pod object submitted to the cluster:
//!
//! | SpawnConfig        | Pod                                              |
//! |--------------------|--------------------------------------------------|
//! | `resources.cpu`    | `limits.cpu` in millicores, request = 50%        |
//! | `resources.memory` | `limits.memory`, request = 50%                   |
//! | `resources.disk`   | `limits.ephemeral-storage`, request = 50%        |
//! | `network`          | network-policy annotations                       |
//! | `volumes`          | `volumes` + `volumeMounts`                       |
//! | `env`, `labels`    | container env, pod labels                        |
//!
//! Every pod carries the managed-by and runtime-id labels the reconciler
//! selects on, runs under the configured VM runtime class, and drops all
//! capabilities.

use super::MicroVmConfig;
use crate::constants::{
    AGENT_CONTAINER_NAME, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MAX_POD_NAME_LEN,
    RUNTIME_ID_LABEL, WORKSPACE_PATH,
};
use crate::error::{Error, Result};
use crate::runtime::{
    format_quantity, NetworkPolicy, RuntimeId, SpawnConfig, VolumeSource,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Annotation carrying the network mode.
pub const NETWORK_POLICY_ANNOTATION: &str = "agent-runtime/network-policy";

/// Annotation carrying the egress allow-list, comma separated.
pub const EGRESS_HOSTS_ANNOTATION: &str = "agent-runtime/egress-allowed-hosts";

/// Non-root uid the agent container runs as.
const AGENT_UID: i64 = 1000;

// =============================================================================
// Manifest Types
// =============================================================================

/// Pod object as submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    pub restart_policy: String,
    pub termination_grace_period_seconds: u32,
    pub automount_service_account_token: bool,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
    pub security_context: SecurityContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<ContainerMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub limits: BTreeMap<String, String>,
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub allow_privilege_escalation: bool,
    pub run_as_non_root: bool,
    pub run_as_user: i64,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub drop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<PathRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NameRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRef {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub secret_name: String,
}

impl Volume {
    fn from_source(name: &str, source: &VolumeSource) -> Self {
        let mut volume = Self {
            name: name.to_string(),
            empty_dir: None,
            host_path: None,
            config_map: None,
            secret: None,
        };
        match source {
            VolumeSource::EmptyDir => volume.empty_dir = Some(BTreeMap::new()),
            VolumeSource::HostPath { path } => volume.host_path = Some(PathRef { path: path.clone() }),
            VolumeSource::ConfigMap { name } => volume.config_map = Some(NameRef { name: name.clone() }),
            VolumeSource::Secret { name } => {
                volume.secret = Some(SecretRef {
                    secret_name: name.clone(),
                });
            }
        }
        volume
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Pod name for a runtime id.
#[must_use]
pub fn pod_name_for(id: &RuntimeId) -> String {
    bounded_name("agent", id.as_str())
}

/// Builds a DNS-1123 label from `prefix-raw`, at most 63 characters.
///
/// Over-long names are truncated and suffixed with a hash of the full name,
/// so distinct inputs stay distinct.
#[must_use]
pub fn bounded_name(prefix: &str, raw: &str) -> String {
    let full = format!("{prefix}-{raw}");
    let mut name: String = full
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    name = name.trim_matches('-').to_string();

    if name.len() > MAX_POD_NAME_LEN {
        let digest = Sha256::digest(full.as_bytes());
        let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
        name.truncate(MAX_POD_NAME_LEN - suffix.len() - 1);
        name = format!("{}-{suffix}", name.trim_end_matches('-'));
    }
    if name.is_empty() {
        name = prefix.to_string();
    }
    name
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_POD_NAME_LEN
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

// =============================================================================
// Building
// =============================================================================

impl PodManifest {
    /// Builds the pod for a runtime.
    pub fn for_runtime(id: &RuntimeId, spawn: &SpawnConfig, config: &MicroVmConfig) -> Result<Self> {
        let limits_cfg = &spawn.resources;
        let cpu_millis = limits_cfg.cpu_millis().max(1);
        let memory = limits_cfg.memory_bytes()?;

        let mut limits = BTreeMap::new();
        let mut requests = BTreeMap::new();
        limits.insert("cpu".to_string(), format!("{cpu_millis}m"));
        requests.insert("cpu".to_string(), format!("{}m", (cpu_millis / 2).max(1)));
        limits.insert("memory".to_string(), format_quantity(memory));
        requests.insert("memory".to_string(), format_quantity(memory / 2));
        if let Some(disk) = limits_cfg.disk_bytes()? {
            limits.insert("ephemeral-storage".to_string(), format_quantity(disk));
            requests.insert("ephemeral-storage".to_string(), format_quantity(disk / 2));
        }

        let mut labels: BTreeMap<String, String> = spawn
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(RUNTIME_ID_LABEL.to_string(), id.to_string());

        let mut annotations = BTreeMap::new();
        match &spawn.network {
            NetworkPolicy::Isolated => {
                annotations.insert(NETWORK_POLICY_ANNOTATION.to_string(), "isolated".to_string());
            }
            NetworkPolicy::Egress { allowed_hosts } => {
                annotations.insert(NETWORK_POLICY_ANNOTATION.to_string(), "egress".to_string());
                annotations.insert(EGRESS_HOSTS_ANNOTATION.to_string(), allowed_hosts.join(","));
            }
            NetworkPolicy::Unrestricted => {
                annotations.insert(
                    NETWORK_POLICY_ANNOTATION.to_string(),
                    "unrestricted".to_string(),
                );
            }
        }

        let mut env: Vec<EnvVar> = spawn
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));
        env.push(EnvVar {
            name: "AGENT_RUNTIME_ID".to_string(),
            value: id.to_string(),
        });

        let volume_mounts = spawn
            .volumes
            .iter()
            .map(|v| ContainerMount {
                name: v.name.clone(),
                mount_path: v.mount_path.clone(),
                read_only: v.read_only,
            })
            .collect();
        let volumes = spawn
            .volumes
            .iter()
            .map(|v| Volume::from_source(&v.name, &v.source))
            .collect();

        let manifest = Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: pod_name_for(id),
                namespace: config.namespace.clone(),
                labels,
                annotations,
            },
            spec: PodSpec {
                runtime_class_name: Some(config.runtime_class.clone()),
                restart_policy: "Never".to_string(),
                termination_grace_period_seconds: config.grace_period_secs,
                automount_service_account_token: false,
                containers: vec![Container {
                    name: AGENT_CONTAINER_NAME.to_string(),
                    image: spawn.image.clone(),
                    command: vec!["sleep".to_string(), "infinity".to_string()],
                    working_dir: WORKSPACE_PATH.to_string(),
                    env,
                    resources: ResourceRequirements { limits, requests },
                    security_context: SecurityContext {
                        allow_privilege_escalation: false,
                        run_as_non_root: true,
                        run_as_user: AGENT_UID,
                        capabilities: Capabilities {
                            drop: vec!["ALL".to_string()],
                        },
                    },
                    volume_mounts,
                }],
                volumes,
            },
        };
        manifest.validate(&config.runtime_class)?;
        Ok(manifest)
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Checks the structural rules the cluster would otherwise reject late.
    pub fn validate(&self, runtime_class: &str) -> Result<()> {
        if self.api_version != "v1" {
            return Err(invalid(format!("unsupported apiVersion '{}'", self.api_version)));
        }
        if self.kind != "Pod" {
            return Err(invalid(format!("expected kind 'Pod', got '{}'", self.kind)));
        }
        if !is_dns_label(&self.metadata.name) {
            return Err(invalid(format!(
                "pod name '{}' is not a DNS label of at most {MAX_POD_NAME_LEN} characters",
                self.metadata.name
            )));
        }
        if self.metadata.namespace.is_empty() {
            return Err(invalid("namespace must not be empty".to_string()));
        }
        if self.spec.runtime_class_name.as_deref() != Some(runtime_class) {
            return Err(invalid(format!("runtimeClassName must be '{runtime_class}'")));
        }
        if self.spec.containers.is_empty() {
            return Err(invalid("pod has no containers".to_string()));
        }
        for container in &self.spec.containers {
            if container.image.trim().is_empty() {
                return Err(invalid(format!("container '{}' has no image", container.name)));
            }
            if container.security_context.allow_privilege_escalation {
                return Err(invalid(format!(
                    "container '{}' allows privilege escalation",
                    container.name
                )));
            }
        }
        for (key, value) in &self.metadata.labels {
            if value.len() > MAX_POD_NAME_LEN {
                return Err(invalid(format!("label '{key}' value exceeds {MAX_POD_NAME_LEN} characters")));
            }
        }
        Ok(())
    }

    /// Renders the manifest as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parses a pod manifest from YAML, checking the document shape first.
    pub fn from_yaml(yaml: &str, runtime_class: &str) -> Result<Self> {
        validate_document(yaml, runtime_class)?;
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate(runtime_class)?;
        Ok(manifest)
    }
}

fn invalid(reason: String) -> Error {
    Error::Configuration(format!("invalid pod manifest: {reason}"))
}

/// Validates a raw pod document.
///
/// Requires a mapping with `apiVersion`, `kind`, `metadata` and `spec`,
/// `kind: Pod`, and `spec.runtimeClassName` equal to `runtime_class`.
pub fn validate_document(yaml: &str, runtime_class: &str) -> Result<serde_yaml::Value> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml)
        .map_err(|e| invalid(format!("invalid YAML syntax: {e}")))?;
    let map = doc
        .as_mapping()
        .ok_or_else(|| invalid("document must be a mapping".to_string()))?;

    for field in ["apiVersion", "kind", "metadata", "spec"] {
        if !map.contains_key(field) {
            return Err(invalid(format!("missing required field: {field}")));
        }
    }
    let kind = doc.get("kind").and_then(serde_yaml::Value::as_str).unwrap_or("");
    if kind != "Pod" {
        return Err(invalid(format!("expected kind 'Pod', got '{kind}'")));
    }
    let class = doc
        .get("spec")
        .and_then(|s| s.get("runtimeClassName"))
        .and_then(serde_yaml::Value::as_str);
    if class != Some(runtime_class) {
        return Err(invalid(format!("runtimeClassName must be '{runtime_class}'")));
    }
    Ok(doc)
}
