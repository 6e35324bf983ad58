//! Cluster collaborator interface.
//!
//! The MicroVM provider never talks to a cluster API server directly. It
//! consumes [`ClusterApi`], which an embedding application implements over
//! its client of choice. [`super::InMemoryCluster`] is the in-process
//! implementation used for development and tests.

use super::manifest::PodManifest;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

// =============================================================================
// Exec Channel Numbers
// =============================================================================

/// Exec frame channel carrying stdout.
pub const CHANNEL_STDOUT: u8 = 1;

/// Exec frame channel carrying stderr.
pub const CHANNEL_STDERR: u8 = 2;

/// Exec frame channel carrying the final status object.
pub const CHANNEL_STATUS: u8 = 3;

// =============================================================================
// Pod Objects
// =============================================================================

/// Pod lifecycle phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Observed pod, reduced to what the provider needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodObject {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub phase: PodPhase,
    /// All containers report ready.
    pub ready: bool,
    /// Human-readable reason for the current phase, if any.
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PodObject {
    /// Whether the label selector (`k=v,k2=v2`) matches this pod.
    #[must_use]
    pub fn matches_selector(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((k, v)) => self.labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
                None => self.labels.contains_key(term),
            })
    }
}

/// Change notification from a pod watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(PodObject),
    Modified(PodObject),
    Deleted(PodObject),
}

impl WatchEvent {
    #[must_use]
    pub fn pod(&self) -> &PodObject {
        match self {
            Self::Added(p) | Self::Modified(p) | Self::Deleted(p) => p,
        }
    }
}

// =============================================================================
// Exec
// =============================================================================

/// One frame of a multiplexed exec connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFrame {
    /// [`CHANNEL_STDOUT`], [`CHANNEL_STDERR`] or [`CHANNEL_STATUS`].
    pub channel: u8,
    pub data: Vec<u8>,
    /// Position in the frame stream, starting at 0. The transport may
    /// deliver frames out of order.
    pub sequence: u64,
}

/// Open exec connection into a pod container.
#[derive(Debug)]
pub struct ExecChannel {
    /// Output frames. The channel closes when the connection ends.
    pub frames: mpsc::Receiver<ExecFrame>,
    /// Stdin, when requested. Dropping it signals EOF.
    pub stdin: Option<mpsc::Sender<Vec<u8>>>,
}

/// Final status object sent on the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    /// `Success` or `Failure`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ExecStatusDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatusDetails {
    #[serde(default)]
    pub causes: Vec<ExecStatusCause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatusCause {
    pub reason: String,
    pub message: String,
}

impl ExecStatus {
    /// Status object for a process that exited with `code`.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        if code == 0 {
            return Self {
                status: "Success".to_string(),
                reason: None,
                message: None,
                details: None,
            };
        }
        Self {
            status: "Failure".to_string(),
            reason: Some("NonZeroExitCode".to_string()),
            message: Some(format!("command terminated with non-zero exit code: {code}")),
            details: Some(ExecStatusDetails {
                causes: vec![ExecStatusCause {
                    reason: "ExitCode".to_string(),
                    message: code.to_string(),
                }],
            }),
        }
    }

    /// Decodes a status frame payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Serialization(format!("invalid exec status frame: {e}")))
    }

    /// Exit code carried by the status.
    ///
    /// A failure without an `ExitCode` cause means the exec itself failed
    /// (container gone, command not startable) and is an error.
    pub fn exit_code(&self) -> Result<i32> {
        if self.status == "Success" {
            return Ok(0);
        }
        let code = self
            .details
            .iter()
            .flat_map(|d| d.causes.iter())
            .find(|c| c.reason == "ExitCode")
            .and_then(|c| c.message.trim().parse().ok());
        code.ok_or_else(|| {
            Error::cluster(
                "exec",
                self.message
                    .clone()
                    .unwrap_or_else(|| "exec failed without exit code".to_string()),
            )
        })
    }

    /// Encodes the status as a frame payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Handle to a container checkpoint held by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Cluster-side identifier.
    pub id: String,
    /// Image reference a new pod can start from to resume the checkpoint.
    pub image: String,
    pub pod_name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// ClusterApi
// =============================================================================

/// Operations the MicroVM provider consumes from a cluster.
///
/// Implementations map "object does not exist" to [`Error::NotFound`] and
/// every other API failure to [`Error::Cluster`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submits a pod. Returns the object as first observed.
    async fn create_pod(&self, manifest: &PodManifest) -> Result<PodObject>;

    /// Fetches a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodObject>;

    /// Deletes a pod.
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_secs: u32) -> Result<()>;

    /// Lists pods matching a label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodObject>>;

    /// Opens an exec connection into a container.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: bool,
    ) -> Result<ExecChannel>;

    /// Starts watching pods matching a label selector.
    ///
    /// The receiver closes when the watch connection drops; callers are
    /// expected to resync and watch again.
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Checkpoints a running container.
    async fn checkpoint_pod(&self, namespace: &str, pod: &str, container: &str)
        -> Result<Checkpoint>;

    /// Releases a checkpoint.
    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()>;
}
