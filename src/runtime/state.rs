//! Runtime state types.
//!
//! This module defines the runtime-side domain model:
//! - `RuntimeId` / `SnapshotId`: opaque identifiers
//! - `RuntimeState`: lifecycle state machine
//! - `AgentRuntime`: the unit of work handed back to callers
//! - `ExecResult` / `ExecChunk`: command output, buffered or streamed
//! - `Snapshot`: point-in-time capture of a runtime
//! - `RuntimeEvent`: notifications emitted by providers

use super::BackendType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a runtime.
///
/// New ids are UUIDv7, so they sort by creation time. Ids observed from an
/// external system (e.g. a pod label) are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(String);

impl RuntimeId {
    /// Generates a fresh, time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RuntimeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuntimeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Generates a fresh, time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("snap-{}", uuid::Uuid::now_v7()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Runtime State
// =============================================================================

/// Lifecycle state of a runtime.
///
/// ```text
///   Pending ──▶ Creating ──▶ Running ◀──▶ Paused
///      │           │            │            │
///      │           │            ▼            │
///      │           │       Terminating ──▶ Terminated
///      │           │            │
///      └───────────┴────────────┴──────────▶ Error
/// ```
///
/// `Terminated` and `Error` are terminal: a runtime in either state is never
/// moved anywhere else. A replacement gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    #[default]
    Pending,
    Creating,
    Running,
    Paused,
    Terminating,
    Terminated,
    Error,
}

impl RuntimeState {
    /// Returns true for states a runtime never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Same-state moves are not transitions and return false.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RuntimeState::{Creating, Error, Paused, Pending, Running, Terminated, Terminating};
        match (self, next) {
            (Terminated | Error, _) => false,
            (_, Error) => true,
            (Pending, Creating | Running | Terminating | Terminated) => true,
            (Creating, Running | Terminating | Terminated) => true,
            (Running, Paused | Terminating | Terminated) => true,
            (Paused, Running | Terminating | Terminated) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Agent Runtime
// =============================================================================

/// Observed resource consumption of a runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// CPU usage in fractional cores.
    pub cpu: f64,
    /// Memory usage in bytes.
    pub memory_bytes: u64,
    /// Disk usage in bytes.
    pub disk_bytes: u64,
    /// Commands executed so far.
    pub exec_count: u64,
}

/// An isolated execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntime {
    pub id: RuntimeId,
    pub backend_type: BackendType,
    pub state: RuntimeState,
    pub resource_usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Backend-specific details (pod name, directory path, ...).
    pub metadata: HashMap<String, String>,
}

impl AgentRuntime {
    /// Creates a runtime record in the `Pending` state.
    #[must_use]
    pub fn new(id: RuntimeId, backend_type: BackendType) -> Self {
        let now = Utc::now();
        Self {
            id,
            backend_type,
            state: RuntimeState::Pending,
            resource_usage: ResourceUsage::default(),
            created_at: now,
            last_active_at: now,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == RuntimeState::Running
    }

    /// Marks the runtime as active now.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

// =============================================================================
// Execution Results
// =============================================================================

/// Result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub metadata: HashMap<String, String>,
}

impl ExecResult {
    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded as UTF-8, lossy.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded as UTF-8, lossy.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Which stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Stdout,
    Stderr,
    /// Final chunk; `data` holds the decimal exit code.
    Exit,
}

/// One piece of streamed command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecChunk {
    pub kind: ChunkKind,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Position in the stream; consumers order by this, not arrival.
    pub sequence: u64,
}

impl ExecChunk {
    /// Exit code carried by an `Exit` chunk.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        if self.kind != ChunkKind::Exit {
            return None;
        }
        std::str::from_utf8(&self.data).ok()?.trim().parse().ok()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time capture of a runtime, owned by the provider that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: SnapshotId,
    pub runtime_id: RuntimeId,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub metadata: HashMap<String, String>,
}

// =============================================================================
// Events
// =============================================================================

/// Discriminant of [`RuntimeEvent`], used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    RuntimeCreated,
    RuntimeTerminated,
    ExecCompleted,
    SnapshotCreated,
    Error,
}

/// Notification emitted by a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    StateChange {
        runtime_id: RuntimeId,
        from: RuntimeState,
        to: RuntimeState,
    },
    RuntimeCreated {
        runtime: AgentRuntime,
    },
    RuntimeTerminated {
        runtime_id: RuntimeId,
    },
    ExecCompleted {
        runtime_id: RuntimeId,
        exit_code: i32,
        duration_ms: u64,
    },
    SnapshotCreated {
        snapshot: Snapshot,
    },
    Error {
        runtime_id: Option<RuntimeId>,
        message: String,
    },
}

impl RuntimeEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChange { .. } => EventKind::StateChange,
            Self::RuntimeCreated { .. } => EventKind::RuntimeCreated,
            Self::RuntimeTerminated { .. } => EventKind::RuntimeTerminated,
            Self::ExecCompleted { .. } => EventKind::ExecCompleted,
            Self::SnapshotCreated { .. } => EventKind::SnapshotCreated,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Runtime the event refers to, if any.
    #[must_use]
    pub fn runtime_id(&self) -> Option<&RuntimeId> {
        match self {
            Self::StateChange { runtime_id, .. }
            | Self::RuntimeTerminated { runtime_id }
            | Self::ExecCompleted { runtime_id, .. } => Some(runtime_id),
            Self::RuntimeCreated { runtime } => Some(&runtime.id),
            Self::SnapshotCreated { snapshot } => Some(&snapshot.runtime_id),
            Self::Error { runtime_id, .. } => runtime_id.as_ref(),
        }
    }
}
