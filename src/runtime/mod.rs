//! # Runtime Provider Interface
//!
//! This module provides the provider-neutral view of an agent runtime: the
//! domain model every backend shares and the [`RuntimeProvider`] trait every
//! backend implements.
//!
//! ## Lifecycle
//!
//! ```text
//! spawn(config) ──▶ Pending ──▶ Creating ──▶ Running ──▶ terminate(id)
//!                                               │
//!                          execute / files / snapshot
//! ```
//!
//! A failed spawn leaves nothing behind, and `restore()` always produces a
//! new runtime id rather than reviving the snapshotted one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_runtime_orchestrator::runtime::{RuntimeProvider, SpawnConfig, ExecOptions};
//!
//! let runtime = provider.spawn(&SpawnConfig::new("python:3.12")).await?;
//! let result = provider
//!     .execute(&runtime.id, &["python".into(), "-V".into()], ExecOptions::default())
//!     .await?;
//! provider.terminate(&runtime.id, false).await?;
//! ```

mod events;
mod spec;
mod state;
mod stream;
mod table;
mod traits;

pub use events::EventBus;
pub use spec::{
    cores_to_millis, format_quantity, parse_quantity, BackendType, ExecOptions, NetworkPolicy,
    ResourceLimits, SpawnConfig, VolumeMount, VolumeSource,
};
pub use state::{
    AgentRuntime, ChunkKind, EventKind, ExecChunk, ExecResult, ResourceUsage, RuntimeEvent,
    RuntimeId, RuntimeState, Snapshot, SnapshotId,
};
pub use stream::{ChunkSender, ExecStream, InteractiveSession, SequenceBuffer};
pub use table::{RuntimeEntry, RuntimeTable};
pub use traits::{EventHandler, RuntimeProvider};

/// Builds an argv vector from string slices.
///
/// ```rust,ignore
/// let cmd = argv(["sh", "-c", "echo hi"]);
/// ```
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
