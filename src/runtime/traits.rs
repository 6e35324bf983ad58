//! Runtime Provider trait definition.
//!
//! This module defines the core `RuntimeProvider` trait - the contract every
//! isolation backend satisfies.

use super::{
    AgentRuntime, BackendType, EventBus, EventKind, ExecOptions, ExecResult, ExecStream,
    InteractiveSession, RuntimeEvent, RuntimeId, RuntimeState, Snapshot, SnapshotId, SpawnConfig,
};
use crate::constants::STATE_POLL_INTERVAL;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Boxed event handler accepted by [`RuntimeProvider::on`].
pub type EventHandler = Box<dyn Fn(RuntimeEvent) + Send + Sync + 'static>;

/// Runtime Provider - uniform lifecycle, exec, file and snapshot API.
///
/// Callers never talk to a backend directly; they go through this trait so
/// the fallback orchestrator can substitute one backend for another.
///
/// # Lifecycle Guarantees
///
/// Implementations **MUST** ensure:
///
/// 1. `spawn()` moves a runtime `pending → creating → running`, emitting a
///    `StateChange` event at each step
/// 2. `spawn()` either returns a running runtime or an error with no
///    external resources left behind
/// 3. A runtime in `terminated` or `error` never changes state again
/// 4. `terminate(id, true)` on an unknown or already-terminated id succeeds
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Operations on the same runtime are
/// not serialized by the provider; callers that need ordering must provide it.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Backend this provider implements.
    fn backend_type(&self) -> BackendType;

    /// Event hub for this provider.
    fn events(&self) -> &EventBus;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a new isolated runtime and waits until it is running.
    ///
    /// # Errors
    ///
    /// - `Spawn` if the backend rejects or fails the workload
    /// - `ResourceExhausted` if the backend is at capacity
    /// - `Timeout` if the runtime is not running within `config.timeout`
    async fn spawn(&self, config: &SpawnConfig) -> Result<AgentRuntime>;

    /// Tears a runtime down and forgets it.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown ids, unless `force` is set
    async fn terminate(&self, id: &RuntimeId, force: bool) -> Result<()>;

    /// Current record for a runtime.
    async fn status(&self, id: &RuntimeId) -> Result<AgentRuntime>;

    /// All runtimes this provider currently tracks.
    async fn list_runtimes(&self) -> Result<Vec<AgentRuntime>>;

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs a command to completion and returns its buffered output.
    ///
    /// A non-zero exit status is a successful call with a failing result.
    async fn execute(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult>;

    /// Runs a command and yields output chunks as they are produced.
    async fn execute_stream(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecStream>;

    /// Runs a command with stdin attached.
    async fn execute_interactive(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<InteractiveSession>;

    // =========================================================================
    // File Transfer
    // =========================================================================

    /// Reads a file. Missing paths are `NotFound`.
    async fn read_file(&self, id: &RuntimeId, path: &str) -> Result<Vec<u8>>;

    /// Writes a file, creating parent directories.
    async fn write_file(&self, id: &RuntimeId, path: &str, data: &[u8]) -> Result<()>;

    /// Copies a local directory tree into the runtime.
    async fn upload_directory(&self, id: &RuntimeId, local: &Path, remote: &str) -> Result<()>;

    /// Copies a directory tree out of the runtime.
    async fn download_directory(&self, id: &RuntimeId, remote: &str, local: &Path)
        -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Captures the runtime's current state.
    async fn snapshot(&self, id: &RuntimeId) -> Result<Snapshot>;

    /// Materializes a new runtime, under a new id, from a snapshot.
    async fn restore(&self, snapshot_id: &SnapshotId) -> Result<AgentRuntime>;

    /// Snapshots owned by this provider, optionally for one runtime.
    async fn list_snapshots(&self, runtime_id: Option<&RuntimeId>) -> Result<Vec<Snapshot>>;

    /// Deletes a snapshot.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()>;

    // =========================================================================
    // Events & Health
    // =========================================================================

    /// Runs `handler` for every subsequent event of `kind`.
    fn on(&self, kind: EventKind, handler: EventHandler) -> JoinHandle<()> {
        self.events().on(kind, handler)
    }

    /// Waits until a runtime reaches `state`.
    ///
    /// Returns `Ok(false)` on timeout, or when the runtime settles in a
    /// different terminal state. A runtime that is gone counts as
    /// `terminated`.
    async fn wait_for_state(
        &self,
        id: &RuntimeId,
        state: RuntimeState,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.events().subscribe();

        loop {
            match self.status(id).await {
                Ok(runtime) if runtime.state == state => return Ok(true),
                Ok(runtime) if runtime.state.is_terminal() => return Ok(false),
                Ok(_) => {}
                Err(Error::NotFound(_)) if state == RuntimeState::Terminated => return Ok(true),
                Err(e) => return Err(e),
            }

            let wait = tokio::time::timeout_at(deadline, async {
                // Wake on a relevant event, or poll in case one was missed.
                let poll = tokio::time::sleep(STATE_POLL_INTERVAL);
                tokio::pin!(poll);
                let mut closed = false;
                loop {
                    if closed {
                        (&mut poll).await;
                        break;
                    }
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(e) if e.runtime_id() == Some(id) => break,
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => closed = true,
                        },
                        () = &mut poll => break,
                    }
                }
            });
            if wait.await.is_err() {
                return Ok(false);
            }
        }
    }

    /// Cheap liveness probe used by the orchestrator's health checker.
    async fn health_check(&self) -> Result<()> {
        self.list_runtimes().await.map(|_| ())
    }

    /// Stops background tasks owned by the provider.
    async fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn RuntimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProvider")
            .field("backend", &self.backend_type())
            .finish_non_exhaustive()
    }
}
