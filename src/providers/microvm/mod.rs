//! MicroVM runtime provider.
//!
//! Each runtime is a single-container pod scheduled under a VM-backed
//! runtime class, so every agent gets its own guest kernel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  MicroVmProvider                                                 │
//! │                                                                  │
//! │  spawn ──▶ PodManifest ──▶ create_pod ──▶ poll until ready       │
//! │               │                               │                  │
//! │               │              failure / timeout / drop            │
//! │               │                               ▼                  │
//! │               │                      SpawnGuard deletes pod      │
//! │                                                                  │
//! │  exec ──▶ ExecChannel (1=stdout 2=stderr 3=status)               │
//! │              └─▶ SequenceBuffer ─▶ ExecStream                    │
//! │                                                                  │
//! │  reconciler task: watch(label selector) ──▶ RuntimeTable         │
//! │     reconnect with backoff, resync via list on every reconnect   │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ ClusterApi
//!                                ▼
//!                      cluster control plane
//! ```
//!
//! # State Ownership
//!
//! Call-driven operations and the reconciler both write the runtime table,
//! and both go through [`RuntimeTable::transition`], so neither can move a
//! runtime out of a terminal state.

mod cluster;
mod manifest;
mod memory;
mod transfer;

pub use cluster::{
    Checkpoint, ClusterApi, ExecChannel, ExecFrame, ExecStatus, ExecStatusCause,
    ExecStatusDetails, PodObject, PodPhase, WatchEvent, CHANNEL_STATUS, CHANNEL_STDERR,
    CHANNEL_STDOUT,
};
pub use manifest::{bounded_name, pod_name_for, validate_document, PodManifest};
pub use memory::{InMemoryCluster, PodBehavior};
pub use transfer::{pack_directory, unpack_archive, MISSING_PATH_EXIT_CODE};

use crate::constants::{
    AGENT_CONTAINER_NAME, DEFAULT_API_TIMEOUT, DEFAULT_COMMAND_TIMEOUT, DEFAULT_GRACE_PERIOD_SECS,
    DEFAULT_NAMESPACE, DEFAULT_SPAWN_TIMEOUT, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    MAX_FILE_TRANSFER_SIZE, MICROVM_RUNTIME_CLASS, READINESS_POLL_INTERVAL,
    RESTORED_FROM_ANNOTATION, RUNTIME_ID_LABEL, WATCH_RECONNECT_INITIAL, WATCH_RECONNECT_MAX,
    WORKSPACE_PATH,
};
use crate::error::{Error, Result};
use crate::factory::ProviderConfig;
use crate::runtime::{
    AgentRuntime, BackendType, ChunkKind, ChunkSender, EventBus, ExecChunk, ExecOptions,
    ExecResult, ExecStream, InteractiveSession, ResourceLimits, RuntimeEvent, RuntimeId,
    RuntimeProvider, RuntimeState, RuntimeTable, SequenceBuffer, Snapshot, SnapshotId,
    SpawnConfig,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use transfer::{
    decode, encode, resolve_remote_path, script_command, wrap_command, DISK_USAGE_SCRIPT,
    DOWNLOAD_DIR_SCRIPT, READ_FILE_SCRIPT, UPLOAD_DIR_SCRIPT, WRITE_FILE_SCRIPT,
};

// =============================================================================
// Configuration
// =============================================================================

/// MicroVM provider settings.
///
/// Deserialized from the resolved [`ProviderConfig`]; unknown keys are
/// ignored so the same layer can carry settings for other backends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MicroVmConfig {
    pub namespace: String,
    pub runtime_class: String,
    pub spawn_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub api_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub grace_period_secs: u32,
    /// Run the watch-based reconciler.
    pub reconcile: bool,
    /// Default CPU limit for spawns that leave resources at their defaults.
    pub cpu: f64,
    pub memory: String,
    /// Cap on concurrently live runtimes; unlimited when unset.
    pub max_agents: Option<u32>,
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            runtime_class: MICROVM_RUNTIME_CLASS.to_string(),
            spawn_timeout_ms: millis(DEFAULT_SPAWN_TIMEOUT),
            command_timeout_ms: millis(DEFAULT_COMMAND_TIMEOUT),
            api_timeout_ms: millis(DEFAULT_API_TIMEOUT),
            poll_interval_ms: millis(READINESS_POLL_INTERVAL),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            reconcile: true,
            cpu: limits.cpu,
            memory: limits.memory,
            max_agents: None,
        }
    }
}

impl MicroVmConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self> {
        let parsed: Self = config.deserialize()?;
        if parsed.namespace.is_empty() {
            return Err(Error::Configuration("microvm namespace must not be empty".to_string()));
        }
        if parsed.runtime_class.is_empty() {
            return Err(Error::Configuration(
                "microvm runtime_class must not be empty".to_string(),
            ));
        }
        parsed.default_resources().validate()?;
        Ok(parsed)
    }

    #[must_use]
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn default_resources(&self) -> ResourceLimits {
        ResourceLimits {
            cpu: self.cpu,
            memory: self.memory.clone(),
            max_agents: self.max_agents,
            ..ResourceLimits::default()
        }
    }

    /// Label selector matching every pod this provider manages.
    #[must_use]
    pub fn selector(&self) -> String {
        format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
    }
}

// =============================================================================
// Internal Records
// =============================================================================

#[derive(Debug, Clone)]
struct PodRecord {
    pod_name: String,
    spawn: SpawnConfig,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    snapshot: Snapshot,
    checkpoint: Checkpoint,
    spawn: SpawnConfig,
}

struct Inner {
    cluster: Arc<dyn ClusterApi>,
    config: MicroVmConfig,
    events: EventBus,
    table: RuntimeTable<PodRecord>,
    snapshots: RwLock<HashMap<SnapshotId, SnapshotRecord>>,
}

// =============================================================================
// Spawn Guard
// =============================================================================

/// Deletes a half-created pod unless disarmed.
///
/// Covers every exit from `launch`: errors, timeouts, and the spawn future
/// being dropped by its caller.
struct SpawnGuard {
    inner: Option<Arc<Inner>>,
    id: RuntimeId,
    pod_name: String,
}

impl SpawnGuard {
    fn disarm(mut self) {
        self.inner = None;
    }

    async fn cleanup(mut self, reason: &str) {
        if let Some(inner) = self.inner.take() {
            inner.discard(&self.id, &self.pod_name, reason).await;
        }
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let id = self.id.clone();
        let pod_name = self.pod_name.clone();
        inner.mark_failed(&id, "spawn abandoned");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // The create call may still land after the first delete.
                    if matches!(inner.delete_pod(&pod_name, 0).await, Ok(false)) {
                        tokio::time::sleep(inner.config.poll_interval()).await;
                        let _ = inner.delete_pod(&pod_name, 0).await;
                    }
                    inner.table.remove(&id);
                });
            }
            Err(_) => {
                tracing::warn!(runtime = %id, pod = %pod_name, "no runtime to clean up abandoned pod");
                inner.table.remove(&id);
            }
        }
    }
}

// =============================================================================
// Inner: Lifecycle
// =============================================================================

impl Inner {
    /// Runs a cluster call under the API timeout.
    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.api_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation, timeout))?
    }

    fn pod_name(&self, id: &RuntimeId) -> Result<String> {
        self.table
            .entry(id)
            .map(|e| e.data.pod_name)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))
    }

    /// Deletes a pod. Returns false if it did not exist.
    async fn delete_pod(&self, pod_name: &str, grace_period_secs: u32) -> Result<bool> {
        let ns = &self.config.namespace;
        match self
            .call("delete pod", self.cluster.delete_pod(ns, pod_name, grace_period_secs))
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn mark_failed(&self, id: &RuntimeId, reason: &str) {
        if let Err(e) = self.table.transition(id, RuntimeState::Error) {
            tracing::debug!(runtime = %id, error = %e, "could not mark runtime failed");
        }
        self.events.emit(RuntimeEvent::Error {
            runtime_id: Some(id.clone()),
            message: reason.to_string(),
        });
    }

    /// Failure path of a spawn: mark, delete the pod, forget the runtime.
    async fn discard(&self, id: &RuntimeId, pod_name: &str, reason: &str) {
        self.mark_failed(id, reason);
        match self.delete_pod(pod_name, 0).await {
            Ok(deleted) => {
                tracing::debug!(runtime = %id, pod = %pod_name, deleted, "cleaned up failed spawn");
            }
            Err(e) => {
                tracing::warn!(runtime = %id, pod = %pod_name, error = %e, "failed to delete pod of failed spawn");
            }
        }
        self.table.remove(id);
    }

    async fn launch(
        self: &Arc<Self>,
        id: RuntimeId,
        manifest: PodManifest,
        spawn: SpawnConfig,
        restored_from: Option<&SnapshotId>,
    ) -> Result<AgentRuntime> {
        let pod_name = manifest.metadata.name.clone();
        let mut runtime = AgentRuntime::new(id.clone(), BackendType::MicroVm);
        runtime.metadata.insert("pod".to_string(), pod_name.clone());
        runtime
            .metadata
            .insert("namespace".to_string(), self.config.namespace.clone());
        runtime.metadata.insert("image".to_string(), spawn.image.clone());
        if let Some(snapshot) = restored_from {
            runtime
                .metadata
                .insert("restoredFrom".to_string(), snapshot.to_string());
        }

        let timeout = spawn.timeout.unwrap_or_else(|| self.config.spawn_timeout());
        let max_agents = spawn.resources.max_agents;
        self.table.insert_bounded(
            runtime,
            PodRecord {
                pod_name: pod_name.clone(),
                spawn,
            },
            max_agents,
        )?;
        let guard = SpawnGuard {
            inner: Some(Arc::clone(self)),
            id: id.clone(),
            pod_name: pod_name.clone(),
        };

        let outcome = match tokio::time::timeout(timeout, self.create_and_wait(&id, &manifest)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("spawn of pod {pod_name}"), timeout)),
        };
        let outcome = outcome.and_then(|()| self.table.transition(&id, RuntimeState::Running));

        if let Err(e) = outcome {
            tracing::warn!(runtime = %id, pod = %pod_name, error = %e, "spawn failed");
            guard.cleanup(&e.to_string()).await;
            return Err(e);
        }
        guard.disarm();

        let runtime = self
            .table
            .get(&id)
            .ok_or_else(|| Error::Spawn(format!("runtime {id} vanished during spawn")))?;
        self.events.emit(RuntimeEvent::RuntimeCreated {
            runtime: runtime.clone(),
        });
        tracing::info!(runtime = %id, pod = %pod_name, "microvm runtime running");
        Ok(runtime)
    }

    async fn create_and_wait(&self, id: &RuntimeId, manifest: &PodManifest) -> Result<()> {
        self.table.transition(id, RuntimeState::Creating)?;
        let ns = &self.config.namespace;
        let name = &manifest.metadata.name;

        self.call("create pod", self.cluster.create_pod(manifest)).await?;
        tracing::debug!(runtime = %id, pod = %name, "pod submitted");

        loop {
            let pod = match self.call("get pod", self.cluster.get_pod(ns, name)).await {
                Ok(pod) => pod,
                Err(Error::NotFound(_)) => {
                    return Err(Error::Spawn(format!("pod {name} disappeared during startup")));
                }
                Err(e) => return Err(e),
            };
            match pod.phase {
                PodPhase::Running if pod.ready => return Ok(()),
                PodPhase::Failed | PodPhase::Succeeded => {
                    return Err(Error::Spawn(format!(
                        "pod {name} entered phase {}: {}",
                        pod.phase,
                        pod.message.as_deref().unwrap_or("no message")
                    )));
                }
                _ => {}
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn terminate(&self, id: &RuntimeId, force: bool) -> Result<()> {
        let Some(entry) = self.table.entry(id) else {
            if force {
                return Ok(());
            }
            return Err(Error::NotFound(format!("runtime {id}")));
        };

        if !entry.runtime.state.is_terminal() {
            self.table.transition(id, RuntimeState::Terminating)?;
        }
        let grace = if force { 0 } else { self.config.grace_period_secs };
        match self.delete_pod(&entry.data.pod_name, grace).await {
            Ok(_) => {}
            Err(e) if force => {
                tracing::warn!(runtime = %id, error = %e, "pod deletion failed, forgetting runtime anyway");
            }
            Err(e) => return Err(e),
        }

        if !entry.runtime.state.is_terminal() {
            // The reconciler may have finished the job already.
            if let Err(e) = self.table.transition(id, RuntimeState::Terminated) {
                tracing::debug!(runtime = %id, error = %e, "terminate transition skipped");
            }
        }
        self.table.remove(id);
        self.events.emit(RuntimeEvent::RuntimeTerminated {
            runtime_id: id.clone(),
        });
        tracing::info!(runtime = %id, force, "microvm runtime terminated");
        Ok(())
    }
}

// =============================================================================
// Inner: Exec
// =============================================================================

struct OpenExec {
    stream: ExecStream,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
}

impl Inner {
    async fn open_exec(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
        interactive: bool,
    ) -> Result<OpenExec> {
        if command.is_empty() {
            return Err(Error::Configuration("command must not be empty".to_string()));
        }
        let entry = self.table.require_running(id)?;
        let argv = wrap_command(command, &options);
        let want_stdin = interactive || options.stdin.is_some();

        let channel = self
            .call(
                "exec",
                self.cluster.exec(
                    &self.config.namespace,
                    &entry.data.pod_name,
                    AGENT_CONTAINER_NAME,
                    &argv,
                    want_stdin,
                ),
            )
            .await
            .map_err(|e| match e {
                Error::Cluster { reason, .. } => Error::execution(id, reason),
                other => other,
            })?;

        self.table.update(id, |rt| {
            rt.resource_usage.exec_count += 1;
            rt.touch();
        });

        let ExecChannel { frames, stdin } = channel;
        let mut stdin = stdin;
        if let Some(data) = options.stdin {
            if interactive {
                if let Some(tx) = &stdin {
                    let _ = tx.try_send(data);
                }
            } else if let Some(tx) = stdin.take() {
                tokio::spawn(async move {
                    // Dropping the sender afterwards signals EOF.
                    let _ = tx.send(data).await;
                });
            }
        }

        let limit = if interactive {
            options.timeout
        } else {
            Some(options.timeout.unwrap_or_else(|| self.config.command_timeout()))
        };
        let (sender, stream) = ExecStream::channel();
        tokio::spawn(pump_frames(
            frames,
            sender,
            limit,
            id.clone(),
            self.events.clone(),
        ));
        Ok(OpenExec { stream, stdin })
    }

    async fn run_script(
        &self,
        id: &RuntimeId,
        script: &str,
        arg: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResult> {
        let options = ExecOptions {
            stdin,
            timeout: Some(self.config.command_timeout()),
            ..ExecOptions::default()
        };
        self.open_exec(id, &script_command(script, arg), options, false)
            .await?
            .stream
            .collect()
            .await
    }
}

fn frame_kind(channel: u8) -> Option<ChunkKind> {
    match channel {
        CHANNEL_STDOUT => Some(ChunkKind::Stdout),
        CHANNEL_STDERR => Some(ChunkKind::Stderr),
        CHANNEL_STATUS => Some(ChunkKind::Exit),
        _ => None,
    }
}

/// Demultiplexes exec frames into an [`ExecStream`].
///
/// Frames are restored to sequence order before delivery. The stream ends
/// with an `Exit` chunk, or with an error if the connection closes without
/// a status frame or `limit` elapses first.
async fn pump_frames(
    mut frames: mpsc::Receiver<ExecFrame>,
    mut sender: ChunkSender,
    limit: Option<Duration>,
    runtime: RuntimeId,
    events: EventBus,
) {
    let started = Instant::now();

    let work = async {
        let mut buffer = SequenceBuffer::new();
        let mut exit_code: Option<i32> = None;

        'frames: while let Some(frame) = frames.recv().await {
            let Some(kind) = frame_kind(frame.channel) else {
                tracing::debug!(runtime = %runtime, channel = frame.channel, "ignoring unknown exec channel");
                continue;
            };
            let chunk = ExecChunk {
                kind,
                data: frame.data,
                timestamp: Utc::now(),
                sequence: frame.sequence,
            };
            for ready in buffer.push(chunk) {
                if ready.kind == ChunkKind::Exit {
                    exit_code = Some(status_exit_code(&runtime, &ready.data)?);
                    break 'frames;
                }
                if !sender.forward(ready).await {
                    return Ok(None);
                }
            }
        }

        if exit_code.is_none() {
            for ready in buffer.drain() {
                if ready.kind == ChunkKind::Exit {
                    exit_code = Some(status_exit_code(&runtime, &ready.data)?);
                    break;
                }
                if !sender.forward(ready).await {
                    return Ok(None);
                }
            }
        }

        let finished: Result<Option<i32>> = exit_code.map(Some).ok_or_else(|| {
            Error::execution(&runtime, "exec connection closed without exit status")
        });
        finished
    };

    let outcome: Result<Option<i32>> = match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(Error::timeout(format!("command in runtime {runtime}"), limit))),
        None => work.await,
    };

    match outcome {
        Ok(Some(code)) => {
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = started.elapsed().as_millis() as u64;
            sender.exit(code).await;
            events.emit(RuntimeEvent::ExecCompleted {
                runtime_id: runtime,
                exit_code: code,
                duration_ms,
            });
        }
        Ok(None) => {
            tracing::debug!(runtime = %runtime, "exec consumer went away");
        }
        Err(e) => {
            tracing::debug!(runtime = %runtime, error = %e, "exec failed");
            sender.fail(e).await;
        }
    }
}

fn status_exit_code(runtime: &RuntimeId, data: &[u8]) -> Result<i32> {
    ExecStatus::parse(data)
        .and_then(|status| status.exit_code())
        .map_err(|e| Error::execution(runtime, e.to_string()))
}

fn script_failure(id: &RuntimeId, what: &str, result: &ExecResult) -> Error {
    Error::execution(
        id,
        format!(
            "{what} exited with {}: {}",
            result.exit_code,
            result.stderr_lossy().trim()
        ),
    )
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

// =============================================================================
// Inner: Reconciliation
// =============================================================================

fn runtime_id_of(pod: &PodObject) -> Option<RuntimeId> {
    pod.labels.get(RUNTIME_ID_LABEL).map(|s| RuntimeId::from(s.as_str()))
}

impl Inner {
    /// Applies an observed pod to the runtime table.
    fn apply_pod(&self, pod: &PodObject) {
        let Some(id) = runtime_id_of(pod) else {
            return;
        };
        if !self.table.contains(&id) {
            tracing::trace!(pod = %pod.name, "ignoring pod without tracked runtime");
            return;
        }
        let target = match pod.phase {
            PodPhase::Running if pod.ready => RuntimeState::Running,
            PodPhase::Succeeded => RuntimeState::Terminated,
            PodPhase::Failed => RuntimeState::Error,
            PodPhase::Running | PodPhase::Pending | PodPhase::Unknown => return,
        };
        match self.table.transition(&id, target) {
            Ok(Some(from)) => {
                tracing::debug!(runtime = %id, pod = %pod.name, %from, to = %target, "reconciled pod phase");
                if target == RuntimeState::Error {
                    self.events.emit(RuntimeEvent::Error {
                        runtime_id: Some(id),
                        message: pod
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("pod {} failed", pod.name)),
                    });
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(runtime = %id, error = %e, "ignoring stale pod phase"),
        }
    }

    /// Handles a pod that no longer exists.
    fn apply_deleted(&self, id: &RuntimeId) {
        let Some(runtime) = self.table.get(id) else {
            return;
        };
        match runtime.state {
            // Spawn and terminate finish their own bookkeeping.
            RuntimeState::Pending | RuntimeState::Creating | RuntimeState::Terminating => return,
            RuntimeState::Running | RuntimeState::Paused => {
                let _ = self.table.transition(id, RuntimeState::Terminated);
            }
            RuntimeState::Terminated | RuntimeState::Error => {}
        }
        self.table.remove(id);
        self.events.emit(RuntimeEvent::RuntimeTerminated {
            runtime_id: id.clone(),
        });
        tracing::info!(runtime = %id, "pod deleted outside the provider, runtime removed");
    }

    fn apply_watch_event(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => self.apply_pod(pod),
            WatchEvent::Deleted(pod) => {
                if let Some(id) = runtime_id_of(pod) {
                    self.apply_deleted(&id);
                }
            }
        }
    }

    /// Opens a watch, then lists to catch up on anything missed while
    /// disconnected.
    async fn open_watch(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        let ns = &self.config.namespace;
        let selector = self.config.selector();
        // Only runtimes already settled before the list can be judged by it;
        // anything spawned while the list is in flight is absent from it.
        let settled: Vec<RuntimeId> = self
            .table
            .list()
            .into_iter()
            .filter(|r| matches!(r.state, RuntimeState::Running | RuntimeState::Paused))
            .map(|r| r.id)
            .collect();
        let rx = self
            .call("watch pods", self.cluster.watch_pods(ns, &selector))
            .await?;
        let pods = self
            .call("list pods", self.cluster.list_pods(ns, &selector))
            .await?;

        let live: HashSet<RuntimeId> = pods.iter().filter_map(runtime_id_of).collect();
        for pod in &pods {
            self.apply_pod(pod);
        }
        for id in settled {
            if !live.contains(&id) {
                self.apply_deleted(&id);
            }
        }
        tracing::debug!(pods = pods.len(), "reconciler resynced");
        Ok(rx)
    }
}

async fn reconcile_loop(inner: Weak<Inner>) {
    let mut backoff = WATCH_RECONNECT_INITIAL;
    loop {
        let Some(this) = inner.upgrade() else {
            break;
        };
        let opened = this.open_watch().await;
        drop(this);

        match opened {
            Ok(mut rx) => {
                backoff = WATCH_RECONNECT_INITIAL;
                while let Some(event) = rx.recv().await {
                    let Some(this) = inner.upgrade() else {
                        return;
                    };
                    this.apply_watch_event(&event);
                }
                tracing::debug!("pod watch closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?backoff, "pod watch failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(WATCH_RECONNECT_MAX);
    }
}

// =============================================================================
// MicroVmProvider
// =============================================================================

/// Runtime provider backed by VM-isolated pods.
pub struct MicroVmProvider {
    inner: Arc<Inner>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl MicroVmProvider {
    /// Creates a provider. Call [`Self::start_reconciler`] to follow
    /// out-of-band pod changes.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: MicroVmConfig) -> Self {
        let events = EventBus::new();
        Self {
            inner: Arc::new(Inner {
                cluster,
                config,
                table: RuntimeTable::new(events.clone()),
                events,
                snapshots: RwLock::new(HashMap::new()),
            }),
            reconciler: Mutex::new(None),
        }
    }

    /// Factory constructor sharing one cluster client.
    ///
    /// Starts the reconciler when the resolved config enables it.
    pub fn constructor(
        cluster: Arc<dyn ClusterApi>,
    ) -> impl Fn(ProviderConfig) -> Result<Arc<dyn RuntimeProvider>> + Send + Sync + 'static {
        move |provider_config| {
            let config = MicroVmConfig::from_provider_config(&provider_config)?;
            let reconcile = config.reconcile;
            let provider = Self::new(Arc::clone(&cluster), config);
            if reconcile {
                provider.start_reconciler()?;
            }
            Ok(Arc::new(provider) as Arc<dyn RuntimeProvider>)
        }
    }

    #[must_use]
    pub fn config(&self) -> &MicroVmConfig {
        &self.inner.config
    }

    /// Starts the watch-based reconciler. No-op if it is already running.
    ///
    /// # Errors
    ///
    /// Fails outside a Tokio runtime.
    pub fn start_reconciler(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Configuration("reconciler requires a Tokio runtime".to_string()))?;
        let mut task = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(handle.spawn(reconcile_loop(Arc::downgrade(&self.inner))));
        tracing::debug!(namespace = %self.inner.config.namespace, "reconciler started");
        Ok(())
    }

    fn stop_reconciler(&self) {
        if let Some(task) = self
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn effective_spawn(&self, config: &SpawnConfig) -> SpawnConfig {
        let mut spawn = config.clone();
        if spawn.resources == ResourceLimits::default() {
            spawn.resources = self.inner.config.default_resources();
        }
        spawn
    }
}

impl Drop for MicroVmProvider {
    fn drop(&mut self) {
        self.stop_reconciler();
    }
}

#[async_trait]
impl RuntimeProvider for MicroVmProvider {
    fn backend_type(&self) -> BackendType {
        BackendType::MicroVm
    }

    fn events(&self) -> &EventBus {
        &self.inner.events
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<AgentRuntime> {
        config.validate()?;
        let spawn = self.effective_spawn(config);
        let id = RuntimeId::generate();
        let manifest = PodManifest::for_runtime(&id, &spawn, &self.inner.config)?;
        tracing::debug!(runtime = %id, pod = %manifest.metadata.name, image = %spawn.image, "spawning microvm runtime");
        self.inner.launch(id, manifest, spawn, None).await
    }

    async fn terminate(&self, id: &RuntimeId, force: bool) -> Result<()> {
        self.inner.terminate(id, force).await
    }

    /// Refreshes the runtime from the cluster before returning it.
    async fn status(&self, id: &RuntimeId) -> Result<AgentRuntime> {
        let pod_name = self.inner.pod_name(id)?;
        let ns = &self.inner.config.namespace;
        match self
            .inner
            .call("get pod", self.inner.cluster.get_pod(ns, &pod_name))
            .await
        {
            Ok(pod) => self.inner.apply_pod(&pod),
            Err(Error::NotFound(_)) => self.inner.apply_deleted(id),
            Err(e) => tracing::debug!(runtime = %id, error = %e, "status refresh failed"),
        }
        self.inner
            .table
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))
    }

    async fn list_runtimes(&self) -> Result<Vec<AgentRuntime>> {
        Ok(self.inner.table.list())
    }

    async fn execute(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult> {
        self.inner
            .open_exec(id, command, options, false)
            .await?
            .stream
            .collect()
            .await
    }

    async fn execute_stream(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecStream> {
        Ok(self.inner.open_exec(id, command, options, false).await?.stream)
    }

    async fn execute_interactive(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<InteractiveSession> {
        let open = self.inner.open_exec(id, command, options, true).await?;
        let stdin = open
            .stdin
            .ok_or_else(|| Error::execution(id, "cluster did not attach stdin"))?;
        Ok(InteractiveSession::new(stdin, open.stream))
    }

    async fn read_file(&self, id: &RuntimeId, path: &str) -> Result<Vec<u8>> {
        let path = resolve_remote_path(path)?;
        let result = self.inner.run_script(id, READ_FILE_SCRIPT, &path, None).await?;
        match result.exit_code {
            0 => decode(&result.stdout),
            MISSING_PATH_EXIT_CODE => Err(Error::NotFound(format!("file {path} in runtime {id}"))),
            _ => Err(script_failure(id, "read", &result)),
        }
    }

    async fn write_file(&self, id: &RuntimeId, path: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_FILE_TRANSFER_SIZE {
            return Err(Error::ResourceExhausted(format!(
                "file of {} bytes exceeds transfer limit",
                data.len()
            )));
        }
        let path = resolve_remote_path(path)?;
        let result = self
            .inner
            .run_script(id, WRITE_FILE_SCRIPT, &path, Some(encode(data)))
            .await?;
        if !result.is_success() {
            return Err(script_failure(id, "write", &result));
        }
        tracing::debug!(runtime = %id, path = %path, bytes = data.len(), "wrote file");
        Ok(())
    }

    async fn upload_directory(&self, id: &RuntimeId, local: &Path, remote: &str) -> Result<()> {
        let remote = resolve_remote_path(remote)?;
        let local = local.to_path_buf();
        let archive = blocking(move || pack_directory(&local)).await?;
        let result = self
            .inner
            .run_script(id, UPLOAD_DIR_SCRIPT, &remote, Some(encode(&archive)))
            .await?;
        if !result.is_success() {
            return Err(script_failure(id, "upload", &result));
        }
        tracing::debug!(runtime = %id, remote = %remote, archive_bytes = archive.len(), "uploaded directory");
        Ok(())
    }

    async fn download_directory(&self, id: &RuntimeId, remote: &str, local: &Path) -> Result<()> {
        let remote = resolve_remote_path(remote)?;
        let result = self
            .inner
            .run_script(id, DOWNLOAD_DIR_SCRIPT, &remote, None)
            .await?;
        match result.exit_code {
            0 => {}
            MISSING_PATH_EXIT_CODE => {
                return Err(Error::NotFound(format!("directory {remote} in runtime {id}")));
            }
            _ => return Err(script_failure(id, "download", &result)),
        }
        let archive = decode(&result.stdout)?;
        let local = local.to_path_buf();
        let bytes = blocking(move || unpack_archive(&archive, &local)).await?;
        tracing::debug!(runtime = %id, remote = %remote, bytes, "downloaded directory");
        Ok(())
    }

    async fn snapshot(&self, id: &RuntimeId) -> Result<Snapshot> {
        let entry = self.inner.table.require_running(id)?;
        let ns = &self.inner.config.namespace;
        let checkpoint = self
            .inner
            .call(
                "checkpoint",
                self.inner
                    .cluster
                    .checkpoint_pod(ns, &entry.data.pod_name, AGENT_CONTAINER_NAME),
            )
            .await?;

        let size_bytes = match self
            .inner
            .run_script(id, DISK_USAGE_SCRIPT, WORKSPACE_PATH, None)
            .await
        {
            Ok(result) if result.is_success() => result
                .stdout_lossy()
                .trim()
                .parse::<u64>()
                .map_or(0, |kib| kib * 1024),
            Ok(_) => 0,
            Err(e) => {
                tracing::debug!(runtime = %id, error = %e, "disk usage probe failed");
                0
            }
        };
        self.inner.table.update(id, |rt| rt.resource_usage.disk_bytes = size_bytes);

        let mut metadata = HashMap::new();
        metadata.insert("checkpointId".to_string(), checkpoint.id.clone());
        metadata.insert("checkpointImage".to_string(), checkpoint.image.clone());
        metadata.insert("pod".to_string(), entry.data.pod_name.clone());
        let snapshot = Snapshot {
            id: SnapshotId::generate(),
            runtime_id: id.clone(),
            created_at: Utc::now(),
            size_bytes,
            metadata,
        };

        self.inner
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                snapshot.id.clone(),
                SnapshotRecord {
                    snapshot: snapshot.clone(),
                    checkpoint,
                    spawn: entry.data.spawn,
                },
            );
        self.inner.events.emit(RuntimeEvent::SnapshotCreated {
            snapshot: snapshot.clone(),
        });
        tracing::info!(runtime = %id, snapshot = %snapshot.id, size_bytes, "snapshot created");
        Ok(snapshot)
    }

    async fn restore(&self, snapshot_id: &SnapshotId) -> Result<AgentRuntime> {
        let record = self
            .inner
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;

        let mut spawn = record.spawn;
        spawn.image = record.checkpoint.image;
        let id = RuntimeId::generate();
        let manifest = PodManifest::for_runtime(&id, &spawn, &self.inner.config)?
            .with_annotation(RESTORED_FROM_ANNOTATION, snapshot_id.to_string());
        tracing::debug!(runtime = %id, snapshot = %snapshot_id, "restoring snapshot");
        self.inner
            .launch(id, manifest, spawn, Some(snapshot_id))
            .await
    }

    async fn list_snapshots(&self, runtime_id: Option<&RuntimeId>) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .inner
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| runtime_id.map_or(true, |id| &r.snapshot.runtime_id == id))
            .map(|r| r.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Deletes the checkpoint, then forgets the snapshot.
    ///
    /// A failed checkpoint deletion keeps the record so the call can be
    /// retried.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        let checkpoint_id = self
            .inner
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .map(|r| r.checkpoint.id.clone())
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;
        match self
            .inner
            .call(
                "delete checkpoint",
                self.inner.cluster.delete_checkpoint(&checkpoint_id),
            )
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(snapshot = %snapshot_id, error = %e, "checkpoint deletion failed, snapshot kept");
                return Err(e);
            }
        }
        self.inner
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(snapshot_id);
        tracing::info!(snapshot = %snapshot_id, "snapshot deleted");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let ns = &self.inner.config.namespace;
        let selector = self.inner.config.selector();
        self.inner
            .call("list pods", self.inner.cluster.list_pods(ns, &selector))
            .await
            .map(|_| ())
    }

    async fn shutdown(&self) {
        self.stop_reconciler();
    }
}

impl std::fmt::Debug for MicroVmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroVmProvider")
            .field("config", &self.inner.config)
            .field("runtimes", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}
