//! Worktree runtime provider.
//!
//! The cheapest backend and the usual last resort in the fallback chain:
//! each runtime is a directory under `base_dir`, commands run as host
//! processes with that directory as working directory, and snapshots are
//! directory copies.
//!
//! ```text
//! base_dir/
//! ├── runtimes/<runtime-id>/     one per live runtime
//! └── snapshots/<snapshot-id>/   immutable copies
//! ```
//!
//! Paths handed to file operations are relative to the runtime directory.
//! The `/workspace` prefix used by VM-backed runtimes is accepted and mapped
//! onto the runtime directory, so callers can stay backend-neutral.

use crate::constants::{DEFAULT_COMMAND_TIMEOUT, MAX_FILE_TRANSFER_SIZE, WORKSPACE_PATH};
use crate::error::{Error, Result};
use crate::factory::ProviderConfig;
use crate::runtime::{
    AgentRuntime, BackendType, ChunkKind, ChunkSender, EventBus, ExecOptions, ExecResult,
    ExecStream, InteractiveSession, RuntimeEvent, RuntimeId, RuntimeProvider, RuntimeState,
    RuntimeTable, Snapshot, SnapshotId, SpawnConfig, VolumeSource,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Read buffer size for process pipes.
const PIPE_CHUNK_SIZE: usize = 8 * 1024;

const RUNTIMES_SUBDIR: &str = "runtimes";
const SNAPSHOTS_SUBDIR: &str = "snapshots";

// =============================================================================
// Configuration
// =============================================================================

/// Worktree provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeConfig {
    /// Root under which runtime and snapshot directories live.
    pub base_dir: PathBuf,
    pub command_timeout: Duration,
    /// Cap on concurrently live runtimes when the spawn sets none.
    pub max_agents: Option<u32>,
}

impl WorktreeConfig {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_agents: None,
        }
    }

    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self> {
        let base_dir = config
            .get_str("base_dir")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("worktree base_dir is required".to_string()))?;
        Ok(Self {
            base_dir: PathBuf::from(base_dir),
            command_timeout: config
                .get_duration_ms("command_timeout_ms")
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            max_agents: config
                .get_u64("max_agents")
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        })
    }
}

#[derive(Debug, Clone)]
struct WorktreeRecord {
    root: PathBuf,
    env: HashMap<String, String>,
    spawn: SpawnConfig,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    snapshot: Snapshot,
    path: PathBuf,
    spawn: SpawnConfig,
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

/// Maps a caller path onto `root`, refusing anything that escapes it.
fn resolve_in(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path)
        .strip_prefix(WORKSPACE_PATH)
        .unwrap_or_else(|_| Path::new(path.trim_start_matches('/')));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(Error::PathTraversal {
            path: path.to_string(),
        });
    }
    Ok(root.join(relative))
}

/// Copies a directory recursively, preserving symlinks.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source directory does not exist: {}", src.display()),
        ));
    }
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(&src_path)?;
            let _ = std::fs::remove_file(&dst_path);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)?;
            #[cfg(not(unix))]
            {
                if std::fs::metadata(&src_path).is_ok_and(|m| m.is_dir()) {
                    copy_dir_recursive(&src_path, &dst_path)?;
                } else {
                    std::fs::copy(&src_path, &dst_path)?;
                }
            }
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Total size of regular files under `dir`.
fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
        .map_err(Error::from)
}

fn map_not_found(e: std::io::Error, what: impl FnOnce() -> String) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(what())
    } else {
        Error::Io(e)
    }
}

// =============================================================================
// Process Plumbing
// =============================================================================

async fn read_pipe<R>(mut pipe: R, kind: ChunkKind, tx: mpsc::Sender<(ChunkKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PIPE_CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((kind, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Streams a child's output into `sender` and finishes with its exit code.
async fn pump_child(
    mut child: Child,
    mut sender: ChunkSender,
    limit: Option<Duration>,
    runtime: RuntimeId,
    events: EventBus,
) {
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_pipe(stdout, ChunkKind::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_pipe(stderr, ChunkKind::Stderr, tx.clone()));
    }
    drop(tx);

    let work = async {
        while let Some((kind, data)) = rx.recv().await {
            if !sender.send(kind, data).await {
                return Ok(None);
            }
        }
        let status = child.wait().await?;
        let result: Result<Option<i32>> = Ok(Some(status.code().unwrap_or(-1)));
        result
    };

    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let _ = child.start_kill();
                Err(Error::timeout(format!("command in runtime {runtime}"), limit))
            }
        },
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
            let _ = child.start_kill();
        }
        Err(e) => sender.fail(e).await,
    }
}

// =============================================================================
// WorktreeProvider
// =============================================================================

/// Runtime provider backed by local directories.
pub struct WorktreeProvider {
    config: WorktreeConfig,
    events: EventBus,
    table: RuntimeTable<WorktreeRecord>,
    snapshots: RwLock<HashMap<SnapshotId, SnapshotRecord>>,
}

impl WorktreeProvider {
    #[must_use]
    pub fn new(config: WorktreeConfig) -> Self {
        let events = EventBus::new();
        Self {
            config,
            table: RuntimeTable::new(events.clone()),
            events,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Factory constructor.
    pub fn constructor(
    ) -> impl Fn(ProviderConfig) -> Result<Arc<dyn RuntimeProvider>> + Send + Sync + 'static {
        |provider_config| {
            let config = WorktreeConfig::from_provider_config(&provider_config)?;
            Ok(Arc::new(Self::new(config)) as Arc<dyn RuntimeProvider>)
        }
    }

    #[must_use]
    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    fn runtime_dir(&self, id: &RuntimeId) -> PathBuf {
        self.config.base_dir.join(RUNTIMES_SUBDIR).join(id.as_str())
    }

    fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.config.base_dir.join(SNAPSHOTS_SUBDIR).join(id.as_str())
    }

    /// Registers a runtime whose directory is already populated and marks it
    /// running.
    fn activate(&self, id: &RuntimeId, root: PathBuf, spawn: SpawnConfig) -> Result<AgentRuntime> {
        let mut runtime = AgentRuntime::new(id.clone(), BackendType::Worktree);
        runtime
            .metadata
            .insert("path".to_string(), root.to_string_lossy().into_owned());
        runtime.metadata.insert("image".to_string(), spawn.image.clone());
        let mut env = spawn.env.clone();
        env.insert("AGENT_RUNTIME_ID".to_string(), id.to_string());
        let max_agents = spawn.resources.max_agents.or(self.config.max_agents);
        self.table
            .insert_bounded(runtime, WorktreeRecord { root, env, spawn }, max_agents)?;
        self.table.transition(id, RuntimeState::Creating)?;
        self.table.transition(id, RuntimeState::Running)?;

        let runtime = self
            .table
            .get(id)
            .ok_or_else(|| Error::Internal(format!("runtime {id} vanished")))?;
        self.events.emit(RuntimeEvent::RuntimeCreated {
            runtime: runtime.clone(),
        });
        Ok(runtime)
    }

    async fn start(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
        interactive: bool,
    ) -> Result<(ExecStream, Option<mpsc::Sender<Vec<u8>>>)> {
        let Some((program, args)) = command.split_first() else {
            return Err(Error::Configuration("command must not be empty".to_string()));
        };
        let entry = self.table.require_running(id)?;
        let cwd = match &options.working_dir {
            Some(dir) => resolve_in(&entry.data.root, dir)?,
            None => entry.data.root.clone(),
        };

        let want_stdin = interactive || options.stdin.is_some();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .envs(&entry.data.env)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if want_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::execution(id, format!("failed to start '{program}': {e}")))?;

        self.table.update(id, |rt| {
            rt.resource_usage.exec_count += 1;
            rt.touch();
        });

        let mut session_stdin = None;
        if let Some(mut pipe) = child.stdin.take() {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
            if let Some(data) = options.stdin {
                let _ = tx.try_send(data);
            }
            if interactive {
                session_stdin = Some(tx.clone());
            }
            drop(tx);
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if pipe.write_all(&data).await.is_err() {
                        break;
                    }
                }
                let _ = pipe.shutdown().await;
            });
        }

        let limit = if interactive {
            options.timeout
        } else {
            Some(options.timeout.unwrap_or(self.config.command_timeout))
        };
        let (sender, stream) = ExecStream::channel();
        tokio::spawn(pump_child(
            child,
            sender,
            limit,
            id.clone(),
            self.events.clone(),
        ));
        Ok((stream, session_stdin))
    }

    fn root_of(&self, id: &RuntimeId) -> Result<PathBuf> {
        Ok(self.table.require_running(id)?.data.root)
    }
}

#[async_trait]
impl RuntimeProvider for WorktreeProvider {
    fn backend_type(&self) -> BackendType {
        BackendType::Worktree
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<AgentRuntime> {
        config.validate()?;
        let id = RuntimeId::generate();
        let root = self.runtime_dir(&id);
        tokio::fs::create_dir_all(&root).await?;

        for volume in &config.volumes {
            let target = resolve_in(&root, &volume.mount_path)?;
            match &volume.source {
                VolumeSource::EmptyDir => tokio::fs::create_dir_all(&target).await?,
                other => {
                    tracing::debug!(runtime = %id, volume = %volume.name, source = ?other, "volume source not supported by worktree, skipped");
                }
            }
        }

        let runtime = match self.activate(&id, root.clone(), config.clone()) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.table.remove(&id);
                let _ = tokio::fs::remove_dir_all(&root).await;
                return Err(e);
            }
        };
        tracing::info!(runtime = %id, path = %root.display(), "worktree runtime running");
        Ok(runtime)
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
        match tokio::fs::remove_dir_all(&entry.data.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if force => {
                tracing::warn!(runtime = %id, error = %e, "failed to remove worktree, forgetting runtime anyway");
            }
            Err(e) => return Err(e.into()),
        }
        if !entry.runtime.state.is_terminal() {
            self.table.transition(id, RuntimeState::Terminated)?;
        }
        self.table.remove(id);
        self.events.emit(RuntimeEvent::RuntimeTerminated {
            runtime_id: id.clone(),
        });
        tracing::info!(runtime = %id, force, "worktree runtime terminated");
        Ok(())
    }

    async fn status(&self, id: &RuntimeId) -> Result<AgentRuntime> {
        self.table
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))
    }

    async fn list_runtimes(&self) -> Result<Vec<AgentRuntime>> {
        Ok(self.table.list())
    }

    async fn execute(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult> {
        let (stream, _) = self.start(id, command, options, false).await?;
        stream.collect().await
    }

    async fn execute_stream(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecStream> {
        Ok(self.start(id, command, options, false).await?.0)
    }

    async fn execute_interactive(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<InteractiveSession> {
        let (stream, stdin) = self.start(id, command, options, true).await?;
        let stdin = stdin.ok_or_else(|| Error::execution(id, "stdin not attached"))?;
        Ok(InteractiveSession::new(stdin, stream))
    }

    async fn read_file(&self, id: &RuntimeId, path: &str) -> Result<Vec<u8>> {
        let file = resolve_in(&self.root_of(id)?, path)?;
        tokio::fs::read(&file)
            .await
            .map_err(|e| map_not_found(e, || format!("file {path} in runtime {id}")))
    }

    async fn write_file(&self, id: &RuntimeId, path: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_FILE_TRANSFER_SIZE {
            return Err(Error::ResourceExhausted(format!(
                "file of {} bytes exceeds transfer limit",
                data.len()
            )));
        }
        let file = resolve_in(&self.root_of(id)?, path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, data).await?;
        Ok(())
    }

    async fn upload_directory(&self, id: &RuntimeId, local: &Path, remote: &str) -> Result<()> {
        let target = resolve_in(&self.root_of(id)?, remote)?;
        let source = local.to_path_buf();
        if !tokio::fs::metadata(&source).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::NotFound(format!("directory {}", source.display())));
        }
        blocking(move || copy_dir_recursive(&source, &target)).await
    }

    async fn download_directory(&self, id: &RuntimeId, remote: &str, local: &Path) -> Result<()> {
        let source = resolve_in(&self.root_of(id)?, remote)?;
        if !tokio::fs::metadata(&source).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::NotFound(format!("directory {remote} in runtime {id}")));
        }
        let target = local.to_path_buf();
        blocking(move || copy_dir_recursive(&source, &target)).await
    }

    async fn snapshot(&self, id: &RuntimeId) -> Result<Snapshot> {
        let entry = self.table.require_running(id)?;
        let snapshot_id = SnapshotId::generate();
        let path = self.snapshot_dir(&snapshot_id);

        let (src, dst) = (entry.data.root.clone(), path.clone());
        let size_bytes = blocking(move || {
            copy_dir_recursive(&src, &dst)?;
            dir_size(&dst)
        })
        .await?;
        self.table.update(id, |rt| rt.resource_usage.disk_bytes = size_bytes);

        let mut metadata = HashMap::new();
        metadata.insert("path".to_string(), path.to_string_lossy().into_owned());
        let snapshot = Snapshot {
            id: snapshot_id,
            runtime_id: id.clone(),
            created_at: Utc::now(),
            size_bytes,
            metadata,
        };
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                snapshot.id.clone(),
                SnapshotRecord {
                    snapshot: snapshot.clone(),
                    path,
                    spawn: entry.data.spawn,
                },
            );
        self.events.emit(RuntimeEvent::SnapshotCreated {
            snapshot: snapshot.clone(),
        });
        tracing::info!(runtime = %id, snapshot = %snapshot.id, size_bytes, "snapshot created");
        Ok(snapshot)
    }

    async fn restore(&self, snapshot_id: &SnapshotId) -> Result<AgentRuntime> {
        let record = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;

        let id = RuntimeId::generate();
        let root = self.runtime_dir(&id);
        let (src, dst) = (record.path.clone(), root.clone());
        if let Err(e) = blocking(move || copy_dir_recursive(&src, &dst)).await {
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(e);
        }

        let mut runtime = match self.activate(&id, root.clone(), record.spawn) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.table.remove(&id);
                let _ = tokio::fs::remove_dir_all(&root).await;
                return Err(e);
            }
        };
        self.table.update(&id, |rt| {
            rt.metadata
                .insert("restoredFrom".to_string(), snapshot_id.to_string());
        });
        runtime
            .metadata
            .insert("restoredFrom".to_string(), snapshot_id.to_string());
        tracing::info!(runtime = %id, snapshot = %snapshot_id, "restored worktree runtime");
        Ok(runtime)
    }

    async fn list_snapshots(&self, runtime_id: Option<&RuntimeId>) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
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

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        let path = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .map(|r| r.path.clone())
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(snapshot_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.config.base_dir.join(RUNTIMES_SUBDIR)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for WorktreeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeProvider")
            .field("base_dir", &self.config.base_dir)
            .field("runtimes", &self.table.len())
            .finish_non_exhaustive()
    }
}
