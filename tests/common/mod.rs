//! Shared test doubles.

#![allow(dead_code)]

use agent_runtime_orchestrator::factory::{ProviderConfig, ProviderFactory};
use agent_runtime_orchestrator::runtime::{
    AgentRuntime, BackendType, ChunkKind, EventBus, ExecOptions, ExecResult, ExecStream,
    InteractiveSession, RuntimeEvent, RuntimeId, RuntimeProvider, RuntimeState, RuntimeTable,
    Snapshot, SnapshotId, SpawnConfig,
};
use agent_runtime_orchestrator::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scriptable in-memory provider.
pub struct MockProvider {
    backend: BackendType,
    events: EventBus,
    table: RuntimeTable<()>,
    files: Mutex<HashMap<(RuntimeId, String), Vec<u8>>>,
    snapshots: Mutex<HashMap<SnapshotId, Snapshot>>,
    spawn_delay: Mutex<Duration>,
    fail_spawn: AtomicBool,
    fail_health: AtomicBool,
    spawn_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    config: Mutex<Option<ProviderConfig>>,
    spawned: Mutex<Vec<SpawnConfig>>,
}

impl MockProvider {
    pub fn new(backend: BackendType) -> Arc<Self> {
        let events = EventBus::new();
        Arc::new(Self {
            backend,
            table: RuntimeTable::new(events.clone()),
            events,
            files: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            spawn_delay: Mutex::new(Duration::ZERO),
            fail_spawn: AtomicBool::new(false),
            fail_health: AtomicBool::new(false),
            spawn_calls: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
            config: Mutex::new(None),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(backend: BackendType) -> Arc<Self> {
        let mock = Self::new(backend);
        mock.set_failing(true);
        mock
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_spawn.store(failing, Ordering::SeqCst);
    }

    pub fn set_health_failing(&self, failing: bool) {
        self.fail_health.store(failing, Ordering::SeqCst);
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = delay;
    }

    pub fn spawn_calls(&self) -> u32 {
        self.spawn_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Option<ProviderConfig> {
        self.config.lock().unwrap().clone()
    }

    /// Every spawn config received, in call order.
    pub fn spawned(&self) -> Vec<SpawnConfig> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn runtime_count(&self) -> usize {
        self.table.len()
    }

    /// Registers this mock as `backend`'s constructor on `factory`.
    pub fn register(self: &Arc<Self>, factory: &ProviderFactory) {
        let mock = Arc::clone(self);
        factory
            .register_provider(self.backend, move |config| {
                *mock.config.lock().unwrap() = Some(config);
                Ok(Arc::clone(&mock) as Arc<dyn RuntimeProvider>)
            })
            .unwrap();
    }

    fn start(&self) -> Result<AgentRuntime> {
        let id = RuntimeId::generate();
        self.table
            .insert(AgentRuntime::new(id.clone(), self.backend), ())?;
        self.table.transition(&id, RuntimeState::Creating)?;
        self.table.transition(&id, RuntimeState::Running)?;
        Ok(self.table.get(&id).unwrap())
    }
}

#[async_trait]
impl RuntimeProvider for MockProvider {
    fn backend_type(&self) -> BackendType {
        self.backend
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<AgentRuntime> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().unwrap().push(config.clone());
        let delay = *self.spawn_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(Error::Spawn(format!("{} unavailable", self.backend)));
        }
        let mut runtime = self.start()?;
        runtime
            .metadata
            .insert("image".to_string(), config.image.clone());
        Ok(runtime)
    }

    async fn terminate(&self, id: &RuntimeId, force: bool) -> Result<()> {
        if self.table.remove(id).is_none() {
            if force {
                return Ok(());
            }
            return Err(Error::NotFound(format!("runtime {id}")));
        }
        self.events.emit(RuntimeEvent::RuntimeTerminated {
            runtime_id: id.clone(),
        });
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
        _options: ExecOptions,
    ) -> Result<ExecResult> {
        self.table.require_running(id)?;
        Ok(ExecResult {
            exit_code: 0,
            stdout: command.join(" ").into_bytes(),
            stderr: Vec::new(),
            duration_ms: 0,
            metadata: HashMap::new(),
        })
    }

    async fn execute_stream(
        &self,
        id: &RuntimeId,
        command: &[String],
        _options: ExecOptions,
    ) -> Result<ExecStream> {
        self.table.require_running(id)?;
        let (mut sender, stream) = ExecStream::channel();
        let output = command.join(" ").into_bytes();
        tokio::spawn(async move {
            sender.send(ChunkKind::Stdout, output).await;
            sender.exit(0).await;
        });
        Ok(stream)
    }

    async fn execute_interactive(
        &self,
        id: &RuntimeId,
        _command: &[String],
        _options: ExecOptions,
    ) -> Result<InteractiveSession> {
        self.table.require_running(id)?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(8);
        let (mut sender, stream) = ExecStream::channel();
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                sender.send(ChunkKind::Stdout, data).await;
            }
            sender.exit(0).await;
        });
        Ok(InteractiveSession::new(stdin_tx, stream))
    }

    async fn read_file(&self, id: &RuntimeId, path: &str) -> Result<Vec<u8>> {
        self.table.require_running(id)?;
        self.files
            .lock()
            .unwrap()
            .get(&(id.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {path}")))
    }

    async fn write_file(&self, id: &RuntimeId, path: &str, data: &[u8]) -> Result<()> {
        self.table.require_running(id)?;
        self.files
            .lock()
            .unwrap()
            .insert((id.clone(), path.to_string()), data.to_vec());
        Ok(())
    }

    async fn upload_directory(&self, _id: &RuntimeId, _local: &Path, _remote: &str) -> Result<()> {
        Err(Error::Configuration("mock has no directories".to_string()))
    }

    async fn download_directory(
        &self,
        _id: &RuntimeId,
        _remote: &str,
        _local: &Path,
    ) -> Result<()> {
        Err(Error::Configuration("mock has no directories".to_string()))
    }

    async fn snapshot(&self, id: &RuntimeId) -> Result<Snapshot> {
        self.table.require_running(id)?;
        let snapshot = Snapshot {
            id: SnapshotId::generate(),
            runtime_id: id.clone(),
            created_at: chrono::Utc::now(),
            size_bytes: 0,
            metadata: HashMap::new(),
        };
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn restore(&self, snapshot_id: &SnapshotId) -> Result<AgentRuntime> {
        if !self.snapshots.lock().unwrap().contains_key(snapshot_id) {
            return Err(Error::NotFound(format!("snapshot {snapshot_id}")));
        }
        self.start()
    }

    async fn list_snapshots(&self, runtime_id: Option<&RuntimeId>) -> Result<Vec<Snapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|s| runtime_id.map_or(true, |id| &s.runtime_id == id))
            .cloned()
            .collect())
    }

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))
    }

    async fn health_check(&self) -> Result<()> {
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(Error::Spawn(format!("{} health probe failed", self.backend)));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}
