//! # Fallback Orchestrator
//!
//! Puts N backends behind one `spawn_with_fallback()` call.
//!
//! ```text
//!  spawn_with_fallback(config)
//!        │
//!        ▼
//!  ┌──────────────┐  circuit open? skip (not a failover)
//!  │ remote-sandbox│──────────────────────────────┐
//!  └──────┬───────┘                               │
//!         │ failed / attempt timeout              │
//!         ▼                                       ▼
//!  ┌──────────────┐   budget spent after ≥1 failover? stop
//!  │   microvm    │──────────────────────────────┐
//!  └──────┬───────┘                               │
//!         ▼                                       ▼
//!  ┌──────────────┐                        Error::Spawn
//!  │   worktree   │                  (every backend's message)
//!  └──────────────┘
//! ```
//!
//! Each backend has one [`CircuitBreaker`] and one [`ProviderHealth`] record,
//! guarded together by a single mutex. Spawn outcomes and the periodic
//! health probe both update that pair inside one critical section, so the two
//! sources never interleave mid-update.

mod circuit;
mod health;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::ProviderHealth;

use crate::constants::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_FALLBACK_BUDGET, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_HEALTH_CHECK_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::factory::{ConfigScope, ProviderFactory};
use crate::runtime::{
    AgentRuntime, BackendType, EventKind, ExecOptions, ExecResult, ExecStream,
    InteractiveSession, ResourceLimits, RuntimeEvent, RuntimeId, RuntimeProvider, RuntimeState,
    Snapshot, SnapshotId, SpawnConfig,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// =============================================================================
// Configuration & Results
// =============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Backends in preference order.
    pub order: Vec<BackendType>,
    /// Timeout for a single backend attempt.
    pub attempt_timeout: Duration,
    /// Cumulative time after which no further backend is tried, once at
    /// least one failover has happened.
    pub fallback_budget: Duration,
    pub circuit: CircuitBreakerConfig,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Optional static preference per backend, in `[0, 1]`; higher is cheaper.
    pub cost_weights: HashMap<BackendType, f64>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            order: BackendType::ALL.to_vec(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            fallback_budget: DEFAULT_FALLBACK_BUDGET,
            circuit: CircuitBreakerConfig::default(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            cost_weights: HashMap::new(),
        }
    }
}

/// Result of a successful [`FallbackOrchestrator::spawn_with_fallback`].
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub runtime: AgentRuntime,
    pub backend_type: BackendType,
    /// Backends that were attempted and failed before the winning one.
    pub failover_count: u32,
    pub total_time_ms: u64,
}

/// Result of a successful [`FallbackOrchestrator::execute_with_fallback`].
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub backend_type: BackendType,
    pub failover_count: u32,
    pub total_time_ms: u64,
}

/// Notifications for external monitoring.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackEvent {
    SpawnSuccess {
        backend: BackendType,
        runtime_id: RuntimeId,
        duration_ms: u64,
        failover_count: u32,
    },
    SpawnFailure {
        backend: BackendType,
        error: String,
        consecutive_failures: u32,
    },
    ProviderUnhealthy {
        backend: BackendType,
        reason: String,
    },
    ProviderRecovered {
        backend: BackendType,
    },
    /// A provider-reported state change, forwarded.
    StateChange {
        backend: BackendType,
        runtime_id: RuntimeId,
        from: RuntimeState,
        to: RuntimeState,
    },
}

// =============================================================================
// Backend Slot
// =============================================================================

/// Breaker and health record of one backend, always updated together.
#[derive(Debug)]
struct BackendSlot {
    breaker: CircuitBreaker,
    health: ProviderHealth,
}

impl BackendSlot {
    fn sync_circuit(&mut self) {
        self.health.circuit_open = self.breaker.state() != CircuitState::Closed;
        if self.breaker.is_open() {
            self.health.healthy = false;
        }
    }

    /// Records a success. Returns true if the backend was unhealthy before.
    fn on_success(&mut self, latency_ms: Option<f64>) -> bool {
        let was_unhealthy = !self.health.healthy;
        self.breaker.record_success();
        match latency_ms {
            Some(ms) => self.health.record_spawn_success(ms),
            None => self.health.mark_success(),
        }
        self.sync_circuit();
        was_unhealthy
    }

    /// Records a failure. Returns true if the circuit just opened.
    fn on_failure(&mut self, error: &str, counts_as_spawn: bool, now: Instant) -> bool {
        if counts_as_spawn {
            self.health.record_spawn_failure(error);
        } else {
            self.health.mark_failure(error);
        }
        let opened = self.breaker.record_failure(now);
        self.sync_circuit();
        opened
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// =============================================================================
// Orchestrator
// =============================================================================

type OwnerMap = Arc<RwLock<HashMap<RuntimeId, BackendType>>>;

/// Circuit-breaking fallback across registered backends.
///
/// Providers are fetched as the factory's unscoped singletons. Team and
/// agent configuration layers are resolved per spawn and applied to the
/// spawn's resource limits.
pub struct FallbackOrchestrator {
    factory: Arc<ProviderFactory>,
    config: FallbackConfig,
    slots: HashMap<BackendType, Mutex<BackendSlot>>,
    /// Which backend owns each runtime spawned through this orchestrator.
    owners: OwnerMap,
    snapshot_owners: RwLock<HashMap<SnapshotId, BackendType>>,
    events: broadcast::Sender<FallbackEvent>,
    forwarders: Mutex<HashMap<BackendType, Vec<JoinHandle<()>>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackOrchestrator {
    /// Creates an orchestrator over the backends in `config.order`.
    ///
    /// Health records for every listed backend are created here and live as
    /// long as the orchestrator.
    #[must_use]
    pub fn new(factory: Arc<ProviderFactory>, config: FallbackConfig) -> Self {
        let slots = config
            .order
            .iter()
            .map(|backend| {
                let slot = BackendSlot {
                    breaker: CircuitBreaker::new(config.circuit),
                    health: ProviderHealth::default(),
                };
                (*backend, Mutex::new(slot))
            })
            .collect();
        let (events, _) = broadcast::channel(crate::constants::EVENT_CHANNEL_CAPACITY);

        Self {
            factory,
            config,
            slots,
            owners: Arc::new(RwLock::new(HashMap::new())),
            snapshot_owners: RwLock::new(HashMap::new()),
            events,
            forwarders: Mutex::new(HashMap::new()),
            health_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<ProviderFactory> {
        &self.factory
    }

    #[must_use]
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Subscribes to orchestrator events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FallbackEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FallbackEvent) {
        let _ = self.events.send(event);
    }

    fn slot(&self, backend: BackendType) -> Option<MutexGuard<'_, BackendSlot>> {
        self.slots
            .get(&backend)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Backend order for a spawn.
    ///
    /// An explicit backend or a team policy moves that backend to the front;
    /// the rest of the configured order follows as fallbacks.
    #[must_use]
    pub fn chain_for(&self, config: &SpawnConfig) -> Vec<BackendType> {
        let preferred = config.backend.or_else(|| {
            config
                .team_id
                .as_deref()
                .and_then(|team| self.factory.team_policy(team))
        });
        let mut chain = self.config.order.clone();
        if let Some(preferred) = preferred {
            chain.retain(|b| *b != preferred);
            chain.insert(0, preferred);
        }
        chain
    }

    /// The backend's shared provider, built from the unscoped configuration.
    fn provider(&self, backend: BackendType) -> Result<Arc<dyn RuntimeProvider>> {
        let provider = self.factory.get_provider(backend, &ConfigScope::default())?;
        self.ensure_forwarder(backend, &provider);
        Ok(provider)
    }

    /// Relays a provider's state changes onto the orchestrator's event stream
    /// and forgets runtimes the provider reports as terminated.
    fn ensure_forwarder(&self, backend: BackendType, provider: &Arc<dyn RuntimeProvider>) {
        let mut forwarders = self.forwarders.lock().unwrap_or_else(PoisonError::into_inner);
        if forwarders
            .get(&backend)
            .is_some_and(|handles| handles.iter().all(|h| !h.is_finished()))
        {
            return;
        }
        if let Some(stale) = forwarders.remove(&backend) {
            stale.iter().for_each(JoinHandle::abort);
        }

        let events = self.events.clone();
        let state_changes = provider.on(
            EventKind::StateChange,
            Box::new(move |event| {
                if let RuntimeEvent::StateChange {
                    runtime_id,
                    from,
                    to,
                } = event
                {
                    let _ = events.send(FallbackEvent::StateChange {
                        backend,
                        runtime_id,
                        from,
                        to,
                    });
                }
            }),
        );
        let owners = Arc::clone(&self.owners);
        let terminations = provider.on(
            EventKind::RuntimeTerminated,
            Box::new(move |event| {
                if let RuntimeEvent::RuntimeTerminated { runtime_id } = event {
                    let removed = owners
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&runtime_id);
                    if removed.is_some() {
                        tracing::debug!(runtime = %runtime_id, %backend, "terminated runtime forgotten");
                    }
                }
            }),
        );
        forwarders.insert(backend, vec![state_changes, terminations]);
    }

    /// Applies the team and agent layers resolved for `backend` to a spawn.
    ///
    /// Limits set explicitly by the caller win over layered ones.
    fn scoped_spawn(
        &self,
        backend: BackendType,
        config: &SpawnConfig,
        scope: &ConfigScope,
    ) -> Result<SpawnConfig> {
        let mut spawn = config.clone();
        if spawn.resources == ResourceLimits::default() {
            spawn.resources = self.factory.resolve_config(backend, scope).resource_limits()?;
            tracing::trace!(
                %backend,
                team = ?scope.team_id,
                agent = ?scope.agent_id,
                cpu = spawn.resources.cpu,
                memory = %spawn.resources.memory,
                "resolved scoped resources"
            );
        }
        Ok(spawn)
    }

    // =========================================================================
    // Fallback Chain
    // =========================================================================

    /// Spawns a runtime on the first backend that succeeds.
    ///
    /// # Errors
    ///
    /// - `Configuration` if `config` is invalid (no backend is tried)
    /// - `Spawn` aggregating every backend's failure once the chain is
    ///   exhausted, skipped, or out of budget
    pub async fn spawn_with_fallback(&self, config: &SpawnConfig) -> Result<SpawnOutcome> {
        config.validate()?;
        let chain = self.chain_for(config);
        let scope = &ConfigScope::from(config);

        let outcome = self
            .run_chain(&chain, true, |provider| async move {
                let spawn = self.scoped_spawn(provider.backend_type(), config, scope)?;
                provider.spawn(&spawn).await
            })
            .await?;

        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(outcome.value.id.clone(), outcome.backend_type);

        self.emit(FallbackEvent::SpawnSuccess {
            backend: outcome.backend_type,
            runtime_id: outcome.value.id.clone(),
            duration_ms: outcome.total_time_ms,
            failover_count: outcome.failover_count,
        });
        tracing::info!(
            runtime = %outcome.value.id,
            backend = %outcome.backend_type,
            failover_count = outcome.failover_count,
            total_ms = outcome.total_time_ms,
            "spawned runtime"
        );

        Ok(SpawnOutcome {
            runtime: outcome.value,
            backend_type: outcome.backend_type,
            failover_count: outcome.failover_count,
            total_time_ms: outcome.total_time_ms,
        })
    }

    /// Runs an arbitrary provider operation through the fallback chain.
    ///
    /// Uses the configured order, the same circuit breakers, per-attempt
    /// timeout and budget as spawning. Latency is not folded into the spawn
    /// average.
    pub async fn execute_with_fallback<T, F, Fut>(&self, op: F) -> Result<FallbackOutcome<T>>
    where
        F: Fn(Arc<dyn RuntimeProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let chain = self.config.order.clone();
        self.run_chain(&chain, false, op).await
    }

    async fn run_chain<T, F, Fut>(
        &self,
        chain: &[BackendType],
        is_spawn: bool,
        op: F,
    ) -> Result<FallbackOutcome<T>>
    where
        F: Fn(Arc<dyn RuntimeProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut failover_count: u32 = 0;
        let mut failures: Vec<String> = Vec::new();

        for &backend in chain {
            if failover_count > 0 && started.elapsed() > self.config.fallback_budget {
                tracing::warn!(
                    %backend,
                    budget = ?self.config.fallback_budget,
                    "fallback budget exhausted, not trying remaining backends"
                );
                failures.push(format!(
                    "{backend}: not attempted, fallback budget of {:?} exhausted",
                    self.config.fallback_budget
                ));
                break;
            }

            let admitted = match self.slot(backend) {
                Some(mut slot) => slot.breaker.try_acquire(Instant::now()),
                None => {
                    failures.push(format!("{backend}: not configured in fallback order"));
                    continue;
                }
            };
            if !admitted {
                tracing::debug!(%backend, "circuit open, skipping backend");
                failures.push(format!("{backend}: circuit open"));
                continue;
            }

            let attempt_started = Instant::now();
            let result = match self.provider(backend) {
                Ok(provider) => {
                    match tokio::time::timeout(self.config.attempt_timeout, op(provider)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(
                            format!("{backend} attempt"),
                            self.config.attempt_timeout,
                        )),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    #[allow(clippy::cast_precision_loss)]
                    let latency = elapsed_ms(attempt_started) as f64;
                    let recovered = self
                        .slot(backend)
                        .map(|mut slot| slot.on_success(is_spawn.then_some(latency)))
                        .unwrap_or(false);
                    if recovered {
                        self.emit(FallbackEvent::ProviderRecovered { backend });
                    }
                    return Ok(FallbackOutcome {
                        value,
                        backend_type: backend,
                        failover_count,
                        total_time_ms: elapsed_ms(started),
                    });
                }
                Err(e) => {
                    failover_count += 1;
                    let message = e.to_string();
                    tracing::warn!(%backend, error = %message, retryable = e.is_retryable(), "backend attempt failed");
                    self.record_failure(backend, &message, is_spawn);
                    failures.push(format!("{backend}: {message}"));
                }
            }
        }

        Err(Error::Spawn(format!(
            "all backends failed ({} attempted in {} ms): {}",
            failover_count,
            elapsed_ms(started),
            if failures.is_empty() {
                "no backends configured".to_string()
            } else {
                failures.join("; ")
            }
        )))
    }

    fn record_failure(&self, backend: BackendType, message: &str, is_spawn: bool) {
        let Some((opened, consecutive)) = self.slot(backend).map(|mut slot| {
            let opened = slot.on_failure(message, is_spawn, Instant::now());
            (opened, slot.health.consecutive_failures)
        }) else {
            return;
        };

        if is_spawn {
            self.emit(FallbackEvent::SpawnFailure {
                backend,
                error: message.to_string(),
                consecutive_failures: consecutive,
            });
        }
        if opened {
            tracing::warn!(%backend, consecutive, "circuit opened");
            self.emit(FallbackEvent::ProviderUnhealthy {
                backend,
                reason: message.to_string(),
            });
        }
    }

    // =========================================================================
    // Health & Selection
    // =========================================================================

    /// Highest-scoring registered backend whose circuit currently admits
    /// requests.
    ///
    /// Ties go to the backend earlier in the configured order.
    #[must_use]
    pub fn get_best_provider(&self) -> Option<BackendType> {
        let now = Instant::now();
        let mut best: Option<(BackendType, f64)> = None;
        for &backend in &self.config.order {
            if !self.factory.is_registered(backend) {
                continue;
            }
            let Some(slot) = self.slot(backend) else {
                continue;
            };
            if !slot.breaker.allows(now) {
                continue;
            }
            let score = slot
                .health
                .score(self.config.cost_weights.get(&backend).copied());
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((backend, score));
            }
        }
        best.map(|(backend, _)| backend)
    }

    #[must_use]
    pub fn get_provider_health(&self, backend: BackendType) -> Option<ProviderHealth> {
        self.slot(backend).map(|slot| slot.health.clone())
    }

    #[must_use]
    pub fn get_all_health(&self) -> HashMap<BackendType, ProviderHealth> {
        self.config
            .order
            .iter()
            .filter_map(|b| self.get_provider_health(*b).map(|h| (*b, h)))
            .collect()
    }

    #[must_use]
    pub fn circuit_state(&self, backend: BackendType) -> Option<CircuitState> {
        self.slot(backend).map(|slot| slot.breaker.state())
    }

    /// Marks a backend unhealthy and opens its circuit immediately.
    pub fn mark_provider_unhealthy(&self, backend: BackendType, reason: &str) {
        let Some(mut slot) = self.slot(backend) else {
            return;
        };
        slot.breaker.trip(Instant::now());
        slot.health.healthy = false;
        slot.health.last_error = Some(reason.to_string());
        slot.sync_circuit();
        drop(slot);

        tracing::warn!(%backend, reason, "provider marked unhealthy");
        self.emit(FallbackEvent::ProviderUnhealthy {
            backend,
            reason: reason.to_string(),
        });
    }

    /// Closes a backend's circuit and clears its failure count.
    pub fn reset_circuit_breaker(&self, backend: BackendType) {
        let Some(mut slot) = self.slot(backend) else {
            return;
        };
        slot.breaker.reset();
        slot.health.healthy = true;
        slot.health.consecutive_failures = 0;
        slot.sync_circuit();
        tracing::info!(%backend, "circuit breaker reset");
    }

    /// Probes every backend once.
    ///
    /// Success clears unhealthy status and, once the reset timeout allows a
    /// probe, closes an open circuit. Failure feeds the breaker. Backends
    /// without a registered constructor are skipped.
    pub async fn run_health_checks(&self) -> HashMap<BackendType, bool> {
        let mut results = HashMap::new();
        for &backend in &self.config.order {
            if !self.factory.is_registered(backend) {
                continue;
            }
            let outcome = match self.provider(backend) {
                Ok(provider) => {
                    match tokio::time::timeout(
                        self.config.health_check_timeout,
                        provider.health_check(),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(
                            format!("{backend} health check"),
                            self.config.health_check_timeout,
                        )),
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    let recovered = self.slot(backend).is_some_and(|mut slot| {
                        let was_unhealthy = !slot.health.healthy;
                        if slot.breaker.state() != CircuitState::Closed
                            && slot.breaker.try_acquire(Instant::now())
                        {
                            slot.breaker.record_success();
                        }
                        if slot.breaker.state() == CircuitState::Closed {
                            slot.health.mark_success();
                        } else {
                            slot.health.last_checked = Some(chrono::Utc::now());
                        }
                        slot.sync_circuit();
                        was_unhealthy && slot.health.healthy
                    });
                    if recovered {
                        tracing::info!(%backend, "provider recovered");
                        self.emit(FallbackEvent::ProviderRecovered { backend });
                    }
                    results.insert(backend, true);
                }
                Err(e) => {
                    tracing::debug!(%backend, error = %e, "health check failed");
                    self.record_failure(backend, &e.to_string(), false);
                    results.insert(backend, false);
                }
            }
        }
        results
    }

    /// Starts the periodic health check task.
    ///
    /// The task holds only a weak reference and ends when the orchestrator
    /// is dropped or [`Self::stop_health_checks`] is called.
    pub fn start_health_checks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.run_health_checks().await;
            }
        });

        let mut task = self.health_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        tracing::debug!(?interval, "health checks started");
    }

    pub fn stop_health_checks(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Stops background tasks and forgets routing state.
    pub fn shutdown(&self) {
        self.stop_health_checks();
        for (_, handles) in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            handles.iter().for_each(JoinHandle::abort);
        }
        self.owners.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.snapshot_owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // =========================================================================
    // Pass-through Operations
    // =========================================================================

    /// Backend that owns a runtime spawned through this orchestrator.
    #[must_use]
    pub fn backend_of(&self, id: &RuntimeId) -> Option<BackendType> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    fn owner_provider(&self, id: &RuntimeId) -> Result<Arc<dyn RuntimeProvider>> {
        let backend = self
            .backend_of(id)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))?;
        self.provider(backend)
    }

    pub async fn status(&self, id: &RuntimeId) -> Result<AgentRuntime> {
        self.owner_provider(id)?.status(id).await
    }

    /// Terminates a runtime on its owning backend.
    ///
    /// With `force`, unknown ids succeed.
    pub async fn terminate(&self, id: &RuntimeId, force: bool) -> Result<()> {
        let provider = match self.owner_provider(id) {
            Ok(p) => p,
            Err(Error::NotFound(_)) if force => return Ok(()),
            Err(e) => return Err(e),
        };
        provider.terminate(id, force).await?;
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    pub async fn execute(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult> {
        self.owner_provider(id)?.execute(id, command, options).await
    }

    pub async fn execute_stream(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecStream> {
        self.owner_provider(id)?
            .execute_stream(id, command, options)
            .await
    }

    pub async fn execute_interactive(
        &self,
        id: &RuntimeId,
        command: &[String],
        options: ExecOptions,
    ) -> Result<InteractiveSession> {
        self.owner_provider(id)?
            .execute_interactive(id, command, options)
            .await
    }

    pub async fn read_file(&self, id: &RuntimeId, path: &str) -> Result<Vec<u8>> {
        self.owner_provider(id)?.read_file(id, path).await
    }

    pub async fn write_file(&self, id: &RuntimeId, path: &str, data: &[u8]) -> Result<()> {
        self.owner_provider(id)?.write_file(id, path, data).await
    }

    pub async fn upload_directory(&self, id: &RuntimeId, local: &Path, remote: &str) -> Result<()> {
        self.owner_provider(id)?
            .upload_directory(id, local, remote)
            .await
    }

    pub async fn download_directory(
        &self,
        id: &RuntimeId,
        remote: &str,
        local: &Path,
    ) -> Result<()> {
        self.owner_provider(id)?
            .download_directory(id, remote, local)
            .await
    }

    pub async fn snapshot(&self, id: &RuntimeId) -> Result<Snapshot> {
        let backend = self
            .backend_of(id)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))?;
        let snapshot = self.owner_provider(id)?.snapshot(id).await?;
        self.snapshot_owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.id.clone(), backend);
        Ok(snapshot)
    }

    fn snapshot_backend(&self, snapshot_id: &SnapshotId) -> Result<BackendType> {
        self.snapshot_owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))
    }

    /// Drops a snapshot route once its backend no longer knows the snapshot.
    fn forget_missing_snapshot<T>(&self, snapshot_id: &SnapshotId, result: Result<T>) -> Result<T> {
        if let Err(Error::NotFound(_)) = &result {
            self.snapshot_owners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(snapshot_id);
        }
        result
    }

    /// Restores a snapshot on the backend that took it, under a new id.
    pub async fn restore(&self, snapshot_id: &SnapshotId) -> Result<AgentRuntime> {
        let backend = self.snapshot_backend(snapshot_id)?;
        let restored = self.provider(backend)?.restore(snapshot_id).await;
        let runtime = self.forget_missing_snapshot(snapshot_id, restored)?;
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(runtime.id.clone(), backend);
        Ok(runtime)
    }

    pub async fn list_snapshots(&self, id: &RuntimeId) -> Result<Vec<Snapshot>> {
        self.owner_provider(id)?.list_snapshots(Some(id)).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        let backend = self.snapshot_backend(snapshot_id)?;
        let deleted = self.provider(backend)?.delete_snapshot(snapshot_id).await;
        self.forget_missing_snapshot(snapshot_id, deleted)?;
        self.snapshot_owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(snapshot_id);
        Ok(())
    }
}

impl Drop for FallbackOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FallbackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("order", &self.config.order)
            .finish_non_exhaustive()
    }
}
