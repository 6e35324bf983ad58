//! # Orchestration Constants
//!
//! Default timeouts, thresholds and naming conventions for the runtime
//! orchestration layer. Every configurable value in [`crate::factory`],
//! [`crate::fallback`] and [`crate::providers`] falls back to a constant
//! defined here.
//!
//! ## Cross-References
//!
//! - [`crate::fallback`]: circuit breaker thresholds and fallback budgets
//! - [`crate::providers::microvm`]: spawn/exec timeouts, labels, runtime class
//! - [`crate::factory`]: environment variable prefix

use std::time::Duration;

// =============================================================================
// Spawn & Exec Timeouts
// =============================================================================
//
// Every blocking external call carries an explicit timeout. The per-attempt
// fallback timeout must stay below the provider spawn timeout.
// =============================================================================

/// Default time a provider waits for a runtime to reach `running`.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Default command timeout for `execute` calls.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for a single cluster API call.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness polls while a workload is starting.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between status polls in `wait_for_state`.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period requested when deleting a workload without `force`.
pub const DEFAULT_GRACE_PERIOD_SECS: u32 = 30;

// =============================================================================
// Fallback & Circuit Breaker
// =============================================================================

/// Consecutive failures that open a backend's circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Time an open circuit waits before allowing a half-open probe.
pub const DEFAULT_CIRCUIT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt timeout inside the fallback chain.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cumulative time budget for the whole fallback chain.
pub const DEFAULT_FALLBACK_BUDGET: Duration = Duration::from_secs(60);

/// Interval of the background health probe.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout applied to a single health probe.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn latency that scores zero on the speed axis of `get_best_provider`.
pub const SPEED_SCORE_CEILING_MS: f64 = 10_000.0;

// =============================================================================
// MicroVM Workloads
// =============================================================================

/// Runtime class selecting the VM-isolated container runtime.
pub const MICROVM_RUNTIME_CLASS: &str = "kata";

/// Default namespace for agent workloads.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default agent image.
pub const DEFAULT_IMAGE: &str = "agent-runtime/agent:latest";

/// Label marking workloads owned by this layer (watch selector key).
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "agent-runtime-orchestrator";

/// Label carrying the runtime id.
pub const RUNTIME_ID_LABEL: &str = "agent-runtime/id";

/// Annotation carrying the checkpoint a pod was restored from.
pub const RESTORED_FROM_ANNOTATION: &str = "agent-runtime/restored-from";

/// Name of the agent container inside each pod.
pub const AGENT_CONTAINER_NAME: &str = "agent";

/// Working directory mounted in every agent container.
pub const WORKSPACE_PATH: &str = "/workspace";

/// Maximum Kubernetes object name length (DNS-1123 label).
pub const MAX_POD_NAME_LEN: usize = 63;

/// Initial delay before reconnecting a dropped watch.
pub const WATCH_RECONNECT_INITIAL: Duration = Duration::from_millis(500);

/// Maximum delay between watch reconnect attempts.
pub const WATCH_RECONNECT_MAX: Duration = Duration::from_secs(30);

// =============================================================================
// Streaming & Events
// =============================================================================

/// Buffered chunks per exec stream before backpressure applies.
pub const EXEC_STREAM_CAPACITY: usize = 256;

/// Capacity of each provider's event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum bytes read into memory by `read_file`.
pub const MAX_FILE_TRANSFER_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Prefix of environment variables consumed by the provider factory.
pub const ENV_PREFIX: &str = "AGENT_RUNTIME";
