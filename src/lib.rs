//! # agent-runtime-orchestrator
//!
//! **Runtime Provider Abstraction with Circuit-Breaking Fallback**
//!
//! This crate gives agents an isolated place to run code without caring
//! which isolation backend provides it. Callers ask for a runtime by
//! capability; the orchestrator picks a backend, fails over when one is
//! unhealthy, and hands back a handle that every later operation routes
//! through.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      FallbackOrchestrator                           │
//! │  spawn_with_fallback ─▶ chain (policy order) ─▶ first success wins  │
//! │  per-backend circuit breaker + health score │ periodic probes       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        ProviderFactory                              │
//! │  constructor registry │ layered config (base ◀ team ◀ agent)        │
//! │  one cached provider per backend │ team backend policies            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                     RuntimeProvider Trait                           │
//! │  spawn → execute / stream / interactive → snapshot → terminate     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐   │
//! │  │  RemoteSandbox   │  │   MicroVmProvider│  │ WorktreeProvider │   │
//! │  │ (caller-supplied)│  │  pods on a VM    │  │  host directory  │   │
//! │  │                  │  │  runtime class   │  │  + host process  │   │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Runtime Lifecycle
//!
//! ```text
//!   ┌─────────┐        ┌──────────┐        ┌─────────┐
//!   │ Pending │ ─────▶ │ Creating │ ─────▶ │ Running │ ◀──▶ Paused
//!   └─────────┘        └──────────┘        └────┬────┘
//!        │                  │                   │
//!        └───────── Error ◀─┴───────────────────┤
//!                                               ▼
//!                     Terminated ◀────── Terminating
//! ```
//!
//! `Terminated` and `Error` are terminal: no operation moves a runtime out
//! of them.
//!
//! # Security Properties
//!
//! - **Path Traversal Protection**: archives received from a runtime and
//!   worktree file paths are rejected if they climb out of their root.
//! - **Size Limits**: single transfers are bounded by
//!   `MAX_FILE_TRANSFER_SIZE` (64 MiB).
//! - **Timeouts**: every cluster call, spawn, fallback attempt and command
//!   carries a deadline.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_runtime_orchestrator::{
//!     BackendType, ConfigLayers, FallbackConfig, FallbackOrchestrator, ProviderFactory,
//!     SpawnConfig, WorktreeProvider,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> agent_runtime_orchestrator::Result<()> {
//!     let factory = Arc::new(ProviderFactory::new(ConfigLayers::from_env()));
//!     factory.register_provider(BackendType::Worktree, WorktreeProvider::constructor())?;
//!
//!     let orchestrator = FallbackOrchestrator::new(factory, FallbackConfig::default());
//!     let outcome = orchestrator.spawn_with_fallback(&SpawnConfig::new("agent:latest")).await?;
//!     let result = orchestrator
//!         .execute(&outcome.runtime.id, &["echo".into(), "hi".into()], Default::default())
//!         .await?;
//!     println!("{}", result.stdout_lossy());
//!     orchestrator.terminate(&outcome.runtime.id, false).await
//! }
//! ```

pub mod constants;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod logging;
pub mod providers;
pub mod runtime;

// Re-exports
pub use constants::*;
pub use error::{Error, ErrorKind, Result};
pub use factory::{ConfigLayers, ConfigScope, ProviderConfig, ProviderFactory, SelectionOptions};
pub use fallback::{
    CircuitBreakerConfig, CircuitState, FallbackConfig, FallbackEvent, FallbackOrchestrator,
    ProviderHealth, SpawnOutcome,
};
pub use logging::init_tracing;
pub use providers::{MicroVmConfig, MicroVmProvider, WorktreeConfig, WorktreeProvider};
pub use runtime::{
    AgentRuntime, BackendType, ExecOptions, ExecResult, ExecStream, InteractiveSession,
    ResourceLimits, RuntimeEvent, RuntimeId, RuntimeProvider, RuntimeState, Snapshot,
    SnapshotId, SpawnConfig,
};
