//! Concrete runtime providers.
//!
//! | Provider | Isolation | Needs |
//! |----------|-----------|-------|
//! | [`MicroVmProvider`] | guest kernel per runtime | a [`microvm::ClusterApi`] implementation |
//! | [`WorktreeProvider`] | host process, own directory | a writable base directory |
//!
//! No remote sandbox client ships here; register a constructor for
//! [`BackendType::RemoteSandbox`](crate::runtime::BackendType::RemoteSandbox)
//! on the factory to use one.

pub mod microvm;
pub mod worktree;

pub use microvm::{MicroVmConfig, MicroVmProvider};
pub use worktree::{WorktreeConfig, WorktreeProvider};
