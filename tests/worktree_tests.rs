//! Tests for the worktree provider.
//!
//! Runs real host processes inside temporary directories.

use agent_runtime_orchestrator::factory::{ConfigLayers, ConfigScope, ProviderFactory};
use agent_runtime_orchestrator::fallback::{CircuitState, FallbackConfig, FallbackOrchestrator};
use agent_runtime_orchestrator::providers::microvm::InMemoryCluster;
use agent_runtime_orchestrator::providers::{MicroVmProvider, WorktreeConfig, WorktreeProvider};
use agent_runtime_orchestrator::runtime::{
    argv, BackendType, ChunkKind, ExecOptions, ResourceLimits, RuntimeEvent, RuntimeProvider,
    RuntimeState, SpawnConfig, VolumeMount, VolumeSource,
};
use agent_runtime_orchestrator::{Error, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn provider() -> (TempDir, WorktreeProvider) {
    let dir = tempfile::tempdir().unwrap();
    let provider = WorktreeProvider::new(WorktreeConfig::new(dir.path()));
    (dir, provider)
}

fn spawn_config() -> SpawnConfig {
    SpawnConfig::new("local")
}

fn sh(script: &str) -> Vec<String> {
    argv(["sh", "-c", script])
}

fn root(runtime: &agent_runtime_orchestrator::AgentRuntime) -> PathBuf {
    PathBuf::from(&runtime.metadata["path"])
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_spawn_creates_directory() {
    let (dir, provider) = provider();
    let mut events = provider.events().subscribe();

    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    assert_eq!(runtime.state, RuntimeState::Running);
    assert_eq!(runtime.backend_type, BackendType::Worktree);
    assert!(root(&runtime).is_dir());
    assert!(root(&runtime).starts_with(dir.path()));

    let mut created = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RuntimeEvent::RuntimeCreated { .. }) {
            created = true;
        }
    }
    assert!(created);
}

#[tokio::test]
async fn test_spawn_creates_empty_dir_volumes() {
    let (_dir, provider) = provider();
    let spawn = spawn_config().with_volume(VolumeMount {
        name: "cache".to_string(),
        mount_path: "/workspace/.cache".to_string(),
        read_only: false,
        source: VolumeSource::EmptyDir,
    });

    let runtime = provider.spawn(&spawn).await.unwrap();
    assert!(root(&runtime).join(".cache").is_dir());
}

#[tokio::test]
async fn test_spawn_rejects_invalid_config() {
    let (dir, provider) = provider();

    let err = provider.spawn(&SpawnConfig::new("")).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(!dir.path().join("runtimes").exists());
}

#[tokio::test]
async fn test_max_agents_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let provider = WorktreeProvider::new(WorktreeConfig {
        max_agents: Some(1),
        ..WorktreeConfig::new(dir.path())
    });
    let first = provider.spawn(&spawn_config()).await.unwrap();

    let err = provider.spawn(&spawn_config()).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(provider.list_runtimes().await.unwrap().len(), 1);
    assert_eq!(std::fs::read_dir(root(&first).parent().unwrap()).unwrap().count(), 1);

    provider.terminate(&first.id, false).await.unwrap();
    provider.spawn(&spawn_config()).await.unwrap();
}

#[tokio::test]
async fn test_spawn_resources_carry_agent_limit() {
    let (_dir, provider) = provider();
    let spawn = spawn_config().with_resources(ResourceLimits {
        max_agents: Some(1),
        ..ResourceLimits::default()
    });

    provider.spawn(&spawn).await.unwrap();
    assert!(matches!(
        provider.spawn(&spawn).await,
        Err(Error::ResourceExhausted(_))
    ));
    // Unlimited spawns are not counted against another spawn's limit.
    provider.spawn(&spawn_config()).await.unwrap();
}

#[tokio::test]
async fn test_terminate_removes_directory() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    let path = root(&runtime);

    provider.terminate(&runtime.id, false).await.unwrap();

    assert!(!path.exists());
    assert!(provider.list_runtimes().await.unwrap().is_empty());
    provider.terminate(&runtime.id, true).await.unwrap();
    assert!(matches!(
        provider.terminate(&runtime.id, false).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_health_check_creates_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("nested/base");
    let provider = WorktreeProvider::new(WorktreeConfig::new(&base));

    provider.health_check().await.unwrap();
    assert!(base.join("runtimes").is_dir());
}

// =============================================================================
// Exec Tests
// =============================================================================

#[tokio::test]
async fn test_execute_runs_in_worktree() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config().with_env("TEAM", "alpha")).await.unwrap();

    let result = provider
        .execute(&runtime.id, &sh("echo hi; echo oops >&2"), ExecOptions::default())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.stdout_lossy(), "hi\n");
    assert_eq!(result.stderr_lossy(), "oops\n");

    let pwd = provider
        .execute(&runtime.id, &argv(["pwd"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(PathBuf::from(pwd.stdout_lossy().trim()), root(&runtime));

    let env = provider
        .execute(&runtime.id, &sh("echo $TEAM $AGENT_RUNTIME_ID"), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(
        env.stdout_lossy().trim(),
        format!("alpha {}", runtime.id)
    );

    let status = provider.status(&runtime.id).await.unwrap();
    assert_eq!(status.resource_usage.exec_count, 3);
}

#[tokio::test]
async fn test_execute_options() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    provider
        .write_file(&runtime.id, "sub/marker", b"x")
        .await
        .unwrap();

    let options = ExecOptions {
        env: vec![("GREETING".to_string(), "hello".to_string())],
        ..ExecOptions::default().with_working_dir("sub")
    };
    let result = provider
        .execute(&runtime.id, &sh("echo $GREETING; ls"), options)
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "hello\nmarker\n");

    let piped = provider
        .execute(&runtime.id, &argv(["cat"]), ExecOptions::default().with_stdin("fed"))
        .await
        .unwrap();
    assert_eq!(piped.stdout_lossy(), "fed");
}

#[tokio::test]
async fn test_execute_exit_codes() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let result = provider
        .execute(&runtime.id, &sh("exit 7"), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert!(!result.is_success());

    let err = provider
        .execute(&runtime.id, &argv(["definitely-not-a-binary"]), ExecOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_execute_timeout() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let err = provider
        .execute(
            &runtime.id,
            &argv(["sleep", "5"]),
            ExecOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_execute_requires_running_runtime() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    provider.terminate(&runtime.id, false).await.unwrap();

    assert!(matches!(
        provider
            .execute(&runtime.id, &argv(["true"]), ExecOptions::default())
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_execute_stream() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let mut stream = provider
        .execute_stream(&runtime.id, &sh("echo one; echo two"), ExecOptions::default())
        .await
        .unwrap();

    let mut stdout = Vec::new();
    let mut exit = None;
    let mut last_sequence = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        if let Some(previous) = last_sequence {
            assert!(chunk.sequence > previous);
        }
        last_sequence = Some(chunk.sequence);
        match chunk.kind {
            ChunkKind::Stdout => stdout.extend_from_slice(&chunk.data),
            ChunkKind::Exit => exit = chunk.exit_code(),
            ChunkKind::Stderr => {}
        }
    }
    assert_eq!(stdout, b"one\ntwo\n");
    assert_eq!(exit, Some(0));
}

#[tokio::test]
async fn test_interactive_session() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let mut session = provider
        .execute_interactive(&runtime.id, &argv(["cat"]), ExecOptions::default())
        .await
        .unwrap();
    session.write("first\n").await.unwrap();
    let echoed = session.output.next().await.unwrap().unwrap();
    assert_eq!(echoed.data, b"first\n");

    session.write("second\n").await.unwrap();
    let result = session.finish().await.unwrap();
    assert_eq!(result.stdout_lossy(), "second\n");
    assert_eq!(result.exit_code, 0);
}

// =============================================================================
// File Transfer Tests
// =============================================================================

#[tokio::test]
async fn test_file_round_trip() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    provider
        .write_file(&runtime.id, "/workspace/notes/todo.txt", b"ship it")
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(root(&runtime).join("notes/todo.txt")).unwrap(),
        b"ship it"
    );
    assert_eq!(
        provider.read_file(&runtime.id, "notes/todo.txt").await.unwrap(),
        b"ship it"
    );
    assert!(matches!(
        provider.read_file(&runtime.id, "missing").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let (dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    for path in ["../escape.txt", "notes/../../escape.txt", "/workspace/../escape.txt"] {
        let err = provider
            .write_file(&runtime.id, path, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }), "{path}");
    }
    assert!(!dir.path().join("runtimes/escape.txt").exists());
    assert!(matches!(
        provider.read_file(&runtime.id, "../../etc/passwd").await,
        Err(Error::PathTraversal { .. })
    ));
}

#[tokio::test]
async fn test_workspace_prefix_matches_whole_component() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    provider
        .write_file(&runtime.id, "/workspacefoo/x.txt", b"x")
        .await
        .unwrap();
    assert!(root(&runtime).join("workspacefoo/x.txt").is_file());
    assert!(!root(&runtime).join("foo/x.txt").exists());
}

#[tokio::test]
async fn test_write_size_limit() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let data = vec![0u8; agent_runtime_orchestrator::MAX_FILE_TRANSFER_SIZE + 1];
    let err = provider
        .write_file(&runtime.id, "big.bin", &data)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn test_directory_transfer() {
    let (_dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("a/b")).unwrap();
    std::fs::write(src.path().join("top.txt"), b"top").unwrap();
    std::fs::write(src.path().join("a/b/deep.txt"), b"deep").unwrap();

    provider
        .upload_directory(&runtime.id, src.path(), "project")
        .await
        .unwrap();
    assert_eq!(
        provider
            .read_file(&runtime.id, "project/a/b/deep.txt")
            .await
            .unwrap(),
        b"deep"
    );

    let dest = tempfile::tempdir().unwrap();
    let out = dest.path().join("copy");
    provider
        .download_directory(&runtime.id, "project", &out)
        .await
        .unwrap();
    assert_eq!(std::fs::read(out.join("top.txt")).unwrap(), b"top");
    assert_eq!(std::fs::read(out.join("a/b/deep.txt")).unwrap(), b"deep");

    assert!(matches!(
        provider
            .download_directory(&runtime.id, "nope", &out)
            .await,
        Err(Error::NotFound(_))
    ));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_and_restore() {
    let (_dir, provider) = provider();
    let original = provider.spawn(&spawn_config()).await.unwrap();
    provider
        .write_file(&original.id, "progress.txt", b"step 1")
        .await
        .unwrap();

    let snapshot = provider.snapshot(&original.id).await.unwrap();
    assert_eq!(snapshot.runtime_id, original.id);
    assert_eq!(snapshot.size_bytes, 6);

    provider
        .write_file(&original.id, "progress.txt", b"step 2")
        .await
        .unwrap();

    let restored = provider.restore(&snapshot.id).await.unwrap();
    assert_ne!(restored.id, original.id);
    assert_eq!(
        restored.metadata.get("restoredFrom"),
        Some(&snapshot.id.to_string())
    );
    assert_eq!(
        provider.read_file(&restored.id, "progress.txt").await.unwrap(),
        b"step 1"
    );
    assert_eq!(
        provider.read_file(&original.id, "progress.txt").await.unwrap(),
        b"step 2"
    );

    // Snapshots outlive their runtime.
    provider.terminate(&original.id, false).await.unwrap();
    assert_eq!(provider.list_snapshots(None).await.unwrap().len(), 1);
    let again = provider.restore(&snapshot.id).await.unwrap();
    assert_eq!(
        provider.read_file(&again.id, "progress.txt").await.unwrap(),
        b"step 1"
    );
}

#[tokio::test]
async fn test_delete_snapshot() {
    let (dir, provider) = provider();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    let snapshot = provider.snapshot(&runtime.id).await.unwrap();
    assert!(dir
        .path()
        .join("snapshots")
        .join(snapshot.id.as_str())
        .is_dir());

    provider.delete_snapshot(&snapshot.id).await.unwrap();

    assert!(!dir
        .path()
        .join("snapshots")
        .join(snapshot.id.as_str())
        .exists());
    assert!(provider
        .list_snapshots(Some(&runtime.id))
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        provider.restore(&snapshot.id).await,
        Err(Error::NotFound(_))
    ));
}

// =============================================================================
// Factory & Fallback Integration Tests
// =============================================================================

#[tokio::test]
async fn test_constructed_through_factory() {
    let dir = tempfile::tempdir().unwrap();
    let mut layers = ConfigLayers::default();
    layers.base.insert(
        "base_dir".to_string(),
        dir.path().to_string_lossy().into_owned().into(),
    );
    let factory = ProviderFactory::new(layers);
    factory
        .register_provider(BackendType::Worktree, WorktreeProvider::constructor())
        .unwrap();

    let provider = factory
        .get_provider(BackendType::Worktree, &ConfigScope::default())
        .unwrap();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    assert!(root(&runtime).starts_with(dir.path()));
}

#[test]
fn test_factory_requires_base_dir() {
    let factory = ProviderFactory::new(ConfigLayers::default());
    factory
        .register_provider(BackendType::Worktree, WorktreeProvider::constructor())
        .unwrap();

    let err = factory
        .get_provider(BackendType::Worktree, &ConfigScope::default())
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_falls_back_from_microvm_to_worktree() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new();
    cluster.fail_create(Some("no capacity"));

    let mut layers = ConfigLayers::default();
    layers.base.insert(
        "base_dir".to_string(),
        dir.path().to_string_lossy().into_owned().into(),
    );
    layers.base.insert("reconcile".to_string(), false.into());
    let factory = Arc::new(ProviderFactory::new(layers));
    factory
        .register_provider(
            BackendType::MicroVm,
            MicroVmProvider::constructor(Arc::new(cluster.clone())),
        )
        .unwrap();
    factory
        .register_provider(BackendType::Worktree, WorktreeProvider::constructor())
        .unwrap();

    let orchestrator = FallbackOrchestrator::new(
        factory,
        FallbackConfig {
            order: vec![BackendType::MicroVm, BackendType::Worktree],
            ..FallbackConfig::default()
        },
    );

    let outcome = orchestrator
        .spawn_with_fallback(&spawn_config())
        .await
        .unwrap();
    assert_eq!(outcome.backend_type, BackendType::Worktree);
    assert_eq!(outcome.failover_count, 1);
    assert_eq!(cluster.pod_count(), 0);
    assert_eq!(
        orchestrator.circuit_state(BackendType::MicroVm),
        Some(CircuitState::Closed)
    );

    let result = orchestrator
        .execute(&outcome.runtime.id, &argv(["echo", "routed"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "routed\n");
    orchestrator
        .terminate(&outcome.runtime.id, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_quota_exhaustion_fails_over_to_worktree() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new();
    let yaml = format!(
        "base:\n  max_agents: 1\n  reconcile: false\n  poll_interval_ms: 5\n  base_dir: \"{}\"\n",
        dir.path().display()
    );
    let factory = Arc::new(ProviderFactory::new(ConfigLayers::from_yaml(&yaml).unwrap()));
    factory
        .register_provider(
            BackendType::MicroVm,
            MicroVmProvider::constructor(Arc::new(cluster.clone())),
        )
        .unwrap();
    factory
        .register_provider(BackendType::Worktree, WorktreeProvider::constructor())
        .unwrap();
    let orchestrator = FallbackOrchestrator::new(
        factory,
        FallbackConfig {
            order: vec![BackendType::MicroVm, BackendType::Worktree],
            ..FallbackConfig::default()
        },
    );

    let first = orchestrator
        .spawn_with_fallback(&spawn_config())
        .await
        .unwrap();
    assert_eq!(first.backend_type, BackendType::MicroVm);

    let second = orchestrator
        .spawn_with_fallback(&spawn_config())
        .await
        .unwrap();
    assert_eq!(second.backend_type, BackendType::Worktree);
    assert_eq!(second.failover_count, 1);
    assert_eq!(cluster.created_count(), 1);

    let health = orchestrator
        .get_provider_health(BackendType::MicroVm)
        .unwrap();
    assert!(health
        .last_error
        .unwrap_or_default()
        .contains("resource exhausted"));
}
