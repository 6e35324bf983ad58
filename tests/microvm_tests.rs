//! Tests for the MicroVM provider.
//!
//! Runs the provider against the in-memory cluster: spawn cleanup, exec
//! streaming, file transfer, snapshots and watch reconciliation.

use agent_runtime_orchestrator::factory::{ConfigLayers, ConfigScope, ProviderFactory};
use agent_runtime_orchestrator::fallback::{FallbackConfig, FallbackOrchestrator};
use agent_runtime_orchestrator::providers::microvm::{
    InMemoryCluster, MicroVmConfig, MicroVmProvider, PodBehavior, PodPhase,
};
use agent_runtime_orchestrator::runtime::{
    argv, BackendType, ChunkKind, ExecOptions, RuntimeEvent, RuntimeId, RuntimeProvider,
    RuntimeState, SpawnConfig,
};
use agent_runtime_orchestrator::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "default";

fn test_config() -> MicroVmConfig {
    MicroVmConfig {
        spawn_timeout_ms: 2_000,
        api_timeout_ms: 1_000,
        poll_interval_ms: 5,
        reconcile: false,
        ..MicroVmConfig::default()
    }
}

fn provider_with(cluster: &InMemoryCluster, config: MicroVmConfig) -> MicroVmProvider {
    MicroVmProvider::new(Arc::new(cluster.clone()), config)
}

fn provider(cluster: &InMemoryCluster) -> MicroVmProvider {
    provider_with(cluster, test_config())
}

fn spawn_config() -> SpawnConfig {
    SpawnConfig::new("agent:latest")
}

async fn running(provider: &MicroVmProvider) -> RuntimeId {
    provider.spawn(&spawn_config()).await.unwrap().id
}

fn pod_of(runtime: &agent_runtime_orchestrator::AgentRuntime) -> String {
    runtime.metadata["pod"].clone()
}

/// Polls `check` until it holds or a second has passed.
async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Spawn Tests
// =============================================================================

#[tokio::test]
async fn test_spawn_reaches_running() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let mut events = provider.events().subscribe();

    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    assert_eq!(runtime.state, RuntimeState::Running);
    assert_eq!(runtime.backend_type, BackendType::MicroVm);
    assert_eq!(cluster.pod_names(), vec![pod_of(&runtime)]);
    assert_eq!(provider.list_runtimes().await.unwrap().len(), 1);

    let mut created = false;
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::RuntimeCreated { runtime: r } = event {
            assert_eq!(r.id, runtime.id);
            created = true;
        }
    }
    assert!(created);
}

#[tokio::test]
async fn test_failed_pod_is_cleaned_up() {
    let cluster = InMemoryCluster::new();
    cluster.set_pod_behavior(PodBehavior::Fail("ImagePullBackOff".to_string()));
    let provider = provider(&cluster);

    let err = provider.spawn(&spawn_config()).await.unwrap_err();

    assert!(matches!(err, Error::Spawn(_)));
    assert!(err.to_string().contains("ImagePullBackOff"));
    assert_eq!(cluster.pod_count(), 0, "no orphaned pod");
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spawn_timeout_is_cleaned_up() {
    let cluster = InMemoryCluster::new();
    cluster.set_pod_behavior(PodBehavior::NeverReady);
    let provider = provider_with(
        &cluster,
        MicroVmConfig {
            spawn_timeout_ms: 100,
            ..test_config()
        },
    );

    let err = provider.spawn(&spawn_config()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(cluster.created_count(), 1);
    assert_eq!(cluster.pod_count(), 0, "no orphaned pod");
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spawn_config_timeout_overrides_default() {
    let cluster = InMemoryCluster::new();
    cluster.set_pod_behavior(PodBehavior::NeverReady);
    let provider = provider(&cluster);

    let spawn = spawn_config().with_timeout(Duration::from_millis(50));
    let err = provider.spawn(&spawn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(cluster.pod_count(), 0);
}

#[tokio::test]
async fn test_abandoned_spawn_is_cleaned_up() {
    let cluster = InMemoryCluster::new();
    cluster.set_pod_behavior(PodBehavior::NeverReady);
    let provider = provider(&cluster);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), provider.spawn(&spawn_config())).await;
    assert!(abandoned.is_err());
    assert_eq!(cluster.created_count(), 1);

    assert!(eventually(|| cluster.pod_count() == 0).await, "no orphaned pod");
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_failure_surfaces_as_spawn_error() {
    let cluster = InMemoryCluster::new();
    cluster.fail_create(Some("quota exceeded"));
    let provider = provider(&cluster);

    let err = provider.spawn(&spawn_config()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Spawn);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("quota exceeded"));
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_spawn_config_rejected() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);

    let err = provider.spawn(&SpawnConfig::new("  ")).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(cluster.created_count(), 0);
}

#[tokio::test]
async fn test_max_agents_is_enforced() {
    let cluster = InMemoryCluster::new();
    let provider = provider_with(
        &cluster,
        MicroVmConfig {
            max_agents: Some(1),
            ..test_config()
        },
    );
    let first = running(&provider).await;

    let err = provider.spawn(&spawn_config()).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert!(err.is_retryable());
    assert_eq!(cluster.created_count(), 1);

    provider.terminate(&first, false).await.unwrap();
    running(&provider).await;
    assert_eq!(cluster.pod_count(), 1);
}

#[tokio::test]
async fn test_concurrent_spawns() {
    let cluster = InMemoryCluster::new();
    let provider = Arc::new(provider(&cluster));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.spawn(&spawn_config()).await })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }

    assert_eq!(cluster.pod_count(), 5);
    for id in &ids {
        provider.terminate(id, false).await.unwrap();
    }
    assert_eq!(cluster.pod_count(), 0);
}

// =============================================================================
// Terminate & Status Tests
// =============================================================================

#[tokio::test]
async fn test_terminate_is_idempotent_with_force() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    provider.terminate(&id, false).await.unwrap();
    assert_eq!(cluster.pod_count(), 0);
    assert_eq!(cluster.deleted_count(), 1);

    provider.terminate(&id, true).await.unwrap();
    assert!(matches!(
        provider.terminate(&id, false).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(provider.status(&id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_force_terminate_after_external_delete() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    assert!(cluster.remove_pod_externally(NS, &pod_of(&runtime)));
    provider.terminate(&runtime.id, true).await.unwrap();
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_refreshes_from_cluster() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    assert!(cluster.set_pod_phase(NS, &pod_of(&runtime), PodPhase::Failed));
    let status = provider.status(&runtime.id).await.unwrap();
    assert_eq!(status.state, RuntimeState::Error);

    // Terminal states are sticky even if the pod comes back.
    cluster.set_pod_phase(NS, &pod_of(&runtime), PodPhase::Running);
    let status = provider.status(&runtime.id).await.unwrap();
    assert_eq!(status.state, RuntimeState::Error);
}

#[tokio::test]
async fn test_status_after_external_delete() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    cluster.remove_pod_externally(NS, &pod_of(&runtime));
    assert!(matches!(
        provider.status(&runtime.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(
        provider
            .wait_for_state(&runtime.id, RuntimeState::Terminated, Duration::from_millis(100))
            .await
            .unwrap()
    );
}

// =============================================================================
// Exec Tests
// =============================================================================

#[tokio::test]
async fn test_execute_collects_output() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let result = provider
        .execute(&id, &argv(["echo", "hello", "world"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout_lossy(), "hello world\n");

    let result = provider
        .execute(&id, &argv(["sh", "-c", "exit 3"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);

    let result = provider
        .execute(&id, &argv(["no-such-tool"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 127);
    assert!(result.stderr_lossy().contains("not found"));

    let status = provider.status(&id).await.unwrap();
    assert_eq!(status.resource_usage.exec_count, 3);
}

#[tokio::test]
async fn test_execute_env_and_working_dir() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let spawn = spawn_config().with_env("TEAM", "alpha");
    let id = provider.spawn(&spawn).await.unwrap().id;

    let options = ExecOptions {
        env: vec![("GREETING".to_string(), "hi".to_string())],
        ..ExecOptions::default()
    };
    let greeting = provider
        .execute(&id, &argv(["printenv", "GREETING"]), options)
        .await
        .unwrap();
    assert_eq!(greeting.stdout_lossy(), "hi\n");

    let team = provider
        .execute(&id, &argv(["printenv", "TEAM"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(team.stdout_lossy(), "alpha\n");

    let own_id = provider
        .execute(&id, &argv(["printenv", "AGENT_RUNTIME_ID"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(own_id.stdout_lossy().trim(), id.as_str());

    let pwd = provider
        .execute(
            &id,
            &argv(["pwd"]),
            ExecOptions::default().with_working_dir("/tmp/build"),
        )
        .await
        .unwrap();
    assert_eq!(pwd.stdout_lossy(), "/tmp/build\n");
}

#[tokio::test]
async fn test_execute_with_stdin() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let result = provider
        .execute(&id, &argv(["cat"]), ExecOptions::default().with_stdin("piped input"))
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "piped input");
}

#[tokio::test]
async fn test_execute_errors() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    assert!(matches!(
        provider
            .execute(&RuntimeId::generate(), &argv(["true"]), ExecOptions::default())
            .await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        provider.execute(&id, &[], ExecOptions::default()).await,
        Err(Error::Configuration(_))
    ));

    cluster.fail_exec(Some("connection refused"));
    let err = provider
        .execute(&id, &argv(["true"]), ExecOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_execute_on_failed_runtime() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    cluster.set_pod_phase(NS, &pod_of(&runtime), PodPhase::Failed);
    provider.status(&runtime.id).await.unwrap();

    let err = provider
        .execute(&runtime.id, &argv(["true"]), ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Execution { .. }));
}

#[tokio::test]
async fn test_command_timeout() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let err = provider
        .execute(
            &id,
            &argv(["sleep", "5"]),
            ExecOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_execute_stream_chunks_in_order() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let mut stream = provider
        .execute_stream(&id, &argv(["echo", "streamed"]), ExecOptions::default())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].kind, ChunkKind::Stdout);
    assert_eq!(chunks[0].data, b"streamed\n");
    assert_eq!(chunks[1].exit_code(), Some(0));
    assert!(chunks[0].sequence < chunks[1].sequence);
}

#[tokio::test]
async fn test_interactive_session() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let mut session = provider
        .execute_interactive(&id, &argv(["cat"]), ExecOptions::default())
        .await
        .unwrap();
    session.write("ping\n").await.unwrap();
    let first = session.output.next().await.unwrap().unwrap();
    assert_eq!(first.data, b"ping\n");

    session.write("pong\n").await.unwrap();
    let result = session.finish().await.unwrap();
    assert_eq!(result.stdout, b"pong\n");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn test_out_of_order_frames_are_reordered() {
    let cluster = InMemoryCluster::new();
    cluster.shuffle_exec_frames(true);
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let session = provider
        .execute_interactive(&id, &argv(["cat"]), ExecOptions::default())
        .await
        .unwrap();
    for part in ["one ", "two ", "three"] {
        session.write(part).await.unwrap();
    }
    let result = session.finish().await.unwrap();
    assert_eq!(result.stdout_lossy(), "one two three");
    assert_eq!(result.exit_code, 0);
}

// =============================================================================
// File Transfer Tests
// =============================================================================

#[tokio::test]
async fn test_write_and_read_file() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    let id = runtime.id.clone();
    let data = (0..=255u8).cycle().take(10_000).collect::<Vec<u8>>();

    provider.write_file(&id, "out/data.bin", &data).await.unwrap();
    assert_eq!(
        cluster.file(NS, &pod_of(&runtime), "/workspace/out/data.bin"),
        Some(data.clone())
    );
    assert_eq!(provider.read_file(&id, "out/data.bin").await.unwrap(), data);
    assert_eq!(
        provider.read_file(&id, "/workspace/out/data.bin").await.unwrap(),
        data
    );

    let cat = provider
        .execute(&id, &argv(["cat", "out/data.bin"]), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(cat.stdout, data);
}

#[tokio::test]
async fn test_read_missing_file() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;

    assert!(matches!(
        provider.read_file(&id, "missing.txt").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_upload_and_download_directory() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    let id = runtime.id.clone();

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("src/nested")).unwrap();
    std::fs::write(src.path().join("README.md"), b"# project").unwrap();
    std::fs::write(src.path().join("src/nested/lib.rs"), b"fn main() {}").unwrap();

    provider
        .upload_directory(&id, src.path(), "project")
        .await
        .unwrap();
    assert_eq!(
        cluster.file(NS, &pod_of(&runtime), "/workspace/project/src/nested/lib.rs"),
        Some(b"fn main() {}".to_vec())
    );

    let dest = tempfile::tempdir().unwrap();
    provider
        .download_directory(&id, "project", dest.path())
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(dest.path().join("README.md")).unwrap(),
        b"# project"
    );
    assert_eq!(
        std::fs::read(dest.path().join("src/nested/lib.rs")).unwrap(),
        b"fn main() {}"
    );
}

#[tokio::test]
async fn test_directory_transfer_errors() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;
    let dest = tempfile::tempdir().unwrap();

    assert!(matches!(
        provider
            .download_directory(&id, "/nowhere", dest.path())
            .await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        provider
            .upload_directory(&id, &dest.path().join("absent"), "x")
            .await,
        Err(Error::NotFound(_))
    ));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_restore_round_trip() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let original = provider.spawn(&spawn_config()).await.unwrap();
    provider
        .write_file(&original.id, "state.json", b"{\"step\":3}")
        .await
        .unwrap();

    let snapshot = provider.snapshot(&original.id).await.unwrap();
    assert_eq!(snapshot.runtime_id, original.id);
    assert_eq!(snapshot.size_bytes, 1024);
    assert_eq!(cluster.checkpoint_count(), 1);

    let restored = provider.restore(&snapshot.id).await.unwrap();
    assert_ne!(restored.id, original.id);
    assert_ne!(pod_of(&restored), pod_of(&original));
    assert_eq!(restored.state, RuntimeState::Running);
    assert_eq!(
        restored.metadata.get("restoredFrom"),
        Some(&snapshot.id.to_string())
    );
    assert_eq!(
        provider.read_file(&restored.id, "state.json").await.unwrap(),
        b"{\"step\":3}"
    );

    // The original keeps running independently.
    provider
        .write_file(&original.id, "state.json", b"{\"step\":4}")
        .await
        .unwrap();
    assert_eq!(
        provider.read_file(&restored.id, "state.json").await.unwrap(),
        b"{\"step\":3}"
    );
}

#[tokio::test]
async fn test_snapshot_listing_and_deletion() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let a = running(&provider).await;
    let b = running(&provider).await;

    let first = provider.snapshot(&a).await.unwrap();
    provider.snapshot(&a).await.unwrap();
    provider.snapshot(&b).await.unwrap();

    assert_eq!(provider.list_snapshots(Some(&a)).await.unwrap().len(), 2);
    assert_eq!(provider.list_snapshots(None).await.unwrap().len(), 3);

    provider.delete_snapshot(&first.id).await.unwrap();
    assert_eq!(cluster.checkpoint_count(), 2);
    assert!(matches!(
        provider.restore(&first.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        provider.delete_snapshot(&first.id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_checkpoint_deletion_can_be_retried() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    let id = running(&provider).await;
    let snapshot = provider.snapshot(&id).await.unwrap();

    cluster.fail_checkpoint_deletes(1);
    let err = provider.delete_snapshot(&snapshot.id).await.unwrap_err();
    assert!(err.to_string().contains("registry unavailable"));
    assert_eq!(provider.list_snapshots(None).await.unwrap().len(), 1);
    assert_eq!(cluster.checkpoint_count(), 1);

    provider.delete_snapshot(&snapshot.id).await.unwrap();
    assert!(provider.list_snapshots(None).await.unwrap().is_empty());
    assert_eq!(cluster.checkpoint_count(), 0);
}

#[tokio::test]
async fn test_snapshot_failure() {
    let cluster = InMemoryCluster::new();
    cluster.fail_checkpoint(Some("criu unavailable"));
    let provider = provider(&cluster);
    let id = running(&provider).await;

    let err = provider.snapshot(&id).await.unwrap_err();
    assert!(err.to_string().contains("criu unavailable"));
    assert!(provider.list_snapshots(None).await.unwrap().is_empty());
}

// =============================================================================
// Reconciliation Tests
// =============================================================================

#[tokio::test]
async fn test_reconciler_removes_externally_deleted_runtime() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    provider.start_reconciler().unwrap();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    assert!(eventually(|| cluster.watcher_count() == 1).await);

    let mut events = provider.events().subscribe();
    cluster.remove_pod_externally(NS, &pod_of(&runtime));

    let terminated = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(RuntimeEvent::RuntimeTerminated { runtime_id }) = events.recv().await {
                return runtime_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(terminated, runtime.id);
    assert!(provider.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconciler_marks_failed_pod() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    provider.start_reconciler().unwrap();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    assert!(eventually(|| cluster.watcher_count() == 1).await);

    cluster.set_pod_phase(NS, &pod_of(&runtime), PodPhase::Failed);

    let mut failed = false;
    for _ in 0..100 {
        let listed = provider.list_runtimes().await.unwrap();
        if listed.iter().any(|r| r.state == RuntimeState::Error) {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed);
}

#[tokio::test]
async fn test_reconciler_resyncs_after_reconnect() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    provider.start_reconciler().unwrap();
    let kept = provider.spawn(&spawn_config()).await.unwrap();
    let lost = provider.spawn(&spawn_config()).await.unwrap();
    assert!(eventually(|| cluster.watcher_count() == 1).await);

    cluster.drop_watches();
    // Deleted while no watch is open, so only the resync can notice.
    cluster.remove_pod_externally(NS, &pod_of(&lost));

    let mut resynced = false;
    for _ in 0..300 {
        let ids: Vec<RuntimeId> = provider
            .list_runtimes()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids == vec![kept.id.clone()] {
            resynced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resynced);
    assert_eq!(cluster.watcher_count(), 1);
}

#[tokio::test]
async fn test_resync_keeps_runtime_spawned_during_list() {
    let cluster = InMemoryCluster::new();
    cluster.set_list_latency(Duration::from_millis(300));
    let provider = provider(&cluster);
    provider.start_reconciler().unwrap();
    // The resync listing is taken now, before the pod exists.
    assert!(eventually(|| cluster.watcher_count() == 1).await);

    let runtime = provider.spawn(&spawn_config()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let listed = provider.list_runtimes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, runtime.id);
    assert_eq!(listed[0].state, RuntimeState::Running);
    assert_eq!(cluster.pod_count(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_reconciler() {
    let cluster = InMemoryCluster::new();
    let provider = provider(&cluster);
    provider.start_reconciler().unwrap();
    assert!(eventually(|| cluster.watcher_count() == 1).await);

    provider.shutdown().await;
    assert!(eventually(|| cluster.watcher_count() == 0).await);
}

// =============================================================================
// Factory Integration Tests
// =============================================================================

#[tokio::test]
async fn test_constructed_through_factory() {
    let cluster = InMemoryCluster::new();
    let yaml = "base:\n  poll_interval_ms: 5\n  reconcile: false\nteams:\n  alpha:\n    namespace: agents-alpha\n";
    let factory = ProviderFactory::new(ConfigLayers::from_yaml(yaml).unwrap());
    factory
        .register_provider(
            BackendType::MicroVm,
            MicroVmProvider::constructor(Arc::new(cluster.clone())),
        )
        .unwrap();

    let provider = factory
        .get_provider(BackendType::MicroVm, &ConfigScope::team("alpha"))
        .unwrap();
    let runtime = provider.spawn(&spawn_config()).await.unwrap();

    assert_eq!(runtime.metadata["namespace"], "agents-alpha");
    provider
        .write_file(&runtime.id, "marker", b"alpha")
        .await
        .unwrap();
    assert_eq!(
        cluster.file("agents-alpha", &pod_of(&runtime), "/workspace/marker"),
        Some(b"alpha".to_vec())
    );
    provider.health_check().await.unwrap();
    provider.terminate(&runtime.id, false).await.unwrap();
    assert_eq!(cluster.pod_count(), 0);
}

#[test]
fn test_invalid_provider_config() {
    let cluster = InMemoryCluster::new();
    let yaml = "base:\n  namespace: \"\"\n";
    let factory = ProviderFactory::new(ConfigLayers::from_yaml(yaml).unwrap());
    factory
        .register_provider(
            BackendType::MicroVm,
            MicroVmProvider::constructor(Arc::new(cluster)),
        )
        .unwrap();

    let err = factory
        .get_provider(BackendType::MicroVm, &ConfigScope::default())
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

// =============================================================================
// Orchestrator Integration Tests
// =============================================================================

#[tokio::test]
async fn test_scoped_resources_reach_pod() {
    let cluster = InMemoryCluster::new();
    let yaml = "
base:
  cpu: 1
  poll_interval_ms: 5
  reconcile: false
teams:
  alpha:
    cpu: 2
    namespace: agents-alpha
agents:
  a7:
    cpu: 4
";
    let factory = Arc::new(ProviderFactory::new(ConfigLayers::from_yaml(yaml).unwrap()));
    factory
        .register_provider(
            BackendType::MicroVm,
            MicroVmProvider::constructor(Arc::new(cluster.clone())),
        )
        .unwrap();
    let orchestrator = FallbackOrchestrator::new(
        factory,
        FallbackConfig {
            order: vec![BackendType::MicroVm],
            ..FallbackConfig::default()
        },
    );

    let cases = [
        (spawn_config(), "1000m"),
        (spawn_config().scoped(Some("alpha"), None), "2000m"),
        (spawn_config().scoped(Some("alpha"), Some("a7")), "4000m"),
        (spawn_config().scoped(Some("beta"), None), "1000m"),
    ];
    for (spawn, cpu) in &cases {
        let runtime = orchestrator.spawn_with_fallback(spawn).await.unwrap().runtime;
        // The shared provider keeps the base namespace for every scope.
        assert_eq!(runtime.metadata["namespace"], NS);
        let limits = cluster.pod_limits(NS, &pod_of(&runtime)).unwrap();
        assert_eq!(limits["cpu"], *cpu, "{:?}", spawn.team_id);
    }
}
