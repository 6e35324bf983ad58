//! In-process cluster.
//!
//! [`InMemoryCluster`] implements [`ClusterApi`] without a cluster: pods are
//! map entries, each with a small in-memory filesystem, and exec understands
//! the transfer scripts plus a handful of shell builtins. It backs local
//! development and the test suite, and can inject the failures the MicroVM
//! provider has to survive: pods that never become ready, pods that fail,
//! create/exec/checkpoint errors, dropped watch connections and out-of-order
//! exec frames.

use super::cluster::{
    Checkpoint, ClusterApi, ExecChannel, ExecFrame, ExecStatus, PodObject, PodPhase, WatchEvent,
    CHANNEL_STATUS, CHANNEL_STDERR, CHANNEL_STDOUT,
};
use super::manifest::PodManifest;
use super::transfer::{
    decode, encode, pack_entries, read_entries, DISK_USAGE_SCRIPT, DOWNLOAD_DIR_SCRIPT,
    MISSING_PATH_EXIT_CODE, READ_FILE_SCRIPT, UPLOAD_DIR_SCRIPT, WORKDIR_SCRIPT,
    WRITE_FILE_SCRIPT,
};
use crate::constants::WORKSPACE_PATH;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const WATCH_CAPACITY: usize = 256;
const FRAME_CAPACITY: usize = 64;
const STDIN_CAPACITY: usize = 16;

type PodKey = (String, String);

/// How newly created pods behave.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PodBehavior {
    /// Pods become running and ready after the ready delay.
    #[default]
    Ready,
    /// Pods stay pending forever.
    NeverReady,
    /// Pods move to `Failed` with this message after the ready delay.
    Fail(String),
}

#[derive(Debug)]
struct FakePod {
    object: PodObject,
    limits: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct Watcher {
    namespace: String,
    selector: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Debug)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct ClusterState {
    pods: BTreeMap<PodKey, FakePod>,
    checkpoints: HashMap<String, StoredCheckpoint>,
    watchers: Vec<Watcher>,
    behavior: PodBehavior,
    ready_delay: Duration,
    fail_create: Option<String>,
    fail_exec: Option<String>,
    fail_checkpoint: Option<String>,
    checkpoint_delete_failures: u32,
    list_latency: Duration,
    shuffle_frames: bool,
    created: u64,
    deleted: u64,
}

impl ClusterState {
    fn notify(&mut self, event: &WatchEvent) {
        let pod = event.pod();
        self.watchers.retain(|w| {
            if w.namespace != pod.namespace || !pod.matches_selector(&w.selector) {
                return !w.tx.is_closed();
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(pod = %pod.name, "watch consumer lagging, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// In-memory [`ClusterApi`] implementation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.lock().ready_delay = Duration::from_millis(10);
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    pub fn set_pod_behavior(&self, behavior: PodBehavior) {
        self.lock().behavior = behavior;
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.lock().ready_delay = delay;
    }

    /// Makes every `create_pod` fail with `message` until cleared.
    pub fn fail_create(&self, message: Option<&str>) {
        self.lock().fail_create = message.map(str::to_string);
    }

    /// Makes every `exec` fail with `message` until cleared.
    pub fn fail_exec(&self, message: Option<&str>) {
        self.lock().fail_exec = message.map(str::to_string);
    }

    /// Makes every `checkpoint_pod` fail with `message` until cleared.
    pub fn fail_checkpoint(&self, message: Option<&str>) {
        self.lock().fail_checkpoint = message.map(str::to_string);
    }

    /// Delivers exec frames of each command in reverse order.
    /// Makes the next `count` checkpoint deletions fail.
    pub fn fail_checkpoint_deletes(&self, count: u32) {
        self.lock().checkpoint_delete_failures = count;
    }

    /// Delays `list_pods` responses; the listing itself is taken at call
    /// time.
    pub fn set_list_latency(&self, latency: Duration) {
        self.lock().list_latency = latency;
    }

    pub fn shuffle_exec_frames(&self, enabled: bool) {
        self.lock().shuffle_frames = enabled;
    }

    /// Closes every open watch connection.
    pub fn drop_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Removes a pod without going through the API, as an operator would.
    pub fn remove_pod_externally(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.lock();
        match state.pods.remove(&(namespace.to_string(), name.to_string())) {
            Some(pod) => {
                state.notify(&WatchEvent::Deleted(pod.object));
                true
            }
            None => false,
        }
    }

    /// Forces a pod into `phase`, as the kubelet would.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: PodPhase) -> bool {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(pod) = state.pods.get_mut(&key) else {
            return false;
        };
        pod.object.phase = phase;
        pod.object.ready = phase == PodPhase::Running;
        let object = pod.object.clone();
        state.notify(&WatchEvent::Modified(object));
        true
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.lock().pods.len()
    }

    #[must_use]
    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().map(|(_, name)| name.clone()).collect()
    }

    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.lock().created
    }

    #[must_use]
    pub fn deleted_count(&self) -> u64 {
        self.lock().deleted
    }

    #[must_use]
    pub fn checkpoint_count(&self) -> usize {
        self.lock().checkpoints.len()
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.iter().filter(|w| !w.tx.is_closed()).count()
    }

    /// Container resource limits a pod was created with.
    #[must_use]
    pub fn pod_limits(&self, namespace: &str, pod: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .map(|p| p.limits.clone())
    }

    /// Contents of a file inside a pod.
    #[must_use]
    pub fn file(&self, namespace: &str, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .and_then(|p| p.files.get(path).cloned())
    }

    fn with_pod<R>(&self, key: &PodKey, f: impl FnOnce(&mut FakePod) -> R) -> Option<R> {
        self.lock().pods.get_mut(key).map(f)
    }
}

// =============================================================================
// ClusterApi
// =============================================================================

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<PodObject> {
        let key = (
            manifest.metadata.namespace.clone(),
            manifest.metadata.name.clone(),
        );
        let (object, delay) = {
            let mut state = self.lock();
            if let Some(message) = &state.fail_create {
                return Err(Error::cluster("create pod", message));
            }
            if state.pods.contains_key(&key) {
                return Err(Error::cluster(
                    "create pod",
                    format!("pod {} already exists", key.1),
                ));
            }

            let container = manifest.spec.containers.first();
            let image = container.map(|c| c.image.clone()).unwrap_or_default();
            let env = container
                .map(|c| c.env.iter().map(|e| (e.name.clone(), e.value.clone())).collect())
                .unwrap_or_default();
            let limits = container
                .map(|c| c.resources.limits.clone())
                .unwrap_or_default();
            let files = state
                .checkpoints
                .values()
                .find(|c| c.checkpoint.image == image)
                .map(|c| c.files.clone())
                .unwrap_or_default();

            let object = PodObject {
                name: key.1.clone(),
                namespace: key.0.clone(),
                labels: manifest.metadata.labels.clone(),
                annotations: manifest.metadata.annotations.clone(),
                phase: PodPhase::Pending,
                ready: false,
                message: None,
                created_at: Utc::now(),
            };
            state.pods.insert(
                key.clone(),
                FakePod {
                    object: object.clone(),
                    limits,
                    env,
                    files,
                },
            );
            state.created += 1;
            state.notify(&WatchEvent::Added(object.clone()));
            (object, state.ready_delay)
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let behavior = state.behavior.clone();
            let Some(pod) = state.pods.get_mut(&key) else {
                return;
            };
            match behavior {
                PodBehavior::Ready => {
                    pod.object.phase = PodPhase::Running;
                    pod.object.ready = true;
                }
                PodBehavior::Fail(message) => {
                    pod.object.phase = PodPhase::Failed;
                    pod.object.message = Some(message);
                }
                PodBehavior::NeverReady => return,
            }
            let object = pod.object.clone();
            state.notify(&WatchEvent::Modified(object));
        });

        Ok(object)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodObject> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.object.clone())
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name}")))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, _grace_period_secs: u32) -> Result<()> {
        let mut state = self.lock();
        let pod = state
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name}")))?;
        state.deleted += 1;
        state.notify(&WatchEvent::Deleted(pod.object));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodObject>> {
        let (pods, latency) = {
            let state = self.lock();
            let pods: Vec<PodObject> = state
                .pods
                .values()
                .filter(|p| {
                    p.object.namespace == namespace && p.object.matches_selector(label_selector)
                })
                .map(|p| p.object.clone())
                .collect();
            (pods, state.list_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(pods)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
        stdin: bool,
    ) -> Result<ExecChannel> {
        let key = (namespace.to_string(), pod.to_string());
        let shuffle = {
            let state = self.lock();
            if let Some(message) = &state.fail_exec {
                return Err(Error::cluster("exec", message));
            }
            let pod = state
                .pods
                .get(&key)
                .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{}", key.1)))?;
            if pod.object.phase != PodPhase::Running {
                return Err(Error::cluster(
                    "exec",
                    format!("pod {} is {}", key.1, pod.object.phase),
                ));
            }
            state.shuffle_frames
        };

        let (frame_tx, frames) = mpsc::channel(FRAME_CAPACITY);
        let (stdin_tx, stdin_rx) = if stdin {
            let (tx, rx) = mpsc::channel(STDIN_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let cluster = self.clone();
        let argv = command.to_vec();
        tokio::spawn(async move {
            let mut out = FrameWriter {
                tx: frame_tx,
                sequence: 0,
                shuffle,
                held: Vec::new(),
            };
            let code = cluster.run(&key, argv, stdin_rx, &mut out).await;
            out.finish(code).await;
        });

        Ok(ExecChannel {
            frames,
            stdin: stdin_tx,
        })
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.lock().watchers.push(Watcher {
            namespace: namespace.to_string(),
            selector: label_selector.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn checkpoint_pod(&self, namespace: &str, pod: &str, _container: &str) -> Result<Checkpoint> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_checkpoint {
            return Err(Error::cluster("checkpoint", message));
        }
        let files = state
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .map(|p| p.files.clone())
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{pod}")))?;

        let id = format!("ckpt-{}", uuid::Uuid::now_v7().simple());
        let checkpoint = Checkpoint {
            image: format!("checkpoint.local/{pod}:{id}"),
            id: id.clone(),
            pod_name: pod.to_string(),
            created_at: Utc::now(),
        };
        state.checkpoints.insert(
            id,
            StoredCheckpoint {
                checkpoint: checkpoint.clone(),
                files,
            },
        );
        Ok(checkpoint)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.checkpoint_delete_failures > 0 {
            state.checkpoint_delete_failures -= 1;
            return Err(Error::cluster("delete checkpoint", "registry unavailable"));
        }
        state
            .checkpoints
            .remove(checkpoint_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("checkpoint {checkpoint_id}")))
    }
}

// =============================================================================
// Exec Emulation
// =============================================================================

struct FrameWriter {
    tx: mpsc::Sender<ExecFrame>,
    sequence: u64,
    shuffle: bool,
    held: Vec<ExecFrame>,
}

impl FrameWriter {
    async fn write(&mut self, channel: u8, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let frame = ExecFrame {
            channel,
            data,
            sequence: self.sequence,
        };
        self.sequence += 1;
        if self.shuffle {
            self.held.push(frame);
            true
        } else {
            self.tx.send(frame).await.is_ok()
        }
    }

    async fn finish(mut self, code: i32) {
        self.write(CHANNEL_STATUS, ExecStatus::exited(code).to_bytes())
            .await;
        for frame in std::mem::take(&mut self.held).into_iter().rev() {
            if self.tx.send(frame).await.is_err() {
                break;
            }
        }
    }
}

async fn read_all(stdin: Option<mpsc::Receiver<Vec<u8>>>) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(mut rx) = stdin {
        while let Some(chunk) = rx.recv().await {
            data.extend_from_slice(&chunk);
        }
    }
    data
}

fn normalize(path: &str, cwd: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn dir_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

impl InMemoryCluster {
    async fn run(
        &self,
        key: &PodKey,
        mut argv: Vec<String>,
        stdin: Option<mpsc::Receiver<Vec<u8>>>,
        out: &mut FrameWriter,
    ) -> i32 {
        let mut env = BTreeMap::new();
        let mut cwd = WORKSPACE_PATH.to_string();

        if argv.first().map(String::as_str) == Some("env") {
            argv.remove(0);
            while let Some((k, v)) = argv.first().and_then(|a| a.split_once('=')) {
                env.insert(k.to_string(), v.to_string());
                argv.remove(0);
            }
        }
        if argv.len() >= 5 && argv[0] == "sh" && argv[1] == "-c" && argv[2] == WORKDIR_SCRIPT {
            cwd = normalize(&argv[4], "/");
            argv.drain(..5);
        }

        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["sh", "-c", script, "sh", arg] if is_transfer_script(script) => {
                let path = normalize(arg, &cwd);
                self.run_script(key, script, &path, stdin, out).await
            }
            ["sh", "-c", script] => match script.trim().strip_prefix("exit ") {
                Some(code) => code.trim().parse().unwrap_or(2),
                None => {
                    out.write(CHANNEL_STDERR, b"sh: unsupported script\n".to_vec())
                        .await;
                    127
                }
            },
            ["echo", rest @ ..] => {
                out.write(CHANNEL_STDOUT, format!("{}\n", rest.join(" ")).into_bytes())
                    .await;
                0
            }
            ["cat"] => {
                if let Some(mut rx) = stdin {
                    while let Some(chunk) = rx.recv().await {
                        if !out.write(CHANNEL_STDOUT, chunk).await {
                            return 1;
                        }
                    }
                }
                0
            }
            ["cat", path] => {
                let path = normalize(path, &cwd);
                match self.with_pod(key, |p| p.files.get(&path).cloned()).flatten() {
                    Some(data) => {
                        out.write(CHANNEL_STDOUT, data).await;
                        0
                    }
                    None => {
                        out.write(
                            CHANNEL_STDERR,
                            format!("cat: {path}: No such file or directory\n").into_bytes(),
                        )
                        .await;
                        1
                    }
                }
            }
            ["printenv", name] => {
                let value = match env.get(*name) {
                    Some(v) => Some(v.clone()),
                    None => self
                        .with_pod(key, |p| p.env.get(*name).cloned())
                        .flatten(),
                };
                match value {
                    Some(v) => {
                        out.write(CHANNEL_STDOUT, format!("{v}\n").into_bytes()).await;
                        0
                    }
                    None => 1,
                }
            }
            ["pwd"] => {
                out.write(CHANNEL_STDOUT, format!("{cwd}\n").into_bytes()).await;
                0
            }
            ["sleep", secs] => {
                let secs: f64 = secs.parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
                0
            }
            ["true"] => 0,
            ["false"] => 1,
            [program, ..] => {
                out.write(
                    CHANNEL_STDERR,
                    format!("sh: {program}: not found\n").into_bytes(),
                )
                .await;
                127
            }
            [] => 0,
        }
    }

    async fn run_script(
        &self,
        key: &PodKey,
        script: &str,
        path: &str,
        stdin: Option<mpsc::Receiver<Vec<u8>>>,
        out: &mut FrameWriter,
    ) -> i32 {
        match script {
            WRITE_FILE_SCRIPT => {
                let input = read_all(stdin).await;
                match decode(&input) {
                    Ok(data) => {
                        self.with_pod(key, |p| p.files.insert(path.to_string(), data));
                        0
                    }
                    Err(e) => {
                        out.write(CHANNEL_STDERR, format!("base64: {e}\n").into_bytes())
                            .await;
                        1
                    }
                }
            }
            READ_FILE_SCRIPT => match self.with_pod(key, |p| p.files.get(path).cloned()).flatten() {
                Some(data) => {
                    out.write(CHANNEL_STDOUT, encode(&data)).await;
                    0
                }
                None => MISSING_PATH_EXIT_CODE,
            },
            UPLOAD_DIR_SCRIPT => {
                let input = read_all(stdin).await;
                let entries = match decode(&input).and_then(|a| read_entries(&a)) {
                    Ok(entries) => entries,
                    Err(e) => {
                        out.write(CHANNEL_STDERR, format!("tar: {e}\n").into_bytes())
                            .await;
                        return 2;
                    }
                };
                let prefix = dir_prefix(path);
                self.with_pod(key, |p| {
                    for (name, data) in entries {
                        p.files.insert(format!("{prefix}{name}"), data);
                    }
                });
                0
            }
            DOWNLOAD_DIR_SCRIPT => {
                let prefix = dir_prefix(path);
                let files: Option<Vec<(String, Vec<u8>)>> = self
                    .with_pod(key, |p| {
                        p.files
                            .iter()
                            .filter_map(|(name, data)| {
                                name.strip_prefix(&prefix).map(|rel| (rel.to_string(), data.clone()))
                            })
                            .collect()
                    });
                let files = files.unwrap_or_default();
                if files.is_empty() && path != WORKSPACE_PATH {
                    return MISSING_PATH_EXIT_CODE;
                }
                match pack_entries(files.iter().map(|(n, d)| (n.as_str(), d.as_slice()))) {
                    Ok(archive) => {
                        out.write(CHANNEL_STDOUT, encode(&archive)).await;
                        0
                    }
                    Err(e) => {
                        out.write(CHANNEL_STDERR, format!("tar: {e}\n").into_bytes())
                            .await;
                        2
                    }
                }
            }
            DISK_USAGE_SCRIPT => {
                let prefix = dir_prefix(path);
                let bytes: u64 = self
                    .with_pod(key, |p| {
                        p.files
                            .iter()
                            .filter(|(name, _)| name.starts_with(&prefix) || name.as_str() == path)
                            .map(|(_, d)| d.len() as u64)
                            .sum()
                    })
                    .unwrap_or(0);
                out.write(CHANNEL_STDOUT, format!("{}\n", bytes.div_ceil(1024)).into_bytes())
                    .await;
                0
            }
            _ => 127,
        }
    }
}

fn is_transfer_script(script: &str) -> bool {
    [
        WRITE_FILE_SCRIPT,
        READ_FILE_SCRIPT,
        UPLOAD_DIR_SCRIPT,
        DOWNLOAD_DIR_SCRIPT,
        DISK_USAGE_SCRIPT,
    ]
    .contains(&script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/b", "/workspace"), "/workspace/a/b");
        assert_eq!(normalize("/x/../y", "/"), "/y");
        assert_eq!(normalize("./a/./b/", "/w"), "/w/a/b");
    }
}
