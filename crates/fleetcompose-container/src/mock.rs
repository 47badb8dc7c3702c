//! インメモリのランタイム実装
//!
//! Docker デーモン無しでエンジンを動かすためのもの。呼び出しを記録し、
//! コマンドの簡単なスクリプト（`echo` / `exit N` / `fail` / `cat`）を解釈する。
//! それ以外のコマンドは停止されるまで動き続ける。

use crate::runtime::RuntimeClient;
use crate::types::*;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use fleetcompose_core::error::{ComposeError, ResourceKind, Result};
use fleetcompose_core::MountKind;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FIRST_EPHEMERAL_PORT: u16 = 49153;

/// 記録される呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateContainer(String),
    StartContainer(String),
    StopContainer {
        name: String,
        timeout: Option<Duration>,
    },
    KillContainer {
        name: String,
        signal: String,
    },
    PauseContainer(String),
    UnpauseContainer(String),
    RestartContainer(String),
    RemoveContainer(String),
    RenameContainer {
        from: String,
        to: String,
    },
    CreateExec {
        container: String,
        command: Vec<String>,
    },
    CopyToContainer {
        container: String,
        path: String,
    },
    PullImage(String),
    BuildImage(String),
    PushImage(String),
    RemoveImage(String),
    CreateNetwork(String),
    ConnectNetwork {
        network: String,
        container: String,
    },
    DisconnectNetwork {
        network: String,
        container: String,
    },
    RemoveNetwork(String),
    CreateVolume(String),
    RemoveVolume(String),
}

impl Call {
    /// コンテナ・ネットワーク・ボリュームを作成または削除する呼び出しか
    pub fn changes_resources(&self) -> bool {
        matches!(
            self,
            Call::CreateContainer(_)
                | Call::RemoveContainer(_)
                | Call::CreateNetwork(_)
                | Call::RemoveNetwork(_)
                | Call::CreateVolume(_)
                | Call::RemoveVolume(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Process {
    output: Vec<(Stream, Bytes)>,
    stdin: BytesMut,
}

impl Process {
    fn line(&mut self, stream: Stream, text: &str) {
        self.output
            .push((stream, Bytes::from(format!("{}\n", text))));
    }
}

#[derive(Debug)]
struct MockContainer {
    id: String,
    spec: ContainerSpec,
    status: ContainerStatus,
    health: HealthStatus,
    exit_code: i64,
    created: i64,
    /// 接続中のネットワーク名 → エイリアス
    networks: BTreeMap<String, Vec<String>>,
    /// 起動時に割り当てた公開ポート
    ports: Vec<PublishedPort>,
    process: Process,
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

impl MockContainer {
    fn has_healthcheck(&self) -> bool {
        self.spec
            .healthcheck
            .as_ref()
            .map(|h| h.test.first().map(String::as_str) != Some("NONE"))
            .unwrap_or(false)
    }

    fn details(&self) -> ContainerDetails {
        ContainerDetails {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            image_id: format!("sha256:{}", self.spec.image),
            labels: self.spec.labels.clone(),
            status: self.status,
            health: self.health,
            exit_code: self.exit_code,
            tty: self.spec.tty,
            open_stdin: self.spec.open_stdin,
            ports: self.ports.clone(),
            networks: self.networks.clone(),
            mounts: self
                .spec
                .mounts
                .iter()
                .map(|m| MountInfo {
                    kind: m.kind,
                    name: match m.kind {
                        MountKind::Volume => m.source.clone(),
                        _ => None,
                    },
                    source: m.source.clone(),
                    destination: m.target.clone(),
                    read_only: m.read_only,
                })
                .collect(),
        }
    }

    fn summary(&self) -> ContainerSummary {
        let status_text = match self.status {
            ContainerStatus::Running => "Up".to_string(),
            ContainerStatus::Paused => "Up (Paused)".to_string(),
            ContainerStatus::Exited => format!("Exited ({})", self.exit_code),
            ContainerStatus::Created => "Created".to_string(),
            other => other.to_string(),
        };
        ContainerSummary {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            labels: self.spec.labels.clone(),
            status: self.status,
            status_text,
            created: self.created,
            ports: self.ports.clone(),
            networks: self.networks.keys().cloned().collect(),
        }
    }

    fn uses_volume(&self, volume: &str) -> bool {
        self.spec
            .mounts
            .iter()
            .any(|m| m.kind == MountKind::Volume && m.source.as_deref() == Some(volume))
    }
}

#[derive(Debug)]
struct MockExec {
    container: String,
    spec: ExecSpec,
    running: bool,
    exit_code: Option<i64>,
    process: Process,
}

#[derive(Debug, Default)]
struct MockState {
    counter: u64,
    next_port: u16,
    containers: BTreeMap<String, MockContainer>,
    execs: HashMap<String, MockExec>,
    images: BTreeMap<String, ImageInfo>,
    pull_missing: BTreeSet<String>,
    build_failures: BTreeSet<String>,
    networks: BTreeMap<String, NetworkInfo>,
    volumes: BTreeMap<String, VolumeInfo>,
    health_overrides: HashMap<String, HealthStatus>,
    framed: bool,
    hide_exec_exit_codes: bool,
    calls: Vec<Call>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}{:012x}", prefix, self.counter)
    }

    fn find_id(&self, key: &str) -> Option<String> {
        if self.containers.contains_key(key) {
            return Some(key.to_string());
        }
        self.containers
            .values()
            .find(|c| c.spec.name == key)
            .map(|c| c.id.clone())
    }

    fn container(&self, key: &str) -> Result<&MockContainer> {
        self.find_id(key)
            .and_then(|id| self.containers.get(&id))
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, key))
    }

    fn container_mut(&mut self, key: &str) -> Result<&mut MockContainer> {
        let id = self
            .find_id(key)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, key))?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, key))
    }
}

/// イメージ参照を `name:tag` に揃える
fn normalize_image(reference: &str) -> String {
    if reference.contains('@') {
        return reference.to_string();
    }
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Docker の多重化フレーム（8 バイトヘッダ）を組み立てる
pub fn encode_frame(stream_id: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u8(stream_id);
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

fn to_chunk(tty: bool, framed: bool, stream: Stream, data: Bytes) -> OutputChunk {
    match (tty, framed, stream) {
        (true, _, _) => OutputChunk::Console(data),
        (false, true, Stream::Stdout) => OutputChunk::Multiplexed(encode_frame(1, &data)),
        (false, true, Stream::Stderr) => OutputChunk::Multiplexed(encode_frame(2, &data)),
        (false, false, Stream::Stdout) => OutputChunk::Stdout(data),
        (false, false, Stream::Stderr) => OutputChunk::Stderr(data),
    }
}

/// 起動時にコマンドを解釈する
///
/// 終了するコマンドなら終了コードを返す。
fn run_script(command: &[String], process: &mut Process, has_stdin: bool) -> Option<i64> {
    match command.first().map(String::as_str) {
        Some("echo") => {
            process.line(Stream::Stdout, &command[1..].join(" "));
            Some(0)
        }
        Some("exit") => Some(command.get(1).and_then(|c| c.parse().ok()).unwrap_or(1)),
        Some("fail") => {
            process.line(Stream::Stderr, &command[1..].join(" "));
            Some(1)
        }
        Some("cat") if has_stdin => None,
        Some("cat") => Some(0),
        _ => None,
    }
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>> {
    state
        .lock()
        .map_err(|e| ComposeError::runtime(format!("mutex poisoned: {e}")))
}

#[derive(Clone)]
enum Target {
    Container(String),
    Exec(String),
}

enum Step {
    Chunk(OutputChunk),
    Wait,
    End,
}

/// 出力バッファを読み進めるカーソル
struct Cursor {
    state: Arc<Mutex<MockState>>,
    target: Target,
    offset: usize,
    follow: bool,
    timestamps: bool,
    until: Option<usize>,
}

impl Cursor {
    fn step(&mut self) -> Result<Step> {
        let state = lock(&self.state)?;
        let (process, finished, tty) = match &self.target {
            Target::Container(id) => match state.containers.get(id) {
                Some(c) => (
                    &c.process,
                    matches!(c.status, ContainerStatus::Exited | ContainerStatus::Dead),
                    c.spec.tty,
                ),
                None => return Ok(Step::End),
            },
            Target::Exec(id) => match state.execs.get(id) {
                Some(e) => (&e.process, !e.running, e.spec.tty),
                None => return Ok(Step::End),
            },
        };

        let limit = self.until.unwrap_or(process.output.len());
        if self.offset < limit.min(process.output.len()) {
            let (stream, data) = process.output[self.offset].clone();
            self.offset += 1;
            let data = if self.timestamps {
                let mut stamped = BytesMut::from("1970-01-01T00:00:00.000000000Z ");
                stamped.put_slice(&data);
                stamped.freeze()
            } else {
                data
            };
            return Ok(Step::Chunk(to_chunk(tty, state.framed, stream, data)));
        }
        if self.follow && !finished {
            Ok(Step::Wait)
        } else {
            Ok(Step::End)
        }
    }

    fn into_stream(self) -> RuntimeStream<OutputChunk> {
        stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            loop {
                match cursor.step() {
                    Ok(Step::Chunk(chunk)) => return Some((Ok(chunk), Some(cursor))),
                    Ok(Step::Wait) => tokio::time::sleep(POLL_INTERVAL).await,
                    Ok(Step::End) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }
}

/// attach / exec の標準入力
struct MockInput {
    state: Arc<Mutex<MockState>>,
    target: Target,
}

impl MockInput {
    fn with_process<F>(&self, f: F) -> std::io::Result<()>
    where
        F: FnOnce(&mut Process, bool) -> bool,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("mutex poisoned: {e}")))?;
        match &self.target {
            Target::Container(id) => {
                if let Some(c) = state.containers.get_mut(id) {
                    let is_cat = c.spec.command.first().map(String::as_str) == Some("cat");
                    if f(&mut c.process, is_cat) {
                        c.status = ContainerStatus::Exited;
                        c.exit_code = 0;
                    }
                }
            }
            Target::Exec(id) => {
                if let Some(e) = state.execs.get_mut(id) {
                    let is_cat = e.spec.command.first().map(String::as_str) == Some("cat");
                    if f(&mut e.process, is_cat) {
                        e.running = false;
                        e.exit_code = Some(0);
                    }
                }
            }
        }
        Ok(())
    }
}

impl AsyncWrite for MockInput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = self.with_process(|process, is_cat| {
            process.stdin.put_slice(buf);
            if is_cat {
                process
                    .output
                    .push((Stream::Stdout, Bytes::copy_from_slice(buf)));
            }
            false
        });
        Poll::Ready(result.map(|_| buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // cat は stdin が閉じたら終了する
        Poll::Ready(self.with_process(|_, is_cat| is_cat))
    }
}

/// テスト用のインメモリランタイム
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_port: FIRST_EPHEMERAL_PORT,
                ..Default::default()
            })),
            events,
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        lock(&self.state)
    }

    fn emit(&self, kind: &str, action: &str, id: &str, attributes: HashMap<String, String>) {
        // 購読者がいなければ捨てる
        let _ = self.events.send(RuntimeEvent {
            time_nanos: now_nanos(),
            kind: kind.to_string(),
            action: action.to_string(),
            id: id.to_string(),
            attributes,
        });
    }

    fn container_event(&self, action: &str, container: &MockContainer) {
        let mut attributes = container.spec.labels.clone();
        attributes.insert("name".to_string(), container.spec.name.clone());
        attributes.insert("image".to_string(), container.spec.image.clone());
        self.emit("container", action, &container.id, attributes);
    }

    fn record(&self, call: Call) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(call);
        }
    }

    // --- テスト用の操作 ---

    /// ローカルにイメージを置く
    pub fn add_image(&self, reference: &str) {
        if let Ok(mut state) = self.state.lock() {
            let id = state.next_id("sha256:");
            state.images.insert(
                normalize_image(reference),
                ImageInfo {
                    id,
                    repo_digests: Vec::new(),
                    labels: HashMap::new(),
                },
            );
        }
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.images.contains_key(&normalize_image(reference)))
            .unwrap_or(false)
    }

    /// レジストリに存在しないイメージとして扱う
    pub fn set_pull_missing(&self, reference: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.pull_missing.insert(normalize_image(reference));
        }
    }

    /// ビルドを失敗させる
    pub fn set_build_failure(&self, tag: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.build_failures.insert(normalize_image(tag));
        }
    }

    /// 起動後のヘルス状態を固定する（既存コンテナにも反映）
    pub fn set_health(&self, name: &str, health: HealthStatus) {
        if let Ok(mut state) = self.state.lock() {
            state.health_overrides.insert(name.to_string(), health);
            if let Ok(container) = state.container_mut(name)
                && container.status.is_running()
            {
                container.health = health;
            }
        }
    }

    /// exec の終了コードを報告しない（古いデーモンの挙動）
    pub fn hide_exec_exit_codes(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.hide_exec_exit_codes = true;
        }
    }

    /// 非 TTY 出力を多重化フレームのまま返す
    pub fn set_framed(&self, framed: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.framed = framed;
        }
    }

    /// 実行中のコンテナに 1 行出力させる
    pub fn emit_line(&self, name: &str, line: &str) {
        if let Ok(mut state) = self.state.lock()
            && let Ok(container) = state.container_mut(name)
        {
            container.process.line(Stream::Stdout, line);
        }
    }

    /// コンテナを自発的に終了させる
    pub fn exit_container(&self, name: &str, code: i64) {
        let snapshot = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let Ok(container) = state.container_mut(name) else {
                return;
            };
            container.status = ContainerStatus::Exited;
            container.exit_code = code;
            container.health = HealthStatus::None;
            let mut attributes = container.spec.labels.clone();
            attributes.insert("name".to_string(), container.spec.name.clone());
            attributes.insert("exitCode".to_string(), code.to_string());
            (container.id.clone(), attributes)
        };
        self.emit("container", "die", &snapshot.0, snapshot.1);
    }

    /// コンテナ内にファイルを置く
    pub fn put_file(&self, name: &str, path: &str, contents: &[u8]) {
        if let Ok(mut state) = self.state.lock()
            && let Ok(container) = state.container_mut(name)
        {
            container
                .files
                .insert(path.to_string(), Bytes::copy_from_slice(contents));
        }
    }

    /// コンテナ内のファイルを読む
    pub fn file(&self, name: &str, path: &str) -> Option<Bytes> {
        let state = self.state.lock().ok()?;
        state.container(name).ok()?.files.get(path).cloned()
    }

    /// 記録された呼び出し
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    /// 全コンテナ名（作成順）
    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                let mut containers: Vec<_> = s.containers.values().collect();
                containers.sort_by_key(|c| c.created);
                containers.iter().map(|c| c.spec.name.clone()).collect()
            })
            .unwrap_or_default()
    }

    pub fn running_names(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .map(|s| {
                s.containers
                    .values()
                    .filter(|c| c.status == ContainerStatus::Running)
                    .map(|c| c.spec.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn network_names(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .map(|s| s.networks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_names(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .map(|s| s.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn start_locked(&self, state: &mut MockState, key: &str) -> Result<()> {
        let id = state
            .find_id(key)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, key))?;

        // 公開ポートの衝突確認
        let wanted: Vec<PortBindingSpec> = state.containers[&id].spec.ports.clone();
        for port in wanted.iter().filter(|p| p.host_port.is_some()) {
            let taken = state.containers.values().any(|other| {
                other.id != id
                    && other.status.is_running()
                    && other.ports.iter().any(|p| {
                        p.host_port == port.host_port && p.protocol == port.protocol
                    })
            });
            if taken {
                let host_port = port.host_port.unwrap_or_default();
                return Err(ComposeError::conflict(
                    format!("host port {}/{}", host_port, port.protocol),
                    format!(
                        "Bind for 0.0.0.0:{} failed: port is already allocated",
                        host_port
                    ),
                ));
            }
        }

        let mut ports = Vec::new();
        for port in &wanted {
            let host_port = match port.host_port {
                Some(p) => p,
                None => {
                    state.next_port += 1;
                    state.next_port
                }
            };
            ports.push(PublishedPort {
                host_ip: port.host_ip.clone(),
                host_port: Some(host_port),
                container_port: port.container_port,
                protocol: port.protocol.clone(),
            });
        }

        let health_override = state.health_overrides.get(&state.containers[&id].spec.name).copied();
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, key))?;
        container.ports = ports;
        container.status = ContainerStatus::Running;
        container.health = match (health_override, container.has_healthcheck()) {
            (Some(health), _) => health,
            (None, true) => HealthStatus::Healthy,
            (None, false) => HealthStatus::None,
        };
        let command = container.spec.command.clone();
        let open_stdin = container.spec.open_stdin;
        if let Some(code) = run_script(&command, &mut container.process, open_stdin) {
            container.status = ContainerStatus::Exited;
            container.exit_code = code;
            container.health = HealthStatus::None;
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn info(&self) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            name: "mock".to_string(),
            server_version: "0.0.0-mock".to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: 1,
            memory: 0,
        })
    }

    async fn list_containers(
        &self,
        filter: &ListFilter,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let state = self.state()?;
        let mut containers: Vec<ContainerSummary> = state
            .containers
            .values()
            .filter(|c| all || c.status.is_running())
            .filter(|c| filter.matches(&c.spec.name, &c.spec.labels))
            .map(MockContainer::summary)
            .collect();
        containers.sort_by_key(|c| c.created);
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        Ok(self.state()?.container(id)?.details())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state()?;
        state.calls.push(Call::CreateContainer(spec.name.clone()));

        if state.find_id(&spec.name).is_some() {
            return Err(ComposeError::conflict(
                format!("container '{}'", spec.name),
                "name is already in use",
            ));
        }
        if !state.images.contains_key(&normalize_image(&spec.image)) {
            return Err(ComposeError::not_found(ResourceKind::Image, &spec.image));
        }
        for attachment in &spec.networks {
            if !state.networks.contains_key(&attachment.network) {
                return Err(ComposeError::not_found(
                    ResourceKind::Network,
                    &attachment.network,
                ));
            }
        }

        let id = state.next_id("");
        let created = state.counter as i64;
        let container = MockContainer {
            id: id.clone(),
            spec: spec.clone(),
            status: ContainerStatus::Created,
            health: HealthStatus::None,
            exit_code: 0,
            created,
            networks: spec
                .networks
                .iter()
                .map(|n| (n.network.clone(), n.aliases.clone()))
                .collect(),
            ports: Vec::new(),
            process: Process::default(),
            files: BTreeMap::new(),
            dirs: ["/", "/tmp"].iter().map(|d| d.to_string()).collect(),
        };
        for attachment in &spec.networks {
            if let Some(network) = state.networks.get_mut(&attachment.network) {
                network.containers.push(id.clone());
            }
        }
        self.container_event("create", &container);
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state()?;
        let name = state.container(id)?.spec.name.clone();
        state.calls.push(Call::StartContainer(name));
        if state.container(id)?.status.is_running() {
            return Ok(());
        }
        self.start_locked(&mut state, id)?;
        let container = state.container(id)?;
        self.container_event("start", container);
        if container.status == ContainerStatus::Exited {
            self.container_event("die", container);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        let was_running = container.status.is_running();
        if was_running {
            container.status = ContainerStatus::Exited;
            container.exit_code = 0;
            container.health = HealthStatus::None;
        }
        let container = state.container(id)?;
        if was_running {
            self.container_event("stop", container);
        }
        state.calls.push(Call::StopContainer { name, timeout });
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        if !container.status.is_running() {
            return Err(ComposeError::conflict(
                format!("container '{}'", name),
                "container is not running",
            ));
        }
        container.status = ContainerStatus::Exited;
        container.exit_code = 137;
        container.health = HealthStatus::None;
        let container = state.container(id)?;
        self.container_event("kill", container);
        state.calls.push(Call::KillContainer {
            name,
            signal: signal.to_string(),
        });
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        if container.status != ContainerStatus::Running {
            return Err(ComposeError::conflict(
                format!("container '{}'", name),
                "container is not running",
            ));
        }
        container.status = ContainerStatus::Paused;
        let container = state.container(id)?;
        self.container_event("pause", container);
        state.calls.push(Call::PauseContainer(name));
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        if container.status != ContainerStatus::Paused {
            return Err(ComposeError::conflict(
                format!("container '{}'", name),
                "container is not paused",
            ));
        }
        container.status = ContainerStatus::Running;
        let container = state.container(id)?;
        self.container_event("unpause", container);
        state.calls.push(Call::UnpauseContainer(name));
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        container.status = ContainerStatus::Exited;
        self.start_locked(&mut state, id)?;
        let container = state.container(id)?;
        self.container_event("restart", container);
        state.calls.push(Call::RestartContainer(name));
        Ok(())
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container(id)?;
        let name = container.spec.name.clone();
        if container.status.is_running() && !options.force {
            return Err(ComposeError::Forbidden(format!(
                "cannot remove running container '{}' without force",
                name
            )));
        }
        let cid = container.id.clone();
        self.container_event("destroy", container);
        state.containers.remove(&cid);
        for network in state.networks.values_mut() {
            network.containers.retain(|c| c != &cid);
        }
        state.calls.push(Call::RemoveContainer(name));
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        loop {
            {
                let state = self.state()?;
                let container = state.container(id)?;
                if matches!(
                    container.status,
                    ContainerStatus::Exited | ContainerStatus::Dead
                ) {
                    return Ok(container.exit_code);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.find_id(new_name).is_some() {
            return Err(ComposeError::conflict(
                format!("container '{}'", new_name),
                "name is already in use",
            ));
        }
        let container = state.container_mut(id)?;
        let from = std::mem::replace(&mut container.spec.name, new_name.to_string());
        let container = state.container(id)?;
        self.container_event("rename", container);
        state.calls.push(Call::RenameContainer {
            from,
            to: new_name.to_string(),
        });
        Ok(())
    }

    async fn resize_container(&self, id: &str, _size: TtySize) -> Result<()> {
        self.state()?.container(id)?;
        Ok(())
    }

    async fn attach_container(
        &self,
        id: &str,
        options: &AttachOptions,
    ) -> Result<AttachedStreams> {
        let state = self.state()?;
        let container = state.container(id)?;
        let target = Target::Container(container.id.clone());
        let offset = if options.logs {
            0
        } else {
            container.process.output.len()
        };
        let input: Option<InputSink> = if options.stdin {
            Some(Box::pin(MockInput {
                state: self.state.clone(),
                target: target.clone(),
            }))
        } else {
            None
        };
        let output = Cursor {
            state: self.state.clone(),
            target,
            offset,
            follow: true,
            timestamps: false,
            until: None,
        }
        .into_stream();
        Ok(AttachedStreams { output, input })
    }

    fn container_logs(&self, id: &str, options: &LogOptions) -> RuntimeStream<OutputChunk> {
        let resolved = match self.state() {
            Ok(state) => state
                .container(id)
                .map(|c| (c.id.clone(), c.process.output.len())),
            Err(e) => Err(e),
        };
        let (cid, len) = match resolved {
            Ok(found) => found,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let offset = match options.tail {
            Tail::All => 0,
            Tail::Lines(n) => len.saturating_sub(n as usize),
        };
        Cursor {
            state: self.state.clone(),
            target: Target::Container(cid),
            offset,
            follow: options.follow,
            timestamps: options.timestamps,
            until: if options.follow { None } else { Some(len) },
        }
        .into_stream()
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        let mut state = self.state()?;
        let target = state.container(container)?;
        let name = target.spec.name.clone();
        if target.status != ContainerStatus::Running {
            return Err(ComposeError::conflict(
                format!("container '{}'", name),
                "container is not running",
            ));
        }
        let cid = target.id.clone();
        state.calls.push(Call::CreateExec {
            container: name,
            command: spec.command.clone(),
        });
        let id = state.next_id("exec-");
        state.execs.insert(
            id.clone(),
            MockExec {
                container: cid,
                spec: spec.clone(),
                running: false,
                exit_code: None,
                process: Process::default(),
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, _tty: bool) -> Result<AttachedStreams> {
        let mut state = self.state()?;
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Exec, exec_id))?;
        let command = exec.spec.command.clone();
        match run_script(&command, &mut exec.process, exec.spec.stdin) {
            Some(code) => {
                exec.running = false;
                exec.exit_code = Some(code);
            }
            None if command.first().map(String::as_str) == Some("cat") => {
                exec.running = true;
            }
            // その他のコマンドは即座に正常終了したものとみなす
            None => {
                exec.running = false;
                exec.exit_code = Some(0);
            }
        }
        let target = Target::Exec(exec_id.to_string());
        let input: Option<InputSink> = if exec.spec.stdin {
            Some(Box::pin(MockInput {
                state: self.state.clone(),
                target: target.clone(),
            }))
        } else {
            None
        };
        let output = Cursor {
            state: self.state.clone(),
            target,
            offset: 0,
            follow: true,
            timestamps: false,
            until: None,
        }
        .into_stream();
        Ok(AttachedStreams { output, input })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let state = self.state()?;
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Exec, exec_id))?;
        if !state.containers.contains_key(&exec.container) {
            return Err(ComposeError::not_found(ResourceKind::Container, &exec.container));
        }
        Ok(ExecState {
            running: exec.running,
            exit_code: exec.exit_code.filter(|_| !state.hide_exec_exit_codes),
        })
    }

    async fn resize_exec(&self, exec_id: &str, _size: TtySize) -> Result<()> {
        let state = self.state()?;
        if !state.execs.contains_key(exec_id) {
            return Err(ComposeError::not_found(ResourceKind::Exec, exec_id));
        }
        Ok(())
    }

    async fn copy_to_container(&self, id: &str, path: &str, archive: Bytes) -> Result<()> {
        let mut state = self.state()?;
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        let base = path.trim_end_matches('/');
        if !container.dirs.contains(if base.is_empty() { "/" } else { base }) {
            return Err(ComposeError::not_found(ResourceKind::Path, path));
        }

        let mut tar = tar::Archive::new(&archive[..]);
        let entries = tar
            .entries()
            .map_err(|e| ComposeError::runtime_with("invalid archive", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ComposeError::runtime_with("invalid archive", e))?;
            let entry_path = entry
                .path()
                .map_err(|e| ComposeError::runtime_with("invalid archive", e))?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let full = format!("{}/{}", base, entry_path);
            if entry.header().entry_type().is_dir() {
                container.dirs.insert(full);
            } else {
                let mut data = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut data)
                    .map_err(|e| ComposeError::runtime_with("invalid archive", e))?;
                container.files.insert(full, Bytes::from(data));
            }
        }
        state.calls.push(Call::CopyToContainer {
            container: name,
            path: path.to_string(),
        });
        Ok(())
    }

    fn copy_from_container(&self, id: &str, path: &str) -> RuntimeStream<Bytes> {
        let result = (|| -> Result<Bytes> {
            let state = self.state()?;
            let container = state.container(id)?;
            let path = path.trim_end_matches('/');
            let name = path.rsplit('/').next().unwrap_or(path);

            let mut builder = tar::Builder::new(Vec::new());
            let mut append = |entry_name: &str, data: &[u8]| -> Result<()> {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, entry_name, data)
                    .map_err(|e| ComposeError::runtime_with("failed to build archive", e))
            };

            if let Some(data) = container.files.get(path) {
                append(name, data)?;
            } else {
                let prefix = format!("{}/", path);
                let children: Vec<_> = container
                    .files
                    .iter()
                    .filter(|(p, _)| p.starts_with(&prefix))
                    .collect();
                if children.is_empty() && !container.dirs.contains(path) {
                    return Err(ComposeError::not_found(ResourceKind::Path, path));
                }
                for (child, data) in children {
                    let relative = &child[prefix.len()..];
                    append(&format!("{}/{}", name, relative), data)?;
                }
            }
            let data = builder
                .into_inner()
                .map_err(|e| ComposeError::runtime_with("failed to build archive", e))?;
            Ok(Bytes::from(data))
        })();
        stream::once(async move { result }).boxed()
    }

    async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat> {
        let state = self.state()?;
        let container = state.container(id)?;
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();

        if let Some(data) = container.files.get(trimmed) {
            return Ok(PathStat {
                name,
                size: data.len() as u64,
                mode: 0o644,
                is_dir: false,
                link_target: None,
            });
        }
        let prefix = format!("{}/", trimmed.trim_end_matches('/'));
        let is_dir = container.dirs.contains(trimmed)
            || container.files.keys().any(|p| p.starts_with(&prefix));
        if is_dir {
            return Ok(PathStat {
                name,
                size: 0,
                mode: 0o755,
                is_dir: true,
                link_target: None,
            });
        }
        Err(ComposeError::not_found(ResourceKind::Path, path))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self
            .state()?
            .images
            .get(&normalize_image(reference))
            .cloned())
    }

    fn pull_image(
        &self,
        reference: &str,
        _auth: Option<RegistryAuth>,
    ) -> RuntimeStream<ImageProgress> {
        let reference = reference.to_string();
        let state = self.state.clone();
        stream::once(async move {
            let mut state = lock(&state)?;
            state.calls.push(Call::PullImage(reference.clone()));
            let key = normalize_image(&reference);
            if state.pull_missing.contains(&key) {
                return Err(ComposeError::not_found(ResourceKind::Image, reference));
            }
            let id = state.next_id("sha256:");
            state.images.insert(
                key,
                ImageInfo {
                    id,
                    repo_digests: Vec::new(),
                    labels: HashMap::new(),
                },
            );
            Ok(vec![
                ImageProgress {
                    status: format!("Pulling from {}", reference),
                    ..Default::default()
                },
                ImageProgress {
                    id: Some("layer0".to_string()),
                    status: "Pull complete".to_string(),
                    ..Default::default()
                },
            ])
        })
        .flat_map(|result| match result {
            Ok(events) => stream::iter(events.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
        .boxed()
    }

    fn push_image(
        &self,
        reference: &str,
        _auth: Option<RegistryAuth>,
    ) -> RuntimeStream<ImageProgress> {
        let reference = reference.to_string();
        let state = self.state.clone();
        stream::once(async move {
            let mut state = lock(&state)?;
            state.calls.push(Call::PushImage(reference.clone()));
            if !state.images.contains_key(&normalize_image(&reference)) {
                return Err(ComposeError::not_found(ResourceKind::Image, reference));
            }
            Ok(ImageProgress {
                status: "Pushed".to_string(),
                ..Default::default()
            })
        })
        .boxed()
    }

    fn build_image(&self, spec: BuildSpec) -> RuntimeStream<ImageProgress> {
        let state = self.state.clone();
        stream::once(async move {
            let mut state = lock(&state)?;
            state.calls.push(Call::BuildImage(spec.tag.clone()));
            let key = normalize_image(&spec.tag);
            if state.build_failures.contains(&key) {
                return Err(ComposeError::runtime(format!(
                    "build of '{}' failed: The command '/bin/sh -c false' returned a non-zero code: 1",
                    spec.tag
                )));
            }
            let id = state.next_id("sha256:");
            state.images.insert(
                key,
                ImageInfo {
                    id,
                    repo_digests: Vec::new(),
                    labels: spec.labels.clone(),
                },
            );
            Ok(ImageProgress {
                status: format!("Successfully tagged {}", spec.tag),
                ..Default::default()
            })
        })
        .boxed()
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> Result<()> {
        let mut state = self.state()?;
        state.calls.push(Call::RemoveImage(reference.to_string()));
        match state.images.remove(&normalize_image(reference)) {
            Some(_) => Ok(()),
            None => Err(ComposeError::not_found(ResourceKind::Image, reference)),
        }
    }

    async fn list_networks(&self, filter: &ListFilter) -> Result<Vec<NetworkInfo>> {
        Ok(self
            .state()?
            .networks
            .values()
            .filter(|n| filter.matches(&n.name, &n.labels))
            .cloned()
            .collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo> {
        self.state()?
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Network, name))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let mut state = self.state()?;
        state.calls.push(Call::CreateNetwork(spec.name.clone()));
        if state.networks.contains_key(&spec.name) {
            return Err(ComposeError::conflict(
                format!("network '{}'", spec.name),
                "network with name already exists",
            ));
        }
        let id = state.next_id("net-");
        state.networks.insert(
            spec.name.clone(),
            NetworkInfo {
                id: id.clone(),
                name: spec.name.clone(),
                driver: spec.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                labels: spec.labels.clone(),
                containers: Vec::new(),
            },
        );
        let mut attributes = spec.labels.clone();
        attributes.insert("name".to_string(), spec.name.clone());
        self.emit("network", "create", &id, attributes);
        Ok(id)
    }

    async fn connect_network(
        &self,
        container: &str,
        attachment: &NetworkAttachment,
    ) -> Result<()> {
        let mut state = self.state()?;
        let cid = state
            .find_id(container)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, container))?;
        let network = state
            .networks
            .get_mut(&attachment.network)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Network, &attachment.network))?;
        if network.containers.contains(&cid) {
            return Err(ComposeError::conflict(
                format!("network '{}'", attachment.network),
                format!("container '{}' is already attached", container),
            ));
        }
        network.containers.push(cid.clone());
        let c = state.container_mut(&cid)?;
        let name = c.spec.name.clone();
        c.networks
            .insert(attachment.network.clone(), attachment.aliases.clone());
        state.calls.push(Call::ConnectNetwork {
            network: attachment.network.clone(),
            container: name,
        });
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str, _force: bool) -> Result<()> {
        let mut state = self.state()?;
        let cid = state
            .find_id(container)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Container, container))?;
        let info = state
            .networks
            .get_mut(network)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Network, network))?;
        info.containers.retain(|c| c != &cid);
        let c = state.container_mut(&cid)?;
        let name = c.spec.name.clone();
        c.networks.remove(network);
        state.calls.push(Call::DisconnectNetwork {
            network: network.to_string(),
            container: name,
        });
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        let info = state
            .networks
            .get(name)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Network, name))?;
        if !info.containers.is_empty() {
            return Err(ComposeError::Forbidden(format!(
                "network '{}' has active endpoints",
                name
            )));
        }
        let id = info.id.clone();
        let mut attributes = info.labels.clone();
        attributes.insert("name".to_string(), name.to_string());
        state.networks.remove(name);
        state.calls.push(Call::RemoveNetwork(name.to_string()));
        self.emit("network", "destroy", &id, attributes);
        Ok(())
    }

    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeInfo>> {
        Ok(self
            .state()?
            .volumes
            .values()
            .filter(|v| filter.matches(&v.name, &v.labels))
            .cloned()
            .collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        self.state()?
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Volume, name))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let mut state = self.state()?;
        state.calls.push(Call::CreateVolume(spec.name.clone()));
        // Docker と同じく既存のボリュームはそのまま返す
        if let Some(existing) = state.volumes.get(&spec.name) {
            return Ok(existing.clone());
        }
        let info = VolumeInfo {
            name: spec.name.clone(),
            driver: spec.driver.clone().unwrap_or_else(|| "local".to_string()),
            labels: spec.labels.clone(),
            mountpoint: format!("/var/lib/docker/volumes/{}/_data", spec.name),
        };
        state.volumes.insert(spec.name.clone(), info.clone());
        let mut attributes = spec.labels.clone();
        attributes.insert("name".to_string(), spec.name.clone());
        self.emit("volume", "create", &spec.name, attributes);
        Ok(info)
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> Result<()> {
        let mut state = self.state()?;
        if !state.volumes.contains_key(name) {
            return Err(ComposeError::not_found(ResourceKind::Volume, name));
        }
        if state.containers.values().any(|c| c.uses_volume(name)) {
            return Err(ComposeError::conflict(
                format!("volume '{}'", name),
                "volume is in use",
            ));
        }
        state.volumes.remove(name);
        state.calls.push(Call::RemoveVolume(name.to_string()));
        Ok(())
    }

    fn events(&self, filter: &ListFilter) -> RuntimeStream<RuntimeEvent> {
        let receiver = self.events.subscribe();
        let filter = filter.clone();
        stream::unfold((receiver, filter), |(mut receiver, filter)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let name = event.attributes.get("name").cloned().unwrap_or_default();
                        if filter.matches(&name, &event.attributes) {
                            return Some((Ok(event), (receiver, filter)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
