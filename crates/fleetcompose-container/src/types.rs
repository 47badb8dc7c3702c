//! ランタイムとやり取りする値の型
//!
//! 特定のランタイム実装に依存しない表現で、Docker 実装とモック実装の両方が使う。

use bytes::Bytes;
use fleetcompose_core::MountKind;
use fleetcompose_core::error::Result;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// ランタイムから流れてくる結果付きストリーム
pub type RuntimeStream<T> = BoxStream<'static, Result<T>>;

/// コンテナへの入力（attach / exec の stdin）
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// コンテナの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// プロセスが生きている状態か
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Restarting)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ヘルスチェックの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthStatus {
    /// ヘルスチェック未設定
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// 公開ポート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl fmt::Display for PublishedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_port {
            Some(host_port) => write!(
                f,
                "{}:{}->{}/{}",
                self.host_ip.as_deref().unwrap_or("0.0.0.0"),
                host_port,
                self.container_port,
                self.protocol
            ),
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

/// 一覧取得で得られるコンテナ情報
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    /// 先頭の `/` を除いた名前
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
    /// `Up 5 minutes` などランタイムの表記
    pub status_text: String,
    pub created: i64,
    pub ports: Vec<PublishedPort>,
    pub networks: Vec<String>,
}

/// コンテナのマウント情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub kind: MountKind,
    /// 名前付きボリュームの名前
    pub name: Option<String>,
    pub source: Option<String>,
    pub destination: String,
    pub read_only: bool,
}

/// inspect で得られるコンテナ詳細
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub exit_code: i64,
    pub tty: bool,
    pub open_stdin: bool,
    pub ports: Vec<PublishedPort>,
    /// 接続中のネットワーク名 → エイリアス
    pub networks: BTreeMap<String, Vec<String>>,
    pub mounts: Vec<MountInfo>,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// 一覧取得のフィルタ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// `key=value` または `key`
    pub labels: Vec<String>,
    pub names: Vec<String>,
}

impl ListFilter {
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push(format!("{}={}", key, value));
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.names.push(name.to_string());
        self
    }

    /// ランタイムのフィルタ表現
    pub fn to_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.labels.is_empty() {
            filters.insert("label".to_string(), self.labels.clone());
        }
        if !self.names.is_empty() {
            filters.insert("name".to_string(), self.names.clone());
        }
        filters
    }

    /// ラベル集合がフィルタに合致するか（モックやクライアント側の絞り込み用）
    pub fn matches(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        let labels_ok = self.labels.iter().all(|f| match f.split_once('=') {
            Some((k, v)) => labels.get(k).map(|x| x == v).unwrap_or(false),
            None => labels.contains_key(f),
        });
        let names_ok = self.names.is_empty() || self.names.iter().any(|n| n == name);
        labels_ok && names_ok
    }
}

/// ポートの公開設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindingSpec {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: Option<String>,
    /// None は空きポートの自動割り当て
    pub host_port: Option<u16>,
}

impl PortBindingSpec {
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// マウント設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

/// ネットワーク接続設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// ランタイム上のネットワーク名
    pub network: String,
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

/// 再起動ポリシー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSpec {
    pub name: String,
    pub max_retries: Option<i64>,
}

/// ヘルスチェック（期間はナノ秒）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval: Option<i64>,
    pub timeout: Option<i64>,
    pub retries: Option<i64>,
    pub start_period: Option<i64>,
}

/// リソース制限
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    pub nano_cpus: Option<i64>,
    pub memory: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub pids_limit: Option<i64>,
}

/// コンテナ作成仕様
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    /// `KEY=VALUE`（キー順）
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub hostname: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub ports: Vec<PortBindingSpec>,
    pub mounts: Vec<MountSpec>,
    pub volumes_from: Vec<String>,
    /// 最初の要素は作成時に、残りは作成後に接続する
    pub networks: Vec<NetworkAttachment>,
    pub network_mode: Option<String>,
    pub restart: Option<RestartSpec>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub resources: ResourceLimits,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<i64>,
    pub init: Option<bool>,
    pub privileged: bool,
    pub read_only: bool,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// コンテナ削除オプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    /// 匿名ボリュームも削除する
    pub volumes: bool,
}

/// TTY のサイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySize {
    pub rows: u16,
    pub cols: u16,
}

/// コンテナ出力の 1 チャンク
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
    /// TTY の生出力
    Console(Bytes),
    /// 8 バイトヘッダで多重化されたままのストリーム
    Multiplexed(Bytes),
}

/// attach オプション
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// 過去のログも流す
    pub logs: bool,
}

/// attach / exec の入出力
pub struct AttachedStreams {
    pub output: RuntimeStream<OutputChunk>,
    pub input: Option<InputSink>,
}

impl fmt::Debug for AttachedStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedStreams")
            .field("input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

/// ログの末尾指定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tail {
    #[default]
    All,
    Lines(u64),
}

impl Tail {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("all") {
            Some(Self::All)
        } else {
            s.parse().ok().map(Self::Lines)
        }
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Lines(n) => write!(f, "{}", n),
        }
    }
}

/// ログ取得オプション
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    /// UNIX 秒
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub timestamps: bool,
    pub tail: Tail,
}

/// exec 作成仕様
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub stdin: bool,
    pub privileged: bool,
}

/// exec の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// コンテナ内パスの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub link_target: Option<String>,
}

/// イメージ情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub repo_digests: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// レジストリ認証情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_token: Option<String>,
    pub server_address: Option<String>,
}

/// pull / push / build の進捗
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProgress {
    /// レイヤ ID など
    pub id: Option<String>,
    pub status: String,
    pub progress: Option<String>,
    pub current: Option<i64>,
    pub total: Option<i64>,
}

/// ビルド仕様
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    pub tag: String,
    /// tar.gz 化したビルドコンテキスト
    pub context: Bytes,
    /// コンテキスト内の Dockerfile パス
    pub dockerfile: String,
    pub args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub pull: bool,
}

/// IPAM プール
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamPoolSpec {
    pub subnet: Option<String>,
    pub ip_range: Option<String>,
    pub gateway: Option<String>,
}

/// ネットワーク作成仕様
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub attachable: bool,
    pub internal: bool,
    pub enable_ipv6: bool,
    pub ipam_driver: Option<String>,
    pub ipam_pools: Vec<IpamPoolSpec>,
}

/// ネットワーク情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
    /// 接続中のコンテナ ID
    pub containers: Vec<String>,
}

/// ボリューム作成仕様
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: Option<String>,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// ボリューム情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
    pub mountpoint: String,
}

/// ランタイムイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// UNIX ナノ秒
    pub time_nanos: i64,
    /// container / network / volume / image
    pub kind: String,
    pub action: String,
    pub id: String,
    pub attributes: HashMap<String, String>,
}

/// ランタイム情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub name: String,
    pub server_version: String,
    pub os: String,
    pub arch: String,
    pub cpus: i64,
    pub memory: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_parse() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("EXITED"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
        assert!(ContainerStatus::Paused.is_running());
        assert!(!ContainerStatus::Created.is_running());
    }

    #[test]
    fn test_list_filter_matches() {
        let filter = ListFilter::default()
            .label("compose.project", "demo")
            .label("compose.oneoff", "false");
        let mut labels = HashMap::new();
        labels.insert("compose.project".to_string(), "demo".to_string());
        assert!(!filter.matches("demo_web_1", &labels));
        labels.insert("compose.oneoff".to_string(), "false".to_string());
        assert!(filter.matches("demo_web_1", &labels));

        let filters = filter.to_filters();
        assert_eq!(filters["label"].len(), 2);
        assert!(!filters.contains_key("name"));
    }

    #[test]
    fn test_tail_parse() {
        assert_eq!(Tail::parse("all"), Some(Tail::All));
        assert_eq!(Tail::parse("10"), Some(Tail::Lines(10)));
        assert_eq!(Tail::parse("ten"), None);
        assert_eq!(Tail::Lines(5).to_string(), "5");
    }

    #[test]
    fn test_published_port_display() {
        let port = PublishedPort {
            host_ip: None,
            host_port: Some(8080),
            container_port: 80,
            protocol: "tcp".into(),
        };
        assert_eq!(port.to_string(), "0.0.0.0:8080->80/tcp");
    }
}
