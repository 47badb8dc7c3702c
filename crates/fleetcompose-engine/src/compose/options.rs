//! 各操作のオプション

use crate::convergence::RecreatePolicy;
use fleetcompose_container::Tail;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// ユーザー割り込み
///
/// 1 回目のシグナルで `graceful`、2 回目で `force` が取り消される。
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    pub graceful: CancellationToken,
    pub force: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }
}

/// create / up の収束部分
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub services: Vec<String>,
    /// イメージがあってもビルドする
    pub build: bool,
    pub no_deps: bool,
    pub remove_orphans: bool,
    pub recreate: RecreatePolicy,
    /// サービスごとのレプリカ数の上書き
    pub scale: BTreeMap<String, u32>,
    /// 停止の猶予時間の上書き
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub create: CreateOptions,
    pub detach: bool,
    pub abort_on_container_exit: bool,
    /// 失敗したら実行中の他サービスも取り消し、起動済みのサービスを停止する
    pub cascade_stop: bool,
}

/// down --rmi
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveImages {
    /// image 指定の無いサービス（エンジンがビルドしたもの）のみ
    Local,
    All,
}

impl RemoveImages {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    pub remove_orphans: bool,
    pub volumes: bool,
    pub rmi: Option<RemoveImages>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    pub services: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct RmOptions {
    pub services: Vec<String>,
    /// 実行中のコンテナも削除する
    pub force: bool,
    /// 削除前に停止する
    pub stop: bool,
    /// 匿名ボリュームも削除する
    pub volumes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub service: String,
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub publish: Vec<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub rm: bool,
    pub no_deps: bool,
    /// サービス定義のポートを公開する
    pub service_ports: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub service: String,
    /// レプリカ番号（1 始まり）
    pub index: u32,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub tty: bool,
    pub interactive: bool,
    pub privileged: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            service: String::new(),
            index: 1,
            command: Vec::new(),
            env: BTreeMap::new(),
            user: None,
            workdir: None,
            tty: false,
            interactive: false,
            privileged: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub services: Vec<String>,
    pub follow: bool,
    pub tail: Tail,
    /// UNIX 秒
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub timestamps: bool,
    pub no_color: bool,
    pub no_prefix: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PsOptions {
    pub services: Vec<String>,
    /// 停止中のコンテナも含める
    pub all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventsOptions {
    pub services: Vec<String>,
    pub json: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub services: Vec<String>,
    pub no_cache: bool,
    pub pull: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub services: Vec<String>,
    pub quiet: bool,
    pub ignore_pull_failures: bool,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub source: String,
    pub destination: String,
    /// コンテナ側のレプリカ番号
    pub index: u32,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            source: String::new(),
            destination: String::new(),
            index: 1,
        }
    }
}
