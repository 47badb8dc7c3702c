//! FleetCompose のエンジン
//!
//! プロジェクト定義とランタイムの観測状態を突き合わせて収束させる。
//!
//! - [`convergence`]: サービスごとの差分計画と適用
//! - [`scheduler`]: 依存グラフに沿った並行実行
//! - [`iomux`]: コンテナ出力の多重化と対話的な接続
//! - [`progress`]: 進捗通知
//! - [`compose`]: up / down / run / exec などの操作

pub mod compose;
pub mod convergence;
pub mod iomux;
pub mod progress;
pub mod scheduler;

pub use compose::*;
pub use convergence::{ConvergeOptions, RecreatePolicy, Reconciler, ReplicaAction, ServicePlan};
pub use iomux::{CaptureBuffer, DetachKeys, InputSource, Output};
pub use progress::{
    EventKind, LineFormat, LineProgress, NoopProgress, ProgressEvent, ProgressSink,
    ProgressStatus, RecordingProgress, TimedProgress, TtyProgress,
};
pub use scheduler::{DependencyScheduler, Direction, FailurePolicy};
