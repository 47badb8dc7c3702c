use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use fleetcompose_core::error::Result;
use std::time::Duration;

/// コンテナランタイムのトレイト
///
/// エンジンはこのトレイトだけに依存し、具体的なランタイムは構築時に渡される。
/// 実装はランタイム固有のエラーを [`fleetcompose_core::ComposeError`] の分類に変換して返すこと。
///
/// ストリームを返す操作は同期メソッドで、ストリームを読み始めるまで通信しない。
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// ランタイムへの疎通確認
    async fn ping(&self) -> Result<()>;

    async fn info(&self) -> Result<RuntimeInfo>;

    // --- コンテナ ---

    /// `all = false` なら実行中のものだけ
    async fn list_containers(&self, filter: &ListFilter, all: bool)
    -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// 作成したコンテナの ID を返す
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// 猶予時間を過ぎたらランタイムが強制終了する
    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()>;

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;

    async fn pause_container(&self, id: &str) -> Result<()>;

    async fn unpause_container(&self, id: &str) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout: Option<Duration>) -> Result<()>;

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()>;

    /// コンテナの終了を待って終了コードを返す
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()>;

    async fn resize_container(&self, id: &str, size: TtySize) -> Result<()>;

    async fn attach_container(&self, id: &str, options: &AttachOptions)
    -> Result<AttachedStreams>;

    fn container_logs(&self, id: &str, options: &LogOptions) -> RuntimeStream<OutputChunk>;

    /// exec インスタンスを作成して ID を返す
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String>;

    /// exec を開始して入出力に接続する
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<AttachedStreams>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState>;

    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<()>;

    /// tar アーカイブをコンテナ内のディレクトリに展開する
    async fn copy_to_container(&self, id: &str, path: &str, archive: Bytes) -> Result<()>;

    /// コンテナ内のパスを tar アーカイブとして取り出す
    fn copy_from_container(&self, id: &str, path: &str) -> RuntimeStream<Bytes>;

    async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat>;

    // --- イメージ ---

    /// 存在しなければ None
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;

    fn pull_image(&self, reference: &str, auth: Option<RegistryAuth>)
    -> RuntimeStream<ImageProgress>;

    fn push_image(&self, reference: &str, auth: Option<RegistryAuth>)
    -> RuntimeStream<ImageProgress>;

    fn build_image(&self, spec: BuildSpec) -> RuntimeStream<ImageProgress>;

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()>;

    // --- ネットワーク ---

    async fn list_networks(&self, filter: &ListFilter) -> Result<Vec<NetworkInfo>>;

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn connect_network(
        &self,
        container: &str,
        attachment: &NetworkAttachment,
    ) -> Result<()>;

    async fn disconnect_network(&self, network: &str, container: &str, force: bool)
    -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    // --- ボリューム ---

    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeInfo>>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo>;

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()>;

    // --- イベント ---

    /// 購読開始以降のランタイムイベント
    fn events(&self, filter: &ListFilter) -> RuntimeStream<RuntimeEvent>;
}
