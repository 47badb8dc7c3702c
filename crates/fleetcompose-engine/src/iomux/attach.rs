//! 対話的な接続（run / exec）
//!
//! コンテナの出力をそのまま呼び出し元に流し、ローカルの stdin をコンテナに送る。
//! TTY の場合は端末サイズの変更を Resize として伝える。

use super::detach::{DetachKeys, Scan};
use super::frame::FrameDemuxer;
use super::output::Output;
use crossterm::terminal;
use fleetcompose_container::{AttachedStreams, RuntimeClient, TtySize};
use fleetcompose_core::{ComposeError, Result};
use futures_util::StreamExt;
use std::future::pending;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// ローカル入力
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// 端末の raw モードを有効にし、Drop で必ず元に戻す
///
/// パニックで巻き戻る場合も Drop が走る。
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| ComposeError::runtime_with("failed to set terminal raw mode", e))?;
        debug!("Terminal raw mode enabled");
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Resize の送り先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeTarget {
    Container(String),
    Exec(String),
}

/// 現在の端末サイズを送る
pub async fn resize_to_terminal(runtime: &dyn RuntimeClient, target: &ResizeTarget) {
    let Ok((cols, rows)) = terminal::size() else {
        return;
    };
    let size = TtySize { rows, cols };
    let result = match target {
        ResizeTarget::Container(id) => runtime.resize_container(id, size).await,
        ResizeTarget::Exec(id) => runtime.resize_exec(id, size).await,
    };
    if let Err(e) = result {
        debug!(error = %e, "Resize failed");
    }
}

/// 接続の終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachEnd {
    /// 出力ストリームが閉じた
    Closed,
    /// デタッチキーで切り離した
    Detached,
}

/// 1 つのコンテナ（または exec）への対話的な接続
pub struct AttachSession<'a> {
    pub output: &'a Output,
    pub runtime: &'a dyn RuntimeClient,
    pub detach_keys: &'a DetachKeys,
    /// TTY の場合に Resize を送る先
    pub resize: Option<ResizeTarget>,
}

impl AttachSession<'_> {
    /// 出力が閉じる、デタッチ、取り消しのいずれかまで入出力を中継する
    pub async fn pump(
        &self,
        streams: AttachedStreams,
        stdin: Option<InputSource>,
        cancel: &CancellationToken,
    ) -> Result<AttachEnd> {
        let AttachedStreams { mut output, input } = streams;
        let mut input = input;
        let mut stdin = stdin.filter(|_| input.is_some());
        let mut matcher = self.detach_keys.matcher();
        let mut demux = FrameDemuxer::new();
        let mut buf = vec![0u8; 4096];
        let mut winch = self.window_changes();

        if let Some(target) = &self.resize {
            resize_to_terminal(self.runtime, target).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ComposeError::Canceled),
                chunk = output.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for (kind, data) in demux.split(chunk) {
                            self.output.write(kind, &data);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(AttachEnd::Closed),
                },
                read = read_some(&mut stdin, &mut buf) => match read {
                    Ok(0) => {
                        // stdin の終端をコンテナに伝える
                        if let Some(mut sink) = input.take() {
                            let _ = sink.shutdown().await;
                        }
                        stdin = None;
                    }
                    Ok(n) => {
                        let (forward, detach) = match matcher.scan(&buf[..n]) {
                            Scan::Forward(bytes) => (bytes, false),
                            Scan::Detach(bytes) => (bytes, true),
                        };
                        if let Some(sink) = input.as_mut()
                            && !forward.is_empty()
                            && let Err(e) = sink.write_all(&forward).await
                        {
                            warn!(error = %e, "Failed to forward stdin");
                            stdin = None;
                        }
                        if detach {
                            debug!("Detach sequence received");
                            return Ok(AttachEnd::Detached);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        stdin = None;
                    }
                },
                _ = next_window_change(&mut winch) => {
                    if let Some(target) = &self.resize {
                        resize_to_terminal(self.runtime, target).await;
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    fn window_changes(&self) -> Option<tokio::signal::unix::Signal> {
        use tokio::signal::unix::{SignalKind, signal};
        self.resize.as_ref()?;
        signal(SignalKind::window_change()).ok()
    }

    #[cfg(not(unix))]
    fn window_changes(&self) -> Option<()> {
        None
    }
}

async fn read_some(stdin: &mut Option<InputSource>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdin {
        Some(reader) => reader.read(buf).await,
        None => pending().await,
    }
}

#[cfg(unix)]
async fn next_window_change(winch: &mut Option<tokio::signal::unix::Signal>) {
    match winch {
        Some(signal) => {
            if signal.recv().await.is_none() {
                *winch = None;
            }
        }
        None => pending().await,
    }
}

#[cfg(not(unix))]
async fn next_window_change(_winch: &mut Option<()>) {
    pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcompose_container::{AttachOptions, ContainerSpec, MockRuntime};

    async fn container(runtime: &MockRuntime, command: &[&str], stdin: bool) -> String {
        runtime.add_image("alpine");
        runtime
            .create_container(&ContainerSpec {
                name: "demo_app_1".to_string(),
                image: "alpine".to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                open_stdin: stdin,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn attach_options(stdin: bool) -> AttachOptions {
        AttachOptions {
            stdin,
            stdout: true,
            stderr: true,
            logs: false,
        }
    }

    #[tokio::test]
    async fn test_pump_until_closed() {
        let runtime = MockRuntime::new();
        let id = container(&runtime, &["echo", "hi"], false).await;
        let streams = runtime.attach_container(&id, &attach_options(false)).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let (output, out, _) = Output::capture();
        let keys = DetachKeys::default();
        let session = AttachSession {
            output: &output,
            runtime: &runtime,
            detach_keys: &keys,
            resize: None,
        };
        let end = session
            .pump(streams, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, AttachEnd::Closed);
        assert_eq!(out.contents(), "hi\n");
    }

    #[tokio::test]
    async fn test_stdin_forwarded_and_closed() {
        let runtime = MockRuntime::new();
        let id = container(&runtime, &["cat"], true).await;
        let streams = runtime.attach_container(&id, &attach_options(true)).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let (output, out, _) = Output::capture();
        let keys = DetachKeys::default();
        let session = AttachSession {
            output: &output,
            runtime: &runtime,
            detach_keys: &keys,
            resize: None,
        };
        let stdin: InputSource = Box::new(&b"ping\n"[..]);
        let end = session
            .pump(streams, Some(stdin), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, AttachEnd::Closed);
        assert_eq!(out.contents(), "ping\n");
        assert_eq!(runtime.wait_container(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_detach_keeps_container_running() {
        let runtime = MockRuntime::new();
        let id = container(&runtime, &["cat"], true).await;
        let streams = runtime.attach_container(&id, &attach_options(true)).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let (output, _, _) = Output::capture();
        let keys = DetachKeys::default();
        let session = AttachSession {
            output: &output,
            runtime: &runtime,
            detach_keys: &keys,
            resize: None,
        };
        let stdin: InputSource = Box::new(&b"\x10\x11"[..]);
        let end = session
            .pump(streams, Some(stdin), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, AttachEnd::Detached);
        assert!(runtime.running_names().contains("demo_app_1"));
    }
}
