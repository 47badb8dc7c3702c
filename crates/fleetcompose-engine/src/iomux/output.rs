//! 呼び出し元の stdout / stderr
//!
//! 複数タスクから書き込まれるため、1 回の書き込み（1 行）単位でロックする。

use super::frame::StreamKind;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::warn;

type Writer = Mutex<Box<dyn Write + Send>>;

pub struct Output {
    stdout: Writer,
    stderr: Writer,
}

impl Default for Output {
    fn default() -> Self {
        Self::stdio()
    }
}

impl Output {
    pub fn new(stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        Self {
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
        }
    }

    pub fn stdio() -> Self {
        Self::new(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    /// メモリ上のバッファに書き込む（テスト用）
    pub fn capture() -> (Self, CaptureBuffer, CaptureBuffer) {
        let stdout = CaptureBuffer::default();
        let stderr = CaptureBuffer::default();
        (
            Self::new(Box::new(stdout.clone()), Box::new(stderr.clone())),
            stdout,
            stderr,
        )
    }

    pub fn write(&self, kind: StreamKind, data: &[u8]) {
        let writer = match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        };
        let Ok(mut writer) = writer.lock() else {
            return;
        };
        if let Err(e) = writer.write_all(data).and_then(|_| writer.flush()) {
            warn!(error = %e, "Failed to write container output");
        }
    }

    /// プレフィックスと本文を 1 回のロックで書く
    pub fn write_prefixed(&self, kind: StreamKind, prefix: &str, line: &[u8]) {
        let mut data = Vec::with_capacity(prefix.len() + line.len());
        data.extend_from_slice(prefix.as_bytes());
        data.extend_from_slice(line);
        self.write(kind, &data);
    }

    pub fn println(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.write(StreamKind::Stdout, &data);
    }
}

/// 共有バッファ
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self
            .0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
