//! 複数コンテナの出力を 1 つの端末にまとめる

use super::color::Prefixer;
use super::frame::{FrameDemuxer, StreamKind};
use super::lines::LineBuffer;
use super::output::Output;
use fleetcompose_container::{OutputChunk, RuntimeStream};
use fleetcompose_core::AggregateError;
use futures_util::StreamExt;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 名前付きの出力ストリーム
pub struct LogSource {
    pub name: String,
    pub stream: RuntimeStream<OutputChunk>,
}

impl LogSource {
    pub fn new(name: impl Into<String>, stream: RuntimeStream<OutputChunk>) -> Self {
        Self {
            name: name.into(),
            stream,
        }
    }
}

/// 終了時の状況
#[derive(Debug, Default)]
pub struct MuxReport {
    pub canceled: bool,
    /// 途中で失敗したストリーム
    pub failures: AggregateError,
}

/// 行単位でプレフィックスを付けて書き出すマルチプレクサ
pub struct LogMux {
    output: Arc<Output>,
    no_color: bool,
    no_prefix: bool,
}

impl LogMux {
    pub fn new(output: Arc<Output>) -> Self {
        Self {
            output,
            no_color: false,
            no_prefix: false,
        }
    }

    pub fn no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    pub fn no_prefix(mut self, no_prefix: bool) -> Self {
        self.no_prefix = no_prefix;
        self
    }

    /// 全ストリームが閉じるか取り消されるまで読み続ける
    ///
    /// 1 つのストリームのエラーは他のストリームを止めない。
    pub async fn run(&self, sources: Vec<LogSource>, cancel: &CancellationToken) -> MuxReport {
        let prefixer = Prefixer::new(sources.iter().map(|s| s.name.as_str()), self.no_color);
        let pumps = sources.into_iter().enumerate().map(|(index, source)| {
            let prefix = if self.no_prefix {
                String::new()
            } else {
                prefixer.prefix(&source.name, index)
            };
            self.pump(source, prefix, cancel)
        });

        let mut report = MuxReport::default();
        for (name, result) in join_all(pumps).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_canceled() => report.canceled = true,
                Err(e) => {
                    warn!(source = %name, error = %e, "Log stream failed");
                    report.failures.push(name, e);
                }
            }
        }
        report.canceled |= cancel.is_cancelled();
        report
    }

    async fn pump(
        &self,
        source: LogSource,
        prefix: String,
        cancel: &CancellationToken,
    ) -> (String, fleetcompose_core::Result<()>) {
        let LogSource { name, mut stream } = source;
        let mut demux = FrameDemuxer::new();
        let mut stdout = LineBuffer::new();
        let mut stderr = LineBuffer::new();

        let result = loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break Err(fleetcompose_core::ComposeError::Canceled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    for (kind, data) in demux.split(chunk) {
                        let buffer = match kind {
                            StreamKind::Stdout => &mut stdout,
                            StreamKind::Stderr => &mut stderr,
                        };
                        for line in buffer.push(&data) {
                            self.output.write_prefixed(kind, &prefix, &line);
                        }
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        // 取り消し時も途中の行は捨てない
        if let Some(rest) = stdout.flush() {
            self.output.write_prefixed(StreamKind::Stdout, &prefix, &rest);
        }
        if let Some(rest) = stderr.flush() {
            self.output.write_prefixed(StreamKind::Stderr, &prefix, &rest);
        }
        debug!(source = %name, "Log stream closed");
        (name, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fleetcompose_core::ComposeError;
    use futures_util::stream;

    fn chunks(items: Vec<fleetcompose_core::Result<OutputChunk>>) -> RuntimeStream<OutputChunk> {
        stream::iter(items).boxed()
    }

    fn stdout(s: &'static str) -> fleetcompose_core::Result<OutputChunk> {
        Ok(OutputChunk::Stdout(Bytes::from_static(s.as_bytes())))
    }

    #[tokio::test]
    async fn test_prefixes_lines_per_source() {
        let (output, out, _) = Output::capture();
        let mux = LogMux::new(Arc::new(output)).no_color(true);
        let report = mux
            .run(
                vec![
                    LogSource::new("web", chunks(vec![stdout("hel"), stdout("lo\nbye")])),
                    LogSource::new("db", chunks(vec![stdout("ready\n")])),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.canceled);
        assert!(report.failures.is_empty());
        let text = out.contents();
        assert!(text.contains("web  | hello\n"));
        assert!(text.contains("web  | bye\n"));
        assert!(text.contains("db   | ready\n"));
    }

    #[tokio::test]
    async fn test_stream_error_does_not_stop_others() {
        let (output, out, _) = Output::capture();
        let mux = LogMux::new(Arc::new(output)).no_color(true);
        let report = mux
            .run(
                vec![
                    LogSource::new(
                        "web",
                        chunks(vec![Err(ComposeError::runtime("connection reset"))]),
                    ),
                    LogSource::new("db", chunks(vec![stdout("a\n"), stdout("b\n")])),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures.failures()[0].service, "web");
        assert!(out.contents().contains("db   | b\n"));
    }

    #[tokio::test]
    async fn test_cancel_flushes_partial_line() {
        let (output, out, _) = Output::capture();
        let mux = LogMux::new(Arc::new(output)).no_color(true);
        let endless = stream::iter(vec![stdout("partial")])
            .chain(stream::pending())
            .boxed();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = mux.run(vec![LogSource::new("web", endless)], &cancel).await;
        assert!(report.canceled);
        assert_eq!(out.contents(), "web  | partial\n");
    }

    #[tokio::test]
    async fn test_multiplexed_stderr() {
        let (output, out, err) = Output::capture();
        let mux = LogMux::new(Arc::new(output)).no_prefix(true);
        let framed = fleetcompose_container::mock::encode_frame(2, b"warn\n");
        mux.run(
            vec![LogSource::new(
                "web",
                chunks(vec![Ok(OutputChunk::Multiplexed(framed))]),
            )],
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(err.contents(), "warn\n");
        assert!(out.contents().is_empty());
    }
}
