//! 進捗イベント
//!
//! エンジンは整形方針を持たず、構造化イベントだけを [`ProgressSink`] に送る。
//! 同じ ID のイベントは発生順に届く。ID をまたいだ順序は保証しない。

use chrono::{DateTime, Utc};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 基本ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Working,
    Done,
    Error,
}

/// 便宜上のイベント種別（基本ステータスに対応づく）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Creating,
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Removing,
    Removed,
    Pulling,
    Pulled,
    Building,
    Built,
    Pushing,
    Pushed,
    Killing,
    Killed,
    Pausing,
    Paused,
    Unpausing,
    Unpaused,
    Restarting,
    Restarted,
    Waiting,
    Healthy,
    Exited,
    Running,
    Recreate,
    Recreated,
    Copying,
    Copied,
    Skipped,
}

impl EventKind {
    pub fn status(&self) -> ProgressStatus {
        use EventKind::*;
        match self {
            Creating | Starting | Stopping | Removing | Pulling | Building | Pushing
            | Killing | Pausing | Unpausing | Restarting | Waiting | Recreate | Copying => {
                ProgressStatus::Working
            }
            Created | Started | Stopped | Removed | Pulled | Built | Pushed | Killed | Paused
            | Unpaused | Restarted | Healthy | Exited | Running | Recreated | Copied | Skipped => {
                ProgressStatus::Done
            }
        }
    }

    pub fn text(&self) -> &'static str {
        use EventKind::*;
        match self {
            Creating => "Creating",
            Created => "Created",
            Starting => "Starting",
            Started => "Started",
            Stopping => "Stopping",
            Stopped => "Stopped",
            Removing => "Removing",
            Removed => "Removed",
            Pulling => "Pulling",
            Pulled => "Pulled",
            Building => "Building",
            Built => "Built",
            Pushing => "Pushing",
            Pushed => "Pushed",
            Killing => "Killing",
            Killed => "Killed",
            Pausing => "Pausing",
            Paused => "Paused",
            Unpausing => "Unpausing",
            Unpaused => "Unpaused",
            Restarting => "Restarting",
            Restarted => "Restarted",
            Waiting => "Waiting",
            Healthy => "Healthy",
            Exited => "Exited",
            Running => "Running",
            Recreate => "Recreate",
            Recreated => "Recreated",
            Copying => "Copying",
            Copied => "Copied",
            Skipped => "Skipped",
        }
    }
}

/// 進捗イベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: ProgressStatus,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_text: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, kind: EventKind) -> Self {
        let status = kind.status();
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: None,
            status,
            text: kind.text().to_string(),
            status_text: String::new(),
            started_at: now,
            ended_at: (status != ProgressStatus::Working).then_some(now),
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: None,
            status: ProgressStatus::Error,
            text: "Error".to_string(),
            status_text: message.into(),
            started_at: now,
            ended_at: Some(now),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }
}

/// 進捗の受け手
///
/// 複数タスクから同時に呼ばれるため、実装側で同期すること。
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);

    /// 操作全体の終了時に呼ばれる
    fn finish(&self) {}
}

/// ID ごとの開始時刻を引き継いで転送する
///
/// 各イベントは生成時刻を `started_at` に持つので、完了・失敗イベントには
/// 同じ ID の最初の Working イベントの時刻を付け直す。
pub struct TimedProgress {
    inner: Arc<dyn ProgressSink>,
    started: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TimedProgress {
    pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            inner,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn key(event: &ProgressEvent) -> String {
        match &event.parent_id {
            Some(parent) => format!("{}/{}", parent, event.id),
            None => event.id.clone(),
        }
    }
}

impl ProgressSink for TimedProgress {
    fn event(&self, mut event: ProgressEvent) {
        if let Ok(mut started) = self.started.lock() {
            let key = Self::key(&event);
            match event.status {
                ProgressStatus::Working => {
                    event.started_at = *started.entry(key).or_insert(event.started_at);
                }
                ProgressStatus::Done | ProgressStatus::Error => {
                    if let Some(at) = started.remove(&key) {
                        event.started_at = at;
                    }
                }
            }
        }
        self.inner.event(event);
    }

    fn finish(&self) {
        self.inner.finish();
    }
}

/// 何もしない
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// 受け取ったイベントを保持する（テスト用）
#[derive(Debug, Default, Clone)]
pub struct RecordingProgress {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// 指定 ID のイベントのテキスト（発生順）
    pub fn texts_for(&self, id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.id == id)
            .map(|e| e.text)
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// 1 行 1 イベントで書き出す形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    Plain,
    Json,
}

/// テキストまたは JSON Lines で書き出す
pub struct LineProgress {
    format: LineFormat,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl LineProgress {
    pub fn new(format: LineFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
        }
    }

    /// 標準エラー出力へ
    pub fn stderr(format: LineFormat) -> Self {
        Self::new(format, Box::new(std::io::stderr()))
    }

    fn render(&self, event: &ProgressEvent) -> Option<String> {
        match self.format {
            LineFormat::Json => serde_json::to_string(event).ok(),
            LineFormat::Plain => {
                let id = match &event.parent_id {
                    Some(parent) => format!("{} {}", parent, event.id),
                    None => event.id.clone(),
                };
                let mut line = format!("{} {}", id, event.text);
                if !event.status_text.is_empty() {
                    line.push_str(": ");
                    line.push_str(&event.status_text);
                }
                Some(line)
            }
        }
    }
}

impl ProgressSink for LineProgress {
    fn event(&self, event: ProgressEvent) {
        let Some(line) = self.render(&event) else {
            return;
        };
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
    }

    fn finish(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

/// 端末向け（ID ごとに 1 行のスピナー）
pub struct TtyProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for TtyProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TtyProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn spinner(&self) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::with_template(" {spinner:.cyan} {msg}") {
            pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", " "]));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    fn message(event: &ProgressEvent) -> String {
        let label = match &event.parent_id {
            Some(parent) => format!("{} {}", parent.dimmed(), event.id),
            None => event.id.clone(),
        };
        let text = match event.status {
            ProgressStatus::Working => event.text.blue().to_string(),
            ProgressStatus::Done => event.text.green().to_string(),
            ProgressStatus::Error => event.text.red().to_string(),
        };
        if event.status_text.is_empty() {
            format!("{} {}", label, text)
        } else {
            format!("{} {} {}", label, text, event.status_text.dimmed())
        }
    }
}

impl ProgressSink for TtyProgress {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let key = match &event.parent_id {
            Some(parent) => format!("{}/{}", parent, event.id),
            None => event.id.clone(),
        };
        let pb = bars.entry(key).or_insert_with(|| self.spinner());
        let message = Self::message(&event);
        match event.status {
            ProgressStatus::Working => pb.set_message(message),
            ProgressStatus::Done => {
                if let Ok(style) = ProgressStyle::with_template(" {msg}") {
                    pb.set_style(style);
                }
                pb.finish_with_message(format!("{} {}", "✓".green(), message));
            }
            ProgressStatus::Error => {
                if let Ok(style) = ProgressStyle::with_template(" {msg}") {
                    pb.set_style(style);
                }
                pb.finish_with_message(format!("{} {}", "✗".red(), message));
            }
        }
    }

    fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values().filter(|pb| !pb.is_finished()) {
                pb.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_kind_status() {
        assert_eq!(EventKind::Creating.status(), ProgressStatus::Working);
        assert_eq!(EventKind::Started.status(), ProgressStatus::Done);
        let event = ProgressEvent::new("demo_web_1", EventKind::Started);
        assert!(event.ended_at.is_some());
        let event = ProgressEvent::new("demo_web_1", EventKind::Starting);
        assert!(event.ended_at.is_none());
    }

    #[test]
    fn test_plain_lines() {
        let buffer = Buffer::default();
        let sink = LineProgress::new(LineFormat::Plain, Box::new(buffer.clone()));
        sink.event(ProgressEvent::new("Network demo_default", EventKind::Created));
        sink.event(
            ProgressEvent::new("layer0", EventKind::Pulling)
                .with_parent("db")
                .with_status_text("50%"),
        );
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "Network demo_default Created\ndb layer0 Pulling: 50%\n");
    }

    #[test]
    fn test_json_lines() {
        let buffer = Buffer::default();
        let sink = LineProgress::new(LineFormat::Json, Box::new(buffer.clone()));
        sink.event(ProgressEvent::error("web", "port is already allocated"));
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["id"], "web");
        assert_eq!(value["status"], "error");
        assert_eq!(value["status_text"], "port is already allocated");
    }

    #[test]
    fn test_recording_preserves_order() {
        let sink = RecordingProgress::new();
        sink.event(ProgressEvent::new("demo_db_1", EventKind::Creating));
        sink.event(ProgressEvent::new("demo_web_1", EventKind::Creating));
        sink.event(ProgressEvent::new("demo_db_1", EventKind::Created));
        assert_eq!(sink.texts_for("demo_db_1"), vec!["Creating", "Created"]);
    }

    #[test]
    fn test_timed_progress_keeps_start_time() {
        let recording = Arc::new(RecordingProgress::new());
        let timed = TimedProgress::new(recording.clone());

        timed.event(ProgressEvent::new("Container web", EventKind::Creating));
        std::thread::sleep(Duration::from_millis(20));
        timed.event(ProgressEvent::new("Container web", EventKind::Starting));
        std::thread::sleep(Duration::from_millis(20));
        timed.event(ProgressEvent::new("Container web", EventKind::Started));
        timed.event(ProgressEvent::new("Container db", EventKind::Removed));

        let events = recording.events();
        let started_at = events[0].started_at;
        assert_eq!(events[1].started_at, started_at);
        assert_eq!(events[2].started_at, started_at);
        let ended_at = events[2].ended_at.unwrap();
        assert!(ended_at - started_at >= chrono::Duration::milliseconds(40));
        // Working を経ない完了イベントはそのまま
        assert_eq!(events[3].ended_at, Some(events[3].started_at));

        // 完了後の同じ ID は新しい区間になる
        timed.event(ProgressEvent::new("Container web", EventKind::Stopping));
        let events = recording.events();
        assert!(events[4].started_at > started_at);
    }
}
