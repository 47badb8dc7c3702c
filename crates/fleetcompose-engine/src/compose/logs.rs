//! logs

use super::ComposeEngine;
use super::options::LogsOptions;
use crate::iomux::{LogMux, LogSource};
use fleetcompose_container::LogOptions;
use fleetcompose_core::labels;
use fleetcompose_core::{ComposeError, Project, Result};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// 出力行のプレフィックスに使う名前
///
/// レプリカが 1 つならサービス名、複数なら `{service}_{number}`。
pub(crate) fn log_label(service: &str, number: u32, scaled: bool) -> String {
    if scaled {
        format!("{}_{}", service, number)
    } else {
        service.to_string()
    }
}

impl ComposeEngine {
    /// logs: 対象サービスのコンテナの出力をまとめて表示する
    ///
    /// `follow` の場合は取り消されるまで続き、取り消しは `Canceled` になる。
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn logs(
        &self,
        project: &Project,
        options: &LogsOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = project.select_services(&options.services)?;
        let reconciler = self.reconciler(project);
        let log_options = LogOptions {
            follow: options.follow,
            since: options.since,
            until: options.until,
            timestamps: options.timestamps,
            tail: options.tail,
        };

        let mut sources = Vec::new();
        for service in &targets {
            let containers = reconciler.service_containers(service).await?;
            let scaled = containers.len() > 1;
            for container in containers {
                let number = labels::parse_labels(&container.labels)
                    .map(|id| id.number)
                    .unwrap_or(1);
                let stream = self.runtime.container_logs(&container.id, &log_options);
                sources.push(LogSource::new(log_label(service, number, scaled), stream));
            }
        }

        let report = LogMux::new(self.output.clone())
            .no_color(options.no_color || self.options.no_color)
            .no_prefix(options.no_prefix)
            .run(sources, cancel)
            .await;
        if report.canceled {
            return Err(ComposeError::Canceled);
        }
        report.failures.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::options::{Interrupt, UpOptions};
    use crate::compose::testing::{harness, project};
    use fleetcompose_container::Tail;
    use std::time::Duration;

    #[test]
    fn test_log_label() {
        assert_eq!(log_label("web", 1, false), "web");
        assert_eq!(log_label("web", 2, true), "web_2");
    }

    async fn started(h: &crate::compose::testing::Harness, yaml: &str) -> Project {
        let p = project(yaml);
        h.engine
            .up(
                &p,
                &UpOptions {
                    detach: true,
                    ..Default::default()
                },
                &Interrupt::new(),
            )
            .await
            .unwrap();
        p
    }

    #[tokio::test]
    async fn test_logs_prefix_and_tail() {
        let h = harness();
        let p = started(&h, "services:\n  web:\n    image: nginx\n  db:\n    image: postgres\n").await;
        h.runtime.emit_line("demo_web_1", "one");
        h.runtime.emit_line("demo_web_1", "two");
        h.runtime.emit_line("demo_db_1", "ready");

        h.engine
            .logs(
                &p,
                &LogsOptions {
                    services: vec!["web".to_string()],
                    tail: Tail::Lines(1),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(h.stdout.contents(), "web  | two\n");
    }

    #[tokio::test]
    async fn test_follow_until_canceled() {
        let h = harness();
        let p = started(&h, "services:\n  web:\n    image: nginx\n").await;
        let cancel = CancellationToken::new();
        let runtime = h.runtime.clone();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            runtime.emit_line("demo_web_1", "tick 1");
            tokio::time::sleep(Duration::from_millis(50)).await;
            runtime.emit_line("demo_web_1", "tick 2");
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = h
            .engine
            .logs(
                &p,
                &LogsOptions {
                    follow: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(h.stdout.contents(), "web  | tick 1\nweb  | tick 2\n");
    }

    #[tokio::test]
    async fn test_scaled_service_labels() {
        let h = harness();
        let p = project("services:\n  web:\n    image: nginx\n");
        let mut options = UpOptions {
            detach: true,
            ..Default::default()
        };
        options.create.scale.insert("web".to_string(), 2);
        h.engine.up(&p, &options, &Interrupt::new()).await.unwrap();
        h.runtime.emit_line("demo_web_2", "hello");

        h.engine
            .logs(&p, &LogsOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.stdout.contents(), "web_2  | hello\n");
    }
}
