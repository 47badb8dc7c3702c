//! create / up

use super::ComposeEngine;
use super::logs::log_label;
use super::options::{CreateOptions, Interrupt, UpOptions};
use crate::convergence::{ConvergeOptions, RecreatePolicy};
use crate::iomux::{LogMux, LogSource};
use crate::scheduler::{Direction, FailurePolicy};
use fleetcompose_container::{LogOptions, RuntimeClient, Tail};
use fleetcompose_core::{ComposeError, DependencyGraph, Project, ResourceKind, Result};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::collections::{BTreeMap, BTreeSet};
use std::future::pending;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// 起動したレプリカ（サービス名 → コンテナ名）
pub(crate) type Started = BTreeMap<String, Vec<String>>;

impl ComposeEngine {
    fn validate_create(project: &Project, options: &CreateOptions) -> Result<()> {
        for (name, replicas) in &options.scale {
            let service = project.service(name)?;
            if *replicas > 1 && service.container_name.is_some() {
                return Err(ComposeError::invalid(format!(
                    "service '{}' sets container_name '{}' and cannot be scaled to {}",
                    name,
                    service.container_name.as_deref().unwrap_or_default(),
                    replicas
                )));
            }
        }
        Ok(())
    }

    /// 対象サービスを依存順に収束させ、`start` なら起動する
    ///
    /// 起動する場合、各サービスは `scope` 内の依存が条件を満たしてから起動される。
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn converge_services(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        targets: &BTreeSet<String>,
        options: &CreateOptions,
        failure: FailurePolicy,
        start: bool,
        cancel: &CancellationToken,
    ) -> Result<Started> {
        let reconciler = self.reconciler(project);
        let started = Mutex::new(Started::new());

        self.scheduler(graph, Direction::Forward)
            .with_failure_policy(failure)
            .run(targets, cancel, |name| {
                let reconciler = &reconciler;
                let started = &started;
                async move {
                    let service = project.service(&name)?;
                    let converge = ConvergeOptions {
                        policy: options.recreate,
                        scale: options.scale.get(&name).copied(),
                        timeout: options.timeout,
                    };
                    let containers = reconciler.converge_service(service, &converge).await?;
                    if start {
                        self.wait_for_dependencies(project, graph, &name, targets, cancel)
                            .await?;
                        for container in &containers {
                            reconciler.start_if_needed(container).await?;
                        }
                    }
                    if let Ok(mut started) = started.lock() {
                        started.insert(name, containers);
                    }
                    Ok(())
                }
            })
            .await?;

        Ok(started.into_inner().unwrap_or_default())
    }

    /// 検証して対象サービスを決める
    fn plan(
        project: &Project,
        options: &CreateOptions,
    ) -> Result<(DependencyGraph, BTreeSet<String>)> {
        Self::validate_create(project, options)?;
        let graph = DependencyGraph::from_project(project)?;
        let targets = Self::targets(project, &options.services, !options.no_deps)?;
        Ok((graph, targets))
    }

    /// イメージ・ネットワーク・ボリューム・コンテナを用意する（共通部分）
    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        targets: &BTreeSet<String>,
        options: &CreateOptions,
        failure: FailurePolicy,
        start: bool,
        cancel: &CancellationToken,
    ) -> Result<Started> {
        self.ensure_images(project, targets, options.build, cancel)
            .await?;
        let reconciler = self.reconciler(project);
        reconciler.ensure_networks().await?;
        reconciler.ensure_volumes().await?;

        let started = self
            .converge_services(project, graph, targets, options, failure, start, cancel)
            .await?;
        self.handle_orphans(project, options.remove_orphans).await?;
        Ok(started)
    }

    /// create: コンテナを作成するが起動しない
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn create(
        &self,
        project: &Project,
        options: &CreateOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (graph, targets) = Self::plan(project, options)?;
        self.prepare(
            project,
            &graph,
            &targets,
            options,
            FailurePolicy::Abort,
            false,
            cancel,
        )
        .await?;
        Ok(())
    }

    /// up: 収束させて起動し、アタッチモードなら全コンテナの終了まで出力を流す
    ///
    /// 戻り値は `--abort-on-container-exit` / `--cascade-stop` で中断させたコンテナの
    /// 終了コード（それ以外は 0）。
    ///
    /// 起動途中で割り込まれた場合（アタッチモード）や `cascade_stop` で失敗した場合は、
    /// 起動済みのサービスを逆依存順に停止してからエラーを返す。
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn up(
        &self,
        project: &Project,
        options: &UpOptions,
        interrupt: &Interrupt,
    ) -> Result<i64> {
        if options.detach && options.abort_on_container_exit {
            return Err(ComposeError::invalid(
                "--detach and --abort-on-container-exit cannot be combined",
            ));
        }
        for name in options.create.scale.keys() {
            if !project.services.contains_key(name) {
                return Err(ComposeError::not_found(ResourceKind::Service, name.clone()));
            }
        }

        let (graph, targets) = Self::plan(project, &options.create)?;
        let failure = if options.cascade_stop {
            FailurePolicy::CascadeStop
        } else {
            FailurePolicy::Abort
        };
        let started = match self
            .prepare(
                project,
                &graph,
                &targets,
                &options.create,
                failure,
                true,
                &interrupt.graceful,
            )
            .await
        {
            Ok(started) => started,
            Err(err) => {
                let interrupted = err.is_canceled() && !options.detach;
                if interrupted || options.cascade_stop {
                    info!(error = %err, "Up failed, stopping started services");
                    if let Err(stop_err) = self
                        .stop_services(
                            project,
                            &graph,
                            &targets,
                            options.create.timeout,
                            &interrupt.force,
                        )
                        .await
                    {
                        warn!(error = %stop_err, "Failed to stop started services");
                    }
                }
                return Err(err);
            }
        };
        info!(services = targets.len(), "Project is up");

        if options.detach {
            return Ok(0);
        }
        self.attach_project(project, &graph, &targets, &started, options, interrupt)
            .await
    }

    async fn attach_project(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        targets: &BTreeSet<String>,
        started: &Started,
        options: &UpOptions,
        interrupt: &Interrupt,
    ) -> Result<i64> {
        let mut sources = Vec::new();
        let mut containers = Vec::new();
        for (service, names) in started {
            for (index, name) in names.iter().enumerate() {
                let label = log_label(service, index as u32 + 1, names.len() > 1);
                let stream = self.runtime.container_logs(
                    name,
                    &LogOptions {
                        follow: true,
                        tail: Tail::All,
                        ..Default::default()
                    },
                );
                sources.push(LogSource::new(label, stream));
                containers.push(name.clone());
            }
        }

        let mux_cancel = CancellationToken::new();
        let mux = LogMux::new(self.output.clone()).no_color(self.options.no_color);
        let logs = mux.run(sources, &mux_cancel);
        tokio::pin!(logs);

        let runtime: &dyn RuntimeClient = self.runtime.as_ref();
        let mut exits: FuturesUnordered<_> = containers
            .iter()
            .map(|name| async move { (name.clone(), runtime.wait_container(name).await) })
            .collect();
        let first_exit = async {
            if !options.abort_on_container_exit && !options.cascade_stop {
                return pending().await;
            }
            match exits.next().await {
                Some(exit) => exit,
                None => pending().await,
            }
        };

        let timeout = options.create.timeout;
        tokio::select! {
            report = &mut logs => {
                report.failures.into_result()?;
                Ok(0)
            }
            (name, code) = first_exit => {
                let code = code?;
                info!(container = %name, code, "Container exited, stopping project");
                mux_cancel.cancel();
                logs.await;
                self.stop_services(project, graph, targets, timeout, &interrupt.force).await?;
                Ok(code)
            }
            _ = interrupt.graceful.cancelled() => {
                info!("Interrupted, stopping project");
                mux_cancel.cancel();
                logs.await;
                self.stop_services(project, graph, targets, timeout, &interrupt.force).await?;
                Err(ComposeError::Canceled)
            }
        }
    }
}

/// `--force-recreate` / `--no-recreate` からの方針
pub fn recreate_policy(force_recreate: bool, no_recreate: bool) -> Result<RecreatePolicy> {
    match (force_recreate, no_recreate) {
        (true, true) => Err(ComposeError::invalid(
            "--force-recreate and --no-recreate cannot be combined",
        )),
        (true, false) => Ok(RecreatePolicy::Force),
        (false, true) => Ok(RecreatePolicy::Never),
        (false, false) => Ok(RecreatePolicy::Diverged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::testing::{harness, project};
    use fleetcompose_container::{Call, HealthStatus};
    use std::time::Duration;

    const YAML: &str = r#"
services:
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
"#;

    fn detached() -> UpOptions {
        UpOptions {
            detach: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_up_detached_starts_in_order() {
        let h = harness();
        let p = project(YAML);
        let code = h.engine.up(&p, &detached(), &Interrupt::new()).await.unwrap();
        assert_eq!(code, 0);

        let running = h.runtime.running_names();
        assert!(running.contains("demo_db_1"));
        assert!(running.contains("demo_web_1"));

        let calls = h.runtime.calls();
        let db = calls
            .iter()
            .position(|c| *c == Call::StartContainer("demo_db_1".to_string()))
            .unwrap();
        let web = calls
            .iter()
            .position(|c| *c == Call::StartContainer("demo_web_1".to_string()))
            .unwrap();
        assert!(db < web);
        assert!(h.progress.texts_for("Container demo_db_1").contains(&"Healthy".to_string()));
    }

    #[tokio::test]
    async fn test_up_twice_changes_nothing() {
        let h = harness();
        let p = project(YAML);
        h.engine.up(&p, &detached(), &Interrupt::new()).await.unwrap();
        h.runtime.clear_calls();
        h.engine.up(&p, &detached(), &Interrupt::new()).await.unwrap();
        assert!(h.runtime.calls().iter().all(|c| !c.changes_resources()));
    }

    #[tokio::test]
    async fn test_up_rejects_contradicting_flags() {
        let h = harness();
        let p = project(YAML);
        let err = h
            .engine
            .up(
                &p,
                &UpOptions {
                    detach: true,
                    abort_on_container_exit: true,
                    ..Default::default()
                },
                &Interrupt::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fleetcompose_core::ErrorKind::InvalidInput);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_up_scale_unknown_service() {
        let h = harness();
        let p = project(YAML);
        let mut options = detached();
        options.create.scale.insert("cache".to_string(), 2);
        let err = h.engine.up(&p, &options, &Interrupt::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_up_scale_up_and_down() {
        let h = harness();
        let p = project("services:\n  web:\n    image: nginx\n");
        let mut options = detached();
        options.create.scale.insert("web".to_string(), 3);
        h.engine.up(&p, &options, &Interrupt::new()).await.unwrap();
        assert_eq!(h.runtime.running_names().len(), 3);

        options.create.scale.insert("web".to_string(), 1);
        h.runtime.clear_calls();
        h.engine.up(&p, &options, &Interrupt::new()).await.unwrap();
        assert_eq!(
            h.runtime.container_names(),
            vec!["demo_web_1".to_string()]
        );
        let removed: Vec<Call> = h
            .runtime
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::RemoveContainer(_)))
            .collect();
        assert_eq!(
            removed,
            vec![
                Call::RemoveContainer("demo_web_3".to_string()),
                Call::RemoveContainer("demo_web_2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_blocks_dependent() {
        let h = harness();
        h.runtime.set_health("demo_db_1", HealthStatus::Unhealthy);
        let p = project(YAML);
        let err = h.engine.up(&p, &detached(), &Interrupt::new()).await.unwrap_err();
        assert_ne!(err.kind(), fleetcompose_core::ErrorKind::Canceled);
        assert!(!h.runtime.running_names().contains("demo_web_1"));
    }

    #[tokio::test]
    async fn test_orphans_removed_on_request() {
        let h = harness();
        let full = project("services:\n  web:\n    image: nginx\n  worker:\n    image: busybox\n");
        h.engine.up(&full, &detached(), &Interrupt::new()).await.unwrap();

        let reduced = project("services:\n  web:\n    image: nginx\n");
        h.engine.up(&reduced, &detached(), &Interrupt::new()).await.unwrap();
        assert!(h.runtime.container_names().contains(&"demo_worker_1".to_string()));

        let mut options = detached();
        options.create.remove_orphans = true;
        h.engine.up(&reduced, &options, &Interrupt::new()).await.unwrap();
        assert_eq!(h.runtime.container_names(), vec!["demo_web_1".to_string()]);
    }

    #[tokio::test]
    async fn test_attached_up_streams_until_exit() {
        let h = harness();
        let p = project("services:\n  job:\n    image: alpine\n    command: [echo, done]\n");
        let code = h
            .engine
            .up(&p, &UpOptions::default(), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(h.stdout.contents(), "job  | done\n");
    }

    #[tokio::test]
    async fn test_abort_on_container_exit_returns_code() {
        let h = harness();
        let p = project(
            "services:\n  server:\n    image: nginx\n  job:\n    image: alpine\n    command: [exit, \"3\"]\n",
        );
        let code = h
            .engine
            .up(
                &p,
                &UpOptions {
                    abort_on_container_exit: true,
                    ..Default::default()
                },
                &Interrupt::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert!(h.runtime.running_names().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_stops_in_reverse_order() {
        let h = harness();
        let p = project(YAML);
        let interrupt = Interrupt::new();
        let trigger = interrupt.graceful.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = h
            .engine
            .up(&p, &UpOptions::default(), &interrupt)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(err.exit_code(), 130);
        assert!(h.runtime.running_names().is_empty());

        let calls = h.runtime.calls();
        let stop_web = calls
            .iter()
            .position(|c| matches!(c, Call::StopContainer { name, .. } if name == "demo_web_1"))
            .unwrap();
        let stop_db = calls
            .iter()
            .position(|c| matches!(c, Call::StopContainer { name, .. } if name == "demo_db_1"))
            .unwrap();
        assert!(stop_web < stop_db);
    }

    #[test]
    fn test_recreate_policy_flags() {
        assert_eq!(recreate_policy(false, false).unwrap(), RecreatePolicy::Diverged);
        assert_eq!(recreate_policy(true, false).unwrap(), RecreatePolicy::Force);
        assert_eq!(recreate_policy(false, true).unwrap(), RecreatePolicy::Never);
        assert!(recreate_policy(true, true).is_err());
    }
}
