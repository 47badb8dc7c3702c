//! Compose のライフサイクル操作
//!
//! [`ComposeEngine`] はランタイム・進捗通知先・出力先を束ね、
//! up / down / run / exec などの各操作を提供する。操作ごとの実装は
//! サブモジュールに分かれている。

mod config;
mod copy;
mod down;
mod events;
mod exec;
mod images;
mod lifecycle;
mod logs;
mod options;
mod ps;
mod run;
mod up;

pub use config::render_config;
pub use copy::CopyEndpoint;
pub use events::ComposeEvent;
pub use images::registry_host;
pub use options::*;
pub use ps::ContainerView;
pub use run::RunOutcome;
pub use up::recreate_policy;

use crate::convergence::Reconciler;
use crate::iomux::{DetachKeys, Output};
use crate::progress::{EventKind, NoopProgress, ProgressEvent, ProgressSink, TimedProgress};
use crate::scheduler::{DependencyScheduler, Direction};
use fleetcompose_container::{
    ContainerSummary, ListFilter, RegistryAuth, RuntimeClient, WaitConfig, wait_for_condition,
};
use fleetcompose_core::labels;
use fleetcompose_core::{
    ComposeError, DependencyCondition, DependencyGraph, Project, ResourceKind, Result,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// エンジン全体の設定
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// 同時に処理するサービス数の上限（None はサービス数）
    pub parallel_limit: Option<usize>,
    /// 孤児コンテナの警告を出さない
    pub ignore_orphans: bool,
    pub detach_keys: DetachKeys,
    pub no_color: bool,
    /// レジストリホスト名ごとの認証情報
    pub registry_auth: BTreeMap<String, RegistryAuth>,
}

/// Compose エンジン
///
/// プロジェクトは操作ごとに受け取るため、1 つのエンジンで複数のプロジェクトを扱える。
pub struct ComposeEngine {
    runtime: Arc<dyn RuntimeClient>,
    progress: Arc<dyn ProgressSink>,
    output: Arc<Output>,
    options: EngineOptions,
}

impl ComposeEngine {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            progress: Arc::new(NoopProgress),
            output: Arc::new(Output::stdio()),
            options: EngineOptions::default(),
        }
    }

    /// 進捗の受け手（完了イベントの `started_at` は開始時刻に揃えて渡す）
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Arc::new(TimedProgress::new(progress));
        self
    }

    pub fn with_output(mut self, output: Arc<Output>) -> Self {
        self.output = output;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn runtime(&self) -> &dyn RuntimeClient {
        self.runtime.as_ref()
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress.as_ref()
    }

    pub fn output(&self) -> &Arc<Output> {
        &self.output
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn reconciler<'a>(&'a self, project: &'a Project) -> Reconciler<'a> {
        Reconciler::new(self.runtime.as_ref(), project, self.progress.as_ref())
    }

    pub(crate) fn scheduler<'g>(
        &self,
        graph: &'g DependencyGraph,
        direction: Direction,
    ) -> DependencyScheduler<'g> {
        DependencyScheduler::new(graph, direction).with_parallelism(self.options.parallel_limit)
    }

    /// 操作対象のサービス集合（空なら全サービス）
    pub(crate) fn targets(
        project: &Project,
        services: &[String],
        with_dependencies: bool,
    ) -> Result<BTreeSet<String>> {
        if with_dependencies {
            project.with_dependencies(services)
        } else {
            project.select_services(services)
        }
    }

    /// サービスの N 番目のレプリカ
    pub(crate) async fn find_replica(
        &self,
        project: &Project,
        service: &str,
        index: u32,
    ) -> Result<ContainerSummary> {
        let definition = project.service(service)?;
        let filter = ListFilter::default()
            .label(labels::LABEL_PROJECT, &project.name)
            .label(labels::LABEL_SERVICE, service)
            .label(labels::LABEL_CONTAINER_NUMBER, &index.to_string())
            .label(labels::LABEL_ONEOFF, "false");
        self.runtime
            .list_containers(&filter, true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ComposeError::not_found(
                    ResourceKind::Container,
                    labels::replica_name(project, definition, index),
                )
            })
    }

    /// コンテナを停止する
    ///
    /// `escalate` が取り消されたら猶予を待たずに SIGKILL を送る。
    pub(crate) async fn stop_one(
        &self,
        container: &ContainerSummary,
        timeout: Duration,
        escalate: &CancellationToken,
    ) -> Result<()> {
        let id = format!("Container {}", container.name);
        self.progress
            .event(ProgressEvent::new(id.clone(), EventKind::Stopping));
        let result = if escalate.is_cancelled() {
            self.kill_for_stop(container).await
        } else {
            tokio::select! {
                result = self.runtime.stop_container(&container.id, Some(timeout)) => result,
                _ = escalate.cancelled() => self.kill_for_stop(container).await,
            }
        };
        match result {
            Ok(()) => {
                self.progress.event(ProgressEvent::new(id, EventKind::Stopped));
                Ok(())
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    async fn kill_for_stop(&self, container: &ContainerSummary) -> Result<()> {
        debug!(container = %container.name, "Escalating stop to SIGKILL");
        match self.runtime.kill_container(&container.id, "SIGKILL").await {
            // 既に止まっている
            Err(ComposeError::Conflict { .. }) => Ok(()),
            other => other,
        }
    }

    /// `service` の依存が条件を満たすまで待つ
    ///
    /// `scope` に含まれない依存は無視する。
    pub(crate) async fn wait_for_dependencies(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        service: &str,
        scope: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reconciler = self.reconciler(project);
        for edge in graph.dependencies(service) {
            if !scope.contains(&edge.target) {
                continue;
            }
            let dependency = project.service(&edge.target)?;
            let config = WaitConfig::for_healthcheck(dependency.healthcheck.as_ref());
            for container in reconciler.service_containers(&edge.target).await? {
                let id = format!("Container {}", container.name);
                self.progress
                    .event(ProgressEvent::new(id.clone(), EventKind::Waiting));
                match wait_for_condition(
                    self.runtime.as_ref(),
                    &container.id,
                    edge.condition,
                    &config,
                    cancel,
                )
                .await
                {
                    Ok(()) => {
                        let done = match edge.condition {
                            DependencyCondition::ServiceStarted => EventKind::Running,
                            DependencyCondition::ServiceHealthy => EventKind::Healthy,
                            DependencyCondition::ServiceCompletedSuccessfully => EventKind::Exited,
                        };
                        self.progress.event(ProgressEvent::new(id, done));
                    }
                    Err(e) => {
                        self.progress.event(ProgressEvent::error(id, e.to_string()));
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// 孤児コンテナの警告または削除
    pub(crate) async fn handle_orphans(&self, project: &Project, remove: bool) -> Result<()> {
        let reconciler = self.reconciler(project);
        let orphans = reconciler.find_orphans().await?;
        if orphans.is_empty() {
            return Ok(());
        }
        if remove {
            for orphan in &orphans {
                reconciler
                    .stop_and_remove(orphan, fleetcompose_core::DEFAULT_STOP_GRACE_PERIOD, false)
                    .await?;
            }
        } else if !self.options.ignore_orphans {
            let names: Vec<&str> = orphans.iter().map(|c| c.name.as_str()).collect();
            warn!(
                project = %project.name,
                orphans = ?names,
                "Found orphan containers for this project. If you removed or renamed this service, run with --remove-orphans to clean it up"
            );
        }
        Ok(())
    }
}
