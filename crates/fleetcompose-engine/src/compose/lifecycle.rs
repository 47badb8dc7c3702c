//! start / stop / restart / kill / pause / unpause

use super::ComposeEngine;
use super::options::{Interrupt, StopOptions};
use crate::progress::{EventKind, ProgressEvent};
use crate::scheduler::{Direction, FailurePolicy};
use fleetcompose_container::{ContainerStatus, ContainerSummary, parse_signal};
use fleetcompose_core::labels;
use fleetcompose_core::{
    AggregateError, ComposeError, DependencyGraph, Project, ResourceKind, Result,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

impl ComposeEngine {
    /// 対象サービスの実行中コンテナを逆依存順に停止する
    ///
    /// 1 つの失敗で他のサービスの停止は止めない。
    pub(crate) async fn stop_services(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        targets: &BTreeSet<String>,
        timeout: Option<Duration>,
        escalate: &CancellationToken,
    ) -> Result<()> {
        let reconciler = self.reconciler(project);
        // 停止そのものは取り消さない（escalate で kill に切り替える）
        let never = CancellationToken::new();
        self.scheduler(graph, Direction::Reverse)
            .with_failure_policy(FailurePolicy::KeepGoing)
            .run(targets, &never, |name| {
                let reconciler = &reconciler;
                async move {
                    let service = project.service(&name)?;
                    let grace = timeout.unwrap_or_else(|| service.stop_grace_period());
                    for container in reconciler.service_containers(&name).await?.iter().rev() {
                        if container.status.is_running() {
                            self.stop_one(container, grace, escalate).await?;
                        }
                    }
                    Ok(())
                }
            })
            .await
    }

    /// start: 作成済みのコンテナを依存順に起動する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn start(
        &self,
        project: &Project,
        services: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let graph = DependencyGraph::from_project(project)?;
        let targets = project.select_services(services)?;
        let reconciler = self.reconciler(project);

        self.scheduler(&graph, Direction::Forward)
            .run(&targets, cancel, |name| {
                let reconciler = &reconciler;
                let graph = &graph;
                let targets = &targets;
                async move {
                    let service = project.service(&name)?;
                    let containers = reconciler.service_containers(&name).await?;
                    if containers.is_empty() {
                        return Err(ComposeError::not_found(
                            ResourceKind::Container,
                            labels::replica_name(project, service, 1),
                        ));
                    }
                    self.wait_for_dependencies(project, graph, &name, targets, cancel)
                        .await?;
                    for container in &containers {
                        reconciler.start_if_needed(&container.name).await?;
                    }
                    Ok(())
                }
            })
            .await
    }

    /// stop: 実行中のコンテナを逆依存順に停止する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn stop(
        &self,
        project: &Project,
        options: &StopOptions,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let graph = DependencyGraph::from_project(project)?;
        let targets = project.select_services(&options.services)?;
        self.stop_services(project, &graph, &targets, options.timeout, &interrupt.graceful)
            .await
    }

    /// restart: コンテナを依存順に再起動する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn restart(
        &self,
        project: &Project,
        options: &StopOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let graph = DependencyGraph::from_project(project)?;
        let targets = project.select_services(&options.services)?;
        let reconciler = self.reconciler(project);

        self.scheduler(&graph, Direction::Forward)
            .run(&targets, cancel, |name| {
                let reconciler = &reconciler;
                async move {
                    let service = project.service(&name)?;
                    let grace = options.timeout.unwrap_or_else(|| service.stop_grace_period());
                    for container in reconciler.service_containers(&name).await? {
                        let id = format!("Container {}", container.name);
                        self.progress
                            .event(ProgressEvent::new(id.clone(), EventKind::Restarting));
                        self.runtime
                            .restart_container(&container.id, Some(grace))
                            .await?;
                        self.progress.event(ProgressEvent::new(id, EventKind::Restarted));
                    }
                    Ok(())
                }
            })
            .await
    }

    /// 対象サービスのコンテナのうち `pick` に合うものに `act` を適用する
    async fn for_each_container<F, Fut>(
        &self,
        project: &Project,
        services: &[String],
        pick: fn(ContainerStatus) -> bool,
        working: EventKind,
        done: EventKind,
        act: F,
    ) -> Result<()>
    where
        F: Fn(ContainerSummary) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let targets = project.select_services(services)?;
        let reconciler = self.reconciler(project);
        let mut errors = AggregateError::new();
        for name in &targets {
            for container in reconciler.service_containers(name).await? {
                if !pick(container.status) {
                    continue;
                }
                let id = format!("Container {}", container.name);
                self.progress.event(ProgressEvent::new(id.clone(), working));
                match act(container).await {
                    Ok(()) => self.progress.event(ProgressEvent::new(id, done)),
                    Err(e) => {
                        self.progress.event(ProgressEvent::error(id, e.to_string()));
                        errors.push(name.clone(), e);
                    }
                }
            }
        }
        errors.into_result()
    }

    /// kill: 実行中のコンテナにシグナルを送る
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn kill(&self, project: &Project, services: &[String], signal: &str) -> Result<()> {
        let signal = parse_signal(signal)?;
        let signal = signal.as_str();
        self.for_each_container(
            project,
            services,
            |s| s.is_running(),
            EventKind::Killing,
            EventKind::Killed,
            |c| async move { self.runtime.kill_container(&c.id, signal).await },
        )
        .await
    }

    /// pause: 実行中のコンテナを一時停止する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn pause(&self, project: &Project, services: &[String]) -> Result<()> {
        self.for_each_container(
            project,
            services,
            |s| s == ContainerStatus::Running,
            EventKind::Pausing,
            EventKind::Paused,
            |c| async move { self.runtime.pause_container(&c.id).await },
        )
        .await
    }

    /// unpause: 一時停止中のコンテナを再開する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn unpause(&self, project: &Project, services: &[String]) -> Result<()> {
        self.for_each_container(
            project,
            services,
            |s| s == ContainerStatus::Paused,
            EventKind::Unpausing,
            EventKind::Unpaused,
            |c| async move { self.runtime.unpause_container(&c.id).await },
        )
        .await
    }
}
