//! down / rm

use super::ComposeEngine;
use super::options::{DownOptions, Interrupt, RemoveImages, RmOptions};
use crate::progress::{EventKind, ProgressEvent};
use crate::scheduler::{Direction, FailurePolicy};
use fleetcompose_container::{ContainerSummary, ListFilter, NetworkInfo, RemoveOptions};
use fleetcompose_core::labels;
use fleetcompose_core::{AggregateError, ComposeError, DependencyGraph, Project, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// ランタイム上のネットワークが external 宣言されたものか
///
/// 作成時に付けた定義キーのラベルがあればその定義の `external` に従い、
/// 無ければ external 宣言の名前と照合する。
fn is_external_network(project: &Project, network: &NetworkInfo) -> bool {
    if let Some(key) = network.labels.get(labels::LABEL_NETWORK) {
        return project
            .networks
            .get(key)
            .is_some_and(|config| config.external);
    }
    project.networks.iter().any(|(key, config)| {
        config.external && labels::network_name(&project.name, key, config) == network.name
    })
}

impl ComposeEngine {
    async fn remove_one(&self, container: &ContainerSummary, options: RemoveOptions) -> Result<()> {
        let id = format!("Container {}", container.name);
        self.progress
            .event(ProgressEvent::new(id.clone(), EventKind::Removing));
        match self.runtime.remove_container(&container.id, options).await {
            // 既に無い
            Ok(()) | Err(ComposeError::NotFound { .. }) => {
                self.progress.event(ProgressEvent::new(id, EventKind::Removed));
                Ok(())
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    /// down: プロジェクトのコンテナ・ネットワーク（・ボリューム・イメージ）を削除する
    ///
    /// 何も無いプロジェクトに対しては何もせず成功する。
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn down(
        &self,
        project: &Project,
        options: &DownOptions,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let graph = DependencyGraph::from_project(project)?;
        let reconciler = self.reconciler(project);

        // サービスごと（一時コンテナを含む）
        let mut by_service: BTreeMap<String, Vec<ContainerSummary>> = BTreeMap::new();
        let mut orphans = Vec::new();
        for container in reconciler.project_containers(true).await? {
            match labels::parse_labels(&container.labels) {
                Some(identity) if project.services.contains_key(&identity.service) => {
                    by_service.entry(identity.service).or_default().push(container);
                }
                _ => orphans.push(container),
            }
        }

        let targets: BTreeSet<String> = by_service.keys().cloned().collect();
        let containers_result = self
            .scheduler(&graph, Direction::Reverse)
            .with_failure_policy(FailurePolicy::KeepGoing)
            .run(&targets, &interrupt.force, |name| {
                let by_service = &by_service;
                async move {
                    let service = project.service(&name)?;
                    let grace = options.timeout.unwrap_or_else(|| service.stop_grace_period());
                    for container in by_service.get(&name).into_iter().flatten().rev() {
                        if container.status.is_running() {
                            self.stop_one(container, grace, &interrupt.graceful).await?;
                        }
                        self.remove_one(
                            container,
                            RemoveOptions {
                                force: false,
                                volumes: options.volumes,
                            },
                        )
                        .await?;
                    }
                    Ok(())
                }
            })
            .await;

        let mut errors = AggregateError::new();
        if let Err(e) = containers_result {
            if e.is_canceled() {
                return Err(e);
            }
            errors.absorb(project.name.clone(), e);
        }

        if options.remove_orphans {
            for orphan in &orphans {
                let grace = options.timeout.unwrap_or(fleetcompose_core::DEFAULT_STOP_GRACE_PERIOD);
                if let Err(e) = self.remove_orphan(orphan, grace, options.volumes, interrupt).await {
                    errors.push(orphan.name.clone(), e);
                }
            }
        } else if !orphans.is_empty() && !self.options.ignore_orphans {
            let names: Vec<&str> = orphans.iter().map(|c| c.name.as_str()).collect();
            warn!(
                orphans = ?names,
                "Found orphan containers for this project. Run down with --remove-orphans to remove them"
            );
        }

        if let Err(e) = self.remove_networks(project).await {
            errors.absorb("networks", e);
        }
        if options.volumes
            && let Err(e) = self.remove_volumes(project).await
        {
            errors.absorb("volumes", e);
        }
        if let Some(mode) = options.rmi {
            self.remove_images(project, mode).await;
        }
        errors.into_result()
    }

    async fn remove_orphan(
        &self,
        orphan: &ContainerSummary,
        grace: Duration,
        volumes: bool,
        interrupt: &Interrupt,
    ) -> Result<()> {
        if orphan.status.is_running() {
            self.stop_one(orphan, grace, &interrupt.graceful).await?;
        }
        self.remove_one(orphan, RemoveOptions { force: false, volumes })
            .await
    }

    /// プロジェクトのラベルが付いたネットワークを削除する（external は対象外）
    async fn remove_networks(&self, project: &Project) -> Result<()> {
        let filter = ListFilter::default().label(labels::LABEL_PROJECT, &project.name);
        let mut errors = AggregateError::new();
        for network in self.runtime.list_networks(&filter).await? {
            if is_external_network(project, &network) {
                debug!(network = %network.name, "External network, keeping");
                continue;
            }
            let id = format!("Network {}", network.name);
            self.progress
                .event(ProgressEvent::new(id.clone(), EventKind::Removing));
            match self.runtime.remove_network(&network.name).await {
                Ok(()) | Err(ComposeError::NotFound { .. }) => {
                    info!(network = %network.name, "Network removed");
                    self.progress.event(ProgressEvent::new(id, EventKind::Removed));
                }
                Err(e) => {
                    self.progress.event(ProgressEvent::error(id, e.to_string()));
                    errors.push(network.name.clone(), e);
                }
            }
        }
        errors.into_result()
    }

    /// プロジェクトのラベルが付いたボリュームを削除する
    async fn remove_volumes(&self, project: &Project) -> Result<()> {
        let filter = ListFilter::default().label(labels::LABEL_PROJECT, &project.name);
        let mut errors = AggregateError::new();
        for volume in self.runtime.list_volumes(&filter).await? {
            let id = format!("Volume {}", volume.name);
            self.progress
                .event(ProgressEvent::new(id.clone(), EventKind::Removing));
            match self.runtime.remove_volume(&volume.name, false).await {
                Ok(()) | Err(ComposeError::NotFound { .. }) => {
                    info!(volume = %volume.name, "Volume removed");
                    self.progress.event(ProgressEvent::new(id, EventKind::Removed));
                }
                Err(e) => {
                    self.progress.event(ProgressEvent::error(id, e.to_string()));
                    errors.push(volume.name.clone(), e);
                }
            }
        }
        errors.into_result()
    }

    /// down --rmi（失敗はログのみ）
    async fn remove_images(&self, project: &Project, mode: RemoveImages) {
        let images: BTreeSet<String> = project
            .services
            .values()
            .filter(|s| mode == RemoveImages::All || s.image.is_none())
            .map(|s| s.image_ref(&project.name))
            .collect();
        for image in images {
            let id = format!("Image {}", image);
            self.progress
                .event(ProgressEvent::new(id.clone(), EventKind::Removing));
            match self.runtime.remove_image(&image, false).await {
                Ok(()) => self.progress.event(ProgressEvent::new(id, EventKind::Removed)),
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to remove image");
                    self.progress.event(ProgressEvent::error(id, e.to_string()));
                }
            }
        }
    }

    /// rm: 停止済みのコンテナを削除し、削除したコンテナ名を返す
    ///
    /// `stop` なら先に停止する。実行中のコンテナは `force` が無ければ残す。
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn rm(
        &self,
        project: &Project,
        options: &RmOptions,
        interrupt: &Interrupt,
    ) -> Result<Vec<String>> {
        let targets = project.select_services(&options.services)?;
        if options.stop {
            let graph = DependencyGraph::from_project(project)?;
            self.stop_services(project, &graph, &targets, None, &interrupt.force)
                .await?;
        }

        let reconciler = self.reconciler(project);
        let mut removed = Vec::new();
        let mut errors = AggregateError::new();
        for name in &targets {
            for container in reconciler.service_containers(name).await? {
                let details = self.runtime.inspect_container(&container.id).await?;
                if details.is_running() && !options.force {
                    debug!(container = %container.name, "Running, not removing");
                    continue;
                }
                match self
                    .remove_one(
                        &container,
                        RemoveOptions {
                            force: options.force,
                            volumes: options.volumes,
                        },
                    )
                    .await
                {
                    Ok(()) => removed.push(container.name),
                    Err(e) => errors.push(name.clone(), e),
                }
            }
        }
        errors.into_result()?;
        Ok(removed)
    }
}
