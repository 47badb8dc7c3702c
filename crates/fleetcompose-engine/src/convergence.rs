//! 宣言された状態とランタイムの観測状態の突き合わせ
//!
//! ネットワークとボリュームは存在確認と作成、コンテナはレプリカ番号ごとに
//! 設定ハッシュを比べて Keep / Create / Recreate / Remove を決める。

use crate::progress::{EventKind, ProgressEvent, ProgressSink};
use fleetcompose_container::{
    ContainerSpec, ContainerSummary, IpamPoolSpec, ListFilter, MountInfo, NetworkSpec,
    RemoveOptions, RuntimeClient, VolumeSpec, service_to_container_spec,
};
use fleetcompose_core::labels::{self, ContainerRole, Labels};
use fleetcompose_core::{
    ComposeError, MountKind, Project, ResourceKind, Result, Service, config_hash,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 再作成の方針
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecreatePolicy {
    /// 設定ハッシュが変わったものだけ
    #[default]
    Diverged,
    /// 常に再作成
    Force,
    /// 再作成しない
    Never,
}

/// レプリカ単位の操作
#[derive(Debug, Clone)]
pub enum ReplicaAction {
    Keep { container: ContainerSummary },
    Create { number: u32 },
    Recreate { old: ContainerSummary, number: u32 },
    Remove { container: ContainerSummary },
}

impl ReplicaAction {
    pub fn number(&self) -> Option<u32> {
        match self {
            ReplicaAction::Create { number } | ReplicaAction::Recreate { number, .. } => {
                Some(*number)
            }
            ReplicaAction::Keep { container } | ReplicaAction::Remove { container } => {
                container_number(container)
            }
        }
    }
}

/// 1 サービス分の計画
#[derive(Debug, Clone)]
pub struct ServicePlan {
    pub service: String,
    /// Keep / Create / Recreate は番号の昇順、その後に Remove が番号の降順で並ぶ
    pub actions: Vec<ReplicaAction>,
}

impl ServicePlan {
    /// 作成・再作成・削除を含まない
    pub fn is_noop(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a, ReplicaAction::Keep { .. }))
    }
}

fn container_number(container: &ContainerSummary) -> Option<u32> {
    labels::parse_labels(&container.labels).map(|id| id.number)
}

fn container_hash(container: &ContainerSummary) -> Option<String> {
    labels::parse_labels(&container.labels).and_then(|id| id.config_hash)
}

/// 観測したコンテナと目標のハッシュ・レプリカ数から計画を立てる
///
/// 同じ番号のコンテナが複数あれば最初に作られたものを残し、残りは削除する。
pub fn plan_service(
    service: &str,
    observed: &[ContainerSummary],
    desired_hash: &str,
    policy: RecreatePolicy,
    scale: u32,
) -> ServicePlan {
    let mut sorted: Vec<&ContainerSummary> = observed.iter().collect();
    sorted.sort_by_key(|c| (container_number(c).unwrap_or(u32::MAX), c.created));

    let mut actions = Vec::new();
    let mut removals = Vec::new();
    let mut seen = BTreeSet::new();

    for container in sorted {
        match container_number(container) {
            Some(number) if number >= 1 && number <= scale && seen.insert(number) => {
                let diverged = container_hash(container).as_deref() != Some(desired_hash);
                let recreate = match policy {
                    RecreatePolicy::Force => true,
                    RecreatePolicy::Diverged => diverged,
                    RecreatePolicy::Never => false,
                };
                if recreate {
                    actions.push(ReplicaAction::Recreate {
                        old: container.clone(),
                        number,
                    });
                } else {
                    actions.push(ReplicaAction::Keep {
                        container: container.clone(),
                    });
                }
            }
            _ => removals.push(container.clone()),
        }
    }

    for number in 1..=scale {
        if !seen.contains(&number) {
            actions.push(ReplicaAction::Create { number });
        }
    }
    actions.sort_by_key(|a| a.number().unwrap_or(u32::MAX));

    removals.sort_by_key(|c| std::cmp::Reverse(container_number(c).unwrap_or(u32::MAX)));
    actions.extend(
        removals
            .into_iter()
            .map(|container| ReplicaAction::Remove { container }),
    );

    ServicePlan {
        service: service.to_string(),
        actions,
    }
}

/// 収束オプション
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergeOptions {
    pub policy: RecreatePolicy,
    /// None は宣言されたレプリカ数
    pub scale: Option<u32>,
    /// 停止の猶予時間（None はサービスの stop_grace_period）
    pub timeout: Option<Duration>,
}

/// 突き合わせを行う
pub struct Reconciler<'a> {
    runtime: &'a dyn RuntimeClient,
    project: &'a Project,
    progress: &'a dyn ProgressSink,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        runtime: &'a dyn RuntimeClient,
        project: &'a Project,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            runtime,
            project,
            progress,
        }
    }

    fn emit(&self, id: String, kind: EventKind) {
        self.progress.event(ProgressEvent::new(id, kind));
    }

    fn project_filter(&self) -> ListFilter {
        ListFilter::default().label(labels::LABEL_PROJECT, &self.project.name)
    }

    // --- ネットワーク / ボリューム ---

    /// 宣言されたネットワークを用意する
    ///
    /// external は存在確認のみ（無ければ NotFound）。それ以外は無ければ作成する。
    #[instrument(skip(self), fields(project = %self.project.name))]
    pub async fn ensure_networks(&self) -> Result<()> {
        for (key, config) in &self.project.networks {
            let name = labels::network_name(&self.project.name, key, config);
            let id = format!("Network {}", name);

            match self.runtime.inspect_network(&name).await {
                Ok(existing) => {
                    if !config.external
                        && existing.labels.get(labels::LABEL_PROJECT) != Some(&self.project.name)
                    {
                        warn!(
                            network = %name,
                            "Network exists but was not created for this project; using it as is"
                        );
                    }
                    debug!(network = %name, "Network already exists");
                }
                Err(e) if e.is_not_found() => {
                    if config.external {
                        return Err(ComposeError::not_found(ResourceKind::Network, name));
                    }
                    self.emit(id.clone(), EventKind::Creating);
                    let spec = NetworkSpec {
                        name: name.clone(),
                        driver: config.driver.clone(),
                        driver_opts: config.driver_opts.clone().into_iter().collect(),
                        labels: labels::network_labels(self.project, key, config)
                            .into_iter()
                            .collect(),
                        attachable: config.attachable,
                        internal: config.internal,
                        enable_ipv6: config.enable_ipv6,
                        ipam_driver: config.ipam.as_ref().and_then(|i| i.driver.clone()),
                        ipam_pools: config
                            .ipam
                            .iter()
                            .flat_map(|i| i.config.iter())
                            .map(|pool| IpamPoolSpec {
                                subnet: pool.subnet.clone(),
                                ip_range: pool.ip_range.clone(),
                                gateway: pool.gateway.clone(),
                            })
                            .collect(),
                    };
                    match self.runtime.create_network(&spec).await {
                        Ok(_) => {}
                        // 並行して作られた場合
                        Err(ComposeError::Conflict { .. }) => {
                            debug!(network = %name, "Network created concurrently")
                        }
                        Err(e) => {
                            self.progress
                                .event(ProgressEvent::error(id, e.to_string()));
                            return Err(e);
                        }
                    }
                    info!(network = %name, "Network created");
                    self.emit(id, EventKind::Created);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 宣言されたボリュームを用意する
    #[instrument(skip(self), fields(project = %self.project.name))]
    pub async fn ensure_volumes(&self) -> Result<()> {
        for (key, config) in &self.project.volumes {
            let name = labels::volume_name(&self.project.name, key, config);
            match self.runtime.inspect_volume(&name).await {
                Ok(existing) => {
                    if !config.external
                        && existing.labels.get(labels::LABEL_PROJECT) != Some(&self.project.name)
                    {
                        warn!(
                            volume = %name,
                            "Volume exists but was not created for this project; using it as is"
                        );
                    }
                }
                Err(e) if e.is_not_found() => {
                    if config.external {
                        return Err(ComposeError::not_found(ResourceKind::Volume, name));
                    }
                    let id = format!("Volume {}", name);
                    self.emit(id.clone(), EventKind::Creating);
                    self.runtime
                        .create_volume(&VolumeSpec {
                            name: name.clone(),
                            driver: config.driver.clone(),
                            driver_opts: config.driver_opts.clone().into_iter().collect(),
                            labels: labels::volume_labels(self.project, key, config)
                                .into_iter()
                                .collect(),
                        })
                        .await?;
                    info!(volume = %name, "Volume created");
                    self.emit(id, EventKind::Created);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // --- コンテナ ---

    /// ハッシュに使うイメージ参照（ローカルにあれば ID 付き）
    pub async fn resolved_image(&self, image: &str) -> Result<String> {
        Ok(match self.runtime.inspect_image(image).await? {
            Some(info) => format!("{}@{}", image, info.id),
            None => image.to_string(),
        })
    }

    /// サービスの目標ハッシュ
    pub async fn desired_hash(&self, service: &Service) -> Result<String> {
        let image = service.image_ref(&self.project.name);
        Ok(config_hash(service, &self.resolved_image(&image).await?))
    }

    /// サービスの常駐コンテナ（停止中を含む）
    pub async fn service_containers(&self, service: &str) -> Result<Vec<ContainerSummary>> {
        let filter = self
            .project_filter()
            .label(labels::LABEL_SERVICE, service)
            .label(labels::LABEL_ONEOFF, "false");
        let mut containers = self.runtime.list_containers(&filter, true).await?;
        containers.sort_by_key(|c| (container_number(c).unwrap_or(u32::MAX), c.created));
        Ok(containers)
    }

    /// プロジェクトの全コンテナ（一時コンテナを含む）
    pub async fn project_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.runtime.list_containers(&self.project_filter(), all).await
    }

    /// 宣言されていないサービスのコンテナ
    pub async fn find_orphans(&self) -> Result<Vec<ContainerSummary>> {
        let filter = self.project_filter().label(labels::LABEL_ONEOFF, "false");
        let containers = self.runtime.list_containers(&filter, true).await?;
        Ok(containers
            .into_iter()
            .filter(|c| {
                labels::parse_labels(&c.labels)
                    .map(|id| !self.project.services.contains_key(&id.service))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// 計画を立てる
    pub async fn plan(&self, service: &Service, options: &ConvergeOptions) -> Result<ServicePlan> {
        let hash = self.desired_hash(service).await?;
        let observed = self.service_containers(&service.name).await?;
        let scale = options.scale.unwrap_or_else(|| service.replicas());
        Ok(plan_service(&service.name, &observed, &hash, options.policy, scale))
    }

    /// サービスのコンテナを目標状態に揃え、レプリカのコンテナ名を番号順に返す
    ///
    /// コンテナの起動は行わない。
    #[instrument(skip(self, service, options), fields(service = %service.name))]
    pub async fn converge_service(
        &self,
        service: &Service,
        options: &ConvergeOptions,
    ) -> Result<Vec<String>> {
        let image = service.image_ref(&self.project.name);
        let hash = config_hash(service, &self.resolved_image(&image).await?);
        let observed = self.service_containers(&service.name).await?;
        let scale = options.scale.unwrap_or_else(|| service.replicas());
        let plan = plan_service(&service.name, &observed, &hash, options.policy, scale);
        let timeout = options.timeout.unwrap_or_else(|| service.stop_grace_period());

        let mut names = Vec::new();
        for action in plan.actions {
            match action {
                ReplicaAction::Keep { container } => {
                    debug!(container = %container.name, "Keeping container");
                    self.reconcile_networks(service, &container, &image).await?;
                    names.push(container.name);
                }
                ReplicaAction::Create { number } => {
                    let name = self.create_replica(service, number, &image, &hash, &[]).await?;
                    names.push(name);
                }
                ReplicaAction::Recreate { old, number } => {
                    info!(container = %old.name, "Recreating container: configuration changed");
                    let id = format!("Container {}", old.name);
                    self.emit(id.clone(), EventKind::Recreate);
                    let details = self.runtime.inspect_container(&old.id).await?;
                    if details.is_running() {
                        self.runtime.stop_container(&old.id, Some(timeout)).await?;
                    }
                    self.runtime
                        .remove_container(&old.id, RemoveOptions::default())
                        .await?;
                    let name = self
                        .create_replica(service, number, &image, &hash, &details.mounts)
                        .await?;
                    self.emit(id, EventKind::Recreated);
                    names.push(name);
                }
                ReplicaAction::Remove { container } => {
                    self.stop_and_remove(&container, timeout, false).await?;
                }
            }
        }
        Ok(names)
    }

    /// レプリカのコンテナを作成する
    ///
    /// `inherited` は再作成前のコンテナのマウントで、匿名ボリュームを引き継ぐ。
    pub async fn create_replica(
        &self,
        service: &Service,
        number: u32,
        image: &str,
        hash: &str,
        inherited: &[MountInfo],
    ) -> Result<String> {
        let name = labels::replica_name(self.project, service, number);
        let labels = labels::build_labels(self.project, service, &ContainerRole::Replica(number), hash);
        let mut spec = service_to_container_spec(self.project, service, &name, image, &labels)?;
        inherit_anonymous_volumes(&mut spec, inherited);
        self.create(spec).await?;
        Ok(name)
    }

    /// 仕様どおりにコンテナを作成する
    pub async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let id = format!("Container {}", spec.name);
        self.emit(id.clone(), EventKind::Creating);
        match self.runtime.create_container(&spec).await {
            Ok(container_id) => {
                debug!(container = %spec.name, id = %container_id, "Container created");
                self.emit(id, EventKind::Created);
                Ok(container_id)
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    /// 停止していれば起動する
    pub async fn start_if_needed(&self, name: &str) -> Result<()> {
        let details = self.runtime.inspect_container(name).await?;
        let id = format!("Container {}", name);
        if details.is_running() {
            self.emit(id, EventKind::Running);
            return Ok(());
        }
        self.emit(id.clone(), EventKind::Starting);
        match self.runtime.start_container(name).await {
            Ok(()) => {
                self.emit(id, EventKind::Started);
                Ok(())
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    /// 停止して削除する
    pub async fn stop_and_remove(
        &self,
        container: &ContainerSummary,
        timeout: Duration,
        volumes: bool,
    ) -> Result<()> {
        let id = format!("Container {}", container.name);
        if container.status.is_running() {
            self.emit(id.clone(), EventKind::Stopping);
            self.runtime
                .stop_container(&container.id, Some(timeout))
                .await?;
            self.emit(id.clone(), EventKind::Stopped);
        }
        self.emit(id.clone(), EventKind::Removing);
        match self
            .runtime
            .remove_container(
                &container.id,
                RemoveOptions {
                    force: false,
                    volumes,
                },
            )
            .await
        {
            Ok(()) => {}
            // 既に無い
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.emit(id, EventKind::Removed);
        Ok(())
    }

    /// 既存コンテナのネットワーク接続を宣言に合わせる
    ///
    /// 宣言に追加されたネットワークには接続し、宣言から消えたプロジェクトの
    /// ネットワークからは切断する。`network_mode` を使うサービスは対象外。
    async fn reconcile_networks(
        &self,
        service: &Service,
        container: &ContainerSummary,
        image: &str,
    ) -> Result<()> {
        if service.network_mode.is_some() {
            return Ok(());
        }
        let desired =
            service_to_container_spec(self.project, service, &container.name, image, &Labels::new())?
                .networks;
        let current: BTreeSet<&str> = container.networks.iter().map(String::as_str).collect();

        for attachment in desired.iter().filter(|a| !current.contains(a.network.as_str())) {
            info!(container = %container.name, network = %attachment.network, "Connecting network");
            self.runtime
                .connect_network(&container.id, attachment)
                .await?;
        }

        let project_networks: BTreeSet<String> = self
            .project
            .networks
            .iter()
            .filter(|(_, config)| !config.external)
            .map(|(key, config)| labels::network_name(&self.project.name, key, config))
            .collect();
        let wanted: BTreeSet<&str> = desired.iter().map(|a| a.network.as_str()).collect();
        for network in current
            .iter()
            .filter(|n| project_networks.contains(**n) && !wanted.contains(**n))
        {
            info!(container = %container.name, network = %network, "Disconnecting network");
            self.runtime
                .disconnect_network(network, &container.id, false)
                .await?;
        }
        Ok(())
    }
}

/// 匿名ボリュームのマウント先が一致するものは旧コンテナのボリュームを使う
fn inherit_anonymous_volumes(spec: &mut ContainerSpec, inherited: &[MountInfo]) {
    for mount in spec
        .mounts
        .iter_mut()
        .filter(|m| m.kind == MountKind::Volume && m.source.is_none())
    {
        if let Some(old) = inherited
            .iter()
            .find(|o| o.kind == MountKind::Volume && o.destination == mount.target)
            && let Some(name) = &old.name
        {
            debug!(target = %mount.target, volume = %name, "Inheriting anonymous volume");
            mount.source = Some(name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;
    use fleetcompose_container::{Call, ContainerStatus, MockRuntime, MountSpec};
    use fleetcompose_core::load_project_from_str;
    use std::collections::HashMap;
    use std::path::Path;

    fn summary(service: &str, number: u32, hash: &str, created: i64) -> ContainerSummary {
        let mut labels = HashMap::new();
        labels.insert(labels::LABEL_PROJECT.to_string(), "demo".to_string());
        labels.insert(labels::LABEL_SERVICE.to_string(), service.to_string());
        labels.insert(labels::LABEL_CONTAINER_NUMBER.to_string(), number.to_string());
        labels.insert(labels::LABEL_ONEOFF.to_string(), "false".to_string());
        labels.insert(labels::LABEL_CONFIG_HASH.to_string(), hash.to_string());
        ContainerSummary {
            id: format!("id-{}-{}", number, created),
            name: labels::container_name("demo", service, number),
            image: "nginx".to_string(),
            labels,
            status: ContainerStatus::Running,
            status_text: "Up".to_string(),
            created,
            ports: Vec::new(),
            networks: vec!["demo_default".to_string()],
        }
    }

    fn kinds(plan: &ServicePlan) -> Vec<String> {
        plan.actions
            .iter()
            .map(|a| match a {
                ReplicaAction::Keep { .. } => format!("keep{}", a.number().unwrap()),
                ReplicaAction::Create { number } => format!("create{}", number),
                ReplicaAction::Recreate { number, .. } => format!("recreate{}", number),
                ReplicaAction::Remove { .. } => format!("remove{}", a.number().unwrap()),
            })
            .collect()
    }

    #[test]
    fn test_plan_create_missing() {
        let plan = plan_service("web", &[], "h", RecreatePolicy::Diverged, 2);
        assert_eq!(kinds(&plan), vec!["create1", "create2"]);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_plan_keep_matching_hash() {
        let observed = vec![summary("web", 1, "h", 1)];
        let plan = plan_service("web", &observed, "h", RecreatePolicy::Diverged, 1);
        assert_eq!(kinds(&plan), vec!["keep1"]);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_plan_recreate_policies() {
        let observed = vec![summary("web", 1, "old", 1)];
        let diverged = plan_service("web", &observed, "new", RecreatePolicy::Diverged, 1);
        assert_eq!(kinds(&diverged), vec!["recreate1"]);
        let never = plan_service("web", &observed, "new", RecreatePolicy::Never, 1);
        assert_eq!(kinds(&never), vec!["keep1"]);

        let same = vec![summary("web", 1, "h", 1)];
        let force = plan_service("web", &same, "h", RecreatePolicy::Force, 1);
        assert_eq!(kinds(&force), vec!["recreate1"]);
    }

    #[test]
    fn test_plan_scale_down_removes_highest_first() {
        let observed = vec![
            summary("web", 1, "h", 1),
            summary("web", 2, "h", 2),
            summary("web", 3, "h", 3),
        ];
        let plan = plan_service("web", &observed, "h", RecreatePolicy::Diverged, 1);
        assert_eq!(kinds(&plan), vec!["keep1", "remove3", "remove2"]);
    }

    #[test]
    fn test_plan_fills_gaps_in_order() {
        let observed = vec![summary("web", 2, "h", 1)];
        let plan = plan_service("web", &observed, "h", RecreatePolicy::Diverged, 3);
        assert_eq!(kinds(&plan), vec!["create1", "keep2", "create3"]);
    }

    #[test]
    fn test_plan_duplicate_number_keeps_oldest() {
        let observed = vec![summary("web", 1, "h", 5), summary("web", 1, "h", 2)];
        let plan = plan_service("web", &observed, "h", RecreatePolicy::Diverged, 1);
        assert_eq!(kinds(&plan), vec!["keep1", "remove1"]);
        let ReplicaAction::Keep { container } = &plan.actions[0] else {
            panic!("expected keep");
        };
        assert_eq!(container.created, 2);
    }

    #[test]
    fn test_inherit_anonymous_volumes() {
        let mut spec = ContainerSpec {
            mounts: vec![
                MountSpec {
                    kind: MountKind::Volume,
                    source: None,
                    target: "/var/lib/data".to_string(),
                    read_only: false,
                },
                MountSpec {
                    kind: MountKind::Bind,
                    source: Some("/src".to_string()),
                    target: "/app".to_string(),
                    read_only: false,
                },
            ],
            ..Default::default()
        };
        let old = vec![MountInfo {
            kind: MountKind::Volume,
            name: Some("3f2a9c".to_string()),
            source: None,
            destination: "/var/lib/data".to_string(),
            read_only: false,
        }];
        inherit_anonymous_volumes(&mut spec, &old);
        assert_eq!(spec.mounts[0].source.as_deref(), Some("3f2a9c"));
        assert_eq!(spec.mounts[1].source.as_deref(), Some("/src"));
    }

    const YAML: &str = r#"
services:
  web:
    image: nginx
networks:
  shared:
    external: true
volumes:
  data: {}
"#;

    #[tokio::test]
    async fn test_external_network_must_exist() {
        let project = load_project_from_str(YAML, Path::new("/tmp/demo"), Some("demo")).unwrap();
        let runtime = MockRuntime::new();
        let progress = RecordingProgress::new();
        let reconciler = Reconciler::new(&runtime, &project, &progress);
        let err = reconciler.ensure_networks().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("shared"));
    }

    #[tokio::test]
    async fn test_networks_and_volumes_created_once() {
        let project = load_project_from_str(YAML, Path::new("/tmp/demo"), Some("demo")).unwrap();
        let runtime = MockRuntime::new();
        runtime
            .create_network(&NetworkSpec {
                name: "shared".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let progress = RecordingProgress::new();
        let reconciler = Reconciler::new(&runtime, &project, &progress);

        reconciler.ensure_networks().await.unwrap();
        reconciler.ensure_volumes().await.unwrap();
        assert!(runtime.network_names().contains("demo_default"));
        assert!(runtime.volume_names().contains("demo_data"));

        runtime.clear_calls();
        reconciler.ensure_networks().await.unwrap();
        reconciler.ensure_volumes().await.unwrap();
        assert!(runtime.calls().iter().all(|c| !c.changes_resources()));
        assert_eq!(
            progress.texts_for("Network demo_default"),
            vec!["Creating", "Created"]
        );
    }

    #[tokio::test]
    async fn test_converge_then_keep() {
        let project = load_project_from_str(
            "services:\n  web:\n    image: nginx\n",
            Path::new("/tmp/demo"),
            Some("demo"),
        )
        .unwrap();
        let runtime = MockRuntime::new();
        runtime.add_image("nginx");
        let progress = RecordingProgress::new();
        let reconciler = Reconciler::new(&runtime, &project, &progress);
        reconciler.ensure_networks().await.unwrap();

        let web = project.service("web").unwrap();
        let names = reconciler
            .converge_service(web, &ConvergeOptions::default())
            .await
            .unwrap();
        assert_eq!(names, vec!["demo_web_1".to_string()]);

        runtime.clear_calls();
        let names = reconciler
            .converge_service(web, &ConvergeOptions::default())
            .await
            .unwrap();
        assert_eq!(names, vec!["demo_web_1".to_string()]);
        assert!(runtime.calls().is_empty());

        let names = reconciler
            .converge_service(
                web,
                &ConvergeOptions {
                    scale: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(names, vec!["demo_web_1".to_string(), "demo_web_2".to_string()]);
        assert!(runtime.calls().contains(&Call::CreateContainer("demo_web_2".to_string())));
    }

    #[tokio::test]
    async fn test_kept_container_gets_new_network() {
        let runtime = MockRuntime::new();
        runtime.add_image("nginx");
        let progress = RecordingProgress::new();

        let before = load_project_from_str(
            "services:\n  web:\n    image: nginx\n",
            Path::new("/tmp/demo"),
            Some("demo"),
        )
        .unwrap();
        let reconciler = Reconciler::new(&runtime, &before, &progress);
        reconciler.ensure_networks().await.unwrap();
        reconciler
            .converge_service(before.service("web").unwrap(), &ConvergeOptions::default())
            .await
            .unwrap();

        let after = load_project_from_str(
            "services:\n  web:\n    image: nginx\n    networks: [back]\nnetworks:\n  back: {}\n",
            Path::new("/tmp/demo"),
            Some("demo"),
        )
        .unwrap();
        let reconciler = Reconciler::new(&runtime, &after, &progress);
        reconciler.ensure_networks().await.unwrap();
        runtime.clear_calls();
        reconciler
            .converge_service(after.service("web").unwrap(), &ConvergeOptions::default())
            .await
            .unwrap();

        let calls = runtime.calls();
        assert!(calls.contains(&Call::ConnectNetwork {
            network: "demo_back".to_string(),
            container: "demo_web_1".to_string(),
        }));
        assert!(!calls.iter().any(|c| matches!(c, Call::CreateContainer(_))));
    }
}
