//! Docker Engine API（bollard）によるランタイム実装

// Bollard 0.19.4 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::converter::{endpoint_settings, spec_to_container_config};
use crate::error::classify;
use crate::runtime::RuntimeClient;
use crate::types::*;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    RenameContainerOptions, ResizeContainerTtyOptions, RestartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions, RemoveImageOptions};
use bollard::models::{Ipam, IpamConfig, NetworkCreateRequest, PortMap};
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bytes::Bytes;
use fleetcompose_core::MountKind;
use fleetcompose_core::error::{ComposeError, ResourceKind, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use http_body_util::{Either, Full};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Docker デーモンに接続するランタイム
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// `DOCKER_HOST` などの標準設定で接続
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ComposeError::Unavailable(e.to_string()))?;
        Ok(Self::new(docker))
    }

    /// 標準設定で接続し、API 呼び出しのタイムアウトを上書きする
    pub fn connect_with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let runtime = Self::connect()?;
        Ok(match timeout {
            Some(timeout) => Self::new(runtime.docker.with_timeout(timeout)),
            None => runtime,
        })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

fn credentials(auth: Option<RegistryAuth>) -> Option<DockerCredentials> {
    auth.map(|a| DockerCredentials {
        username: a.username,
        password: a.password,
        identitytoken: a.identity_token,
        serveraddress: a.server_address,
        ..Default::default()
    })
}

/// `registry:5000/app:1.0` → (`registry:5000/app`, `1.0`)
fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

fn health_status(status: Option<String>) -> HealthStatus {
    match status.as_deref() {
        Some("starting") => HealthStatus::Starting,
        Some("healthy") => HealthStatus::Healthy,
        Some("unhealthy") => HealthStatus::Unhealthy,
        _ => HealthStatus::None,
    }
}

fn mount_kind(kind: Option<String>) -> MountKind {
    match kind.as_deref() {
        Some("volume") => MountKind::Volume,
        Some("tmpfs") => MountKind::Tmpfs,
        _ => MountKind::Bind,
    }
}

fn published_ports(ports: Option<PortMap>) -> Vec<PublishedPort> {
    let mut published = Vec::new();
    for (key, bindings) in ports.unwrap_or_default() {
        let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        match bindings {
            Some(bindings) if !bindings.is_empty() => {
                for binding in bindings {
                    published.push(PublishedPort {
                        host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                        host_port: binding.host_port.and_then(|p| p.parse().ok()),
                        container_port,
                        protocol: protocol.to_string(),
                    });
                }
            }
            _ => published.push(PublishedPort {
                host_ip: None,
                host_port: None,
                container_port,
                protocol: protocol.to_string(),
            }),
        }
    }
    published.sort_by(|a, b| {
        (a.container_port, &a.protocol, a.host_port).cmp(&(b.container_port, &b.protocol, b.host_port))
    });
    published
}

fn output_chunk(output: LogOutput) -> OutputChunk {
    match output {
        LogOutput::StdOut { message } => OutputChunk::Stdout(message),
        LogOutput::StdErr { message } => OutputChunk::Stderr(message),
        LogOutput::Console { message } => OutputChunk::Console(message),
        LogOutput::StdIn { message } => OutputChunk::Console(message),
    }
}

fn progress_from(
    id: Option<String>,
    status: Option<String>,
    progress: Option<String>,
    detail: Option<bollard::models::ProgressDetail>,
) -> ImageProgress {
    ImageProgress {
        id,
        status: status.unwrap_or_default(),
        progress,
        current: detail.as_ref().and_then(|d| d.current),
        total: detail.as_ref().and_then(|d| d.total),
    }
}

/// tar アーカイブ先頭のヘッダからパス情報を得る
fn stat_from_archive(archive: &[u8]) -> Option<PathStat> {
    if archive.len() < 512 {
        return None;
    }
    let header = tar::Header::from_byte_slice(&archive[..512]);
    let path = header.path().ok()?;
    let name = path
        .to_string_lossy()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    Some(PathStat {
        name,
        size: header.size().unwrap_or_default(),
        mode: header.mode().unwrap_or_default(),
        is_dir: header.entry_type().is_dir(),
        link_target: header
            .link_name()
            .ok()
            .flatten()
            .map(|l| l.to_string_lossy().into_owned()),
    })
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ComposeError::Unavailable(e.to_string()))
    }

    async fn info(&self) -> Result<RuntimeInfo> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| ComposeError::Unavailable(e.to_string()))?;
        Ok(RuntimeInfo {
            name: "docker".to_string(),
            server_version: info.server_version.unwrap_or_default(),
            os: info.operating_system.unwrap_or_default(),
            arch: info.architecture.unwrap_or_default(),
            cpus: info.ncpu.unwrap_or_default(),
            memory: info.mem_total.unwrap_or_default(),
        })
    }

    async fn list_containers(
        &self,
        filter: &ListFilter,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            filters: filter.to_filters(),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, "*"))?;

        let mut summaries: Vec<ContainerSummary> = containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let ports = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PublishedPort {
                        host_ip: p.ip.filter(|ip| !ip.is_empty()),
                        host_port: p.public_port,
                        container_port: p.private_port,
                        protocol: p.typ.map(|t| t.to_string()).unwrap_or_else(|| "tcp".into()),
                    })
                    .collect();
                let networks = c
                    .network_settings
                    .and_then(|s| s.networks)
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default();
                ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name,
                    image: c.image.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                    status: c
                        .state
                        .map(|s| ContainerStatus::parse(&s.to_string()))
                        .unwrap_or(ContainerStatus::Unknown),
                    status_text: c.status.unwrap_or_default(),
                    created: c.created.unwrap_or_default(),
                    ports,
                    networks,
                }
            })
            .collect();
        summaries.sort_by_key(|c| c.created);
        Ok(summaries)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))?;

        let state = info.state.unwrap_or_default();
        let config = info.config.unwrap_or_default();
        let settings = info.network_settings.unwrap_or_default();

        let networks: BTreeMap<String, Vec<String>> = settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| (name, endpoint.aliases.unwrap_or_default()))
            .collect();

        let mounts = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountInfo {
                kind: mount_kind(m.typ.map(|t| t.to_string())),
                name: m.name,
                source: m.source,
                destination: m.destination.unwrap_or_default(),
                read_only: !m.rw.unwrap_or(true),
            })
            .collect();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            image_id: info.image.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            status: state
                .status
                .map(|s| ContainerStatus::parse(&s.to_string()))
                .unwrap_or(ContainerStatus::Unknown),
            health: health_status(
                state
                    .health
                    .and_then(|h| h.status)
                    .map(|s| s.to_string()),
            ),
            exit_code: state.exit_code.unwrap_or_default(),
            tty: config.tty.unwrap_or_default(),
            open_stdin: config.open_stdin.unwrap_or_default(),
            ports: published_ports(settings.ports),
            networks,
            mounts,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let (config, options) = spec_to_container_config(spec);
        debug!(container = %spec.name, image = %spec.image, "Creating container");

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match classify(e, ResourceKind::Container, &spec.name) {
                // 404 はイメージが無いことを意味する
                ComposeError::NotFound { .. } => {
                    ComposeError::not_found(ResourceKind::Image, &spec.image)
                }
                other => other,
            })?;

        // 2 つ目以降のネットワークは作成後に接続
        for attachment in spec.networks.iter().skip(1) {
            self.connect_network(&response.id, attachment).await?;
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
        {
            Ok(_) => Ok(()),
            // 既に起動済み
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ResourceKind::Container, id)),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let options = timeout.map(|t| StopContainerOptions {
            t: t.as_secs() as i64,
        });
        match self.docker.stop_container(id, options).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ResourceKind::Container, id)),
        }
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.to_string(),
        };
        self.docker
            .kill_container(id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn restart_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let options = timeout.map(|t| RestartContainerOptions {
            t: t.as_secs() as isize,
        });
        self.docker
            .restart_container(id, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let options = RemoveContainerOptions {
            force: options.force,
            v: options.volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<bollard::query_parameters::WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // 0 以外の終了コードはエラーとして届く
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e, ResourceKind::Container, id)),
            None => Err(ComposeError::runtime(format!(
                "wait stream for '{}' ended without a status",
                id
            ))),
        }
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()> {
        let options = RenameContainerOptions {
            name: new_name.to_string(),
        };
        self.docker
            .rename_container(id, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, new_name))
    }

    async fn resize_container(&self, id: &str, size: TtySize) -> Result<()> {
        let options = ResizeContainerTtyOptions {
            height: size.rows,
            width: size.cols,
        };
        self.docker
            .resize_container_tty(id, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn attach_container(
        &self,
        id: &str,
        options: &AttachOptions,
    ) -> Result<AttachedStreams> {
        let attach = AttachContainerOptions::<String> {
            stdin: Some(options.stdin),
            stdout: Some(options.stdout),
            stderr: Some(options.stderr),
            stream: Some(true),
            logs: Some(options.logs),
            detach_keys: None,
        };
        let results = self
            .docker
            .attach_container(id, Some(attach))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))?;

        let name = id.to_string();
        let output = results
            .output
            .map(move |item| {
                item.map(output_chunk)
                    .map_err(|e| classify(e, ResourceKind::Container, &name))
            })
            .boxed();
        let input: Option<InputSink> = if options.stdin {
            Some(results.input)
        } else {
            None
        };
        Ok(AttachedStreams { output, input })
    }

    fn container_logs(&self, id: &str, options: &LogOptions) -> RuntimeStream<OutputChunk> {
        let logs = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            since: options.since.unwrap_or_default(),
            until: options.until.unwrap_or_default(),
            timestamps: options.timestamps,
            tail: options.tail.to_string(),
        };
        let name = id.to_string();
        self.docker
            .logs(id, Some(logs))
            .map(move |item| {
                item.map(output_chunk)
                    .map_err(|e| classify(e, ResourceKind::Container, &name))
            })
            .boxed()
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions::<String> {
            cmd: Some(spec.command.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            privileged: Some(spec.privileged),
            attach_stdin: Some(spec.stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, container))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<AttachedStreams> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };
        let results = self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Exec, exec_id))?;

        match results {
            StartExecResults::Attached { output, input } => {
                let name = exec_id.to_string();
                let output = output
                    .map(move |item| {
                        item.map(output_chunk)
                            .map_err(|e| classify(e, ResourceKind::Exec, &name))
                    })
                    .boxed();
                Ok(AttachedStreams {
                    output,
                    input: Some(input),
                })
            }
            StartExecResults::Detached => Ok(AttachedStreams {
                output: stream::empty().boxed(),
                input: None,
            }),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let info = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| classify(e, ResourceKind::Exec, exec_id))?;
        Ok(ExecState {
            running: info.running.unwrap_or_default(),
            exit_code: info.exit_code,
        })
    }

    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<()> {
        let options = ResizeExecOptions {
            height: size.rows,
            width: size.cols,
        };
        self.docker
            .resize_exec(exec_id, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Exec, exec_id))
    }

    async fn copy_to_container(&self, id: &str, path: &str, archive: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Either::Left(Full::new(archive)))
            .await
            .map_err(|e| match classify(e, ResourceKind::Container, id) {
                ComposeError::NotFound { .. } => ComposeError::not_found(ResourceKind::Path, path),
                other => other,
            })
    }

    fn copy_from_container(&self, id: &str, path: &str) -> RuntimeStream<Bytes> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let target = path.to_string();
        self.docker
            .download_from_container(id, Some(options))
            .map_err(move |e| classify(e, ResourceKind::Path, &target))
            .boxed()
    }

    async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat> {
        // Engine API の HEAD archive は bollard に無いので先頭ブロックだけ読む
        let mut stream = self.copy_from_container(id, path);
        let mut head = Vec::new();
        while head.len() < 512 {
            match stream.next().await {
                Some(chunk) => head.extend_from_slice(&chunk?),
                None => break,
            }
        }
        stat_from_archive(&head)
            .ok_or_else(|| ComposeError::runtime(format!("unexpected archive for '{}'", path)))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(ImageInfo {
                id: image.id.unwrap_or_default(),
                repo_digests: image.repo_digests.unwrap_or_default(),
                labels: image.config.and_then(|c| c.labels).unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(classify(e, ResourceKind::Image, reference)),
        }
    }

    fn pull_image(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> RuntimeStream<ImageProgress> {
        let (image_name, tag) = split_reference(reference);
        let options = CreateImageOptions::<String> {
            from_image: image_name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let name = reference.to_string();
        self.docker
            .create_image(Some(options), None, credentials(auth))
            .map(move |item| match item {
                Ok(info) => match info.error_detail.and_then(|d| d.message) {
                    Some(message) => Err(ComposeError::runtime(format!(
                        "failed to pull '{}': {}",
                        name, message
                    ))),
                    None => Ok(progress_from(info.id, info.status, info.progress, info.progress_detail)),
                },
                Err(e) => Err(classify(e, ResourceKind::Image, &name)),
            })
            .boxed()
    }

    fn push_image(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> RuntimeStream<ImageProgress> {
        let (image_name, tag) = split_reference(reference);
        let options = PushImageOptions::<String> {
            tag: tag.to_string(),
        };
        let name = reference.to_string();
        self.docker
            .push_image(image_name, Some(options), credentials(auth))
            .map(move |item| match item {
                Ok(info) => match info.error {
                    Some(message) => Err(ComposeError::runtime(format!(
                        "failed to push '{}': {}",
                        name, message
                    ))),
                    None => Ok(progress_from(None, info.status, info.progress, None)),
                },
                Err(e) => Err(classify(e, ResourceKind::Image, &name)),
            })
            .boxed()
    }

    fn build_image(&self, spec: BuildSpec) -> RuntimeStream<ImageProgress> {
        let options = BuildImageOptions::<String> {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            buildargs: spec.args.clone(),
            labels: spec.labels.clone(),
            target: spec.target.clone().unwrap_or_default(),
            nocache: spec.no_cache,
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            pull: spec.pull,
            ..Default::default()
        };
        debug!(tag = %spec.tag, dockerfile = %spec.dockerfile, "Building image");

        let tag = spec.tag;
        let docker = self.docker.clone();
        spawn_stream(move |tx| async move {
            // build_image のストリームはクライアントを借用するため、タスク側で所有する
            let mut builds = Box::pin(docker.build_image(
                options,
                None,
                Some(Either::Left(Full::new(spec.context))),
            ));
            while let Some(item) = builds.next().await {
                let item = match item {
                    Ok(info) => match info.error_detail.and_then(|d| d.message) {
                        Some(message) => Err(ComposeError::runtime(format!(
                            "failed to build '{}': {}",
                            tag, message
                        ))),
                        None => {
                            let status = info.stream.or(info.status);
                            Ok(progress_from(info.id, status, info.progress, info.progress_detail))
                        }
                    },
                    Err(e) => Err(classify(e, ResourceKind::Image, &tag)),
                };
                if tx.send(item).await.is_err() {
                    debug!(tag = %tag, "Build progress receiver dropped");
                    break;
                }
            }
        })
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, ResourceKind::Image, reference))
    }

    async fn list_networks(&self, filter: &ListFilter) -> Result<Vec<NetworkInfo>> {
        let options = ListNetworksOptions::<String> {
            filters: filter.to_filters(),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Network, "*"))?;
        Ok(networks.into_iter().map(network_info).collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo> {
        let network = self
            .docker
            .inspect_network(name, None::<bollard::query_parameters::InspectNetworkOptions>)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, name))?;
        Ok(network_info(network))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let ipam = if spec.ipam_driver.is_some() || !spec.ipam_pools.is_empty() {
            Some(Ipam {
                driver: spec.ipam_driver.clone(),
                config: Some(
                    spec.ipam_pools
                        .iter()
                        .map(|p| IpamConfig {
                            subnet: p.subnet.clone(),
                            ip_range: p.ip_range.clone(),
                            gateway: p.gateway.clone(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            })
        } else {
            None
        };
        let network_config = NetworkCreateRequest {
            name: spec.name.clone(),
            driver: Some(spec.driver.clone().unwrap_or_else(|| "bridge".to_string())),
            options: Some(spec.driver_opts.clone()),
            labels: Some(spec.labels.clone()),
            attachable: Some(spec.attachable),
            internal: Some(spec.internal),
            enable_ipv6: Some(spec.enable_ipv6),
            ipam,
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(network_config)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, &spec.name))?;
        Ok(response.id)
    }

    async fn connect_network(
        &self,
        container: &str,
        attachment: &NetworkAttachment,
    ) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: endpoint_settings(attachment),
        };
        self.docker
            .connect_network(&attachment.network, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, &attachment.network))
    }

    async fn disconnect_network(&self, network: &str, container: &str, force: bool) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        self.docker
            .disconnect_network(network, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, network))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| match classify(e, ResourceKind::Network, name) {
                // エンドポイントが残っている
                ComposeError::Runtime { message, .. } if message.contains("active endpoints") => {
                    ComposeError::Forbidden(message)
                }
                other => other,
            })
    }

    async fn list_volumes(&self, filter: &ListFilter) -> Result<Vec<VolumeInfo>> {
        let options = ListVolumesOptions::<String> {
            filters: filter.to_filters(),
        };
        let response = self
            .docker
            .list_volumes(Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, "*"))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(volume_info)
            .collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        let volume = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, name))?;
        Ok(volume_info(volume))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let options = CreateVolumeOptions::<String> {
            name: spec.name.clone(),
            driver: spec.driver.clone().unwrap_or_else(|| "local".to_string()),
            driver_opts: spec.driver_opts.clone(),
            labels: spec.labels.clone(),
        };
        let volume = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, &spec.name))?;
        Ok(volume_info(volume))
    }

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        let options = RemoveVolumeOptions { force };
        self.docker
            .remove_volume(name, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, name))
    }

    fn events(&self, filter: &ListFilter) -> RuntimeStream<RuntimeEvent> {
        let options = bollard::query_parameters::EventsOptions {
            filters: Some(filter.to_filters()),
            ..Default::default()
        };
        self.docker
            .events(Some(options))
            .map(|item| match item {
                Ok(message) => {
                    let actor = message.actor.unwrap_or_default();
                    Ok(RuntimeEvent {
                        time_nanos: message
                            .time_nano
                            .or_else(|| message.time.map(|t| t * 1_000_000_000))
                            .unwrap_or_default(),
                        kind: message.typ.map(|t| t.to_string()).unwrap_or_default(),
                        action: message.action.unwrap_or_default(),
                        id: actor.id.unwrap_or_default(),
                        attributes: actor.attributes.unwrap_or_default(),
                    })
                }
                Err(e) => Err(classify(e, ResourceKind::Container, "events")),
            })
            .boxed()
    }
}

fn network_info(network: bollard::models::Network) -> NetworkInfo {
    NetworkInfo {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver.unwrap_or_default(),
        labels: network.labels.unwrap_or_default(),
        containers: network
            .containers
            .map(|c| c.into_keys().collect())
            .unwrap_or_default(),
    }
}

fn volume_info(volume: bollard::models::Volume) -> VolumeInfo {
    VolumeInfo {
        name: volume.name,
        driver: volume.driver,
        labels: volume.labels,
        mountpoint: volume.mountpoint,
    }
}

/// 進捗ストリームの中継バッファ
const STREAM_BUFFER: usize = 64;

/// `produce` をタスクとして動かし、送られた要素を `'static` なストリームとして返す
///
/// 受け手がストリームを破棄すると送信が失敗するので、`produce` はそこで止める。
fn spawn_stream<T, F, Fut>(produce: F) -> RuntimeStream<T>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(produce(tx));
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}
