//! Service から ContainerSpec、ContainerSpec から Docker API パラメータへの変換

use crate::types::{
    ContainerSpec, HealthcheckSpec, MountSpec, NetworkAttachment, PortBindingSpec, ResourceLimits,
    RestartSpec,
};
use bollard::container::{Config, CreateContainerOptions, NetworkingConfig};
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HealthConfig, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use fleetcompose_core::duration::parse_bytes;
use fleetcompose_core::error::{ComposeError, Result};
use fleetcompose_core::labels::{self, Labels};
use fleetcompose_core::{HealthCheck, MountKind, Project, ResourceSpec, Service};
use std::collections::HashMap;
use std::time::Duration;

/// `network_mode` 等で参照される他サービスのコンテナ名（1 番目のレプリカ）
fn service_container(project: &Project, service: &str) -> String {
    match project.services.get(service) {
        Some(svc) => labels::replica_name(project, svc, 1),
        None => labels::container_name(&project.name, service, 1),
    }
}

fn nanos(duration: Option<Duration>) -> Option<i64> {
    duration.map(|d| d.as_nanos() as i64)
}

/// ServiceをContainerSpecに変換
///
/// `image` は pull/build 解決後のイメージ参照、`labels` は付与するラベル一式。
pub fn service_to_container_spec(
    project: &Project,
    service: &Service,
    name: &str,
    image: &str,
    labels: &Labels,
) -> Result<ContainerSpec> {
    let fail = |message: String| {
        ComposeError::invalid(format!("service '{}': {}", service.name, message))
    };

    // 環境変数の設定（キー順）
    let env: Vec<String> = service
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let ports = service
        .ports
        .iter()
        .map(|port| PortBindingSpec {
            container_port: port.target,
            protocol: port.protocol.as_str().to_string(),
            host_ip: port.host_ip.clone(),
            host_port: port.published,
        })
        .collect();

    let mut mounts = Vec::new();
    for volume in &service.volumes {
        let source = match (volume.kind, volume.source.as_deref()) {
            (MountKind::Volume, Some(key)) => {
                let config = project.volumes.get(key).cloned().unwrap_or_default();
                Some(labels::volume_name(&project.name, key, &config))
            }
            (_, source) => source.map(str::to_string),
        };
        mounts.push(MountSpec {
            kind: volume.kind,
            source,
            target: volume.target.clone(),
            read_only: volume.read_only,
        });
    }

    // secrets / configs は読み取り専用の bind マウント
    for secret in &service.secrets {
        let file = project
            .secrets
            .get(&secret.source)
            .and_then(|s| s.file.as_ref())
            .ok_or_else(|| fail(format!("secret '{}' has no file", secret.source)))?;
        mounts.push(MountSpec {
            kind: MountKind::Bind,
            source: Some(file.to_string_lossy().into_owned()),
            target: secret.secret_target(),
            read_only: true,
        });
    }
    for config in &service.configs {
        let file = project
            .configs
            .get(&config.source)
            .and_then(|c| c.file.as_ref())
            .ok_or_else(|| fail(format!("config '{}' has no file", config.source)))?;
        mounts.push(MountSpec {
            kind: MountKind::Bind,
            source: Some(file.to_string_lossy().into_owned()),
            target: config.config_target(),
            read_only: true,
        });
    }

    let volumes_from = service
        .volumes_from
        .iter()
        .map(|entry| match entry.strip_prefix("container:") {
            Some(container) => container.to_string(),
            None => match entry.split_once(':') {
                Some((svc, mode)) => format!("{}:{}", service_container(project, svc), mode),
                None => service_container(project, entry),
            },
        })
        .collect();

    let network_mode = service.network_mode.as_ref().map(|mode| {
        match service.network_mode_service() {
            Some(target) => format!("container:{}", service_container(project, target)),
            None => mode.clone(),
        }
    });

    // ネットワーク設定（サービス名でエイリアス）
    let networks = service
        .networks
        .iter()
        .map(|(key, settings)| {
            let config = project.networks.get(key).cloned().unwrap_or_default();
            let mut aliases = vec![service.name.clone()];
            for alias in &settings.aliases {
                if !aliases.contains(alias) {
                    aliases.push(alias.clone());
                }
            }
            NetworkAttachment {
                network: labels::network_name(&project.name, key, &config),
                aliases,
                ipv4_address: settings.ipv4_address.clone(),
                ipv6_address: settings.ipv6_address.clone(),
            }
        })
        .collect();

    Ok(ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
        command: service.command.clone(),
        entrypoint: service.entrypoint.clone(),
        env,
        labels: labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        hostname: service.hostname.clone(),
        working_dir: service.working_dir.clone(),
        user: service.user.clone(),
        tty: service.tty,
        open_stdin: service.stdin_open,
        ports,
        mounts,
        volumes_from,
        networks,
        network_mode,
        restart: restart_spec(service),
        healthcheck: service.healthcheck.as_ref().map(healthcheck_spec),
        resources: resource_limits(service).map_err(fail)?,
        stop_signal: service.stop_signal.clone(),
        stop_timeout: Some(service.stop_grace_period().as_secs() as i64),
        init: service.init,
        privileged: service.privileged,
        read_only: service.read_only,
        extra_hosts: service.extra_hosts.clone(),
        dns: service.dns.clone(),
        cap_add: service.cap_add.clone(),
        cap_drop: service.cap_drop.clone(),
    })
}

fn restart_spec(service: &Service) -> Option<RestartSpec> {
    if let Some(policy) = &service.restart {
        return Some(RestartSpec {
            name: policy.as_docker_str().to_string(),
            max_retries: policy.max_retries().map(i64::from),
        });
    }
    let policy = service.deploy.as_ref()?.restart_policy.as_ref()?;
    let name = match policy.condition.as_deref() {
        Some("none") => "no",
        Some("on-failure") => "on-failure",
        _ => "always",
    };
    Some(RestartSpec {
        name: name.to_string(),
        max_retries: policy.max_attempts.map(i64::from),
    })
}

fn healthcheck_spec(check: &HealthCheck) -> HealthcheckSpec {
    if check.is_disabled() {
        return HealthcheckSpec {
            test: vec!["NONE".to_string()],
            ..Default::default()
        };
    }
    HealthcheckSpec {
        test: check.test.clone(),
        interval: nanos(check.interval),
        timeout: nanos(check.timeout),
        retries: check.retries.map(i64::from),
        start_period: nanos(check.start_period),
    }
}

fn resource_limits(service: &Service) -> std::result::Result<ResourceLimits, String> {
    let resources = service.deploy.as_ref().and_then(|d| d.resources.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());
    let reservations = resources.and_then(|r| r.reservations.as_ref());

    let memory_of = |spec: Option<&ResourceSpec>| -> std::result::Result<Option<i64>, String> {
        spec.and_then(|s| s.memory.as_deref())
            .map(parse_bytes)
            .transpose()
    };

    Ok(ResourceLimits {
        nano_cpus: limits
            .and_then(|l| l.cpus)
            .map(|cpus| (cpus * 1_000_000_000.0) as i64),
        memory: memory_of(limits)?,
        memory_reservation: memory_of(reservations)?,
        pids_limit: limits.and_then(|l| l.pids),
    })
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    }
}

/// ネットワーク接続のエンドポイント設定
pub fn endpoint_settings(attachment: &NetworkAttachment) -> EndpointSettings {
    let ipam_config = if attachment.ipv4_address.is_some() || attachment.ipv6_address.is_some() {
        Some(EndpointIpamConfig {
            ipv4_address: attachment.ipv4_address.clone(),
            ipv6_address: attachment.ipv6_address.clone(),
            ..Default::default()
        })
    } else {
        None
    };
    EndpointSettings {
        aliases: Some(attachment.aliases.clone()),
        ipam_config,
        ..Default::default()
    }
}

/// ContainerSpecをDockerのコンテナ設定に変換
///
/// 最初のネットワークだけを作成時に接続する（Docker API の制約）。
/// 残りは作成後に connect する。
#[allow(deprecated)]
pub fn spec_to_container_config(
    spec: &ContainerSpec,
) -> (Config<String>, CreateContainerOptions<String>) {
    // ポートバインディングの設定
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports = HashMap::new();

    for port in &spec.ports {
        let container_port = port.key();

        // ポート公開設定
        exposed_ports.insert(container_port.clone(), HashMap::new());

        // ホストポートバインディング（未指定なら空きポート）
        let binding = PortBinding {
            host_ip: Some(port.host_ip.clone().unwrap_or_default()),
            host_port: Some(port.host_port.map(|p| p.to_string()).unwrap_or_default()),
        };
        port_bindings
            .entry(container_port)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(binding);
    }

    // ボリュームバインディング
    let mut binds = Vec::new();
    let mut tmpfs = HashMap::new();
    let mut anonymous = HashMap::new();
    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        match (mount.kind, &mount.source) {
            (MountKind::Tmpfs, _) => {
                tmpfs.insert(mount.target.clone(), String::new());
            }
            (_, Some(source)) => binds.push(format!("{}:{}:{}", source, mount.target, mode)),
            (_, None) => {
                anonymous.insert(mount.target.clone(), HashMap::new());
            }
        }
    }

    let primary_network = spec.networks.first();
    let network_mode = spec
        .network_mode
        .clone()
        .or_else(|| primary_network.map(|n| n.network.clone()));

    let non_empty = |v: &Vec<String>| if v.is_empty() { None } else { Some(v.clone()) };

    let host_config = Some(HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(binds),
        tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
        network_mode,
        volumes_from: non_empty(&spec.volumes_from),
        restart_policy: spec.restart.as_ref().map(|r| RestartPolicy {
            name: Some(restart_policy_name(&r.name)),
            maximum_retry_count: r.max_retries,
        }),
        nano_cpus: spec.resources.nano_cpus,
        memory: spec.resources.memory,
        memory_reservation: spec.resources.memory_reservation,
        pids_limit: spec.resources.pids_limit,
        init: spec.init,
        privileged: Some(spec.privileged),
        readonly_rootfs: Some(spec.read_only),
        extra_hosts: non_empty(&spec.extra_hosts),
        dns: non_empty(&spec.dns),
        cap_add: non_empty(&spec.cap_add),
        cap_drop: non_empty(&spec.cap_drop),
        ..Default::default()
    });

    // ネットワーク設定（最初のネットワークのみ）
    let networking_config = primary_network.map(|attachment| {
        let mut endpoints = HashMap::new();
        endpoints.insert(attachment.network.clone(), endpoint_settings(attachment));
        NetworkingConfig {
            endpoints_config: endpoints,
        }
    });

    let healthcheck = spec.healthcheck.as_ref().map(|h| HealthConfig {
        test: Some(h.test.clone()),
        interval: h.interval,
        timeout: h.timeout,
        retries: h.retries,
        start_period: h.start_period,
        ..Default::default()
    });

    // コンテナ設定
    let config = Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        volumes: if anonymous.is_empty() {
            None
        } else {
            Some(anonymous)
        },
        host_config,
        labels: Some(spec.labels.clone()),
        cmd: non_empty(&spec.command),
        entrypoint: non_empty(&spec.entrypoint),
        hostname: spec.hostname.clone(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        attach_stdin: Some(spec.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        stop_signal: spec.stop_signal.clone(),
        stop_timeout: spec.stop_timeout,
        healthcheck,
        networking_config,
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.clone(),
        platform: None,
    };

    (config, options)
}
