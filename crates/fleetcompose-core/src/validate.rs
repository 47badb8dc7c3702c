//! プロジェクトの検証

use crate::error::{ComposeError, Result};
use crate::graph::DependencyGraph;
use crate::model::{Project, Service};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn project_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("project name pattern is valid")
    })
}

fn service_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("service name pattern is valid")
    })
}

/// プロジェクト名として有効か
pub fn is_valid_project_name(name: &str) -> bool {
    project_name_pattern().is_match(name)
}

/// 任意の文字列をプロジェクト名に正規化する
///
/// 小文字化し、使えない文字を落とし、先頭の `_`/`-` を取り除く。
pub fn normalize_project_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    lowered.trim_start_matches(['_', '-']).to_string()
}

/// エンジンが使う前の検証
///
/// - プロジェクト名とサービス名の形式
/// - image か build のどちらかが設定されている
/// - レプリカ数 ≥ 1、container_name はレプリカ数 1 のときのみ
/// - 同一サービス内で公開ポートが衝突しない
/// - depends_on / volumes_from / network_mode / networks / volumes / secrets / configs の参照が解決できる
/// - depends_on に循環が無い
pub fn validate(project: &Project) -> Result<()> {
    if !is_valid_project_name(&project.name) {
        return Err(ComposeError::invalid(format!(
            "project name '{}' must match [a-z0-9][a-z0-9_-]*",
            project.name
        )));
    }
    if project.services.is_empty() {
        return Err(ComposeError::invalid("no services defined"));
    }

    for (name, service) in &project.services {
        if !service_name_pattern().is_match(name) {
            return Err(ComposeError::invalid(format!(
                "invalid service name '{}'",
                name
            )));
        }
        validate_service(project, name, service)?;
    }

    DependencyGraph::from_project(project)?;
    Ok(())
}

fn validate_service(project: &Project, name: &str, service: &Service) -> Result<()> {
    let fail = |message: String| ComposeError::invalid(format!("service '{}': {}", name, message));

    if service.image.is_none() && service.build.is_none() {
        return Err(fail("one of 'image' or 'build' must be set".into()));
    }

    let replicas = service.deploy.as_ref().and_then(|d| d.replicas);
    if replicas == Some(0) {
        return Err(fail("replicas must be at least 1".into()));
    }
    if service.container_name.is_some() && service.replicas() > 1 {
        return Err(fail(
            "'container_name' cannot be used with more than one replica".into(),
        ));
    }

    let mut published = HashSet::new();
    for port in &service.ports {
        if let Some(host_port) = port.published {
            let key = (port.host_ip.clone(), host_port, port.protocol);
            if !published.insert(key) {
                return Err(fail(format!(
                    "host port {}/{} is published more than once",
                    host_port,
                    port.protocol.as_str()
                )));
            }
        }
    }

    for dep in service.depends_on.keys() {
        if !project.services.contains_key(dep) {
            return Err(fail(format!("depends on undefined service '{}'", dep)));
        }
    }
    for dep in service.volumes_from_services() {
        if !project.services.contains_key(dep) {
            return Err(fail(format!("volumes_from undefined service '{}'", dep)));
        }
    }
    if let Some(target) = service.network_mode_service()
        && !project.services.contains_key(target)
    {
        return Err(fail(format!(
            "network_mode refers to undefined service '{}'",
            target
        )));
    }
    if service.network_mode.is_some() && !service.networks.is_empty() {
        let mode = service.network_mode.as_deref().unwrap_or_default();
        if mode != "bridge" {
            return Err(fail(format!(
                "'networks' cannot be combined with network_mode '{}'",
                mode
            )));
        }
    }

    for network in service.networks.keys() {
        if !project.networks.contains_key(network) {
            return Err(fail(format!("uses undefined network '{}'", network)));
        }
    }
    for mount in &service.volumes {
        if let Some(volume) = mount.named_volume()
            && !project.volumes.contains_key(volume)
        {
            return Err(fail(format!("uses undefined volume '{}'", volume)));
        }
    }
    for secret in &service.secrets {
        if !project.secrets.contains_key(&secret.source) {
            return Err(fail(format!("uses undefined secret '{}'", secret.source)));
        }
    }
    for config in &service.configs {
        if !project.configs.contains_key(&config.source) {
            return Err(fail(format!("uses undefined config '{}'", config.source)));
        }
    }
    Ok(())
}
