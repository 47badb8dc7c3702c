//! ラベルと命名規則
//!
//! エンジンが管理するリソースのラベル付与・解釈と、
//! コンテナ・ネットワーク・ボリューム名の生成を一箇所にまとめる。

use crate::model::{NetworkConfig, Project, Service, VolumeConfig};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

pub const LABEL_PROJECT: &str = "compose.project";
pub const LABEL_SERVICE: &str = "compose.service";
pub const LABEL_CONTAINER_NUMBER: &str = "compose.container-number";
pub const LABEL_ONEOFF: &str = "compose.oneoff";
pub const LABEL_SLUG: &str = "compose.slug";
pub const LABEL_CONFIG_HASH: &str = "compose.config-hash";
pub const LABEL_WORKING_DIR: &str = "compose.project.working_dir";
pub const LABEL_CONFIG_FILES: &str = "compose.project.config_files";
pub const LABEL_VERSION: &str = "compose.version";
pub const LABEL_NETWORK: &str = "compose.network";
pub const LABEL_VOLUME: &str = "compose.volume";
/// エンジンがビルドしたイメージであることを示す（`down --rmi local` の判定用）
pub const LABEL_IMAGE_BUILDER: &str = "compose.image.builder";

/// エンジン管理ラベル（config hash の対象外）
pub const ENGINE_MANAGED_LABELS: &[&str] = &[
    LABEL_PROJECT,
    LABEL_SERVICE,
    LABEL_CONTAINER_NUMBER,
    LABEL_ONEOFF,
    LABEL_SLUG,
    LABEL_CONFIG_HASH,
    LABEL_WORKING_DIR,
    LABEL_CONFIG_FILES,
    LABEL_VERSION,
    LABEL_NETWORK,
    LABEL_VOLUME,
];

/// ラベルに記録するエンジンのバージョン
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Labels = BTreeMap<String, String>;

pub fn is_engine_managed(key: &str) -> bool {
    ENGINE_MANAGED_LABELS.contains(&key)
}

/// コンテナの役割
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRole {
    /// 常駐サービスの N 番目のレプリカ
    Replica(u32),
    /// run で作られる一時コンテナ
    OneOff { slug: String },
}

/// ラベルから読み取ったコンテナの身元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub project: String,
    pub service: String,
    pub number: u32,
    pub oneoff: bool,
    pub slug: Option<String>,
    pub config_hash: Option<String>,
}

fn project_labels(project: &Project) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_PROJECT.to_string(), project.name.clone());
    labels.insert(
        LABEL_WORKING_DIR.to_string(),
        project.working_dir.to_string_lossy().into_owned(),
    );
    let files: Vec<String> = project
        .config_files
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    labels.insert(LABEL_CONFIG_FILES.to_string(), files.join(","));
    labels.insert(LABEL_VERSION.to_string(), ENGINE_VERSION.to_string());
    labels
}

/// コンテナに付与するラベル一式
///
/// ユーザー定義ラベルの上にエンジン管理ラベルを重ねる。
pub fn build_labels(
    project: &Project,
    service: &Service,
    role: &ContainerRole,
    config_hash: &str,
) -> Labels {
    let mut labels: Labels = service
        .labels
        .iter()
        .filter(|(k, _)| !is_engine_managed(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.extend(project_labels(project));
    labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
    labels.insert(LABEL_CONFIG_HASH.to_string(), config_hash.to_string());

    match role {
        ContainerRole::Replica(number) => {
            labels.insert(LABEL_CONTAINER_NUMBER.to_string(), number.to_string());
            labels.insert(LABEL_ONEOFF.to_string(), "false".to_string());
        }
        ContainerRole::OneOff { slug } => {
            labels.insert(LABEL_CONTAINER_NUMBER.to_string(), "1".to_string());
            labels.insert(LABEL_ONEOFF.to_string(), "true".to_string());
            labels.insert(LABEL_SLUG.to_string(), slug.clone());
        }
    }
    labels
}

/// ネットワークに付与するラベル
pub fn network_labels(project: &Project, key: &str, config: &NetworkConfig) -> Labels {
    let mut labels = config.labels.clone();
    labels.insert(LABEL_PROJECT.to_string(), project.name.clone());
    labels.insert(LABEL_NETWORK.to_string(), key.to_string());
    labels.insert(LABEL_VERSION.to_string(), ENGINE_VERSION.to_string());
    labels
}

/// ボリュームに付与するラベル
pub fn volume_labels(project: &Project, key: &str, config: &VolumeConfig) -> Labels {
    let mut labels = config.labels.clone();
    labels.insert(LABEL_PROJECT.to_string(), project.name.clone());
    labels.insert(LABEL_VOLUME.to_string(), key.to_string());
    labels.insert(LABEL_VERSION.to_string(), ENGINE_VERSION.to_string());
    labels
}

/// ラベルからコンテナの身元を読み取る
///
/// プロジェクトまたはサービスのラベルが無いコンテナは管理対象外として None。
pub fn parse_labels(labels: &HashMap<String, String>) -> Option<ContainerIdentity> {
    let project = labels.get(LABEL_PROJECT)?.clone();
    let service = labels.get(LABEL_SERVICE)?.clone();
    let oneoff = labels
        .get(LABEL_ONEOFF)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let number = labels
        .get(LABEL_CONTAINER_NUMBER)
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);

    Some(ContainerIdentity {
        project,
        service,
        number,
        oneoff,
        slug: labels.get(LABEL_SLUG).cloned(),
        config_hash: labels.get(LABEL_CONFIG_HASH).cloned(),
    })
}

/// `{project}_{service}_{number}`
pub fn container_name(project: &str, service: &str, number: u32) -> String {
    format!("{}_{}_{}", project, service, number)
}

/// `{project}_{service}_run_{slug}`
pub fn oneoff_container_name(project: &str, service: &str, slug: &str) -> String {
    format!("{}_{}_run_{}", project, service, slug)
}

/// サービスの N 番目のレプリカのコンテナ名（container_name 指定を優先）
pub fn replica_name(project: &Project, service: &Service, number: u32) -> String {
    match &service.container_name {
        Some(name) => name.clone(),
        None => container_name(&project.name, &service.name, number),
    }
}

/// ネットワークのランタイム上の名前
pub fn network_name(project: &str, key: &str, config: &NetworkConfig) -> String {
    match (&config.name, config.external) {
        (Some(name), _) => name.clone(),
        (None, true) => key.to_string(),
        (None, false) => format!("{}_{}", project, key),
    }
}

/// ボリュームのランタイム上の名前
pub fn volume_name(project: &str, key: &str, config: &VolumeConfig) -> String {
    match (&config.name, config.external) {
        (Some(name), _) => name.clone(),
        (None, true) => key.to_string(),
        (None, false) => format!("{}_{}", project, key),
    }
}

/// 一時コンテナ用のランダムな短い識別子（12 桁の 16 進数）
pub fn generate_slug() -> String {
    let bytes: [u8; 6] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

/// ラベルフィルタ `key=value`
pub fn filter(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}
