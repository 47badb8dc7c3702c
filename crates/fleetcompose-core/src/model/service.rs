//! サービス定義

use super::de;
use super::duration;
use super::network::ServiceNetwork;
use super::policy::{DependsOn, PullPolicy, RestartPolicy};
use super::port::PortMapping;
use super::volume::VolumeMount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// stop_grace_period 未指定時の猶予
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// サービス定義
///
/// YAML 形式：
/// ```yaml
/// web:
///   image: nginx
///   ports: ["8080:80"]
///   depends_on:
///     db:
///       condition: service_healthy
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// サービス名（正規化時にマップのキーから設定される）
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// ビルド設定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    #[serde(default, deserialize_with = "de::command", skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, deserialize_with = "de::command", skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, deserialize_with = "de::environment", skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, deserialize_with = "de::name_list_or_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, ServiceNetwork>,
    #[serde(default, deserialize_with = "de::name_list_or_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, DependsOn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
    /// ヘルスチェック設定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
    #[serde(default, deserialize_with = "de::string_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// 再起動ポリシー (no, always, on-failure[:N], unless-stopped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<PullPolicy>,

    /// 固定のコンテナ名（レプリカ数 1 のときのみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, deserialize_with = "de::string_list", skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(default, deserialize_with = "de::string_list", skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, deserialize_with = "de::string_list", skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, deserialize_with = "de::string_list", skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    /// bridge / host / none / service:<name> / container:<id>
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, deserialize_with = "de::string_list", skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<FileReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<FileReference>,
}

/// ビルド設定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildConfig {
    /// ビルドコンテキストのパス（正規化後は絶対パス）
    pub context: PathBuf,
    /// Dockerfileのパス（コンテキストからの相対パス）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<PathBuf>,
    /// ビルド引数
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    /// マルチステージビルドのターゲット
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// キャッシュ無効化フラグ
    pub no_cache: bool,
    /// ベースイメージを常に取得する
    pub pull: bool,
}

#[derive(Deserialize)]
struct LongBuild {
    #[serde(default)]
    context: Option<PathBuf>,
    #[serde(default)]
    dockerfile: Option<PathBuf>,
    #[serde(default, deserialize_with = "de::environment")]
    args: BTreeMap<String, String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default, deserialize_with = "de::string_map")]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    no_cache: bool,
    #[serde(default)]
    pull: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Context(PathBuf),
    Long(LongBuild),
}

impl<'de> Deserialize<'de> for BuildConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RawBuild::deserialize(deserializer)? {
            RawBuild::Context(context) => BuildConfig {
                context,
                ..Default::default()
            },
            RawBuild::Long(long) => BuildConfig {
                context: long.context.unwrap_or_else(|| PathBuf::from(".")),
                dockerfile: long.dockerfile,
                args: long.args,
                target: long.target,
                labels: long.labels,
                no_cache: long.no_cache,
                pull: long.pull,
            },
        })
    }
}

/// ヘルスチェック設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// テストコマンド (CMD-SHELL形式またはCMD形式)
    #[serde(default, deserialize_with = "de::healthcheck_test", skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    /// チェック間隔
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    /// タイムアウト
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// リトライ回数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// 起動待機時間
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<Duration>,
    #[serde(default)]
    pub disable: bool,
}

impl HealthCheck {
    /// 無効化されているか（`disable: true` または `test: ["NONE"]`）
    pub fn is_disabled(&self) -> bool {
        self.disable || self.test.first().map(|t| t == "NONE").unwrap_or(false)
    }
}

/// deploy セクション
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<DeployRestartPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployRestartPolicy {
    /// none / on-failure / any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<ResourceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, deserialize_with = "de::optional_f64", skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// `512m` などの表記
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<i64>,
}

/// secrets / configs の参照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReference {
    pub source: String,
    /// 省略時は secrets なら `/run/secrets/<source>`、configs なら `/<source>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFileReference {
    Name(String),
    Long {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl<'de> Deserialize<'de> for FileReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RawFileReference::deserialize(deserializer)? {
            RawFileReference::Name(source) => FileReference {
                source,
                target: None,
            },
            RawFileReference::Long { source, target } => FileReference { source, target },
        })
    }
}

impl FileReference {
    pub fn secret_target(&self) -> String {
        match &self.target {
            Some(t) if t.starts_with('/') => t.clone(),
            Some(t) => format!("/run/secrets/{}", t),
            None => format!("/run/secrets/{}", self.source),
        }
    }

    pub fn config_target(&self) -> String {
        match &self.target {
            Some(t) => t.clone(),
            None => format!("/{}", self.source),
        }
    }
}

impl Service {
    /// 宣言されたレプリカ数（未指定なら 1）
    pub fn replicas(&self) -> u32 {
        self.deploy.as_ref().and_then(|d| d.replicas).unwrap_or(1)
    }

    /// 停止時の猶予時間
    pub fn stop_grace_period(&self) -> Duration {
        self.stop_grace_period.unwrap_or(DEFAULT_STOP_GRACE_PERIOD)
    }

    pub fn pull_policy(&self) -> PullPolicy {
        self.pull_policy.unwrap_or_default()
    }

    /// コンテナで使うイメージ参照
    ///
    /// image 未指定でビルドするサービスは `{project}_{service}` を使う。
    pub fn image_ref(&self, project_name: &str) -> String {
        match &self.image {
            Some(image) => image.clone(),
            None => format!("{}_{}", project_name, self.name),
        }
    }

    /// `network_mode: service:<name>` の参照先
    pub fn network_mode_service(&self) -> Option<&str> {
        self.network_mode.as_deref()?.strip_prefix("service:")
    }

    /// volumes_from で参照しているサービス名（`container:` 参照は除く）
    pub fn volumes_from_services(&self) -> impl Iterator<Item = &str> {
        self.volumes_from.iter().filter_map(|entry| {
            if entry.starts_with("container:") {
                None
            } else {
                entry.split(':').next()
            }
        })
    }

    /// 他のServiceをマージする
    ///
    /// otherで定義されたフィールドが優先される（オーバーライド）。
    /// - Option<T>: otherがSomeならそれを使用、Noneなら元の値を維持
    /// - Vec<T>: otherが空でなければそれを使用、空なら元の値を維持
    /// - BTreeMap<K, V>: 元の値にotherの値をマージ（otherが優先）
    /// - bool: otherがtrueの場合のみ上書き
    pub fn merge(&mut self, other: Service) {
        // Option<T>フィールド: otherがSomeなら上書き
        macro_rules! merge_option {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        merge_option!(
            image,
            build,
            deploy,
            healthcheck,
            restart,
            pull_policy,
            container_name,
            hostname,
            working_dir,
            user,
            stop_signal,
            stop_grace_period,
            init,
            network_mode,
        );

        // Vec<T>フィールド: otherが空でなければ上書き
        macro_rules! merge_vec {
            ($($field:ident),* $(,)?) => {
                $(if !other.$field.is_empty() {
                    self.$field = other.$field;
                })*
            };
        }
        merge_vec!(
            command,
            entrypoint,
            ports,
            volumes,
            extra_hosts,
            dns,
            cap_add,
            cap_drop,
            volumes_from,
            secrets,
            configs,
        );

        // BTreeMap<K, V>フィールド: マージ（otherの値が優先）
        self.environment.extend(other.environment);
        self.labels.extend(other.labels);
        self.networks.extend(other.networks);
        self.depends_on.extend(other.depends_on);

        self.tty |= other.tty;
        self.stdin_open |= other.stdin_open;
        self.privileged |= other.privileged;
        self.read_only |= other.read_only;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DependencyCondition;

    #[test]
    fn test_service_minimal() {
        let svc: Service = serde_yaml::from_str("image: nginx").unwrap();
        assert_eq!(svc.image.as_deref(), Some("nginx"));
        assert_eq!(svc.replicas(), 1);
        assert_eq!(svc.stop_grace_period(), DEFAULT_STOP_GRACE_PERIOD);
        assert_eq!(svc.pull_policy(), PullPolicy::Missing);
    }

    #[test]
    fn test_service_string_forms() {
        let svc: Service = serde_yaml::from_str(
            r#"
image: app
command: python -m http.server 8000
environment:
  - DEBUG=1
depends_on: [db, cache]
networks: [front]
build: ./app
healthcheck:
  test: curl -f http://localhost
  interval: 5s
"#,
        )
        .unwrap();
        assert_eq!(svc.command, vec!["python", "-m", "http.server", "8000"]);
        assert_eq!(svc.environment.get("DEBUG").map(String::as_str), Some("1"));
        assert_eq!(svc.depends_on.len(), 2);
        assert_eq!(
            svc.depends_on["db"].condition,
            DependencyCondition::ServiceStarted
        );
        assert!(svc.networks.contains_key("front"));
        assert_eq!(svc.build.unwrap().context, PathBuf::from("./app"));
        let hc = svc.healthcheck.unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "curl -f http://localhost"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_service_long_forms() {
        let svc: Service = serde_yaml::from_str(
            r#"
image: app
depends_on:
  db:
    condition: service_healthy
networks:
  back:
    aliases: [api]
deploy:
  replicas: 3
  resources:
    limits:
      cpus: "0.5"
      memory: 256m
stop_grace_period: 1m
restart: unless-stopped
"#,
        )
        .unwrap();
        assert_eq!(
            svc.depends_on["db"].condition,
            DependencyCondition::ServiceHealthy
        );
        assert_eq!(svc.networks["back"].aliases, vec!["api"]);
        assert_eq!(svc.replicas(), 3);
        let limits = svc
            .deploy
            .as_ref()
            .and_then(|d| d.resources.as_ref())
            .and_then(|r| r.limits.as_ref())
            .unwrap();
        assert_eq!(limits.cpus, Some(0.5));
        assert_eq!(svc.stop_grace_period(), Duration::from_secs(60));
        assert_eq!(svc.restart, Some(RestartPolicy::UnlessStopped));
    }

    #[test]
    fn test_service_rejects_unknown_restart_policy() {
        assert!(serde_yaml::from_str::<Service>("image: x\nrestart: sometimes").is_err());
    }

    #[test]
    fn test_service_merge() {
        let mut base: Service = serde_yaml::from_str(
            r#"
image: app:1
command: [run]
environment: {A: "1", B: "2"}
ports: ["8080:80"]
"#,
        )
        .unwrap();
        let over: Service = serde_yaml::from_str(
            r#"
image: app:2
environment: {B: "3", C: "4"}
tty: true
"#,
        )
        .unwrap();
        base.merge(over);

        assert_eq!(base.image.as_deref(), Some("app:2"));
        assert_eq!(base.command, vec!["run"]);
        assert_eq!(base.ports.len(), 1);
        assert_eq!(base.environment["A"], "1");
        assert_eq!(base.environment["B"], "3");
        assert_eq!(base.environment["C"], "4");
        assert!(base.tty);
    }

    #[test]
    fn test_image_ref_for_build_only_service() {
        let svc = Service {
            name: "api".to_string(),
            build: Some(BuildConfig::default()),
            ..Default::default()
        };
        assert_eq!(svc.image_ref("demo"), "demo_api");
    }

    #[test]
    fn test_volumes_from_and_network_mode_refs() {
        let svc = Service {
            volumes_from: vec!["data:ro".into(), "container:abc".into()],
            network_mode: Some("service:vpn".into()),
            ..Default::default()
        };
        assert_eq!(svc.volumes_from_services().collect::<Vec<_>>(), vec!["data"]);
        assert_eq!(svc.network_mode_service(), Some("vpn"));
    }

    #[test]
    fn test_file_reference_targets() {
        let refs: Vec<FileReference> =
            serde_yaml::from_str("[token, {source: cfg, target: /etc/app.conf}]").unwrap();
        assert_eq!(refs[0].secret_target(), "/run/secrets/token");
        assert_eq!(refs[0].config_target(), "/token");
        assert_eq!(refs[1].config_target(), "/etc/app.conf");
    }
}
