//! プロジェクト定義

use super::de;
use super::network::{NetworkConfig, ServiceNetwork};
use super::service::Service;
use super::volume::{MountKind, VolumeConfig};
use crate::error::{ComposeError, ResourceKind, Result};
use crate::graph::DependencyGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// 暗黙的に作られるネットワークのキー
pub const DEFAULT_NETWORK: &str = "default";

/// プロジェクト全体の定義
///
/// エンジンの 1 回の呼び出しの間は読み取り専用として共有される。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// プロジェクト名（`[a-z0-9][a-z0-9_-]*`）
    #[serde(default)]
    pub name: String,
    /// 相対パスの基準ディレクトリ
    #[serde(skip)]
    pub working_dir: PathBuf,
    /// 読み込んだ設定ファイル
    #[serde(skip)]
    pub config_files: Vec<PathBuf>,
    #[serde(default, deserialize_with = "de::nullable_map")]
    pub services: BTreeMap<String, Service>,
    #[serde(default, deserialize_with = "de::nullable_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default, deserialize_with = "de::nullable_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
    #[serde(default, deserialize_with = "de::nullable_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, FileObjectConfig>,
    #[serde(default, deserialize_with = "de::nullable_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, FileObjectConfig>,
    /// 変数展開に使われた環境（ローダーが設定する）
    #[serde(skip)]
    pub environment: BTreeMap<String, String>,
}

/// secrets / configs のトップレベル定義
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// ホスト上のファイル（正規化後は絶対パス）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub external: bool,
}

impl Project {
    /// サービスを名前で取得
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| ComposeError::not_found(ResourceKind::Service, name))
    }

    /// 全サービス名（名前順）
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// 依存関係の順（依存先が先）に並べたサービス
    pub fn services_in_dependency_order(&self) -> Result<Vec<&Service>> {
        let graph = DependencyGraph::from_project(self)?;
        graph
            .topological_order()
            .iter()
            .map(|name| self.service(name))
            .collect()
    }

    /// 指定サービスが存在することを確認し、名前の集合にする
    ///
    /// 空の指定は全サービスを意味する。
    pub fn select_services(&self, names: &[String]) -> Result<BTreeSet<String>> {
        if names.is_empty() {
            return Ok(self.services.keys().cloned().collect());
        }
        names
            .iter()
            .map(|name| self.service(name).map(|_| name.clone()))
            .collect()
    }

    /// 指定サービスとその推移的な依存先
    pub fn with_dependencies(&self, names: &[String]) -> Result<BTreeSet<String>> {
        let selected = self.select_services(names)?;
        let graph = DependencyGraph::from_project(self)?;
        Ok(graph.closure(&selected))
    }

    /// 別ファイルの定義をマージする（後勝ち）
    pub fn merge(&mut self, other: Project) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        for (name, service) in other.services {
            match self.services.get_mut(&name) {
                Some(existing) => existing.merge(service),
                None => {
                    self.services.insert(name, service);
                }
            }
        }
        self.networks.extend(other.networks);
        self.volumes.extend(other.volumes);
        self.secrets.extend(other.secrets);
        self.configs.extend(other.configs);
        self.config_files.extend(other.config_files);
    }

    /// 読み込み直後の定義を正規化する
    ///
    /// - サービス名をキーから設定
    /// - ネットワーク未指定のサービスを `default` ネットワークに接続
    /// - 相対パス（バインドマウント、ビルドコンテキスト、secrets/configs）を絶対パスに
    pub fn normalize(&mut self) {
        let working_dir = self.working_dir.clone();
        let mut uses_default = false;

        for (name, service) in self.services.iter_mut() {
            service.name = name.clone();

            if service.network_mode.is_none() && service.networks.is_empty() {
                service
                    .networks
                    .insert(DEFAULT_NETWORK.to_string(), ServiceNetwork::default());
            }
            if service.networks.contains_key(DEFAULT_NETWORK) {
                uses_default = true;
            }

            for mount in service.volumes.iter_mut() {
                if mount.kind == MountKind::Bind
                    && let Some(source) = mount.source.as_mut()
                {
                    *source = resolve_path(&working_dir, source);
                }
            }
            if let Some(build) = service.build.as_mut() {
                build.context = PathBuf::from(resolve_path(
                    &working_dir,
                    &build.context.to_string_lossy(),
                ));
            }
        }

        if uses_default && !self.networks.contains_key(DEFAULT_NETWORK) {
            self.networks
                .insert(DEFAULT_NETWORK.to_string(), NetworkConfig::default());
        }

        for object in self.secrets.values_mut().chain(self.configs.values_mut()) {
            if let Some(file) = object.file.as_mut() {
                *file = PathBuf::from(resolve_path(&working_dir, &file.to_string_lossy()));
            }
        }
    }
}

/// `~` と相対パスを解決する
fn resolve_path(base: &Path, path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest).to_string_lossy().into_owned();
    }
    let p = Path::new(path);
    if p.is_absolute() || base.as_os_str().is_empty() {
        return path.to_string();
    }
    let joined = base.join(p);
    // `./x` の `.` 成分を落とす
    joined
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(yaml: &str) -> Project {
        let mut p: Project = serde_yaml::from_str(yaml).unwrap();
        p.working_dir = PathBuf::from("/srv/demo");
        p.normalize();
        p
    }

    #[test]
    fn test_normalize_adds_default_network() {
        let p = project(
            r#"
name: demo
services:
  web:
    image: nginx
  tool:
    image: busybox
    network_mode: none
"#,
        );
        assert!(p.networks.contains_key(DEFAULT_NETWORK));
        assert!(p.services["web"].networks.contains_key(DEFAULT_NETWORK));
        assert!(p.services["tool"].networks.is_empty());
        assert_eq!(p.services["web"].name, "web");
    }

    #[test]
    fn test_normalize_resolves_relative_paths() {
        let p = project(
            r#"
services:
  app:
    build: ./app
    volumes:
      - ./conf:/etc/app
      - data:/data
volumes:
  data:
secrets:
  token:
    file: ./token.txt
"#,
        );
        let app = &p.services["app"];
        assert_eq!(app.build.as_ref().unwrap().context, PathBuf::from("/srv/demo/app"));
        assert_eq!(app.volumes[0].source.as_deref(), Some("/srv/demo/conf"));
        assert_eq!(app.volumes[1].source.as_deref(), Some("data"));
        assert_eq!(
            p.secrets["token"].file.as_deref(),
            Some(Path::new("/srv/demo/token.txt"))
        );
        assert!(p.volumes.contains_key("data"));
    }

    #[test]
    fn test_lookup_helpers() {
        let p = project(
            r#"
services:
  web:
    image: nginx
    depends_on: [db]
  db:
    image: postgres
  cache:
    image: redis
"#,
        );
        assert!(p.service("web").is_ok());
        assert!(p.service("nope").unwrap_err().is_not_found());
        assert_eq!(p.service_names(), vec!["cache", "db", "web"]);

        let order: Vec<_> = p
            .services_in_dependency_order()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let db = order.iter().position(|n| n == "db").unwrap();
        let web = order.iter().position(|n| n == "web").unwrap();
        assert!(db < web);

        let closure = p.with_dependencies(&["web".to_string()]).unwrap();
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec!["db", "web"]);
    }

    #[test]
    fn test_merge_projects() {
        let mut base = project("services:\n  web:\n    image: nginx\n    ports: ['80:80']\n");
        let over: Project =
            serde_yaml::from_str("services:\n  web:\n    image: nginx:1.25\n  db:\n    image: postgres\n")
                .unwrap();
        base.merge(over);
        assert_eq!(base.services["web"].image.as_deref(), Some("nginx:1.25"));
        assert_eq!(base.services["web"].ports.len(), 1);
        assert!(base.services.contains_key("db"));
    }
}
