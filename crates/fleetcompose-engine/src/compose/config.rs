//! config: 正規化後のプロジェクト定義を出力する

use super::ComposeEngine;
use fleetcompose_core::{ComposeError, Project, Result};
use std::collections::BTreeMap;

/// 正規化後のプロジェクトを YAML にする
pub fn render_config(project: &Project) -> Result<String> {
    serde_yaml::to_string(project)
        .map_err(|e| ComposeError::runtime_with("failed to render project", e))
}

impl ComposeEngine {
    /// サービスごとの設定ハッシュ（ローカルのイメージ ID を含む）
    pub async fn config_hashes(&self, project: &Project) -> Result<BTreeMap<String, String>> {
        let reconciler = self.reconciler(project);
        let mut hashes = BTreeMap::new();
        for (name, service) in &project.services {
            hashes.insert(name.clone(), reconciler.desired_hash(service).await?);
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::testing::{harness, project};

    const YAML: &str = r#"
services:
  web:
    image: nginx
    depends_on: [db]
  db:
    image: postgres
volumes:
  data: {}
"#;

    #[test]
    fn test_render_round_trips_services() {
        let p = project(YAML);
        let rendered = render_config(&p).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["services"]["web"]["image"].as_str(), Some("nginx"));
        assert!(value["volumes"].get("data").is_some());
    }

    #[tokio::test]
    async fn test_config_hash_follows_local_image() {
        let h = harness();
        let p = project(YAML);
        let before = h.engine.config_hashes(&p).await.unwrap();
        assert_eq!(before.len(), 2);

        h.runtime.add_image("nginx");
        let after = h.engine.config_hashes(&p).await.unwrap();
        assert_ne!(before["web"], after["web"]);
        assert_eq!(before["db"], after["db"]);
    }
}
