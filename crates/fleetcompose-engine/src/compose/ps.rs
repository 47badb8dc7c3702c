//! ps

use super::ComposeEngine;
use super::options::PsOptions;
use fleetcompose_container::ListFilter;
use fleetcompose_core::labels;
use fleetcompose_core::{Project, Result};
use serde::Serialize;
use tracing::instrument;

/// ps の 1 行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub service: String,
    pub number: u32,
    pub oneoff: bool,
    pub image: String,
    pub state: String,
    pub status: String,
    /// ヘルスチェックが無ければ空
    pub health: String,
    pub ports: Vec<String>,
}

impl ComposeEngine {
    /// ps: プロジェクトのコンテナをサービス名・番号順に返す
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn ps(&self, project: &Project, options: &PsOptions) -> Result<Vec<ContainerView>> {
        let services = project.select_services(&options.services)?;
        let filter = ListFilter::default().label(labels::LABEL_PROJECT, &project.name);

        let mut views = Vec::new();
        for summary in self.runtime.list_containers(&filter, options.all).await? {
            let Some(identity) = labels::parse_labels(&summary.labels) else {
                continue;
            };
            // 一時コンテナは -a のときだけ
            if !services.contains(&identity.service) || (identity.oneoff && !options.all) {
                continue;
            }
            let details = match self.runtime.inspect_container(&summary.id).await {
                Ok(details) => details,
                // 一覧取得の後に削除された
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            views.push(ContainerView {
                id: details.id,
                name: details.name,
                service: identity.service,
                number: identity.number,
                oneoff: identity.oneoff,
                image: details.image,
                state: details.status.as_str().to_string(),
                status: summary.status_text,
                health: details.health.as_str().to_string(),
                ports: details.ports.iter().map(ToString::to_string).collect(),
            });
        }
        views.sort_by(|a, b| {
            (a.service.as_str(), a.oneoff, a.number, a.name.as_str())
                .cmp(&(b.service.as_str(), b.oneoff, b.number, b.name.as_str()))
        });
        Ok(views)
    }
}
