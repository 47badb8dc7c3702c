//! events

use super::ComposeEngine;
use super::options::EventsOptions;
use chrono::{DateTime, SecondsFormat, Utc};
use fleetcompose_container::{ListFilter, RuntimeEvent};
use fleetcompose_core::labels;
use fleetcompose_core::{ComposeError, Project, Result};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// プロジェクトのコンテナイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposeEvent {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub id: String,
    pub service: String,
    pub attributes: BTreeMap<String, String>,
}

impl ComposeEvent {
    /// コンテナイベントだけを変換する
    fn from_runtime(event: RuntimeEvent) -> Option<Self> {
        if event.kind != "container" {
            return None;
        }
        let service = event.attributes.get(labels::LABEL_SERVICE)?.clone();
        let attributes = event
            .attributes
            .into_iter()
            .filter(|(k, _)| !labels::is_engine_managed(k))
            .collect();
        Some(Self {
            time: DateTime::<Utc>::from_timestamp_nanos(event.time_nanos),
            kind: event.kind,
            action: event.action,
            id: event.id,
            service,
            attributes,
        })
    }

    /// `<time> container <action> <id> (k=v, ...)`
    pub fn to_line(&self) -> String {
        let attributes: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!(
            "{} {} {} {} ({})",
            self.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.kind,
            self.action,
            self.id,
            attributes.join(", ")
        )
    }
}

impl ComposeEngine {
    /// events: 取り消されるまでプロジェクトのコンテナイベントを表示する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn events(
        &self,
        project: &Project,
        options: &EventsOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let services: BTreeSet<String> = project.select_services(&options.services)?;
        let filter = ListFilter::default().label(labels::LABEL_PROJECT, &project.name);
        let mut stream = self.runtime.events(&filter);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(ComposeError::Canceled),
                item = stream.next() => item,
            };
            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e),
                None => {
                    debug!("Event stream closed");
                    return Ok(());
                }
            };
            let Some(event) = ComposeEvent::from_runtime(event) else {
                continue;
            };
            if !services.contains(&event.service) {
                continue;
            }
            if options.json {
                let line = serde_json::to_string(&event)
                    .map_err(|e| ComposeError::runtime_with("failed to encode event", e))?;
                self.output.println(&line);
            } else {
                self.output.println(&event.to_line());
            }
        }
    }
}
