//! イメージの取得・ビルド・送信

use super::ComposeEngine;
use super::options::{BuildOptions, PullOptions};
use crate::progress::{EventKind, ProgressEvent, ProgressSink};
use fleetcompose_build::{BuildOptions as ContextOptions, BuildResolver};
use fleetcompose_container::{ImageProgress, RegistryAuth, RuntimeStream};
use fleetcompose_core::{
    AggregateError, ComposeError, Project, PullPolicy, ResourceKind, Result, Service,
};
use futures_util::StreamExt;
use futures_util::future::join_all;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DEFAULT_REGISTRY: &str = "docker.io";

/// イメージ参照のレジストリホスト
///
/// 最初の要素に `.` か `:` を含むか `localhost` ならホスト名、それ以外は Docker Hub。
pub fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DEFAULT_REGISTRY,
    }
}

/// ストリームを最後まで読み、進捗を通知する
async fn drain(
    mut stream: RuntimeStream<ImageProgress>,
    progress: &dyn ProgressSink,
    id: &str,
    working: EventKind,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Err(ComposeError::Canceled),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(update)) => {
                let mut text = update.status.clone();
                if let Some(detail) = &update.progress {
                    text = format!("{} {}", text, detail);
                }
                let mut event = ProgressEvent::new(id, working).with_status_text(text);
                if let Some(layer) = &update.id {
                    event = ProgressEvent::new(format!("{} {}", id, layer), working)
                        .with_parent(id)
                        .with_status_text(update.status.clone());
                }
                progress.event(event);
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

impl ComposeEngine {
    fn auth_for(&self, reference: &str) -> Option<RegistryAuth> {
        self.options
            .registry_auth
            .get(registry_host(reference))
            .cloned()
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.runtime.inspect_image(reference).await?.is_some())
    }

    async fn pull_reference(
        &self,
        reference: &str,
        id: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        progress.event(ProgressEvent::new(id, EventKind::Pulling));
        let stream = self
            .runtime
            .pull_image(reference, self.auth_for(reference));
        match drain(stream, progress, id, EventKind::Pulling, cancel).await {
            Ok(()) => {
                info!(image = %reference, "Image pulled");
                progress.event(ProgressEvent::new(id, EventKind::Pulled));
                Ok(())
            }
            Err(e) => {
                progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    /// サービスのイメージをビルドする
    pub(crate) async fn build_service(
        &self,
        project: &Project,
        service: &Service,
        options: ContextOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = service.name.clone();
        self.progress
            .event(ProgressEvent::new(id.as_str(), EventKind::Building));

        // コンテキストの tar 化はブロッキング I/O
        let owned_project = project.clone();
        let owned_service = service.clone();
        let spec = tokio::task::spawn_blocking(move || {
            BuildResolver::new(&owned_project).build_spec(&owned_service, options)
        })
        .await
        .map_err(|e| ComposeError::runtime_with("build context task failed", e))?;
        let spec = match spec {
            Ok(spec) => spec,
            Err(e) => {
                warn!(service = %service.name, "{}", e.user_message());
                self.progress
                    .event(ProgressEvent::error(id.as_str(), e.to_string()));
                return Err(e.into());
            }
        };

        let tag = spec.tag.clone();
        let stream = self.runtime.build_image(spec);
        match drain(stream, self.progress.as_ref(), &id, EventKind::Building, cancel).await {
            Ok(()) => {
                info!(service = %service.name, image = %tag, "Image built");
                self.progress.event(ProgressEvent::new(id, EventKind::Built));
                Ok(())
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }

    /// pull_policy に従ってサービスのイメージを用意する
    async fn ensure_image(
        &self,
        project: &Project,
        service: &Service,
        force_build: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reference = service.image_ref(&project.name);
        let buildable = service.build.is_some();
        let policy = service.pull_policy();

        if policy == PullPolicy::Build || (buildable && force_build) {
            return self
                .build_service(project, service, ContextOptions::default(), cancel)
                .await;
        }

        match policy {
            PullPolicy::Always if service.image.is_some() => {
                self.pull_reference(&reference, &service.name, self.progress.as_ref(), cancel)
                    .await
            }
            PullPolicy::Never => {
                if self.image_exists(&reference).await? {
                    Ok(())
                } else {
                    Err(ComposeError::not_found(ResourceKind::Image, reference))
                }
            }
            _ => {
                if self.image_exists(&reference).await? {
                    debug!(image = %reference, "Image present");
                    return Ok(());
                }
                if service.image.is_none() {
                    return self
                        .build_service(project, service, ContextOptions::default(), cancel)
                        .await;
                }
                match self
                    .pull_reference(&reference, &service.name, self.progress.as_ref(), cancel)
                    .await
                {
                    Ok(()) => Ok(()),
                    // 取得できなくてもビルドできるなら続ける
                    Err(e) if buildable && !e.is_canceled() => {
                        warn!(service = %service.name, error = %e, "Pull failed, building instead");
                        self.build_service(project, service, ContextOptions::default(), cancel)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// 対象サービスのイメージをまとめて用意する
    #[instrument(skip_all, fields(project = %project.name))]
    pub(crate) async fn ensure_images(
        &self,
        project: &Project,
        targets: &BTreeSet<String>,
        force_build: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut services = Vec::new();
        for name in targets {
            services.push(project.service(name)?);
        }
        let results = join_all(
            services
                .iter()
                .map(|service| self.ensure_image(project, service, force_build, cancel)),
        )
        .await;

        let mut errors = AggregateError::new();
        for (service, result) in services.iter().zip(results) {
            if let Err(e) = result {
                errors.push(service.name.clone(), e);
            }
        }
        errors.into_result()
    }

    /// build: build セクションを持つサービスをビルドする
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn build(
        &self,
        project: &Project,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = project.select_services(&options.services)?;
        let context = ContextOptions {
            no_cache: options.no_cache,
            pull: options.pull,
        };
        let mut errors = AggregateError::new();
        for name in &targets {
            let service = project.service(name)?;
            if service.build.is_none() {
                debug!(service = %name, "No build section, skipping");
                continue;
            }
            if let Err(e) = self.build_service(project, service, context, cancel).await {
                if e.is_canceled() {
                    return Err(e);
                }
                errors.push(name.clone(), e);
            }
        }
        errors.into_result()
    }

    /// pull: image を指定したサービスのイメージを取得する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn pull(
        &self,
        project: &Project,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = project.select_services(&options.services)?;
        let quiet = crate::progress::NoopProgress;
        let progress: &dyn ProgressSink = if options.quiet {
            &quiet
        } else {
            self.progress.as_ref()
        };

        let services: Vec<&Service> = targets
            .iter()
            .filter_map(|name| project.services.get(name))
            .filter(|s| s.image.is_some())
            .collect();
        let results = join_all(services.iter().map(|service| {
            let reference = service.image_ref(&project.name);
            async move {
                self.pull_reference(&reference, &service.name, progress, cancel)
                    .await
            }
        }))
        .await;

        let mut errors = AggregateError::new();
        for (service, result) in services.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) if options.ignore_pull_failures => {
                    warn!(service = %service.name, error = %e, "Pull failed, ignoring");
                }
                Err(e) => errors.push(service.name.clone(), e),
            }
        }
        errors.into_result()
    }

    /// push: build と image の両方を持つサービスのイメージを送信する
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn push(
        &self,
        project: &Project,
        services: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = project.select_services(services)?;
        let mut errors = AggregateError::new();
        for name in &targets {
            let service = project.service(name)?;
            let (Some(image), Some(_)) = (&service.image, &service.build) else {
                debug!(service = %name, "Nothing to push");
                continue;
            };
            self.progress
                .event(ProgressEvent::new(name.as_str(), EventKind::Pushing));
            let stream = self.runtime.push_image(image, self.auth_for(image));
            match drain(stream, self.progress.as_ref(), name, EventKind::Pushing, cancel).await {
                Ok(()) => self
                    .progress
                    .event(ProgressEvent::new(name.as_str(), EventKind::Pushed)),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    self.progress
                        .event(ProgressEvent::error(name.as_str(), e.to_string()));
                    errors.push(name.clone(), e);
                }
            }
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::testing::{harness, project};
    use fleetcompose_container::{Call, RuntimeClient};

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("nginx"), "docker.io");
        assert_eq!(registry_host("library/nginx:1.25"), "docker.io");
        assert_eq!(registry_host("ghcr.io/org/app:v1"), "ghcr.io");
        assert_eq!(registry_host("localhost:5000/app"), "localhost:5000");
        assert_eq!(registry_host("localhost/app"), "localhost");
    }

    #[tokio::test]
    async fn test_missing_policy_pulls_once() {
        let h = harness();
        let p = project("services:\n  web:\n    image: nginx\n");
        let targets = p.select_services(&[]).unwrap();
        let cancel = CancellationToken::new();

        h.engine.ensure_images(&p, &targets, false, &cancel).await.unwrap();
        h.engine.ensure_images(&p, &targets, false, &cancel).await.unwrap();
        let pulls = h
            .runtime
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::PullImage(_)))
            .count();
        assert_eq!(pulls, 1);
        assert_eq!(h.progress.texts_for("web"), vec!["Pulling", "Pulling", "Pulled"]);
    }

    #[tokio::test]
    async fn test_always_policy_pulls_every_time() {
        let h = harness();
        h.runtime.add_image("nginx");
        let p = project("services:\n  web:\n    image: nginx\n    pull_policy: always\n");
        let targets = p.select_services(&[]).unwrap();
        let cancel = CancellationToken::new();
        h.engine.ensure_images(&p, &targets, false, &cancel).await.unwrap();
        h.engine.ensure_images(&p, &targets, false, &cancel).await.unwrap();
        let pulls = h
            .runtime
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::PullImage(_)))
            .count();
        assert_eq!(pulls, 2);
    }

    #[tokio::test]
    async fn test_never_policy_requires_local_image() {
        let h = harness();
        let p = project("services:\n  web:\n    image: nginx\n    pull_policy: never\n");
        let targets = p.select_services(&[]).unwrap();
        let err = h
            .engine
            .ensure_images(&p, &targets, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failures_aggregated_or_ignored() {
        let h = harness();
        h.runtime.set_pull_missing("ghost");
        let p = project("services:\n  a:\n    image: ghost\n  b:\n    image: redis\n");
        let cancel = CancellationToken::new();

        let err = h
            .engine
            .pull(&p, &PullOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(h.runtime.has_image("redis"));

        h.engine
            .pull(
                &p,
                &PullOptions {
                    ignore_pull_failures: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_service_from_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let h = harness();
        let mut p = project("services:\n  api:\n    build: .\n");
        p.working_dir = dir.path().to_path_buf();
        if let Some(build) = p.services.get_mut("api").and_then(|s| s.build.as_mut()) {
            build.context = dir.path().to_path_buf();
        }

        h.engine
            .build(&p, &BuildOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(h.runtime.calls().contains(&Call::BuildImage("demo_api".to_string())));
        assert!(h.runtime.inspect_image("demo_api").await.unwrap().is_some());
        assert_eq!(h.progress.texts_for("api").last().map(String::as_str), Some("Built"));
    }
}
