//! run: 一時コンテナでコマンドを実行する

use super::ComposeEngine;
use super::options::{CreateOptions, Interrupt, RunOptions};
use crate::iomux::{AttachEnd, AttachSession, InputSource, RawModeGuard, ResizeTarget};
use crate::scheduler::FailurePolicy;
use fleetcompose_container::{
    AttachOptions, ListFilter, RemoveOptions, service_to_container_spec,
};
use fleetcompose_core::labels::{self, ContainerRole};
use fleetcompose_core::{
    ComposeError, DependencyGraph, PortMapping, Project, Result, Service, VolumeMount,
};
use std::collections::BTreeSet;
use std::io::IsTerminal;
use tracing::{debug, info, instrument, warn};

/// run の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// バックグラウンドで起動した（またはデタッチした）
    Detached { id: String, name: String },
    /// コンテナが終了した
    Exited { code: i64 },
}

/// 呼び出し時の上書きを適用したサービス定義
fn override_service(service: &Service, options: &RunOptions) -> Result<Service> {
    let mut service = service.clone();
    if !options.command.is_empty() {
        service.command = options.command.clone();
    }
    if let Some(entrypoint) = &options.entrypoint {
        service.entrypoint = entrypoint.clone();
    }
    service.environment.extend(options.env.clone());
    for spec in &options.volumes {
        service.volumes.push(VolumeMount::parse(spec)?);
    }
    if !options.service_ports {
        service.ports.clear();
    }
    for spec in &options.publish {
        service.ports.push(PortMapping::parse(spec)?);
    }
    if let Some(workdir) = &options.workdir {
        service.working_dir = Some(workdir.clone());
    }
    if let Some(user) = &options.user {
        service.user = Some(user.clone());
    }
    service.tty = options.tty;
    service.stdin_open = options.interactive;
    // 一時コンテナは再起動ポリシーと固定名を引き継がない
    service.restart = None;
    service.container_name = None;
    Ok(service)
}

impl ComposeEngine {
    /// run: 一時コンテナを作成して実行する
    ///
    /// 依存サービスを起動してから `{project}_{service}_run_{slug}` を作成する。
    /// アタッチ時はコンテナの終了コードを返し、`rm` なら結果にかかわらず削除する。
    /// ただし切り離しキーでデタッチした場合はコンテナが実行中のため `rm` でも残す
    /// （後から `rm --stop` か `down` で片付ける）。
    #[instrument(skip_all, fields(project = %project.name, service = %options.service))]
    pub async fn run(
        &self,
        project: &Project,
        options: &RunOptions,
        stdin: Option<InputSource>,
        interrupt: &Interrupt,
    ) -> Result<RunOutcome> {
        if options.detach && options.rm {
            return Err(ComposeError::invalid(
                "--detach and --rm cannot be combined",
            ));
        }
        let cancel = &interrupt.graceful;
        let definition = project.service(&options.service)?;
        let service = override_service(definition, options)?;
        let graph = DependencyGraph::from_project(project)?;

        let reconciler = self.reconciler(project);
        reconciler.ensure_networks().await?;
        reconciler.ensure_volumes().await?;

        let mut dependencies = BTreeSet::new();
        if !options.no_deps {
            dependencies = project.with_dependencies(std::slice::from_ref(&options.service))?;
            dependencies.remove(&options.service);
            if !dependencies.is_empty() {
                self.ensure_images(project, &dependencies, false, cancel).await?;
                self.converge_services(
                    project,
                    &graph,
                    &dependencies,
                    &CreateOptions::default(),
                    FailurePolicy::Abort,
                    true,
                    cancel,
                )
                .await?;
            }
        }
        self.ensure_images(project, &BTreeSet::from([options.service.clone()]), false, cancel)
            .await?;

        let slug = labels::generate_slug();
        let name = match &options.name {
            Some(name) => name.clone(),
            None => labels::oneoff_container_name(&project.name, &service.name, &slug),
        };
        let hash = reconciler.desired_hash(&service).await?;
        let container_labels = labels::build_labels(
            project,
            &service,
            &ContainerRole::OneOff { slug: slug.clone() },
            &hash,
        );
        let image = service.image_ref(&project.name);
        let spec = service_to_container_spec(project, &service, &name, &image, &container_labels)?;
        let id = reconciler.create(spec).await?;
        info!(container = %name, "One-off container created");

        let result = async {
            self.wait_for_dependencies(project, &graph, &service.name, &dependencies, cancel)
                .await?;
            if options.detach {
                self.runtime.start_container(&id).await?;
                return Ok(RunOutcome::Detached {
                    id: id.clone(),
                    name: name.clone(),
                });
            }
            self.run_attached(&id, &name, &service, options, stdin, interrupt)
                .await
        }
        .await;

        let detached = matches!(result, Ok(RunOutcome::Detached { .. }));
        if options.rm && detached {
            info!(container = %name, "Detached from one-off container, keeping it despite --rm");
        } else if options.rm {
            debug!(container = %name, "Removing one-off container");
            if let Err(e) = self
                .runtime
                .remove_container(
                    &id,
                    RemoveOptions {
                        force: true,
                        volumes: true,
                    },
                )
                .await
                && !e.is_not_found()
            {
                warn!(container = %name, error = %e, "Failed to remove one-off container");
            }
        }
        result
    }

    async fn run_attached(
        &self,
        id: &str,
        name: &str,
        service: &Service,
        options: &RunOptions,
        stdin: Option<InputSource>,
        interrupt: &Interrupt,
    ) -> Result<RunOutcome> {
        let attach = AttachOptions {
            stdin: options.interactive,
            stdout: true,
            stderr: true,
            logs: false,
        };
        // 起動直後の出力を取りこぼさないよう先に接続する
        let streams = self.runtime.attach_container(id, &attach).await?;
        self.runtime.start_container(id).await?;

        let stdin = stdin.filter(|_| options.interactive);
        let _raw = if options.tty && stdin.is_some() && std::io::stdin().is_terminal() {
            Some(RawModeGuard::enable()?)
        } else {
            None
        };
        let session = AttachSession {
            output: self.output.as_ref(),
            runtime: self.runtime.as_ref(),
            detach_keys: &self.options.detach_keys,
            resize: options.tty.then(|| ResizeTarget::Container(id.to_string())),
        };

        match session.pump(streams, stdin, &interrupt.graceful).await {
            Ok(AttachEnd::Closed) => {
                let code = self.runtime.wait_container(id).await?;
                debug!(container = %name, code, "One-off container exited");
                Ok(RunOutcome::Exited { code })
            }
            Ok(AttachEnd::Detached) => Ok(RunOutcome::Detached {
                id: id.to_string(),
                name: name.to_string(),
            }),
            Err(ComposeError::Canceled) => {
                let filter = ListFilter::default().name(name);
                for container in self.runtime.list_containers(&filter, true).await? {
                    if container.status.is_running() {
                        self.stop_one(&container, service.stop_grace_period(), &interrupt.force)
                            .await?;
                    }
                }
                Err(ComposeError::Canceled)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::options::UpOptions;
    use crate::compose::testing::{harness, project};
    use fleetcompose_container::{Call, RuntimeClient};
    use std::collections::BTreeMap;

    const YAML: &str = r#"
services:
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "true"]
  web:
    image: nginx
    ports: ["8080:80"]
    restart: always
    depends_on:
      db:
        condition: service_healthy
"#;

    fn run_options(command: &[&str]) -> RunOptions {
        RunOptions {
            service: "web".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_override_service() {
        let p = project(YAML);
        let mut options = run_options(&["sh"]);
        options.env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        options.publish = vec!["9090:90".to_string()];
        options.workdir = Some("/srv".to_string());
        options.interactive = true;

        let service = override_service(p.service("web").unwrap(), &options).unwrap();
        assert_eq!(service.command, vec!["sh".to_string()]);
        assert_eq!(service.environment["A"], "1");
        assert_eq!(service.ports.len(), 1);
        assert_eq!(service.ports[0].target, 90);
        assert_eq!(service.working_dir.as_deref(), Some("/srv"));
        assert!(service.stdin_open);
        assert!(service.restart.is_none());

        options.service_ports = true;
        let service = override_service(p.service("web").unwrap(), &options).unwrap();
        assert_eq!(service.ports.len(), 2);
    }

    #[tokio::test]
    async fn test_run_rm_starts_dependencies_and_removes() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["echo", "hi"]);
        options.rm = true;

        let outcome = h
            .engine
            .run(&p, &options, None, &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert_eq!(h.stdout.contents(), "hi\n");
        assert!(h.runtime.running_names().contains("demo_db_1"));
        // web の常駐コンテナは作られない
        assert_eq!(h.runtime.container_names(), vec!["demo_db_1".to_string()]);

        let created: Vec<String> = h
            .runtime
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateContainer(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        assert!(created[1].starts_with("demo_web_run_"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_still_removed() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["exit", "7"]);
        options.rm = true;
        options.no_deps = true;

        let outcome = h
            .engine
            .run(&p, &options, None, &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: 7 });
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_run_oneoff_labels_and_detach() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["sleep", "60"]);
        options.detach = true;
        options.no_deps = true;

        let outcome = h
            .engine
            .run(&p, &options, None, &Interrupt::new())
            .await
            .unwrap();
        let RunOutcome::Detached { id, name } = outcome else {
            panic!("expected detached outcome");
        };
        let details = h.runtime.inspect_container(&id).await.unwrap();
        assert!(details.is_running());
        let identity = labels::parse_labels(&details.labels).unwrap();
        assert!(identity.oneoff);
        let slug = identity.slug.unwrap();
        assert_eq!(name, format!("demo_web_run_{}", slug));

        // 一時コンテナは収束の対象外
        h.engine
            .up(
                &p,
                &UpOptions {
                    detach: true,
                    ..Default::default()
                },
                &Interrupt::new(),
            )
            .await
            .unwrap();
        let oneoffs = h
            .runtime
            .list_containers(&ListFilter::default().label(labels::LABEL_ONEOFF, "true"), true)
            .await
            .unwrap();
        assert_eq!(oneoffs.len(), 1);
    }

    #[tokio::test]
    async fn test_run_named_with_stdin() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["cat"]);
        options.interactive = true;
        options.no_deps = true;
        options.name = Some("scratch".to_string());

        let stdin: InputSource = Box::new(&b"hello\n"[..]);
        let outcome = h
            .engine
            .run(&p, &options, Some(stdin), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert_eq!(h.stdout.contents(), "hello\n");
        assert_eq!(h.runtime.container_names(), vec!["scratch".to_string()]);
    }

    #[tokio::test]
    async fn test_run_rm_keeps_container_after_detach_keys() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["cat"]);
        options.interactive = true;
        options.rm = true;
        options.no_deps = true;

        let stdin: InputSource = Box::new(&b"\x10\x11"[..]);
        let outcome = h
            .engine
            .run(&p, &options, Some(stdin), &Interrupt::new())
            .await
            .unwrap();
        let RunOutcome::Detached { name, .. } = outcome else {
            panic!("expected detached outcome");
        };
        assert_eq!(h.runtime.container_names(), vec![name.clone()]);
        assert!(!h.runtime.calls().contains(&Call::RemoveContainer(name)));
    }

    #[tokio::test]
    async fn test_run_rejects_detach_with_rm() {
        let h = harness();
        let p = project(YAML);
        let mut options = run_options(&["true"]);
        options.detach = true;
        options.rm = true;
        let err = h
            .engine
            .run(&p, &options, None, &Interrupt::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fleetcompose_core::ErrorKind::InvalidInput);
    }
}
