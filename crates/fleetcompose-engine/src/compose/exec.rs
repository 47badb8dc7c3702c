//! exec

use super::ComposeEngine;
use super::options::ExecOptions;
use crate::iomux::{AttachEnd, AttachSession, InputSource, RawModeGuard, ResizeTarget};
use fleetcompose_container::ExecSpec;
use fleetcompose_core::{ComposeError, Project, Result};
use std::io::IsTerminal;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const EXIT_POLL_ATTEMPTS: usize = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl ComposeEngine {
    /// exec: サービスの N 番目のレプリカでコマンドを実行し、終了コードを返す
    ///
    /// TTY を要求し手元の stdin が端末なら raw モードにし、どの経路で抜けても元に戻す。
    #[instrument(skip_all, fields(project = %project.name, service = %options.service))]
    pub async fn exec(
        &self,
        project: &Project,
        options: &ExecOptions,
        stdin: Option<InputSource>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        if options.command.is_empty() {
            return Err(ComposeError::invalid("exec requires a command"));
        }
        let container = self
            .find_replica(project, &options.service, options.index)
            .await?;

        let spec = ExecSpec {
            command: options.command.clone(),
            env: options
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            user: options.user.clone(),
            working_dir: options.workdir.clone(),
            tty: options.tty,
            stdin: options.interactive,
            privileged: options.privileged,
        };
        let exec_id = self.runtime.create_exec(&container.id, &spec).await?;
        debug!(container = %container.name, exec = %exec_id, "Exec created");
        let streams = self.runtime.start_exec(&exec_id, options.tty).await?;

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
            resize: options.tty.then(|| ResizeTarget::Exec(exec_id.clone())),
        };

        match session.pump(streams, stdin, cancel).await? {
            AttachEnd::Closed => {
                let mut state = self.runtime.inspect_exec(&exec_id).await?;
                // ストリームが閉じた直後はまだ実行中と報告されることがある
                for _ in 0..EXIT_POLL_ATTEMPTS {
                    if !state.running {
                        break;
                    }
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                    state = self.runtime.inspect_exec(&exec_id).await?;
                }
                state.exit_code.ok_or_else(|| {
                    ComposeError::runtime(format!(
                        "exec {} in {} ended without reporting an exit code",
                        exec_id, container.name
                    ))
                })
            }
            AttachEnd::Detached => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::options::{Interrupt, UpOptions};
    use crate::compose::testing::{harness, project};
    use fleetcompose_container::Call;

    async fn started(h: &crate::compose::testing::Harness) -> Project {
        let p = project("services:\n  web:\n    image: nginx\n");
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
        p
    }

    fn exec_options(command: &[&str]) -> ExecOptions {
        ExecOptions {
            service: "web".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exec_output_and_exit_code() {
        let h = harness();
        let p = started(&h).await;

        let code = h
            .engine
            .exec(&p, &exec_options(&["echo", "inside"]), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(h.stdout.contents(), "inside\n");

        let code = h
            .engine
            .exec(&p, &exec_options(&["exit", "4"]), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 4);
        assert!(h.runtime.calls().contains(&Call::CreateExec {
            container: "demo_web_1".to_string(),
            command: vec!["exit".to_string(), "4".to_string()],
        }));
    }

    #[tokio::test]
    async fn test_exec_forwards_stdin() {
        let h = harness();
        let p = started(&h).await;
        let mut options = exec_options(&["cat"]);
        options.interactive = true;

        let stdin: InputSource = Box::new(&b"piped\n"[..]);
        let code = h
            .engine
            .exec(&p, &options, Some(stdin), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(h.stdout.contents(), "piped\n");
    }

    #[tokio::test]
    async fn test_exec_missing_index_is_not_found() {
        let h = harness();
        let p = started(&h).await;
        let mut options = exec_options(&["true"]);
        options.index = 2;
        let err = h
            .engine
            .exec(&p, &options, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("demo_web_2"));
    }

    #[tokio::test]
    async fn test_exec_without_exit_code_is_runtime_error() {
        let h = harness();
        let p = started(&h).await;
        h.runtime.hide_exec_exit_codes();
        let err = h
            .engine
            .exec(&p, &exec_options(&["true"]), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fleetcompose_core::ErrorKind::Runtime);
        assert!(err.to_string().contains("exit code"));
    }

    #[tokio::test]
    async fn test_exec_requires_command() {
        let h = harness();
        let p = started(&h).await;
        let err = h
            .engine
            .exec(&p, &exec_options(&[]), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fleetcompose_core::ErrorKind::InvalidInput);
    }
}
