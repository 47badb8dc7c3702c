//! インメモリランタイムを使ったエンドツーエンドのシナリオ

use fleetcompose_container::{
    Call, ContainerSpec, HealthStatus, MockRuntime, PortBindingSpec, RuntimeClient,
};
use fleetcompose_core::{ErrorKind, Project, load_project_from_str};
use fleetcompose_engine::{
    CaptureBuffer, ComposeEngine, DownOptions, EngineOptions, Interrupt, LogsOptions, Output,
    PsOptions, RecordingProgress, RunOptions, RunOutcome, UpOptions,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEMO: &str = r#"
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
      retries: 3
    volumes:
      - data:/var/lib/postgresql/data
volumes:
  data: {}
"#;

struct Fixture {
    runtime: Arc<MockRuntime>,
    progress: Arc<RecordingProgress>,
    stdout: CaptureBuffer,
    engine: ComposeEngine,
}

fn fixture() -> Fixture {
    let runtime = Arc::new(MockRuntime::new());
    let progress = Arc::new(RecordingProgress::new());
    let (output, stdout, _stderr) = Output::capture();
    let engine = ComposeEngine::new(runtime.clone())
        .with_progress(progress.clone())
        .with_output(Arc::new(output))
        .with_options(EngineOptions {
            no_color: true,
            ..Default::default()
        });
    Fixture {
        runtime,
        progress,
        stdout,
        engine,
    }
}

fn load(yaml: &str) -> Project {
    load_project_from_str(yaml, Path::new("/srv/demo"), Some("demo")).unwrap()
}

fn detached() -> UpOptions {
    UpOptions {
        detach: true,
        ..Default::default()
    }
}

fn names<F>(calls: &[Call], pick: F) -> Vec<String>
where
    F: Fn(&Call) -> Option<&String>,
{
    calls.iter().filter_map(|c| pick(c).cloned()).collect()
}

fn started(calls: &[Call]) -> Vec<String> {
    names(calls, |c| match c {
        Call::StartContainer(name) => Some(name),
        _ => None,
    })
}

fn created(calls: &[Call]) -> Vec<String> {
    names(calls, |c| match c {
        Call::CreateContainer(name) => Some(name),
        _ => None,
    })
}

async fn up(f: &Fixture, project: &Project) {
    f.engine
        .up(project, &detached(), &Interrupt::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn scenario_up_creates_network_and_starts_in_order() {
    let f = fixture();
    let project = load(DEMO);
    up(&f, &project).await;

    let calls = f.runtime.calls();
    assert!(calls.contains(&Call::CreateNetwork("demo_default".to_string())));
    assert_eq!(started(&calls), vec!["demo_db_1", "demo_web_1"]);
    assert!(
        f.progress
            .texts_for("Container demo_db_1")
            .contains(&"Healthy".to_string())
    );

    let views = f.engine.ps(&project, &PsOptions::default()).await.unwrap();
    let states: Vec<(&str, &str)> = views
        .iter()
        .map(|v| (v.name.as_str(), v.state.as_str()))
        .collect();
    assert_eq!(
        states,
        vec![("demo_db_1", "running"), ("demo_web_1", "running")]
    );
}

#[tokio::test]
async fn scenario_image_change_recreates_only_web() {
    let f = fixture();
    up(&f, &load(DEMO)).await;
    f.runtime.clear_calls();

    let changed = load(&DEMO.replace("image: nginx", "image: nginx:1.25"));
    up(&f, &changed).await;

    let calls = f.runtime.calls();
    assert_eq!(created(&calls), vec!["demo_web_1"]);
    assert!(calls.contains(&Call::StopContainer {
        name: "demo_web_1".to_string(),
        timeout: Some(Duration::from_secs(10)),
    }));
    assert!(calls.contains(&Call::RemoveContainer("demo_web_1".to_string())));
    assert!(!calls.iter().any(|c| matches!(
        c,
        Call::CreateNetwork(_) | Call::CreateVolume(_)
    )));
    assert!(!calls.iter().any(|c| matches!(
        c,
        Call::StopContainer { name, .. } if name == "demo_db_1"
    )));

    let web = f.runtime.inspect_container("demo_web_1").await.unwrap();
    assert_eq!(web.image, "nginx:1.25");
    assert!(web.is_running());
}

#[tokio::test]
async fn scenario_run_rm_echo() {
    let f = fixture();
    let project = load(DEMO);
    let options = RunOptions {
        service: "web".to_string(),
        command: vec!["echo".to_string(), "hi".to_string()],
        rm: true,
        ..Default::default()
    };

    let outcome = f
        .engine
        .run(&project, &options, None, &Interrupt::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Exited { code: 0 });
    assert_eq!(f.stdout.contents(), "hi\n");
    assert!(f.runtime.running_names().contains("demo_db_1"));

    let calls = f.runtime.calls();
    let oneoff: Vec<String> = created(&calls)
        .into_iter()
        .filter(|n| n.starts_with("demo_web_run_"))
        .collect();
    assert_eq!(oneoff.len(), 1);
    assert!(calls.contains(&Call::RemoveContainer(oneoff[0].clone())));
    assert_eq!(f.runtime.container_names(), vec!["demo_db_1".to_string()]);
}

#[tokio::test]
async fn scenario_down_volumes_leaves_nothing() {
    let f = fixture();
    let project = load(DEMO);
    up(&f, &project).await;
    assert!(f.runtime.volume_names().contains("demo_data"));
    f.runtime.clear_calls();

    f.engine
        .down(
            &project,
            &DownOptions {
                volumes: true,
                ..Default::default()
            },
            &Interrupt::new(),
        )
        .await
        .unwrap();

    let stops: Vec<Call> = f
        .runtime
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::StopContainer { .. }))
        .collect();
    assert_eq!(
        stops,
        vec![
            Call::StopContainer {
                name: "demo_web_1".to_string(),
                timeout: Some(Duration::from_secs(10)),
            },
            Call::StopContainer {
                name: "demo_db_1".to_string(),
                timeout: Some(Duration::from_secs(10)),
            },
        ]
    );
    assert!(f.runtime.container_names().is_empty());
    assert!(f.runtime.network_names().is_empty());
    assert!(f.runtime.volume_names().is_empty());
}

#[tokio::test]
async fn scenario_follow_logs_until_interrupt() {
    let f = fixture();
    let project = load(DEMO);
    up(&f, &project).await;

    let cancel = CancellationToken::new();
    let runtime = f.runtime.clone();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        for n in 1..=3 {
            runtime.emit_line("demo_web_1", &format!("line {}", n));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        trigger.cancel();
    });

    let err = f
        .engine
        .logs(
            &project,
            &LogsOptions {
                services: vec!["web".to_string()],
                follow: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 130);
    assert_eq!(
        f.stdout.contents(),
        "web  | line 1\nweb  | line 2\nweb  | line 3\n"
    );
}

#[tokio::test]
async fn scenario_port_conflict_leaves_dependency_running() {
    let f = fixture();
    f.runtime.add_image("busybox");
    let squatter = f
        .runtime
        .create_container(&ContainerSpec {
            name: "unrelated".to_string(),
            image: "busybox".to_string(),
            ports: vec![PortBindingSpec {
                container_port: 80,
                protocol: "tcp".to_string(),
                host_ip: None,
                host_port: Some(8080),
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    f.runtime.start_container(&squatter).await.unwrap();

    let project = load(&DEMO.replace(
        "    image: nginx\n",
        "    image: nginx\n    ports: [\"8080:80\"]\n",
    ));
    let err = f
        .engine
        .up(&project, &detached(), &Interrupt::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("8080"));
    // 依存先は巻き戻さない
    assert!(f.runtime.running_names().contains("demo_db_1"));
    assert!(!f.runtime.running_names().contains("demo_web_1"));
}

#[tokio::test]
async fn scenario_interrupt_while_waiting_for_health_stops_started() {
    let f = fixture();
    f.runtime.set_health("demo_db_1", HealthStatus::Starting);
    let project = load(DEMO);

    let interrupt = Interrupt::new();
    let trigger = interrupt.graceful.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        f.engine.up(&project, &UpOptions::default(), &interrupt),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.exit_code(), 130);
    assert!(f.runtime.running_names().is_empty());

    let calls = f.runtime.calls();
    assert_eq!(started(&calls), vec!["demo_db_1"]);
    assert!(calls.iter().any(|c| matches!(
        c,
        Call::StopContainer { name, .. } if name == "demo_db_1"
    )));
}

#[tokio::test]
async fn scenario_cascade_stop_cancels_siblings_and_stops_started() {
    let f = fixture();
    let project = load(
        r#"
services:
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
  queue:
    image: redis
    healthcheck:
      test: ["CMD", "redis-cli", "ping"]
  worker:
    image: busybox
    depends_on:
      queue:
        condition: service_healthy
"#,
    );
    // db は healthy にならず、queue は unhealthy になる
    f.runtime.set_health("demo_db_1", HealthStatus::Starting);
    f.runtime.set_health("demo_queue_1", HealthStatus::Unhealthy);

    let options = UpOptions {
        detach: true,
        cascade_stop: true,
        ..Default::default()
    };
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        f.engine.up(&project, &options, &Interrupt::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(!err.is_canceled());
    assert!(err.to_string().contains("unhealthy"));
    assert!(f.runtime.running_names().is_empty());

    let started = started(&f.runtime.calls());
    assert!(!started.contains(&"demo_web_1".to_string()));
    assert!(!started.contains(&"demo_worker_1".to_string()));
}
