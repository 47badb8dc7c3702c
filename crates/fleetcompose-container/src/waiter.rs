//! 依存サービス待機モジュール（Exponential Backoff）
//!
//! depends_on の条件（started / healthy / completed_successfully）が
//! 満たされるまでコンテナの状態をポーリングする。

use crate::runtime::RuntimeClient;
use crate::types::{ContainerStatus, HealthStatus};
use fleetcompose_core::error::{ComposeError, Result};
use fleetcompose_core::{DependencyCondition, HealthCheck};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 待機全体のデフォルト上限
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_RETRIES: u32 = 3;

/// 待機設定（exponential backoff）
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 待機全体の上限
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WaitConfig {
    /// ヘルスチェック設定から待機上限を見積もる
    ///
    /// `start_period + interval × (retries + 1)` とデフォルト上限の大きい方。
    pub fn for_healthcheck(check: Option<&HealthCheck>) -> Self {
        let mut config = Self::default();
        if let Some(check) = check.filter(|c| !c.is_disabled()) {
            let interval = check.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL);
            let retries = check.retries.unwrap_or(DEFAULT_HEALTH_RETRIES);
            let start_period = check.start_period.unwrap_or_default();
            let estimated = start_period + interval * (retries + 1);
            config.timeout = config.timeout.max(estimated);
        }
        config
    }

    /// n 回目（0 始まり）の試行後の待機時間
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

enum Check {
    Ready,
    Pending,
}

/// 依存コンテナが条件を満たすまで待機
///
/// - `service_started`: 実行中（正常終了済みも可）
/// - `service_healthy`: healthy、またはヘルスチェック無しで実行中
/// - `service_completed_successfully`: 終了コード 0 で終了
///
/// 待機中に異常終了した場合は Runtime、上限を超えた場合は Unavailable。
pub async fn wait_for_condition(
    runtime: &dyn RuntimeClient,
    container: &str,
    condition: DependencyCondition,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    if condition == DependencyCondition::ServiceCompletedSuccessfully {
        return wait_for_completion(runtime, container, cancel).await;
    }

    let deadline = Instant::now() + config.timeout;
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ComposeError::Canceled);
        }
        match check_container(runtime, container, condition).await? {
            Check::Ready => return Ok(()),
            Check::Pending => {
                debug!(container, attempt, condition = condition.as_str(), "Dependency not ready yet");
            }
        }

        if Instant::now() >= deadline {
            return Err(ComposeError::Unavailable(format!(
                "timed out after {:?} waiting for '{}' to satisfy {}",
                config.timeout,
                container,
                condition.as_str()
            )));
        }

        let delay = config.delay_for_attempt(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ComposeError::Canceled),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn wait_for_completion(
    runtime: &dyn RuntimeClient,
    container: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let code = tokio::select! {
        _ = cancel.cancelled() => return Err(ComposeError::Canceled),
        code = runtime.wait_container(container) => code?,
    };
    if code == 0 {
        Ok(())
    } else {
        Err(ComposeError::runtime(format!(
            "dependency '{}' exited with code {}",
            container, code
        )))
    }
}

/// コンテナの状態を確認
async fn check_container(
    runtime: &dyn RuntimeClient,
    container: &str,
    condition: DependencyCondition,
) -> Result<Check> {
    let details = runtime.inspect_container(container).await?;

    if matches!(details.status, ContainerStatus::Exited | ContainerStatus::Dead) {
        if condition == DependencyCondition::ServiceStarted && details.exit_code == 0 {
            return Ok(Check::Ready);
        }
        return Err(ComposeError::runtime(format!(
            "dependency '{}' exited with code {} while waiting for {}",
            container,
            details.exit_code,
            condition.as_str()
        )));
    }

    if !details.is_running() {
        return Ok(Check::Pending);
    }

    match (condition, details.health) {
        (DependencyCondition::ServiceStarted, _) => Ok(Check::Ready),
        // ヘルスチェックが無い場合は Running で準備完了とみなす
        (_, HealthStatus::None | HealthStatus::Healthy) => Ok(Check::Ready),
        (_, HealthStatus::Starting) => Ok(Check::Pending),
        (_, HealthStatus::Unhealthy) => Err(ComposeError::runtime(format!(
            "dependency '{}' is unhealthy",
            container
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::types::ContainerSpec;
    use fleetcompose_core::ErrorKind;

    #[test]
    fn test_delay_calculation() {
        let config = WaitConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(2)); // capped at max
        assert_eq!(config.delay_for_attempt(100), Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_from_healthcheck() {
        let check = HealthCheck {
            test: vec!["CMD".into(), "true".into()],
            interval: Some(Duration::from_secs(30)),
            retries: Some(5),
            start_period: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let config = WaitConfig::for_healthcheck(Some(&check));
        assert_eq!(config.timeout, Duration::from_secs(190));
        assert_eq!(WaitConfig::for_healthcheck(None).timeout, DEFAULT_WAIT_TIMEOUT);
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "alpine".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wait_for_started_and_healthy() {
        let runtime = MockRuntime::new();
        runtime.add_image("alpine");
        let id = runtime.create_container(&spec("demo_db_1")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let cancel = CancellationToken::new();
        let config = WaitConfig::default();
        wait_for_condition(&runtime, "demo_db_1", DependencyCondition::ServiceStarted, &config, &cancel)
            .await
            .unwrap();
        wait_for_condition(&runtime, "demo_db_1", DependencyCondition::ServiceHealthy, &config, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_unhealthy_fails() {
        let runtime = MockRuntime::new();
        runtime.add_image("alpine");
        let id = runtime.create_container(&spec("demo_db_1")).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        runtime.set_health("demo_db_1", HealthStatus::Unhealthy);

        let err = wait_for_condition(
            &runtime,
            "demo_db_1",
            DependencyCondition::ServiceHealthy,
            &WaitConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_starting() {
        let runtime = MockRuntime::new();
        runtime.add_image("alpine");
        let id = runtime.create_container(&spec("demo_db_1")).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        runtime.set_health("demo_db_1", HealthStatus::Starting);

        let config = WaitConfig {
            timeout: Duration::from_millis(250),
            ..Default::default()
        };
        let err = wait_for_condition(
            &runtime,
            "demo_db_1",
            DependencyCondition::ServiceHealthy,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_wait_canceled() {
        let runtime = MockRuntime::new();
        runtime.add_image("alpine");
        let id = runtime.create_container(&spec("demo_db_1")).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        runtime.set_health("demo_db_1", HealthStatus::Starting);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for_condition(
            &runtime,
            "demo_db_1",
            DependencyCondition::ServiceHealthy,
            &WaitConfig::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let runtime = MockRuntime::new();
        runtime.add_image("alpine");
        let mut migrate = spec("demo_migrate_1");
        migrate.command = vec!["exit".into(), "0".into()];
        let id = runtime.create_container(&migrate).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        wait_for_condition(
            &runtime,
            "demo_migrate_1",
            DependencyCondition::ServiceCompletedSuccessfully,
            &WaitConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut failing = spec("demo_check_1");
        failing.command = vec!["exit".into(), "3".into()];
        let id = runtime.create_container(&failing).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        let err = wait_for_condition(
            &runtime,
            "demo_check_1",
            DependencyCondition::ServiceCompletedSuccessfully,
            &WaitConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }
}
