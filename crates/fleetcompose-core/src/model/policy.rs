//! 再起動・プル・依存条件のポリシー

use serde::{Deserialize, Serialize};
use std::fmt;

/// 再起動ポリシー
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RestartPolicy {
    /// 再起動しない（デフォルト）
    #[default]
    No,
    /// 常に再起動
    Always,
    /// 異常終了時のみ再起動（最大試行回数つき）
    OnFailure(Option<u32>),
    /// 明示的に停止しない限り再起動
    UnlessStopped,
}

impl RestartPolicy {
    /// 文字列からパース
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let (name, count) = match lower.split_once(':') {
            Some((name, count)) => (name.to_string(), Some(count.parse::<u32>().ok()?)),
            None => (lower, None),
        };
        match (name.as_str(), count) {
            ("no" | "none" | "false", None) => Some(Self::No),
            ("always", None) => Some(Self::Always),
            ("on-failure" | "on_failure", count) => Some(Self::OnFailure(count)),
            ("unless-stopped" | "unless_stopped", None) => Some(Self::UnlessStopped),
            _ => None,
        }
    }

    /// Docker APIで使用する文字列に変換
    pub fn as_docker_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure(_) => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        match self {
            Self::OnFailure(count) => *count,
            _ => None,
        }
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown restart policy '{}'", value))
    }
}

impl From<RestartPolicy> for String {
    fn from(value: RestartPolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnFailure(Some(n)) => write!(f, "on-failure:{}", n),
            other => f.write_str(other.as_docker_str()),
        }
    }
}

/// イメージ取得ポリシー
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PullPolicy {
    /// up のたびに取得
    Always,
    /// ローカルに無い場合のみ取得（デフォルト）
    #[default]
    Missing,
    /// 取得しない。無ければ NotFound
    Never,
    /// 常にビルド
    Build,
}

impl PullPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "missing" | "if_not_present" | "if-not-present" => Some(Self::Missing),
            "never" => Some(Self::Never),
            "build" => Some(Self::Build),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Missing => "missing",
            Self::Never => "never",
            Self::Build => "build",
        }
    }
}

impl TryFrom<String> for PullPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown pull policy '{}'", value))
    }
}

impl From<PullPolicy> for String {
    fn from(value: PullPolicy) -> Self {
        value.as_str().to_string()
    }
}

/// 依存サービスに求める状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// コンテナが起動している
    #[default]
    ServiceStarted,
    /// ヘルスチェックが healthy（ヘルスチェックが無ければ起動済み）
    ServiceHealthy,
    /// 終了コード 0 で終了している
    ServiceCompletedSuccessfully,
}

impl DependencyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceStarted => "service_started",
            Self::ServiceHealthy => "service_healthy",
            Self::ServiceCompletedSuccessfully => "service_completed_successfully",
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// depends_on の 1 エントリ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default)]
    pub condition: DependencyCondition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("always"), Some(RestartPolicy::Always));
        assert_eq!(
            RestartPolicy::parse("on-failure:3"),
            Some(RestartPolicy::OnFailure(Some(3)))
        );
        assert_eq!(
            RestartPolicy::parse("unless_stopped"),
            Some(RestartPolicy::UnlessStopped)
        );
        assert_eq!(RestartPolicy::parse("sometimes"), None);
        assert_eq!(RestartPolicy::parse("always:2"), None);
    }

    #[test]
    fn test_restart_policy_serde() {
        let policy: RestartPolicy = serde_yaml::from_str("on-failure:5").unwrap();
        assert_eq!(policy.max_retries(), Some(5));
        assert_eq!(serde_yaml::to_string(&policy).unwrap().trim(), "on-failure:5");
        assert!(serde_yaml::from_str::<RestartPolicy>("bogus").is_err());
    }

    #[test]
    fn test_pull_policy_aliases() {
        assert_eq!(PullPolicy::parse("if_not_present"), Some(PullPolicy::Missing));
        assert_eq!(PullPolicy::parse("BUILD"), Some(PullPolicy::Build));
        assert!(serde_yaml::from_str::<PullPolicy>("sometimes").is_err());
    }

    #[test]
    fn test_dependency_condition_serde() {
        let dep: DependsOn = serde_yaml::from_str("condition: service_healthy").unwrap();
        assert_eq!(dep.condition, DependencyCondition::ServiceHealthy);
        let dep: DependsOn = serde_yaml::from_str("{}").unwrap();
        assert_eq!(dep.condition, DependencyCondition::ServiceStarted);
    }
}
