use std::fmt;
use thiserror::Error;

/// 元のエラーを保持するためのボックス型
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// エンジン全体で共有するエラー分類
///
/// すべての失敗はちょうど一つの [`ErrorKind`] に分類される。
/// `CyclicDependency` は `InvalidInput` として扱う。
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(
        "container runtime unavailable: {0}\n\nhint:\n  • check that the Docker daemon (or OrbStack / Docker Desktop) is running"
    )]
    Unavailable(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error(transparent)]
    Aggregate(AggregateError),
}

/// エラーの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Forbidden,
    Unavailable,
    Canceled,
    Runtime,
    Aggregate,
}

/// NotFound / Conflict の対象リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Container,
    Network,
    Volume,
    Image,
    Exec,
    Secret,
    Config,
    Path,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Service => "service",
            ResourceKind::Container => "container",
            ResourceKind::Network => "network",
            ResourceKind::Volume => "volume",
            ResourceKind::Image => "image",
            ResourceKind::Exec => "exec instance",
            ResourceKind::Secret => "secret",
            ResourceKind::Config => "config",
            ResourceKind::Path => "path",
        };
        f.write_str(s)
    }
}

impl ComposeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ComposeError::InvalidInput(message.into())
    }

    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        ComposeError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ComposeError::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ComposeError::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// 元のエラーを包んだ Runtime エラー
    pub fn runtime_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ComposeError::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ComposeError::InvalidInput(_) | ComposeError::CyclicDependency { .. } => {
                ErrorKind::InvalidInput
            }
            ComposeError::NotFound { .. } => ErrorKind::NotFound,
            ComposeError::Conflict { .. } => ErrorKind::Conflict,
            ComposeError::Forbidden(_) => ErrorKind::Forbidden,
            ComposeError::Unavailable(_) => ErrorKind::Unavailable,
            ComposeError::Canceled => ErrorKind::Canceled,
            ComposeError::Runtime { .. } => ErrorKind::Runtime,
            ComposeError::Aggregate(_) => ErrorKind::Aggregate,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            ComposeError::Canceled => true,
            ComposeError::Aggregate(agg) => agg.all_canceled(),
            _ => false,
        }
    }

    /// プロセス終了コード（0 は成功時のみなのでここでは返さない）
    pub fn exit_code(&self) -> i32 {
        if self.is_canceled() { 130 } else { 1 }
    }
}

/// サービス単位の失敗
#[derive(Debug)]
pub struct ServiceFailure {
    pub service: String,
    pub error: ComposeError,
}

/// 並列処理で発生した複数の失敗
///
/// サービスごとの帰属を保持し、表示されるまで文字列に潰さない。
#[derive(Debug, Default)]
pub struct AggregateError {
    failures: Vec<ServiceFailure>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, service: impl Into<String>, error: ComposeError) {
        self.failures.push(ServiceFailure {
            service: service.into(),
            error,
        });
    }

    /// 失敗を取り込む（Aggregate はサービスごとの失敗として展開する）
    pub fn absorb(&mut self, service: impl Into<String>, error: ComposeError) {
        match error {
            ComposeError::Aggregate(inner) => self.failures.extend(inner.failures),
            other => self.push(service, other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[ServiceFailure] {
        &self.failures
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceFailure> {
        self.failures.iter()
    }

    fn all_canceled(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.error.is_canceled())
    }

    /// 失敗がなければ Ok、一件ならそのエラー、複数なら Aggregate
    pub fn into_result(mut self) -> Result<()> {
        match self.failures.len() {
            0 => Ok(()),
            1 => Err(self.failures.remove(0).error),
            _ => Err(ComposeError::Aggregate(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} services failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.service, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

pub type Result<T> = std::result::Result<T, ComposeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_cycle() {
        let err = ComposeError::CyclicDependency {
            cycle: vec!["web".into(), "db".into(), "web".into()],
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "cyclic dependency detected: web -> db -> web");
    }

    #[test]
    fn test_aggregate_single_failure_unwraps() {
        let mut agg = AggregateError::new();
        agg.push("web", ComposeError::conflict("host port 8080/tcp", "in use"));
        let err = agg.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_aggregate_keeps_attribution() {
        let mut agg = AggregateError::new();
        agg.push("web", ComposeError::runtime("boom"));
        agg.push("db", ComposeError::not_found(ResourceKind::Image, "postgres"));
        let err = agg.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aggregate);
        let ComposeError::Aggregate(agg) = &err else {
            panic!("expected aggregate");
        };
        let services: Vec<_> = agg.iter().map(|f| f.service.as_str()).collect();
        assert_eq!(services, vec!["web", "db"]);
        assert!(err.to_string().contains("db: image 'postgres' not found"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ComposeError::Canceled.exit_code(), 130);
        assert_eq!(ComposeError::runtime("x").exit_code(), 1);

        let mut agg = AggregateError::new();
        agg.push("a", ComposeError::Canceled);
        agg.push("b", ComposeError::Canceled);
        assert_eq!(ComposeError::Aggregate(agg).exit_code(), 130);
    }
}
