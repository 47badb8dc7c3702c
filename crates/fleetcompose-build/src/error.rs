use fleetcompose_core::error::{ComposeError, ResourceKind};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid .dockerignore pattern '{pattern}': {message}")]
    InvalidIgnorePattern { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     build.dockerfile のパス（コンテキストからの相対パス）を確認してください。",
                    path.display()
                )
            }
            BuildError::ContextNotFound(path) => {
                format!(
                    "ビルドコンテキストが見つかりません: {}\n\
                     \n\
                     build.context のパスを確認してください。",
                    path.display()
                )
            }
            _ => format!("{}", self),
        }
    }
}

impl From<BuildError> for ComposeError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::DockerfileNotFound(path) | BuildError::ContextNotFound(path) => {
                ComposeError::not_found(ResourceKind::Path, path.display().to_string())
            }
            BuildError::InvalidConfig(message) => ComposeError::invalid(message),
            err @ BuildError::InvalidIgnorePattern { .. } => ComposeError::invalid(err.to_string()),
            BuildError::Io(e) => ComposeError::runtime_with("failed to prepare build context", e),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcompose_core::ErrorKind;

    #[test]
    fn test_into_compose_error() {
        let err: ComposeError = BuildError::DockerfileNotFound(PathBuf::from("/x/Dockerfile")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ComposeError = BuildError::InvalidConfig("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_user_message_mentions_path() {
        let msg = BuildError::ContextNotFound(PathBuf::from("/srv/app")).user_message();
        assert!(msg.contains("/srv/app"));
    }
}
