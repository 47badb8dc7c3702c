use fleetcompose_core::{ComposeError, ResourceKind};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Compose ファイルが見つかりません（{0} とその親ディレクトリを検索しました）。\n\
        以下のいずれかを配置してください:\n\
        - compose.yaml, compose.yml, docker-compose.yaml, docker-compose.yml\n\
        または -f / COMPOSE_FILE で直接指定できます"
    )]
    ComposeFileNotFound(PathBuf),

    #[error("環境変数 {var} の値 '{value}' が不正です: {message}")]
    InvalidValue {
        var: &'static str,
        value: String,
        message: String,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for ComposeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ComposeFileNotFound(dir) => {
                ComposeError::not_found(ResourceKind::Path, format!("compose file in {}", dir.display()))
            }
            ConfigError::InvalidValue { .. } => ComposeError::invalid(err.to_string()),
            ConfigError::Io(e) => ComposeError::runtime_with("failed to read configuration", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcompose_core::ErrorKind;

    #[test]
    fn test_into_compose_error() {
        let err: ComposeError = ConfigError::InvalidValue {
            var: "COMPOSE_PARALLEL_LIMIT",
            value: "0".into(),
            message: "must be a positive integer".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err: ComposeError = ConfigError::ComposeFileNotFound(PathBuf::from("/srv")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
