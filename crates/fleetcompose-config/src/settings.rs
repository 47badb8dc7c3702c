//! 環境変数から読み込むエンジン設定

use crate::error::{ConfigError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const ENV_PROJECT_NAME: &str = "COMPOSE_PROJECT_NAME";
pub const ENV_FILE: &str = "COMPOSE_FILE";
pub const ENV_PARALLEL_LIMIT: &str = "COMPOSE_PARALLEL_LIMIT";
pub const ENV_HTTP_TIMEOUT: &str = "COMPOSE_HTTP_TIMEOUT";
pub const ENV_IGNORE_ORPHANS: &str = "COMPOSE_IGNORE_ORPHANS";

/// `COMPOSE_FILE` の区切り文字
#[cfg(windows)]
pub const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_SEPARATOR: char = ':';

/// エンジン自身が解釈する環境設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub project_name: Option<String>,
    pub files: Vec<PathBuf>,
    /// スケジューラの同時実行数の上限
    pub parallel_limit: Option<usize>,
    /// ランタイムクライアントへのタイムアウトのヒント
    pub http_timeout: Option<Duration>,
    /// orphan の警告を抑止する
    pub ignore_orphans: bool,
}

impl EngineSettings {
    /// プロセスの環境変数から読み込む
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意の参照関数から読み込む
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            project_name: get(ENV_PROJECT_NAME),
            files: get(ENV_FILE)
                .map(|value| split_file_list(&value))
                .unwrap_or_default(),
            parallel_limit: get(ENV_PARALLEL_LIMIT)
                .map(|value| parse_parallel_limit(&value))
                .transpose()?,
            http_timeout: get(ENV_HTTP_TIMEOUT)
                .map(|value| parse_seconds(ENV_HTTP_TIMEOUT, &value))
                .transpose()?,
            ignore_orphans: get(ENV_IGNORE_ORPHANS)
                .map(|value| parse_bool(ENV_IGNORE_ORPHANS, &value))
                .transpose()?
                .unwrap_or(false),
        };
        debug!(?settings, "Loaded engine settings from environment");
        Ok(settings)
    }
}

/// `COMPOSE_FILE` をパスのリストに分割
pub fn split_file_list(value: &str) -> Vec<PathBuf> {
    value
        .split(PATH_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// 正の整数のみ受け付ける
pub fn parse_parallel_limit(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            var: ENV_PARALLEL_LIMIT,
            value: value.to_string(),
            message: "must be a positive integer".to_string(),
        }),
    }
}

fn parse_seconds(var: &'static str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            message: e.to_string(),
        })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            message: "expected a boolean (1/true/yes/on or 0/false/no/off)".to_string(),
        }),
    }
}
