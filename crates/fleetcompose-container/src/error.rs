//! bollard のエラーをエンジンのエラー分類に変換する

use fleetcompose_core::error::{ComposeError, ResourceKind};
use regex::Regex;
use std::sync::OnceLock;

fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:Bind for|listen tcp[46]?|listen udp[46]?) \[?([0-9a-fA-F.:]*?)\]?:(\d+)")
            .expect("port pattern is valid")
    })
}

/// ポート衝突のメッセージから公開ポートを取り出す
pub fn conflicting_port(message: &str) -> Option<u16> {
    if !(message.contains("port is already allocated")
        || message.contains("address already in use"))
    {
        return None;
    }
    port_pattern()
        .captures(message)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// bollard のエラーを分類する
///
/// `kind` と `name` は NotFound / Conflict の対象として使う。
pub fn classify(err: bollard::errors::Error, kind: ResourceKind, name: &str) -> ComposeError {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code: 404, ..
        } => ComposeError::not_found(kind, name),
        Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => ComposeError::conflict(format!("{} '{}'", kind, name), message),
        Error::DockerResponseServerError {
            status_code: 403,
            message,
        } => ComposeError::Forbidden(message),
        Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            if let Some(port) = conflicting_port(&message) {
                return ComposeError::conflict(format!("host port {}", port), message);
            }
            if message.contains("removal of container") && message.contains("is running") {
                return ComposeError::Forbidden(message);
            }
            ComposeError::runtime(format!("runtime returned {}: {}", status_code, message))
        }
        other => {
            // 接続エラーの可能性をチェック
            let err_str = other.to_string();
            if err_str.contains("Connection refused")
                || err_str.contains("No such file or directory")
                || err_str.contains("Socket not found")
                || err_str.contains("timed out")
            {
                ComposeError::Unavailable(err_str)
            } else {
                ComposeError::runtime_with(format!("{} '{}': {}", kind, name, err_str), other)
            }
        }
    }
}
