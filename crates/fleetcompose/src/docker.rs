use base64::Engine;
use colored::Colorize;
use fleetcompose_container::{DockerRuntime, RegistryAuth, RuntimeClient};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Docker Hub の認証キー（config.json 上の表記）
const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

/// Docker接続を初期化（エラーハンドリング付き）
pub async fn connect(timeout: Option<Duration>) -> anyhow::Result<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::connect_with_timeout(timeout).map_err(|e| {
        print_connection_help(&e);
        anyhow::Error::new(e).context("Docker接続に失敗しました")
    })?;

    // 接続テスト
    if let Err(e) = runtime.ping().await {
        print_connection_help(&e);
        return Err(anyhow::Error::new(e).context("Docker接続に失敗しました"));
    }
    Ok(Arc::new(runtime))
}

fn print_connection_help(cause: &dyn std::fmt::Display) {
    eprintln!();
    eprintln!("{}", "✗ Docker接続エラー".red().bold());
    eprintln!();
    eprintln!("{}", "原因:".yellow());
    eprintln!("  {}", cause);
    eprintln!();
    eprintln!("{}", "解決方法:".yellow());
    eprintln!("  • Dockerが起動しているか確認してください");
    eprintln!("  • DOCKER_HOST が正しいエンドポイントを指しているか確認してください");
    eprintln!("  • docker ps コマンドが正常に動作するか確認してください");
}

/// Docker の設定ファイルの場所（`DOCKER_CONFIG` → `~/.docker`）
fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(Path::new(&dir).join("config.json"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".docker").join("config.json"))
}

/// Docker config.json からレジストリごとの認証情報を読み込む
///
/// ファイルが無い・読めない場合は空のマップを返す。
pub fn registry_auth() -> BTreeMap<String, RegistryAuth> {
    let Some(path) = docker_config_path() else {
        return BTreeMap::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(content) => parse_registry_auth(&content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No docker config found");
            BTreeMap::new()
        }
    }
}

/// config.json の `auths` セクションを解釈する
///
/// キーはイメージ参照のホスト名に正規化する（Docker Hub は `docker.io`）。
pub fn parse_registry_auth(content: &str) -> BTreeMap<String, RegistryAuth> {
    let mut result = BTreeMap::new();
    let Ok(config) = serde_json::from_str::<serde_json::Value>(content) else {
        return result;
    };
    let Some(auths) = config.get("auths").and_then(|a| a.as_object()) else {
        return result;
    };

    for (registry, entry) in auths {
        let mut auth = RegistryAuth {
            server_address: Some(registry.clone()),
            ..Default::default()
        };

        // Base64 デコード (username:password 形式)
        if let Some((username, password)) = entry
            .get("auth")
            .and_then(|v| v.as_str())
            .and_then(decode_basic)
        {
            auth.username = Some(username);
            auth.password = Some(password);
        }
        auth.identity_token = entry
            .get("identitytoken")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if auth.username.is_none() && auth.identity_token.is_none() {
            continue;
        }
        result.insert(registry_key(registry), auth);
    }
    result
}

fn decode_basic(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// `https://ghcr.io/v2/` → `ghcr.io`
fn registry_key(registry: &str) -> String {
    if registry == DOCKER_HUB_INDEX {
        return "docker.io".to_string();
    }
    let without_scheme = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_auth() {
        // user:secret / bot:token
        let content = r#"{
            "auths": {
                "https://index.docker.io/v1/": {"auth": "dXNlcjpzZWNyZXQ="},
                "ghcr.io": {"auth": "Ym90OnRva2Vu"},
                "https://registry.example.com:5000/v2/": {"identitytoken": "abc"},
                "empty.example.com": {}
            }
        }"#;
        let auths = parse_registry_auth(content);
        assert_eq!(auths.len(), 3);

        let hub = &auths["docker.io"];
        assert_eq!(hub.username.as_deref(), Some("user"));
        assert_eq!(hub.password.as_deref(), Some("secret"));

        let ghcr = &auths["ghcr.io"];
        assert_eq!(ghcr.username.as_deref(), Some("bot"));
        assert_eq!(ghcr.server_address.as_deref(), Some("ghcr.io"));

        let private = &auths["registry.example.com:5000"];
        assert_eq!(private.identity_token.as_deref(), Some("abc"));
        assert!(private.username.is_none());
    }

    #[test]
    fn test_parse_registry_auth_invalid_json() {
        assert!(parse_registry_auth("not json").is_empty());
        assert!(parse_registry_auth("{}").is_empty());
    }

    #[test]
    fn test_registry_auth_reads_docker_config_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"auths": {"ghcr.io": {"auth": "Ym90OnRva2Vu"}}}"#,
        )
        .unwrap();
        temp_env::with_var("DOCKER_CONFIG", Some(dir.path()), || {
            let auths = registry_auth();
            assert_eq!(auths["ghcr.io"].password.as_deref(), Some("token"));
        });
    }
}
