//! コマンドライン引数の解釈

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use fleetcompose_container::Tail;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

/// `--scale SERVICE=N`
pub fn parse_scale(s: &str) -> Result<(String, u32), String> {
    let (service, count) = s
        .split_once('=')
        .ok_or_else(|| format!("'{}' は SERVICE=N の形式ではありません", s))?;
    if service.is_empty() {
        return Err(format!("'{}' にサービス名がありません", s));
    }
    let count = count
        .parse::<u32>()
        .map_err(|_| format!("'{}' のレプリカ数が不正です", s))?;
    Ok((service.to_string(), count))
}

/// `--tail all|N`
pub fn parse_tail(s: &str) -> Result<Tail, String> {
    Tail::parse(s).ok_or_else(|| format!("'{}' は all または行数を指定してください", s))
}

/// `--timeout SECS`
pub fn parse_timeout(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("'{}' は秒数ではありません", s))
}

/// `-e KEY=VALUE` / `-e KEY`
///
/// 値の無い `KEY` は `lookup` から値を取り、見つからなければ無視する。
pub fn parse_env<F>(items: &[String], lookup: F) -> anyhow::Result<BTreeMap<String, String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();
    for item in items {
        match item.split_once('=') {
            Some(("", _)) => bail!("'{}' に変数名がありません", item),
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                if let Some(value) = lookup(item) {
                    env.insert(item.clone(), value);
                }
            }
        }
    }
    Ok(env)
}

fn relative_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("relative time pattern is valid")
    })
}

/// `--since` / `--until` を UNIX 秒にする
///
/// UNIX 秒、RFC 3339 の日時、`now` からの相対時間（`10m`, `1h30m`）を受け付ける。
pub fn parse_timestamp(s: &str, now: DateTime<Utc>) -> anyhow::Result<i64> {
    if let Ok(seconds) = s.parse::<i64>() {
        return Ok(seconds);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(s) {
        return Ok(time.timestamp());
    }

    let captures = relative_pattern()
        .captures(s)
        .filter(|_| !s.is_empty())
        .with_context(|| format!("'{}' は日時として解釈できません", s))?;
    let part = |index: usize| -> i64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0)
    };
    let seconds = part(1) * 3600 + part(2) * 60 + part(3);
    Ok(now.timestamp() - seconds)
}

/// コンテナの終了コードをプロセスの終了コードにする
///
/// 負の値は失敗として 1、255 を超える値は 255 に丸める。
pub fn process_exit_code(code: i64) -> i32 {
    if code < 0 {
        1
    } else {
        code.min(255) as i32
    }
}
