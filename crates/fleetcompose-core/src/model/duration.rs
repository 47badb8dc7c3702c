//! Compose 形式の期間表記（`10s`, `1m30s`, `500ms`、または秒数）

use std::time::Duration;

/// 期間文字列をパース
///
/// 単位なしの数値は秒として扱う。
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return to_duration(secs, input);
    }

    let mut total = 0.0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" | "µs" => 0.000_001,
            "ns" => 0.000_000_001,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        rest = &rest[unit_len..];
        total += number * factor;
    }
    to_duration(total, input)
}

fn to_duration(secs: f64, input: &str) -> Result<Duration, String> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(format!("invalid duration '{}'", input))
    }
}

/// 期間を Compose 形式で表記
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() != 0 {
        return format!("{}ms", duration.as_millis());
    }
    let secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}

/// `Option<Duration>` 用の serde アダプタ
pub mod option {
    use super::{format_duration, parse_duration};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_yaml::Value;
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::Number(n) => {
                let secs = n
                    .as_f64()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .ok_or_else(|| D::Error::custom(format!("invalid duration {}", n)))?;
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Value::String(s) => parse_duration(&s).map(Some).map_err(D::Error::custom),
            _ => Err(D::Error::custom("expected a duration")),
        }
    }
}

/// メモリ量表記（`512m`, `1g`, `1024`）をバイト数に変換
pub fn parse_bytes(input: &str) -> Result<i64, String> {
    let s = input.trim().to_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (number, factor) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024f64),
        Some('m') => (&s[..s.len() - 1], 1024f64 * 1024.0),
        Some('g') => (&s[..s.len() - 1], 1024f64 * 1024.0 * 1024.0),
        _ => (s, 1f64),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size '{}'", input))?;
    if value < 0.0 {
        return Err(format!("invalid byte size '{}'", input));
    }
    Ok((value * factor) as i64)
}
