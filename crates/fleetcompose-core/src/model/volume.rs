//! ボリューム定義

use super::de;
use crate::error::{ComposeError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;

/// マウント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountKind::Bind => "bind",
            MountKind::Volume => "volume",
            MountKind::Tmpfs => "tmpfs",
        }
    }
}

/// サービスのボリュームマウント
///
/// 短縮形式 `[SOURCE:]TARGET[:MODE]` と長形式の両方を受け付ける。
/// SOURCE が `/`, `.`, `~` で始まる場合はバインドマウント、それ以外は名前付きボリューム。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    #[serde(rename = "type")]
    pub kind: MountKind,
    /// 匿名ボリュームと tmpfs では None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// 短縮形式をパース
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || ComposeError::invalid(format!("invalid volume specification '{}'", spec));
        let parts: Vec<&str> = spec.split(':').collect();

        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(invalid()),
        };

        if target.is_empty() || !target.starts_with('/') {
            return Err(invalid());
        }

        let read_only = match mode {
            None => false,
            Some(mode) => {
                let flags: Vec<&str> = mode.split(',').collect();
                if flags.iter().any(|f| !is_known_mode(f)) {
                    return Err(invalid());
                }
                flags.contains(&"ro")
            }
        };

        let kind = match source {
            None => MountKind::Volume,
            Some(s) if s.is_empty() => return Err(invalid()),
            Some(s) if is_host_path(s) => MountKind::Bind,
            Some(_) => MountKind::Volume,
        };

        Ok(Self {
            kind,
            source: source.map(str::to_string),
            target: target.to_string(),
            read_only,
        })
    }

    /// プロジェクト定義の名前付きボリュームを参照しているか
    pub fn named_volume(&self) -> Option<&str> {
        match self.kind {
            MountKind::Volume => self.source.as_deref(),
            _ => None,
        }
    }
}

fn is_host_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('.') || s.starts_with('~')
}

fn is_known_mode(flag: &str) -> bool {
    matches!(
        flag,
        "ro" | "rw" | "z" | "Z" | "cached" | "delegated" | "consistent" | "nocopy"
    )
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}:", source)?;
        }
        write!(f, "{}", self.target)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct LongMount {
    #[serde(rename = "type")]
    kind: MountKind,
    #[serde(default)]
    source: Option<String>,
    target: String,
    #[serde(default)]
    read_only: bool,
}

impl<'de> Deserialize<'de> for VolumeMount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => VolumeMount::parse(&s).map_err(D::Error::custom),
            value @ Value::Mapping(_) => {
                let long: LongMount = serde_yaml::from_value(value).map_err(D::Error::custom)?;
                if long.kind == MountKind::Bind && long.source.is_none() {
                    return Err(D::Error::custom("bind mount requires a source"));
                }
                Ok(VolumeMount {
                    kind: long.kind,
                    source: long.source,
                    target: long.target,
                    read_only: long.read_only,
                })
            }
            _ => Err(D::Error::custom("expected a volume string or mapping")),
        }
    }
}

/// トップレベルのボリューム定義
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// ランタイム上の名前の明示的指定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, deserialize_with = "de::string_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_opts: BTreeMap<String, String>,
    /// 事前に存在している必要があり、down でも削除しない
    #[serde(default)]
    pub external: bool,
    #[serde(default, deserialize_with = "de::string_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}
