//! ポート定義

use crate::error::{ComposeError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::fmt;

/// 公開ポートのマッピング
///
/// 短縮形式 `[HOST_IP:][HOST:]CONTAINER[/PROTOCOL]` と長形式の両方を受け付ける。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub target: u16,
    /// None の場合はランタイムが空きポートを割り当てる
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
}

/// プロトコル種別
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// 文字列からProtocolをパース
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "sctp" => Some(Protocol::Sctp),
            _ => None,
        }
    }

    /// Docker APIで使用する文字列に変換
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl PortMapping {
    /// 短縮形式をパース
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || ComposeError::invalid(format!("invalid port specification '{}'", spec));

        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, Protocol::parse(proto).ok_or_else(invalid)?),
            None => (spec, Protocol::Tcp),
        };

        // IPv6 のホストアドレスは [::1]:8080:80 の形
        let (host_ip, rest) = if let Some(stripped) = addr.strip_prefix('[') {
            let (ip, rest) = stripped.split_once("]:").ok_or_else(invalid)?;
            (Some(ip.to_string()), rest)
        } else {
            (None, addr)
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let parse_port = |s: &str| s.parse::<u16>().map_err(|_| invalid());
        let (host_ip, published, target) = match parts.as_slice() {
            [target] => (host_ip, None, parse_port(target)?),
            [published, target] if host_ip.is_some() => {
                (host_ip, optional_port(published, invalid)?, parse_port(target)?)
            }
            [published, target] => (None, optional_port(published, invalid)?, parse_port(target)?),
            [ip, published, target] if host_ip.is_none() => (
                Some(ip.to_string()),
                optional_port(published, invalid)?,
                parse_port(target)?,
            ),
            _ => return Err(invalid()),
        };

        if target == 0 {
            return Err(invalid());
        }

        Ok(Self {
            target,
            published,
            host_ip: host_ip.filter(|ip| !ip.is_empty()),
            protocol,
        })
    }

    /// ランタイムの PortBindings キー（例: `80/tcp`）
    pub fn container_port_key(&self) -> String {
        format!("{}/{}", self.target, self.protocol.as_str())
    }
}

fn optional_port(s: &str, invalid: impl Fn() -> ComposeError) -> Result<Option<u16>> {
    if s.is_empty() {
        Ok(None)
    } else {
        s.parse::<u16>().map(Some).map_err(|_| invalid())
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        if let Some(published) = self.published {
            write!(f, "{}:", published)?;
        }
        write!(f, "{}/{}", self.target, self.protocol.as_str())
    }
}

#[derive(Deserialize)]
struct LongPort {
    target: u16,
    #[serde(default)]
    published: Option<Value>,
    #[serde(default)]
    host_ip: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
}

impl<'de> Deserialize<'de> for PortMapping {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => PortMapping::parse(&s).map_err(D::Error::custom),
            Value::Number(n) => {
                let target = n
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p > 0)
                    .ok_or_else(|| D::Error::custom(format!("invalid port {}", n)))?;
                Ok(PortMapping {
                    target,
                    published: None,
                    host_ip: None,
                    protocol: Protocol::Tcp,
                })
            }
            value @ Value::Mapping(_) => {
                let long: LongPort = serde_yaml::from_value(value).map_err(D::Error::custom)?;
                let published = match long.published {
                    None | Some(Value::Null) => None,
                    Some(Value::Number(n)) => Some(
                        n.as_u64()
                            .and_then(|p| u16::try_from(p).ok())
                            .ok_or_else(|| D::Error::custom(format!("invalid port {}", n)))?,
                    ),
                    Some(Value::String(s)) if s.is_empty() => None,
                    Some(Value::String(s)) => Some(
                        s.parse()
                            .map_err(|_| D::Error::custom(format!("invalid port '{}'", s)))?,
                    ),
                    Some(_) => return Err(D::Error::custom("invalid published port")),
                };
                let protocol = match long.protocol {
                    Some(p) => Protocol::parse(&p)
                        .ok_or_else(|| D::Error::custom(format!("unknown protocol '{}'", p)))?,
                    None => Protocol::Tcp,
                };
                Ok(PortMapping {
                    target: long.target,
                    published,
                    host_ip: long.host_ip,
                    protocol,
                })
            }
            _ => Err(D::Error::custom("expected a port string, number or mapping")),
        }
    }
}
