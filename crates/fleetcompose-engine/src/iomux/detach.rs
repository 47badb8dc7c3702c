//! デタッチキー
//!
//! 既定は `ctrl-p,ctrl-q`（0x10 0x11）。`ctrl-<x>` と 1 文字のリテラルを
//! カンマ区切りで指定できる。

use fleetcompose_core::{ComposeError, Result};
use std::fmt;

pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys {
    bytes: Vec<u8>,
}

impl Default for DetachKeys {
    fn default() -> Self {
        Self {
            bytes: vec![0x10, 0x11],
        }
    }
}

impl DetachKeys {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || ComposeError::invalid(format!("invalid detach keys '{}'", spec));
        let mut bytes = Vec::new();
        for key in spec.split(',').map(str::trim) {
            let byte = match key.strip_prefix("ctrl-") {
                Some(rest) => ctrl_byte(rest).ok_or_else(invalid)?,
                None => {
                    let mut chars = key.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if c.is_ascii() => c as u8,
                        _ => return Err(invalid()),
                    }
                }
            };
            bytes.push(byte);
        }
        if bytes.is_empty() {
            return Err(invalid());
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn matcher(&self) -> DetachMatcher {
        DetachMatcher {
            keys: self.bytes.clone(),
            held: Vec::new(),
        }
    }
}

impl fmt::Display for DetachKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .bytes
            .iter()
            .map(|b| match b {
                1..=26 => format!("ctrl-{}", (b'a' + b - 1) as char),
                _ => (*b as char).to_string(),
            })
            .collect();
        f.write_str(&keys.join(","))
    }
}

fn ctrl_byte(key: &str) -> Option<u8> {
    let mut chars = key.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    match c.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        '@' => Some(0),
        '[' => Some(27),
        '\\' => Some(28),
        ']' => Some(29),
        '^' => Some(30),
        '_' => Some(31),
        _ => None,
    }
}

/// 入力を検査した結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// コンテナへ送るバイト列
    Forward(Vec<u8>),
    /// デタッチ列が完成した。それ以前のバイト列を送ってから切断する
    Detach(Vec<u8>),
}

/// 入力ストリーム中のデタッチ列を探す
///
/// 途中まで一致したバイトは次の入力まで保留し、不一致ならそのまま送る。
#[derive(Debug, Clone)]
pub struct DetachMatcher {
    keys: Vec<u8>,
    held: Vec<u8>,
}

impl DetachMatcher {
    pub fn scan(&mut self, input: &[u8]) -> Scan {
        let mut out = Vec::with_capacity(input.len());
        for &byte in input {
            if byte == self.keys[self.held.len()] {
                self.held.push(byte);
                if self.held.len() == self.keys.len() {
                    self.held.clear();
                    return Scan::Detach(out);
                }
                continue;
            }
            out.append(&mut self.held);
            if byte == self.keys[0] {
                self.held.push(byte);
            } else {
                out.push(byte);
            }
        }
        Scan::Forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!(DetachKeys::parse("ctrl-p,ctrl-q").unwrap(), DetachKeys::default());
        assert_eq!(DetachKeys::parse("ctrl-a,x").unwrap().as_bytes(), &[0x01, b'x']);
        assert_eq!(DetachKeys::parse("ctrl-[").unwrap().as_bytes(), &[27]);
        assert!(DetachKeys::parse("ctrl-").is_err());
        assert!(DetachKeys::parse("ab").is_err());
        assert_eq!(DetachKeys::default().to_string(), DEFAULT_DETACH_KEYS);
    }

    #[test]
    fn test_matcher_detaches() {
        let mut matcher = DetachKeys::default().matcher();
        assert_eq!(matcher.scan(b"ls\n\x10"), Scan::Forward(b"ls\n".to_vec()));
        assert_eq!(matcher.scan(b"\x11rest"), Scan::Detach(Vec::new()));
    }

    #[test]
    fn test_matcher_releases_partial_match() {
        let mut matcher = DetachKeys::default().matcher();
        assert_eq!(matcher.scan(b"\x10"), Scan::Forward(Vec::new()));
        assert_eq!(matcher.scan(b"a"), Scan::Forward(b"\x10a".to_vec()));
        assert_eq!(matcher.scan(b"\x10\x10\x11"), Scan::Detach(b"\x10".to_vec()));
    }
}
