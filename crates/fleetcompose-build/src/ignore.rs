//! `.dockerignore` の解釈
//!
//! 後に書かれたルールが優先され、`!` で始まる行は除外を取り消す。
//! ディレクトリにマッチしたパターンはその配下すべてにマッチする。

use crate::error::{BuildError, BuildResult};
use regex::Regex;
use std::path::Path;

const IGNORE_FILE: &str = ".dockerignore";

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    negate: bool,
}

/// `.dockerignore` のルール集合
#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    /// コンテキスト直下の `.dockerignore` を読み込む（無ければ空）
    pub fn load(context: &Path) -> BuildResult<Self> {
        let path = context.join(IGNORE_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> BuildResult<Self> {
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negate, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let cleaned = pattern
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/');
            if cleaned.is_empty() {
                continue;
            }
            let regex = Regex::new(&to_regex(cleaned)).map_err(|e| {
                BuildError::InvalidIgnorePattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                }
            })?;
            rules.push(Rule {
                pattern: regex,
                negate,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// コンテキストからの相対パス（`/` 区切り）が除外対象か
    pub fn is_ignored(&self, relative: &str) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.pattern.is_match(relative) {
                ignored = !rule.negate;
            }
        }
        ignored
    }
}

/// glob パターンを正規表現に変換する
fn to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` は 0 個以上のディレクトリ
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push_str("(?:/.*)?$");
    regex
}
