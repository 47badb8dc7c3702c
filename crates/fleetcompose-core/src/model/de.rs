//! Compose 形式特有の「文字列またはリスト」「マップまたは KEY=VALUE リスト」を受け付けるデシリアライザ

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// スカラー値を文字列化する（null やコレクションは None）
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn scalar_items<E: serde::de::Error>(items: Vec<Value>) -> Result<Vec<String>, E> {
    items
        .iter()
        .map(|item| scalar_to_string(item).ok_or_else(|| E::custom("expected a scalar list item")))
        .collect()
}

/// `"a b c"` または `["a", "b", "c"]`
pub(crate) fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => scalar_items(items),
        Value::Mapping(_) => Err(D::Error::custom("expected a string or a list")),
        other => Ok(scalar_to_string(&other).into_iter().collect()),
    }
}

/// command / entrypoint 用。文字列形式はシェル風に分割する
pub(crate) fn command<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => split_command(&s).map_err(D::Error::custom),
        Value::Sequence(items) => scalar_items(items),
        _ => Err(D::Error::custom("expected a command string or a list")),
    }
}

/// healthcheck.test 用。文字列形式は CMD-SHELL として扱う
pub(crate) fn healthcheck_test<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec!["CMD-SHELL".to_string(), s]),
        Value::Sequence(items) => scalar_items(items),
        _ => Err(D::Error::custom("expected a healthcheck test string or a list")),
    }
}

fn key_value_map<E, F>(value: Value, missing: F) -> Result<BTreeMap<String, String>, E>
where
    E: serde::de::Error,
    F: Fn(&str) -> Option<String>,
{
    let mut map = BTreeMap::new();
    match value {
        Value::Null => {}
        Value::Mapping(entries) => {
            for (key, value) in entries {
                let key = scalar_to_string(&key).ok_or_else(|| E::custom("expected a string key"))?;
                match scalar_to_string(&value) {
                    Some(v) => {
                        map.insert(key, v);
                    }
                    None if value.is_null() => {
                        if let Some(v) = missing(&key) {
                            map.insert(key, v);
                        }
                    }
                    None => return Err(E::custom(format!("value of '{}' must be a scalar", key))),
                }
            }
        }
        Value::Sequence(items) => {
            for item in scalar_items::<E>(items)? {
                match item.split_once('=') {
                    Some((k, v)) => {
                        map.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        if let Some(v) = missing(&item) {
                            map.insert(item, v);
                        }
                    }
                }
            }
        }
        _ => return Err(E::custom("expected a mapping or a list of KEY=VALUE")),
    }
    Ok(map)
}

/// environment / build.args 用。値のないキーはホスト環境変数から補完し、無ければ省く
pub(crate) fn environment<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    key_value_map(Value::deserialize(deserializer)?, |key| std::env::var(key).ok())
}

/// labels / driver_opts 用。値のないキーは空文字列
pub(crate) fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    key_value_map(Value::deserialize(deserializer)?, |_| Some(String::new()))
}

/// `name:` だけ書かれた（値が null の）エントリを既定値で埋めるマップ
pub(crate) fn nullable_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw: Option<BTreeMap<String, Option<Value>>> = Option::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let parsed = match value {
            None | Some(Value::Null) => T::default(),
            Some(v) => serde_yaml::from_value(v)
                .map_err(|e| D::Error::custom(format!("{}: {}", key, e)))?,
        };
        map.insert(key, parsed);
    }
    Ok(map)
}

/// 名前のリストまたは name → 設定 のマップ
pub(crate) fn name_list_or_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(BTreeMap::new()),
        Value::Sequence(items) => Ok(scalar_items::<D::Error>(items)?
            .into_iter()
            .map(|name| (name, T::default()))
            .collect()),
        value @ Value::Mapping(_) => {
            nullable_map(value).map_err(|e| D::Error::custom(e.to_string()))
        }
        _ => Err(D::Error::custom("expected a list of names or a mapping")),
    }
}

/// 数値または数値文字列
pub(crate) fn optional_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid number '{}'", s))),
        _ => Err(D::Error::custom("expected a number")),
    }
}

/// 文字列のクォートを解釈しつつ空白で分割する
///
/// シングルクォート内はそのまま、ダブルクォート内は `\"` と `\\` のみエスケープを解釈する。
pub fn split_command(input: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(format!("unterminated quote in '{}'", input)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(format!("unterminated quote in '{}'", input)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(format!("unterminated quote in '{}'", input)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}
