//! Compose ファイルの自動発見
//!
//! カレントディレクトリから親に向かって Compose ファイルを探し、
//! 同じディレクトリにあるオーバーライドファイルを後ろに追加します。

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// 検索するファイル名（優先順）
pub const COMPOSE_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

const OVERRIDE_FILE_NAMES: [&str; 4] = [
    "compose.override.yaml",
    "compose.override.yml",
    "docker-compose.override.yaml",
    "docker-compose.override.yml",
];

/// `start_dir` から上に向かって Compose ファイルを探す
///
/// 見つかったファイルと、同じディレクトリのオーバーライドファイル（あれば）を返す。
#[instrument(fields(start_dir = %start_dir.display()))]
pub fn find_compose_files(start_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut current = start_dir.to_path_buf();

    loop {
        debug!(checking = %current.display(), "Looking for compose file");
        if let Some(file) = first_existing(&current, &COMPOSE_FILE_NAMES) {
            let found: Vec<&str> = COMPOSE_FILE_NAMES
                .iter()
                .copied()
                .filter(|name| current.join(name).is_file())
                .collect();
            if found.len() > 1 {
                warn!(
                    dir = %current.display(),
                    using = %file.display(),
                    "Found multiple compose files: {}",
                    found.join(", ")
                );
            }

            let mut files = vec![file];
            if let Some(override_file) = first_existing(&current, &OVERRIDE_FILE_NAMES) {
                debug!(file = %override_file.display(), "Found override file");
                files.push(override_file);
            }
            info!(dir = %current.display(), files = files.len(), "Found compose files");
            return Ok(files);
        }

        // 親ディレクトリへ
        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::ComposeFileNotFound(start_dir.to_path_buf()))
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
