//! プロジェクトローダー
//!
//! 正規化済みの Compose YAML を読み込み、複数ファイルをマージして検証する。
//! 変数展開、`extends`、プロファイルは扱わない。

use crate::error::{ComposeError, Result};
use crate::model::Project;
use crate::validate::{normalize_project_name, validate};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// 読み込みオプション
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// 明示されたプロジェクト名（フラグまたは環境変数）
    pub project_name: Option<String>,
    /// 相対パスの基準。未指定なら最初のファイルのディレクトリ
    pub working_dir: Option<PathBuf>,
}

/// 複数の設定ファイルを順に読み込んでプロジェクトを生成
///
/// 以下の処理を実行:
/// 1. 各ファイルのパース
/// 2. 後勝ちマージ（マップはマージ、リストは置き換え）
/// 3. プロジェクト名の決定
/// 4. 正規化と検証
#[instrument(skip(options), fields(files = files.len()))]
pub fn load_project(files: &[PathBuf], options: &LoadOptions) -> Result<Project> {
    let first = files
        .first()
        .ok_or_else(|| ComposeError::invalid("no compose file given"))?;

    let mut merged: Option<Project> = None;
    for file in files {
        debug!(file = %file.display(), "Reading compose file");
        let content = std::fs::read_to_string(file).map_err(|e| {
            ComposeError::invalid(format!("failed to read {}: {}", file.display(), e))
        })?;
        let mut project = parse_document(&content, file)?;
        project.config_files = vec![absolute(file)];
        match merged.as_mut() {
            Some(base) => base.merge(project),
            None => merged = Some(project),
        }
    }
    let mut project = merged.ok_or_else(|| ComposeError::invalid("no compose file given"))?;

    let working_dir = match &options.working_dir {
        Some(dir) => absolute(dir),
        None => absolute(first)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    finish(&mut project, working_dir, options.project_name.as_deref())?;

    info!(
        project = %project.name,
        services = project.services.len(),
        "Project loaded successfully"
    );
    Ok(project)
}

/// 文字列からプロジェクトを読み込む（テストや標準入力用）
pub fn load_project_from_str(
    content: &str,
    working_dir: &Path,
    project_name: Option<&str>,
) -> Result<Project> {
    let mut project = parse_document(content, Path::new("<inline>"))?;
    finish(&mut project, working_dir.to_path_buf(), project_name)?;
    Ok(project)
}

fn parse_document(content: &str, origin: &Path) -> Result<Project> {
    if content.trim().is_empty() {
        return Err(ComposeError::invalid(format!(
            "{} is empty",
            origin.display()
        )));
    }
    serde_yaml::from_str(content).map_err(|e| {
        ComposeError::invalid(format!("failed to parse {}: {}", origin.display(), e))
    })
}

fn finish(project: &mut Project, working_dir: PathBuf, explicit_name: Option<&str>) -> Result<()> {
    // フラグ/環境変数 → ファイルの name → ディレクトリ名
    let raw_name = match explicit_name.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None if !project.name.is_empty() => project.name.clone(),
        None => working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    project.name = normalize_project_name(&raw_name);
    if project.name.is_empty() {
        return Err(ComposeError::invalid(format!(
            "cannot derive a project name from '{}'; use --project-name",
            raw_name
        )));
    }

    project.working_dir = working_dir;
    project.normalize();
    validate(project)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_single_file_uses_directory_name() {
        let dir = tempfile::Builder::new().prefix("MyDemo").tempdir().unwrap();
        let file = write(&dir, "compose.yaml", "services:\n  web:\n    image: nginx\n");

        let project = load_project(&[file.clone()], &LoadOptions::default()).unwrap();
        assert!(project.name.starts_with("mydemo"));
        assert_eq!(project.working_dir, dir.path());
        assert_eq!(project.config_files, vec![file]);
        assert_eq!(project.services["web"].name, "web");
    }

    #[test]
    fn test_load_merges_override_file() {
        let dir = TempDir::new().unwrap();
        let base = write(
            &dir,
            "compose.yaml",
            "name: demo\nservices:\n  web:\n    image: nginx\n    environment: {A: '1'}\n",
        );
        let over = write(
            &dir,
            "compose.override.yaml",
            "services:\n  web:\n    image: nginx:1.25\n    environment: {B: '2'}\n",
        );

        let project = load_project(&[base, over], &LoadOptions::default()).unwrap();
        assert_eq!(project.name, "demo");
        let web = &project.services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(web.environment.len(), 2);
        assert_eq!(project.config_files.len(), 2);
    }

    #[test]
    fn test_explicit_name_wins() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "compose.yaml", "name: fromfile\nservices:\n  web:\n    image: nginx\n");
        let options = LoadOptions {
            project_name: Some("Override".into()),
            ..Default::default()
        };
        let project = load_project(&[file], &options).unwrap();
        assert_eq!(project.name, "override");
    }

    #[test]
    fn test_parse_and_validation_errors_are_invalid_input() {
        let dir = TempDir::new().unwrap();
        let broken = write(&dir, "broken.yaml", "services: [");
        let err = load_project(&[broken], &LoadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let missing = dir.path().join("missing.yaml");
        let err = load_project(&[missing], &LoadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = load_project_from_str(
            "services:\n  web:\n    image: nginx\n    depends_on: [web]\n",
            dir.path(),
            Some("demo"),
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::CyclicDependency { .. }));
    }
}
