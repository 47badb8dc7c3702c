//! FleetCompose の設定解決
//!
//! 環境変数（`COMPOSE_*`）、Compose ファイルの発見、
//! プロジェクト名の決定をまとめ、コアのローダーに渡します。

pub mod discovery;
pub mod error;
pub mod settings;

pub use discovery::{COMPOSE_FILE_NAMES, find_compose_files};
pub use error::{ConfigError, Result};
pub use settings::EngineSettings;

use fleetcompose_core::{LoadOptions, Project, load_project};
use std::path::{Path, PathBuf};
use tracing::debug;

/// コマンドラインから渡されたプロジェクト指定
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    /// `-f/--file`（指定順）
    pub files: Vec<PathBuf>,
    /// `-p/--project-name`
    pub project_name: Option<String>,
    /// `--project-directory`
    pub project_directory: Option<PathBuf>,
}

impl ProjectOptions {
    /// 使用する Compose ファイルを決定
    ///
    /// `-f` → `COMPOSE_FILE` → 自動発見 の順。相対パスは `cwd` 基準。
    pub fn resolve_files(&self, settings: &EngineSettings, cwd: &Path) -> Result<Vec<PathBuf>> {
        let explicit = if !self.files.is_empty() {
            &self.files
        } else {
            &settings.files
        };
        if !explicit.is_empty() {
            return Ok(explicit
                .iter()
                .map(|f| if f.is_absolute() { f.clone() } else { cwd.join(f) })
                .collect());
        }
        let start = self
            .project_directory
            .as_ref()
            .map(|d| cwd.join(d))
            .unwrap_or_else(|| cwd.to_path_buf());
        find_compose_files(&start)
    }

    /// フラグ → `COMPOSE_PROJECT_NAME` の順で明示された名前
    ///
    /// どちらも無ければファイルの `name:`、最後にディレクトリ名が使われる。
    pub fn explicit_project_name<'a>(&'a self, settings: &'a EngineSettings) -> Option<&'a str> {
        self.project_name
            .as_deref()
            .or(settings.project_name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// 設定を解決してプロジェクトを読み込む
    pub fn load(&self, settings: &EngineSettings) -> fleetcompose_core::Result<Project> {
        let cwd = std::env::current_dir().map_err(ConfigError::from)?;
        self.load_from(settings, &cwd)
    }

    /// `cwd` を基準にプロジェクトを読み込む
    pub fn load_from(
        &self,
        settings: &EngineSettings,
        cwd: &Path,
    ) -> fleetcompose_core::Result<Project> {
        let files = self.resolve_files(settings, cwd)?;
        debug!(?files, "Resolved compose files");
        let options = LoadOptions {
            project_name: self.explicit_project_name(settings).map(str::to_string),
            working_dir: self.project_directory.as_ref().map(|d| cwd.join(d)),
        };
        load_project(&files, &options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const COMPOSE: &str = "services:\n  web:\n    image: nginx\n";

    #[test]
    fn test_project_name_from_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("My_App");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("compose.yaml"), COMPOSE).unwrap();

        let project = ProjectOptions::default()
            .load_from(&EngineSettings::default(), &dir)
            .unwrap();
        assert_eq!(project.name, "my_app");
        assert!(project.services.contains_key("web"));
    }

    #[test]
    fn test_project_name_precedence() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join("compose.yaml"),
            format!("name: fromfile\n{}", COMPOSE),
        )
        .unwrap();

        let settings = EngineSettings {
            project_name: Some("fromenv".into()),
            ..Default::default()
        };
        let from_file = ProjectOptions::default()
            .load_from(&EngineSettings::default(), temp_dir.path())
            .unwrap();
        assert_eq!(from_file.name, "fromfile");

        let from_env = ProjectOptions::default()
            .load_from(&settings, temp_dir.path())
            .unwrap();
        assert_eq!(from_env.name, "fromenv");

        let options = ProjectOptions {
            project_name: Some("FromFlag".into()),
            ..Default::default()
        };
        let from_flag = options.load_from(&settings, temp_dir.path()).unwrap();
        assert_eq!(from_flag.name, "fromflag");
    }

    #[test]
    fn test_flag_files_override_env_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            files: vec![PathBuf::from("env.yaml")],
            ..Default::default()
        };
        let options = ProjectOptions {
            files: vec![PathBuf::from("flag.yaml")],
            ..Default::default()
        };

        let files = options.resolve_files(&settings, temp_dir.path()).unwrap();
        assert_eq!(files, vec![temp_dir.path().join("flag.yaml")]);

        let files = ProjectOptions::default()
            .resolve_files(&settings, temp_dir.path())
            .unwrap();
        assert_eq!(files, vec![temp_dir.path().join("env.yaml")]);
    }

    #[test]
    fn test_multiple_files_are_merged() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("compose.yaml"), COMPOSE).unwrap();
        fs::write(
            temp_dir.path().join("compose.override.yaml"),
            "services:\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let project = ProjectOptions::default()
            .load_from(&EngineSettings::default(), temp_dir.path())
            .unwrap();
        assert_eq!(project.services["web"].image.as_deref(), Some("nginx:1.25"));
        assert_eq!(project.config_files.len(), 2);
    }
}
