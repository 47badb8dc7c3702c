use crate::error::{BuildError, BuildResult};
use crate::ignore::IgnoreRules;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::Builder;

/// コンテキスト外の Dockerfile をアーカイブに入れるときの名前
pub const EXTERNAL_DOCKERFILE_NAME: &str = ".fleetcompose.Dockerfile";

/// 作成したビルドコンテキスト
#[derive(Debug)]
pub struct BuildContext {
    /// tar.gz アーカイブ
    pub archive: Vec<u8>,
    /// アーカイブ内の Dockerfile パス
    pub dockerfile: String,
    /// アーカイブに含めたファイル数
    pub file_count: usize,
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルドコンテキストをtar.gzアーカイブとして作成
    ///
    /// `.dockerignore` で除外されたファイルは含めない。Dockerfile は除外されていても必ず含める。
    pub fn create_context(context_path: &Path, dockerfile_path: &Path) -> BuildResult<BuildContext> {
        tracing::debug!(context = %context_path.display(), "Creating build context");

        let rules = IgnoreRules::load(context_path)?;
        let mut files = Vec::new();
        collect_files(context_path, context_path, &rules, &mut files)?;

        let inside = dockerfile_path
            .strip_prefix(context_path)
            .ok()
            .map(relative_string);

        // tarアーカイブの作成
        let mut archive_data = Vec::new();
        let file_count;
        let dockerfile;
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            for (full, relative) in &files {
                tar.append_path_with_name(full, relative)
                    .map_err(BuildError::Io)?;
            }

            dockerfile = match inside {
                Some(relative) => {
                    if !files.iter().any(|(_, r)| r == &relative) {
                        tar.append_path_with_name(dockerfile_path, &relative)
                            .map_err(BuildError::Io)?;
                    }
                    relative
                }
                None => {
                    // コンテキスト外の Dockerfile は別名で追加
                    let content = fs::read(dockerfile_path)?;
                    let mut header = tar::Header::new_gnu();
                    header.set_path(EXTERNAL_DOCKERFILE_NAME).map_err(|e| {
                        BuildError::InvalidConfig(format!("Failed to set Dockerfile path: {}", e))
                    })?;
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    tar.append(&header, &content[..]).map_err(BuildError::Io)?;
                    EXTERNAL_DOCKERFILE_NAME.to_string()
                }
            };
            file_count = files.len();

            let mut encoder = tar.into_inner().map_err(BuildError::Io)?;
            encoder.flush()?;
            encoder.finish()?;
        }

        tracing::debug!(bytes = archive_data.len(), files = file_count, "Build context created");

        // コンテキストサイズの警告
        Self::check_context_size(archive_data.len());

        Ok(BuildContext {
            archive: archive_data,
            dockerfile,
            file_count,
        })
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 .dockerignoreファイルで不要なファイルを除外することを推奨します。",
                size / 1024 / 1024
            );
        }
    }
}

fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 除外されていないファイルを名前順に集める
fn collect_files(
    root: &Path,
    dir: &Path,
    rules: &IgnoreRules,
    files: &mut Vec<(PathBuf, String)>,
) -> BuildResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(r) => relative_string(r),
            Err(_) => continue,
        };
        if rules.is_ignored(&relative) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, rules, files)?;
        } else {
            files.push((path, relative));
        }
    }
    Ok(())
}
