//! cp: ホストとコンテナの間でファイルをコピーする
//!
//! 転送は tar アーカイブで行う。宛先が既存のディレクトリならその中に展開し、
//! そうでなければアーカイブの先頭要素を宛先の名前に置き換える。
//! 末尾が `/` の宛先が存在しない場合は NotFound。

use super::ComposeEngine;
use super::options::CopyOptions;
use crate::progress::{EventKind, ProgressEvent};
use bytes::{Bytes, BytesMut};
use fleetcompose_core::{ComposeError, Project, ResourceKind, Result};
use futures_util::StreamExt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// cp の片側
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEndpoint {
    Local(PathBuf),
    Container { service: String, path: String },
}

impl CopyEndpoint {
    /// `SERVICE:PATH` ならコンテナ側、それ以外はホストのパス
    ///
    /// `/` や `.` で始まるものは `:` を含んでいてもホストのパスとして扱う。
    pub fn parse(spec: &str) -> Self {
        if spec.starts_with('/') || spec.starts_with('.') {
            return Self::Local(PathBuf::from(spec));
        }
        match spec.split_once(':') {
            Some((service, path)) if !service.is_empty() && !service.contains('/') => {
                Self::Container {
                    service: service.to_string(),
                    path: path.to_string(),
                }
            }
            _ => Self::Local(PathBuf::from(spec)),
        }
    }
}

fn io_error(message: &str) -> impl FnOnce(std::io::Error) -> ComposeError + '_ {
    move |e| ComposeError::runtime_with(message, e)
}

/// コンテナ内パスの親ディレクトリと末尾の名前
fn split_container_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), trimmed.to_string()),
    }
}

/// ホストのファイルまたはディレクトリを `root` という名前で tar にまとめる
fn pack(source: &Path, root: &str) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    if source.is_dir() {
        builder
            .append_dir_all(root, source)
            .map_err(io_error("failed to archive directory"))?;
    } else {
        builder
            .append_path_with_name(source, root)
            .map_err(io_error("failed to archive file"))?;
    }
    let data = builder
        .into_inner()
        .map_err(io_error("failed to finish archive"))?;
    Ok(Bytes::from(data))
}

/// アーカイブを `destination` に展開する
///
/// `rename` なら先頭要素を `destination` 自体に対応させる。
fn unpack(archive: &[u8], destination: &Path, rename: bool) -> Result<()> {
    let mut tar = tar::Archive::new(archive);
    for entry in tar.entries().map_err(io_error("invalid archive"))? {
        let mut entry = entry.map_err(io_error("invalid archive"))?;
        let path = entry.path().map_err(io_error("invalid archive"))?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ComposeError::invalid(format!(
                "archive entry '{}' escapes the destination",
                path.display()
            )));
        }
        let target = if rename {
            let rest: PathBuf = path.components().skip(1).collect();
            if rest.as_os_str().is_empty() {
                destination.to_path_buf()
            } else {
                destination.join(rest)
            }
        } else {
            destination.join(&path)
        };
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_error("failed to create directory"))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error("failed to create directory"))?;
        }
        entry
            .unpack(&target)
            .map_err(io_error("failed to write file"))?;
    }
    Ok(())
}

impl ComposeEngine {
    /// cp: どちらか一方がコンテナ側であること
    #[instrument(skip_all, fields(project = %project.name))]
    pub async fn copy(
        &self,
        project: &Project,
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = CopyEndpoint::parse(&options.source);
        let destination = CopyEndpoint::parse(&options.destination);
        match (source, destination) {
            (CopyEndpoint::Container { service, path }, CopyEndpoint::Local(local)) => {
                self.copy_from(project, &service, options.index, &path, &local, cancel)
                    .await
            }
            (CopyEndpoint::Local(local), CopyEndpoint::Container { service, path }) => {
                self.copy_to(project, &service, options.index, &local, &path)
                    .await
            }
            (CopyEndpoint::Local(_), CopyEndpoint::Local(_)) => Err(ComposeError::invalid(
                "one of source or destination must be SERVICE:PATH",
            )),
            _ => Err(ComposeError::invalid(
                "copying between containers is not supported",
            )),
        }
    }

    async fn copy_from(
        &self,
        project: &Project,
        service: &str,
        index: u32,
        path: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let container = self.find_replica(project, service, index).await?;
        let id = format!("Container {}", container.name);
        self.progress
            .event(ProgressEvent::new(id.clone(), EventKind::Copying));

        let mut stream = self.runtime.copy_from_container(&container.id, path);
        let mut archive = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ComposeError::Canceled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(data)) => archive.extend_from_slice(&data),
                Some(Err(e)) => {
                    self.progress.event(ProgressEvent::error(id, e.to_string()));
                    return Err(e);
                }
                None => break,
            }
        }

        let trailing_slash = destination.as_os_str().to_string_lossy().ends_with('/');
        let (target, rename) = if destination.is_dir() {
            (destination.to_path_buf(), false)
        } else if trailing_slash {
            return Err(ComposeError::not_found(
                ResourceKind::Path,
                destination.display().to_string(),
            ));
        } else {
            (destination.to_path_buf(), true)
        };
        if rename
            && let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty())
            && !parent.is_dir()
        {
            return Err(ComposeError::not_found(
                ResourceKind::Path,
                parent.display().to_string(),
            ));
        }

        let archive = archive.freeze();
        tokio::task::spawn_blocking(move || unpack(&archive, &target, rename))
            .await
            .map_err(|e| ComposeError::runtime_with("copy task failed", e))??;
        debug!(container = %container.name, path, "Copied from container");
        self.progress.event(ProgressEvent::new(id, EventKind::Copied));
        Ok(())
    }

    async fn copy_to(
        &self,
        project: &Project,
        service: &str,
        index: u32,
        source: &Path,
        path: &str,
    ) -> Result<()> {
        if !source.exists() {
            return Err(ComposeError::not_found(
                ResourceKind::Path,
                source.display().to_string(),
            ));
        }
        let container = self.find_replica(project, service, index).await?;

        let (directory, root) = match self.runtime.stat_path(&container.id, path).await {
            Ok(stat) if stat.is_dir => {
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| ".".to_string());
                (path.to_string(), name)
            }
            Ok(_) if source.is_dir() => {
                return Err(ComposeError::invalid(format!(
                    "cannot copy directory '{}' onto file '{}'",
                    source.display(),
                    path
                )));
            }
            Ok(_) => split_container_path(path),
            Err(e) if e.is_not_found() && !path.ends_with('/') => split_container_path(path),
            Err(e) => return Err(e),
        };

        let id = format!("Container {}", container.name);
        self.progress
            .event(ProgressEvent::new(id.clone(), EventKind::Copying));
        let owned = source.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack(&owned, &root))
            .await
            .map_err(|e| ComposeError::runtime_with("copy task failed", e))??;
        match self
            .runtime
            .copy_to_container(&container.id, &directory, archive)
            .await
        {
            Ok(()) => {
                debug!(container = %container.name, path, "Copied to container");
                self.progress.event(ProgressEvent::new(id, EventKind::Copied));
                Ok(())
            }
            Err(e) => {
                self.progress.event(ProgressEvent::error(id, e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::options::{Interrupt, UpOptions};
    use crate::compose::testing::{Harness, harness, project};

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            CopyEndpoint::parse("web:/etc/nginx"),
            CopyEndpoint::Container {
                service: "web".to_string(),
                path: "/etc/nginx".to_string(),
            }
        );
        assert_eq!(
            CopyEndpoint::parse("./a:b"),
            CopyEndpoint::Local(PathBuf::from("./a:b"))
        );
        assert_eq!(
            CopyEndpoint::parse("notes.txt"),
            CopyEndpoint::Local(PathBuf::from("notes.txt"))
        );
    }

    #[test]
    fn test_split_container_path() {
        assert_eq!(
            split_container_path("/tmp/b.txt"),
            ("/tmp".to_string(), "b.txt".to_string())
        );
        assert_eq!(
            split_container_path("/b.txt"),
            ("/".to_string(), "b.txt".to_string())
        );
    }

    async fn started(h: &Harness) -> Project {
        let p = project("services:\n  web:\n    image: nginx\n");
        h.engine
            .up(
                &p,
                &UpOptions {
                    detach: true,
                    ..Default::default()
                },
                &Interrupt::new(),
            )
            .await
            .unwrap();
        p
    }

    fn copy_options(source: &str, destination: &str) -> CopyOptions {
        CopyOptions {
            source: source.to_string(),
            destination: destination.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_copy_to_container() {
        let h = harness();
        let p = started(&h).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "hello").unwrap();
        let local = file.display().to_string();
        let cancel = CancellationToken::new();

        // 既存ディレクトリの中へ
        h.engine
            .copy(&p, &copy_options(&local, "web:/tmp/"), &cancel)
            .await
            .unwrap();
        assert_eq!(
            h.runtime.file("demo_web_1", "/tmp/a.txt").unwrap(),
            Bytes::from_static(b"hello")
        );

        // 名前を変えて
        h.engine
            .copy(&p, &copy_options(&local, "web:/tmp/b.txt"), &cancel)
            .await
            .unwrap();
        assert!(h.runtime.file("demo_web_1", "/tmp/b.txt").is_some());

        let err = h
            .engine
            .copy(&p, &copy_options(&local, "web:/missing/"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_copy_from_container() {
        let h = harness();
        let p = started(&h).await;
        h.runtime.put_file("demo_web_1", "/etc/app.conf", b"x=1");
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let into_dir = format!("{}/", dir.path().display());
        h.engine
            .copy(&p, &copy_options("web:/etc/app.conf", &into_dir), &cancel)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("app.conf")).unwrap(), "x=1");

        let renamed = dir.path().join("renamed.conf").display().to_string();
        h.engine
            .copy(&p, &copy_options("web:/etc/app.conf", &renamed), &cancel)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("renamed.conf")).unwrap(), "x=1");

        let missing = format!("{}/nope/", dir.path().display());
        let err = h
            .engine
            .copy(&p, &copy_options("web:/etc/app.conf", &missing), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_copy_requires_one_container_side() {
        let h = harness();
        let p = started(&h).await;
        let err = h
            .engine
            .copy(&p, &copy_options("/a", "/b"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fleetcompose_core::ErrorKind::InvalidInput);
    }
}
