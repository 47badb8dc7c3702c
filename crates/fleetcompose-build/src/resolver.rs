use crate::context::ContextBuilder;
use crate::error::{BuildError, BuildResult};
use bytes::Bytes;
use fleetcompose_container::BuildSpec;
use fleetcompose_core::labels::{LABEL_IMAGE_BUILDER, LABEL_PROJECT, LABEL_SERVICE};
use fleetcompose_core::{BuildConfig, Project, Service};
use std::collections::HashMap;
use std::path::PathBuf;

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// ビルドの実行時オプション（CLI フラグ由来）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub pull: bool,
}

/// サービスのビルド設定をランタイム向けの [`BuildSpec`] に解決する
pub struct BuildResolver<'a> {
    project: &'a Project,
}

impl<'a> BuildResolver<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    fn build_config<'s>(&self, service: &'s Service) -> BuildResult<&'s BuildConfig> {
        service.build.as_ref().ok_or_else(|| {
            BuildError::InvalidConfig(format!("service '{}' has no build section", service.name))
        })
    }

    /// ビルドコンテキストのパスを解決
    ///
    /// 相対パスはプロジェクトの作業ディレクトリ基準。
    pub fn resolve_context(&self, service: &Service) -> BuildResult<PathBuf> {
        let build = self.build_config(service)?;
        let context = if build.context.is_absolute() {
            build.context.clone()
        } else {
            self.project.working_dir.join(&build.context)
        };

        // コンテキストディレクトリの存在確認
        if !context.exists() {
            return Err(BuildError::ContextNotFound(context));
        }

        if !context.is_dir() {
            return Err(BuildError::InvalidConfig(format!(
                "Build context is not a directory: {}",
                context.display()
            )));
        }

        Ok(context)
    }

    /// Dockerfileのパスを解決
    ///
    /// 指定がなければコンテキスト直下の `Dockerfile`。
    pub fn resolve_dockerfile(&self, service: &Service) -> BuildResult<PathBuf> {
        let build = self.build_config(service)?;
        let context = self.resolve_context(service)?;
        let path = match &build.dockerfile {
            Some(dockerfile) if dockerfile.is_absolute() => dockerfile.clone(),
            Some(dockerfile) => context.join(dockerfile),
            None => context.join(DEFAULT_DOCKERFILE),
        };

        if !path.is_file() {
            return Err(BuildError::DockerfileNotFound(path));
        }
        tracing::debug!(
            "Found Dockerfile for service '{}' at: {}",
            service.name,
            path.display()
        );
        Ok(path)
    }

    /// ビルド引数
    pub fn resolve_build_args(&self, service: &Service) -> BuildResult<HashMap<String, String>> {
        let build = self.build_config(service)?;
        for (key, value) in &build.args {
            self.validate_build_arg(key, value);
        }
        Ok(build
            .args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// ビルド結果に付けるタグ
    pub fn image_tag(&self, service: &Service) -> String {
        service.image_ref(&self.project.name)
    }

    /// イメージに付けるラベル
    ///
    /// `down --rmi local` はビルダーラベルを持つイメージだけを削除する。
    pub fn build_labels(&self, service: &Service) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = service
            .build
            .as_ref()
            .map(|b| b.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        labels.insert(LABEL_PROJECT.to_string(), self.project.name.clone());
        labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
        labels.insert(LABEL_IMAGE_BUILDER.to_string(), "fleetcompose".to_string());
        labels
    }

    /// ビルド引数の検証（機密情報の警告）
    pub fn validate_build_arg(&self, key: &str, _value: &str) {
        let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

        let key_lower = key.to_lowercase();
        if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
            tracing::warn!(
                "警告: ビルド引数 '{}' は機密情報を含む可能性があります。\n\
                 ビルド引数はイメージ履歴に記録されます。\n\
                 機密情報はビルド引数ではなく、シークレットを使用してください。",
                key
            );
        }
    }

    /// コンテキストを tar.gz 化して [`BuildSpec`] を作る
    pub fn build_spec(&self, service: &Service, options: BuildOptions) -> BuildResult<BuildSpec> {
        let build = self.build_config(service)?;
        let context_path = self.resolve_context(service)?;
        let dockerfile_path = self.resolve_dockerfile(service)?;
        let context = ContextBuilder::create_context(&context_path, &dockerfile_path)?;

        tracing::info!(
            service = %service.name,
            files = context.file_count,
            "Build context prepared"
        );

        Ok(BuildSpec {
            tag: self.image_tag(service),
            context: Bytes::from(context.archive),
            dockerfile: context.dockerfile,
            args: self.resolve_build_args(service)?,
            labels: self.build_labels(service),
            target: build.target.clone(),
            no_cache: options.no_cache || build.no_cache,
            pull: options.pull || build.pull,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn project(dir: &std::path::Path) -> Project {
        Project {
            name: "demo".to_string(),
            working_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn service(build: Option<BuildConfig>) -> Service {
        Service {
            name: "api".to_string(),
            build,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_dockerfile_default() {
        let temp_dir = tempdir().unwrap();
        let dockerfile_path = temp_dir.path().join("Dockerfile");
        fs::write(&dockerfile_path, "FROM alpine").unwrap();

        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let service = service(Some(BuildConfig {
            context: PathBuf::from("."),
            ..Default::default()
        }));

        let result = resolver.resolve_dockerfile(&service).unwrap();
        assert_eq!(result, temp_dir.path().join(".").join("Dockerfile"));
    }

    #[test]
    fn test_resolve_dockerfile_explicit() {
        let temp_dir = tempdir().unwrap();
        let backend = temp_dir.path().join("backend");
        fs::create_dir(&backend).unwrap();
        fs::write(backend.join("custom.dockerfile"), "FROM alpine").unwrap();

        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let service = service(Some(BuildConfig {
            context: backend.clone(),
            dockerfile: Some(PathBuf::from("custom.dockerfile")),
            ..Default::default()
        }));

        let result = resolver.resolve_dockerfile(&service).unwrap();
        assert_eq!(result, backend.join("custom.dockerfile"));
    }

    #[test]
    fn test_resolve_dockerfile_not_found() {
        let temp_dir = tempdir().unwrap();
        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let service = service(Some(BuildConfig {
            context: temp_dir.path().to_path_buf(),
            ..Default::default()
        }));

        let result = resolver.resolve_dockerfile(&service);
        assert!(matches!(result, Err(BuildError::DockerfileNotFound(_))));
    }

    #[test]
    fn test_resolve_context_missing() {
        let temp_dir = tempdir().unwrap();
        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let service = service(Some(BuildConfig {
            context: PathBuf::from("nowhere"),
            ..Default::default()
        }));

        let result = resolver.resolve_context(&service);
        assert!(matches!(result, Err(BuildError::ContextNotFound(_))));
    }

    #[test]
    fn test_service_without_build() {
        let temp_dir = tempdir().unwrap();
        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let result = resolver.build_spec(&service(None), BuildOptions::default());
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_image_tag() {
        let temp_dir = tempdir().unwrap();
        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);

        assert_eq!(resolver.image_tag(&service(None)), "demo_api");
        let mut tagged = service(None);
        tagged.image = Some("registry.local/api:1.0".to_string());
        assert_eq!(resolver.image_tag(&tagged), "registry.local/api:1.0");
    }

    #[test]
    fn test_build_spec() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("Dockerfile"), "FROM alpine").unwrap();
        fs::write(temp_dir.path().join("main.sh"), "echo hi").unwrap();

        let project = project(temp_dir.path());
        let resolver = BuildResolver::new(&project);
        let mut args = std::collections::BTreeMap::new();
        args.insert("VERSION".to_string(), "1.2".to_string());
        let service = service(Some(BuildConfig {
            context: temp_dir.path().to_path_buf(),
            args,
            target: Some("release".to_string()),
            ..Default::default()
        }));

        let spec = resolver
            .build_spec(&service, BuildOptions { no_cache: true, pull: false })
            .unwrap();
        assert_eq!(spec.tag, "demo_api");
        assert_eq!(spec.dockerfile, "Dockerfile");
        assert_eq!(spec.args.get("VERSION").map(String::as_str), Some("1.2"));
        assert_eq!(spec.target.as_deref(), Some("release"));
        assert!(spec.no_cache);
        assert!(!spec.pull);
        assert_eq!(spec.labels.get(LABEL_PROJECT).map(String::as_str), Some("demo"));
        assert!(spec.labels.contains_key(LABEL_IMAGE_BUILDER));
        assert!(!spec.context.is_empty());
    }
}
