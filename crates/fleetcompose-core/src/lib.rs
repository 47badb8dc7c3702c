//! fleetcompose のコアモデル
//!
//! Compose プロジェクトのデータモデル、検証、依存グラフ、
//! ラベルと命名規則、設定ハッシュ、エラー分類を提供します。

pub mod error;
pub mod graph;
pub mod hash;
pub mod labels;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{AggregateError, ComposeError, ErrorKind, ResourceKind, Result, ServiceFailure};
pub use graph::{DependencyGraph, Edge};
pub use hash::config_hash;
pub use labels::{ContainerIdentity, ContainerRole};
pub use loader::{LoadOptions, load_project, load_project_from_str};
pub use model::*;
pub use validate::{is_valid_project_name, normalize_project_name, validate};
