//! FleetCompose Docker Image Build functionality
//!
//! ビルドコンテキストの解決と tar.gz 化を行い、
//! ランタイムの Build に渡す [`fleetcompose_container::BuildSpec`] を組み立てる。

pub mod context;
pub mod error;
pub mod ignore;
pub mod resolver;

pub use context::{BuildContext, ContextBuilder};
pub use error::{BuildError, BuildResult};
pub use ignore::IgnoreRules;
pub use resolver::{BuildOptions, BuildResolver};
