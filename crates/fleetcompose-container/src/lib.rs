//! コンテナランタイムとの接続
//!
//! [`RuntimeClient`] トレイトと、その Docker 実装（bollard）・インメモリ実装を提供する。

pub mod converter;
pub mod docker;
pub mod error;
pub mod mock;
pub mod runtime;
pub mod signal;
pub mod types;
pub mod waiter;

pub use converter::*;
pub use docker::DockerRuntime;
pub use error::{classify, conflicting_port};
pub use mock::{Call, MockRuntime};
pub use runtime::RuntimeClient;
pub use signal::parse_signal;
pub use types::*;
pub use waiter::*;
