//! モデル定義
//!
//! Compose エンジンが扱うデータモデルを定義します。
//! 各モデルは機能ごとにモジュールに分離されています。

pub(crate) mod de;
pub mod duration;
mod network;
mod policy;
mod port;
mod project;
mod service;
mod volume;

// Re-exports
pub use de::split_command;
pub use network::*;
pub use policy::*;
pub use port::*;
pub use project::*;
pub use service::*;
pub use volume::*;
