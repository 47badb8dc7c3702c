//! サブコマンドの実装

pub mod config;
pub mod cp;
pub mod down;
pub mod events;
pub mod exec;
pub mod images;
pub mod lifecycle;
pub mod logs;
pub mod ps;
pub mod run;
pub mod up;

use fleetcompose_core::Project;
use fleetcompose_engine::{ComposeEngine, Interrupt};

/// ランタイムを必要とするコマンドの実行文脈
pub struct Context {
    pub engine: ComposeEngine,
    pub project: Project,
    pub interrupt: Interrupt,
}
