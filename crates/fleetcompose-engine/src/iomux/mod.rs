//! コンテナの入出力の多重化

mod attach;
mod color;
mod detach;
mod frame;
mod lines;
mod mux;
mod output;

pub use attach::{
    AttachEnd, AttachSession, InputSource, RawModeGuard, ResizeTarget, resize_to_terminal,
};
pub use color::Prefixer;
pub use detach::{DEFAULT_DETACH_KEYS, DetachKeys, DetachMatcher, Scan};
pub use frame::{FrameDemuxer, StreamKind};
pub use lines::LineBuffer;
pub use mux::{LogMux, LogSource, MuxReport};
pub use output::{CaptureBuffer, Output};
