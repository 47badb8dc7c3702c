//! ソースごとの行バッファ

use bytes::{Bytes, BytesMut};

/// `\n` が来るまで部分行を保持する
///
/// バイト単位で区切るため、マルチバイト文字が途中で切れることはない。
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 完成した行（改行を含む）を返す
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            lines.push(self.pending.split_to(pos + 1).freeze());
        }
        lines
    }

    /// ストリーム終了時に残りを改行付きで返す
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let mut rest = self.pending.split();
        rest.extend_from_slice(b"\n");
        Some(rest.freeze())
    }
}
