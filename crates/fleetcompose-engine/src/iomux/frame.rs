//! 多重化ストリームの分離
//!
//! 非 TTY のコンテナ出力は `[stream, 0, 0, 0, len(u32 BE)]` の 8 バイトヘッダで
//! stdout / stderr が交互に流れてくる。チャンクの境界はフレーム境界と一致しない。

use bytes::{Buf, Bytes, BytesMut};
use fleetcompose_container::OutputChunk;

const HEADER_LEN: usize = 8;

/// 出力先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// フレームを組み立て直す
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    buf: BytesMut,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// データを追加し、揃ったフレームを取り出す
    pub fn push(&mut self, data: &[u8]) -> Vec<(StreamKind, Bytes)> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buf.len() >= HEADER_LEN {
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            let kind = match self.buf[0] {
                2 => StreamKind::Stderr,
                // 0 (stdin のエコー) と 1 は stdout へ
                _ => StreamKind::Stdout,
            };
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            if !payload.is_empty() {
                frames.push((kind, payload));
            }
        }
        frames
    }

    /// 未完成のフレームとして保持しているバイト数
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// 出力チャンクを出力先ごとのバイト列に分ける
    pub fn split(&mut self, chunk: OutputChunk) -> Vec<(StreamKind, Bytes)> {
        match chunk {
            OutputChunk::Stdout(data) | OutputChunk::Console(data) => {
                vec![(StreamKind::Stdout, data)]
            }
            OutputChunk::Stderr(data) => vec![(StreamKind::Stderr, data)],
            OutputChunk::Multiplexed(data) => self.push(&data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcompose_container::mock::encode_frame;

    #[test]
    fn test_demux_whole_frames() {
        let mut demux = FrameDemuxer::new();
        let mut data = encode_frame(1, b"out\n").to_vec();
        data.extend_from_slice(&encode_frame(2, b"err\n"));
        let frames = demux.push(&data);
        assert_eq!(
            frames,
            vec![
                (StreamKind::Stdout, Bytes::from_static(b"out\n")),
                (StreamKind::Stderr, Bytes::from_static(b"err\n")),
            ]
        );
        assert_eq!(demux.pending(), 0);
    }

    #[test]
    fn test_demux_split_across_chunks() {
        let mut demux = FrameDemuxer::new();
        let frame = encode_frame(1, b"hello world\n");
        assert!(demux.push(&frame[..3]).is_empty());
        assert!(demux.push(&frame[3..10]).is_empty());
        assert_eq!(demux.pending(), 10);
        let frames = demux.push(&frame[10..]);
        assert_eq!(frames, vec![(StreamKind::Stdout, Bytes::from_static(b"hello world\n"))]);
    }

    #[test]
    fn test_split_plain_chunks() {
        let mut demux = FrameDemuxer::new();
        let out = demux.split(OutputChunk::Stderr(Bytes::from_static(b"x")));
        assert_eq!(out, vec![(StreamKind::Stderr, Bytes::from_static(b"x"))]);
        let out = demux.split(OutputChunk::Console(Bytes::from_static(b"\x1b[1m")));
        assert_eq!(out[0].0, StreamKind::Stdout);
    }
}
