//! Demultiplexer for sandbox-attached stdio.
//!
//! Sandbox runtimes multiplex stdout/stderr onto one attached stream,
//! prefixing each frame with an 8-byte header: one stream-type byte,
//! three zero bytes, and a big-endian u32 payload length. The raw mixed
//! stream must never reach the JSON reader; [`FramedLineReader`] peels
//! frames off first and yields clean stdout lines.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use tb_domain::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 8;

/// Which stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(StreamKind::Stdin),
            1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(Error::Integrity(format!(
                "unknown stream type byte in frame header: {other}"
            ))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// Encode one frame (used by tests and in-process tool-server doubles).
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(kind.to_byte());
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incremental demuxer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental frame parser. Feed bytes with [`push`](Self::push), drain
/// complete frames with [`next_frame`](Self::next_frame); partial frames
/// stay buffered until completed.
#[derive(Default)]
pub struct FrameDemuxer {
    buf: Vec<u8>,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<(StreamKind, Vec<u8>)>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let kind = StreamKind::from_byte(self.buf[0])?;
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some((kind, payload)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Line reader over a framed stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reads a framed attached stream and yields newline-delimited stdout
/// lines. Stderr frames are logged and dropped.
pub struct FramedLineReader<R> {
    reader: R,
    demuxer: FrameDemuxer,
    stdout_buf: Vec<u8>,
    pending_lines: VecDeque<String>,
}

impl<R: AsyncRead + Unpin> FramedLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            demuxer: FrameDemuxer::new(),
            stdout_buf: Vec::new(),
            pending_lines: VecDeque::new(),
        }
    }

    /// Next stdout line, or `None` at end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.pending_lines.pop_front() {
                return Ok(Some(line));
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.demuxer.push(&chunk[..n]);

            while let Some((kind, payload)) = self.demuxer.next_frame()? {
                match kind {
                    StreamKind::Stdout => self.accept_stdout(&payload),
                    StreamKind::Stderr => {
                        tracing::debug!(
                            output = %String::from_utf8_lossy(&payload).trim_end(),
                            "tool server stderr"
                        );
                    }
                    StreamKind::Stdin => {}
                }
            }
        }
    }

    fn accept_stdout(&mut self, payload: &[u8]) {
        self.stdout_buf.extend_from_slice(payload);
        while let Some(pos) = self.stdout_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.stdout_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.pending_lines.push_back(line);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
