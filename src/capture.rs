//! Size-bounded capture of a subprocess output stream.
//!
//! The first `cap` bytes are kept. Beyond that, only a sliding window of the
//! last `tail_cap` bytes is kept, so a status trailer printed at the very end
//! of a verbose command is still recoverable while memory stays bounded.

use std::collections::VecDeque;
use std::io::Result;

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug)]
pub struct OutputCapture {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    cap: usize,
    tail_cap: usize,
    total: u64,
}

impl OutputCapture {
    pub fn new(cap: usize, tail_cap: usize) -> Self {
        Self {
            head: Vec::with_capacity(cap.min(64 * 1024)),
            tail: VecDeque::new(),
            cap,
            tail_cap,
            total: 0,
        }
    }

    pub fn push(&mut self, buf: &[u8]) {
        self.total += buf.len() as u64;
        let room = self.cap - self.head.len();
        let (head, rest) = buf.split_at(room.min(buf.len()));
        self.head.extend_from_slice(head);
        if rest.is_empty() || self.tail_cap == 0 {
            return;
        }
        // Only the last `tail_cap` bytes of `rest` can survive.
        let rest = &rest[rest.len().saturating_sub(self.tail_cap)..];
        let overflow = (self.tail.len() + rest.len()).saturating_sub(self.tail_cap);
        self.tail.drain(..overflow);
        self.tail.extend(rest);
    }

    /// Reads `reader` to the end into this capture.
    pub async fn read_from<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<()> {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.push(&buf[..n]);
        }
    }

    pub fn finish(self) -> Captured {
        let head_len = self.head.len();
        let kept = (head_len + self.tail.len()) as u64;
        let mut bytes = self.head;
        bytes.extend(self.tail);
        Captured {
            bytes,
            head_len,
            skipped: self.total - kept,
            cap: self.cap,
        }
    }
}

/// What survived of a stream: the head, then (after `skipped` dropped bytes)
/// the tail window.
#[derive(Debug, Clone)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub head_len: usize,
    pub skipped: u64,
    cap: usize,
}

impl Captured {
    /// Where a trailer may legitimately start. When bytes were dropped, the
    /// head is no longer contiguous with the end of the stream.
    pub fn searchable_from(&self) -> usize {
        if self.skipped > 0 {
            self.head_len
        } else {
            0
        }
    }

    /// Renders `bytes[..end]` as text, cut to the cap with a notice appended.
    pub fn render(&self, end: usize) -> String {
        let end = end.min(self.bytes.len());
        let content_len = end as u64 + self.skipped;
        if content_len <= self.cap as u64 {
            return String::from_utf8_lossy(&self.bytes[..end]).into_owned();
        }
        let mut text = String::from_utf8_lossy(&self.bytes[..self.cap.min(end)]).into_owned();
        text.push_str(&format!(
            "\n[output truncated: {} bytes omitted]",
            content_len - self.cap as u64
        ));
        text
    }

    /// The head cut back to its last complete line, for line-oriented
    /// parsing. The flag is set when anything after that line was lost.
    pub fn whole_lines(&self) -> (&[u8], bool) {
        let head = &self.bytes[..self.head_len];
        if self.skipped == 0 && self.bytes.len() == self.head_len {
            return (head, false);
        }
        let end = memchr::memrchr(b'\n', head).map_or(0, |i| i + 1);
        (&head[..end], true)
    }

    pub fn render_all(&self) -> String {
        self.render(self.bytes.len())
    }
}
