//! Turns arbitrarily-split byte chunks into complete lines

use serde::Deserialize;
use tracing::debug;

/// What to do with a fragment left at the end of a chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFlush {
    /// Hold fragments until their newline arrives (or the stream ends)
    #[default]
    Terminated,
    /// Forward fragments immediately as their own line
    Eager,
}

/// Per-container line reassembler
///
/// Bytes that do not yet end in a newline are carried into the next
/// chunk, so a line split anywhere (even inside a UTF-8 sequence) comes
/// out whole.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    pending: Vec<u8>,
    flush: LineFlush,
}

impl ChunkReassembler {
    pub fn new(flush: LineFlush) -> Self {
        Self {
            pending: Vec::new(),
            flush,
        }
    }

    /// Feed a chunk and iterate the lines it completes
    ///
    /// The iterator is lazy and single-pass. Lines left unread when it is
    /// dropped stay buffered and come out of the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.pending.extend_from_slice(chunk);
        Lines {
            buf: &mut self.pending,
            start: 0,
            eager: self.flush == LineFlush::Eager,
        }
    }

    /// Flush the trailing fragment once the source has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }

    /// Bytes held back waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Lines completed by one chunk
pub struct Lines<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
    eager: bool,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = &self.buf[self.start..];

        if let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let line = decode_line(&rest[..pos]);
            self.start += pos + 1;
            return Some(line);
        }

        if self.eager && !rest.is_empty() {
            debug!(bytes = rest.len(), "Forwarding unterminated fragment");
            let line = decode_line(rest);
            self.start = self.buf.len();
            return Some(line);
        }

        None
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.buf.drain(..self.start);
    }
}

/// Strip a trailing carriage return and decode, replacing invalid UTF-8
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&[u8]]) -> Vec<String> {
        let mut reassembler = ChunkReassembler::new(LineFlush::Terminated);
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(reassembler.push(chunk));
        }
        lines.extend(reassembler.finish());
        lines
    }

    #[test]
    fn test_every_split_yields_same_lines() {
        let input = "alpha\nbeta\n\ngamma delta\nnaïve ✓\ntail".as_bytes();
        let expected = vec!["alpha", "beta", "", "gamma delta", "naïve ✓", "tail"];

        assert_eq!(feed(&[input]), expected);

        for i in 0..=input.len() {
            assert_eq!(feed(&[&input[..i], &input[i..]]), expected, "split at {}", i);
            for j in i..=input.len() {
                assert_eq!(
                    feed(&[&input[..i], &input[i..j], &input[j..]]),
                    expected,
                    "split at {} and {}",
                    i,
                    j
                );
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = b"one\r\ntwo\r\n";
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(feed(&chunks), vec!["one", "two"]);
    }

    #[test]
    fn test_fragment_held_until_newline() {
        let mut reassembler = ChunkReassembler::new(LineFlush::Terminated);
        assert_eq!(reassembler.push(b"hel").count(), 0);
        assert_eq!(reassembler.pending_len(), 3);

        let lines: Vec<String> = reassembler.push(b"lo\nwor").collect();
        assert_eq!(lines, vec!["hello"]);
        assert_eq!(reassembler.pending_len(), 3);
        assert_eq!(reassembler.finish().as_deref(), Some("wor"));
        assert_eq!(reassembler.finish(), None);
    }

    #[test]
    fn test_unread_lines_survive_to_next_chunk() {
        let mut reassembler = ChunkReassembler::new(LineFlush::Terminated);
        let first = reassembler.push(b"a\nb\n").next();
        assert_eq!(first.as_deref(), Some("a"));

        let rest: Vec<String> = reassembler.push(b"c\n").collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn test_eager_forwards_fragments() {
        let mut reassembler = ChunkReassembler::new(LineFlush::Eager);
        let lines: Vec<String> = reassembler.push(b"done\npart").collect();
        assert_eq!(lines, vec!["done", "part"]);
        assert_eq!(reassembler.pending_len(), 0);
        assert_eq!(reassembler.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        assert_eq!(feed(&[b"ok \xff\n"]), vec!["ok \u{fffd}"]);
    }
}
