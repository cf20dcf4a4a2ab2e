//! Line framing for the wire protocol.
//!
//! Both directions carry UTF-8 text lines terminated by a single `\n`:
//!
//! ```text
//! Request:  hello\n
//! Response: [echo] hello\n
//! ```
//!
//! `LineFramer` turns an arbitrary byte stream into complete lines, and
//! `encode_line` produces the outbound form.

use crate::error::FrameError;
use bytes::{Buf, BytesMut};

/// Default maximum line length in bytes, excluding the line feed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

const LF: u8 = b'\n';

/// Accumulates inbound bytes and yields complete lines.
///
/// The buffer only ever retains a single partial line between calls to
/// `feed`, and that residue never exceeds `max_line_length` bytes. Once the
/// framer has reported an error it is poisoned: later input is discarded and
/// every later `feed` yields nothing at all.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Offset up to which `buffer` is known to contain no line feed.
    scanned: usize,
    max_line_length: usize,
    poisoned: bool,
}

impl LineFramer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line_length.min(DEFAULT_MAX_LINE_LENGTH) + 1),
            scanned: 0,
            max_line_length,
            poisoned: false,
        }
    }

    /// Append `bytes` and return an iterator over the lines they complete.
    ///
    /// Lines are decoded lazily; bytes belonging to a line that is still
    /// incomplete when the iterator is exhausted stay buffered for the next
    /// call.
    pub fn feed(&mut self, bytes: &[u8]) -> Lines<'_> {
        if !self.poisoned {
            self.buffer.extend_from_slice(bytes);
        }
        Lines { framer: self }
    }

    /// Number of buffered bytes that do not yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete line, if any.
    fn next_line(&mut self) -> Result<Option<String>, FrameError> {
        match self.buffer[self.scanned..].iter().position(|&b| b == LF) {
            Some(offset) => {
                let line_len = self.scanned + offset;
                self.scanned = 0;
                if line_len > self.max_line_length {
                    return Err(self.poison_too_large());
                }

                let frame = self.buffer.split_to(line_len);
                self.buffer.advance(1); // line feed

                match std::str::from_utf8(&frame) {
                    Ok(line) => Ok(Some(line.to_owned())),
                    Err(e) => {
                        self.poison();
                        Err(FrameError::Decode(e))
                    }
                }
            }
            None => {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line_length {
                    return Err(self.poison_too_large());
                }
                Ok(None)
            }
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.buffer.clear();
        self.scanned = 0;
    }

    fn poison_too_large(&mut self) -> FrameError {
        self.poison();
        FrameError::TooLarge {
            limit: self.max_line_length,
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

/// Lines completed by one call to [`LineFramer::feed`].
///
/// Yields at most one error, after which iteration stops.
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.framer.poisoned {
            return None;
        }
        self.framer.next_line().transpose()
    }
}

/// Append `line` in wire form (terminated by a line feed) to `dst`.
pub fn encode_line(line: &str, dst: &mut BytesMut) {
    dst.reserve(line.len() + 1);
    dst.extend_from_slice(line.as_bytes());
    dst.extend_from_slice(&[LF]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut LineFramer, bytes: &[u8]) -> Vec<String> {
        framer.feed(bytes).map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_single_line() {
        let mut framer = LineFramer::default();
        assert_eq!(collect(&mut framer, b"hello\n"), vec!["hello"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_feed() {
        let mut framer = LineFramer::default();
        assert_eq!(
            collect(&mut framer, b"one\ntwo\n\nthree\n"),
            vec!["one", "two", "", "three"]
        );
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut framer = LineFramer::default();
        assert!(collect(&mut framer, b"hel").is_empty());
        assert_eq!(framer.pending(), 3);
        assert_eq!(collect(&mut framer, b"lo\nwor"), vec!["hello"]);
        assert_eq!(framer.pending(), 3);
        assert_eq!(collect(&mut framer, b"ld\n"), vec!["world"]);
    }

    #[test]
    fn test_carriage_return_is_preserved() {
        let mut framer = LineFramer::default();
        assert_eq!(collect(&mut framer, b"telnet\r\n"), vec!["telnet\r"]);
    }

    #[test]
    fn test_every_split_point_reproduces_input() {
        let input: &[u8] = "alpha\n\nβeta gamma\r\nend\n".as_bytes();

        for split in 0..=input.len() {
            let mut framer = LineFramer::default();
            let mut lines = collect(&mut framer, &input[..split]);
            lines.extend(collect(&mut framer, &input[split..]));

            let mut rebuilt = BytesMut::new();
            for line in &lines {
                encode_line(line, &mut rebuilt);
            }
            assert_eq!(&rebuilt[..], input, "split at {split}");
        }
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let mut framer = LineFramer::new(16);
        let line = "x".repeat(16);
        let mut input = line.clone().into_bytes();
        input.push(b'\n');
        assert_eq!(collect(&mut framer, &input), vec![line]);
    }

    #[test]
    fn test_unterminated_overflow_fails() {
        let mut framer = LineFramer::default();
        let chunk = vec![b'a'; 4096];

        assert!(collect(&mut framer, &chunk).is_empty());
        assert!(collect(&mut framer, &chunk).is_empty());

        let results: Vec<_> = framer.feed(b"a").collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FrameError::TooLarge { limit: DEFAULT_MAX_LINE_LENGTH })
        ));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_overlong_terminated_line_fails() {
        let mut framer = LineFramer::new(4);
        let results: Vec<_> = framer.feed(b"ok\ntoolong\nafter\n").collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().unwrap(), "ok");
        assert!(matches!(results[1], Err(FrameError::TooLarge { limit: 4 })));
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let mut framer = LineFramer::default();
        let results: Vec<_> = framer.feed(b"\xff\xfe\nnext\n").collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_poisoned_framer_emits_nothing() {
        let mut framer = LineFramer::new(2);
        assert!(framer.feed(b"abc").any(|r| r.is_err()));
        assert_eq!(framer.feed(b"\nok\n").count(), 0);
    }

    #[test]
    fn test_encode_line() {
        let mut buf = BytesMut::new();
        encode_line("Goodbye", &mut buf);
        encode_line("", &mut buf);
        assert_eq!(&buf[..], b"Goodbye\n\n");
    }
}
