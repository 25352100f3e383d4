use std::collections::VecDeque;

/// Longest unterminated line kept before it is forced out as a line
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

/// Line ring buffer over one output stream.
///
/// Bytes are decoded as UTF-8 across chunk boundaries. The unterminated tail
/// is kept separately since prompts rarely end in a newline.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    lines: VecDeque<String>,
    partial: String,
    pending: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            pending: Vec::new(),
            capacity: capacity.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let text = self.decode_pending();
        for segment in text.split_inclusive('\n') {
            match segment.strip_suffix('\n') {
                Some(line) => {
                    self.partial.push_str(line.strip_suffix('\r').unwrap_or(line));
                    let line = std::mem::take(&mut self.partial);
                    self.push_line(line);
                }
                None => {
                    self.partial.push_str(segment);
                    if self.partial.len() > MAX_PARTIAL_BYTES {
                        let line = std::mem::take(&mut self.partial);
                        self.push_line(line);
                    }
                }
            }
        }
    }

    /// Flush undecodable trailing bytes at end of stream
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.partial.push_str(&rest);
        }
    }

    /// The line a prompt would be on: the unterminated tail, else the last line
    pub fn last_line(&self) -> Option<&str> {
        if !self.partial.is_empty() {
            return Some(&self.partial);
        }
        self.lines.back().map(String::as_str)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    /// Take everything buffered, returning the text and whether older lines
    /// were dropped since the last take
    pub fn take(&mut self) -> (String, bool) {
        let mut text = String::new();
        for line in self.lines.drain(..) {
            text.push_str(&line);
            text.push('\n');
        }
        text.push_str(&self.partial);
        self.partial.clear();
        (text, std::mem::take(&mut self.truncated))
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.truncated = true;
        }
        self.lines.push_back(line);
    }

    /// Decode the longest valid prefix of the pending bytes, keeping an
    /// incomplete trailing sequence for the next chunk
    fn decode_pending(&mut self) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_lines_and_keeps_partial() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(b"one\ntwo\r\nEnter a number: ");
        assert_eq!(buffer.last_line(), Some("Enter a number: "));
        let (text, truncated) = buffer.take();
        assert_eq!(text, "one\ntwo\nEnter a number: ");
        assert!(!truncated);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_lines_join_across_chunks() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(b"hel");
        buffer.push(b"lo\nwor");
        assert_eq!(buffer.last_line(), Some("wor"));
        buffer.push(b"ld\n");
        assert_eq!(buffer.take().0, "hello\nworld\n");
    }

    #[test]
    fn drops_oldest_lines_when_full() {
        let mut buffer = OutputBuffer::new(2);
        buffer.push(b"1\n2\n3\n");
        let (text, truncated) = buffer.take();
        assert_eq!(text, "2\n3\n");
        assert!(truncated);
        // The flag is reported once
        buffer.push(b"4\n");
        assert!(!buffer.take().1);
    }

    #[test]
    fn decodes_utf8_split_across_chunks() {
        let mut buffer = OutputBuffer::new(10);
        let bytes = "héllo\n".as_bytes();
        buffer.push(&bytes[..2]);
        buffer.push(&bytes[2..]);
        assert_eq!(buffer.take().0, "héllo\n");
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(b"a\xffb\n");
        assert_eq!(buffer.take().0, "a\u{fffd}b\n");

        buffer.push(b"\xe2\x82");
        buffer.finish();
        assert_eq!(buffer.take().0, "\u{fffd}");
    }

    proptest! {
        #[test]
        fn never_holds_more_than_capacity(capacity in 1usize..16, lines in prop::collection::vec("[a-z]{0,8}", 0..64)) {
            let mut buffer = OutputBuffer::new(capacity);
            for line in &lines {
                buffer.push(format!("{line}\n").as_bytes());
            }
            let (text, truncated) = buffer.take();
            prop_assert_eq!(text.lines().count(), lines.len().min(capacity));
            prop_assert_eq!(truncated, lines.len() > capacity);
        }

        #[test]
        fn chunking_does_not_change_content(text in "[a-zé\n]{0,200}", split in 0usize..200) {
            let bytes = text.as_bytes();
            let split = split.min(bytes.len());
            let mut whole = OutputBuffer::new(1000);
            whole.push(bytes);
            let mut chunked = OutputBuffer::new(1000);
            chunked.push(&bytes[..split]);
            chunked.push(&bytes[split..]);
            prop_assert_eq!(whole.take().0, chunked.take().0);
        }
    }
}
