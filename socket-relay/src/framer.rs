use std::borrow::Cow;

/// Line delimiter used on the wire in both directions.
pub const DELIMITER: u8 = b'\n';

/// Incremental decoder turning arbitrary read chunks into complete lines.
///
/// Bytes after the last delimiter stay buffered until a later chunk
/// completes them, so a line is never split or merged across calls. The
/// buffer holds raw bytes, which keeps multi-byte UTF-8 sequences intact
/// when a read boundary falls inside one.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed, delimiter stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }

        self.pending.extend_from_slice(chunk);
        let Some(last) = self.pending.iter().rposition(|&byte| byte == DELIMITER) else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete[..last]
            .split(|&byte| byte == DELIMITER)
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Bytes received after the last delimiter.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Returns `message` terminated by exactly the delimiters it needs.
///
/// A trailing `\n` is appended when absent. Embedded delimiters are left
/// alone, so `"a\nb"` reaches clients as two separate lines.
pub fn encode_line(message: &str) -> Cow<'_, str> {
    if message.as_bytes().last() == Some(&DELIMITER) {
        Cow::Borrowed(message)
    } else {
        Cow::Owned(format!("{message}\n"))
    }
}
