//! Pending terminal output awaiting the next flush.
//!
//! PTY reads arrive in arbitrary chunks, so a multi-byte UTF-8 sequence can be
//! split across two reads. [`OutputBuffer`] keeps raw bytes and only hands out
//! complete characters, holding an incomplete tail back until the rest of it
//! arrives (or the session is finished, at which point it is decoded lossily).

/// Bytes produced by a session since the last flush.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pending: Vec<u8>,
    total: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        self.total += data.len() as u64;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total bytes ever pushed.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Take everything that forms complete text. With `finish` set, an
    /// incomplete trailing sequence is taken too (as U+FFFD).
    pub fn take_text(&mut self, finish: bool) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let keep = if finish {
            0
        } else {
            incomplete_tail(&self.pending)
        };
        let split = self.pending.len() - keep;
        let tail = self.pending.split_off(split);
        let head = std::mem::replace(&mut self.pending, tail);
        match String::from_utf8(head) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Length of a truncated UTF-8 sequence at the end of `buf`, if any.
fn incomplete_tail(buf: &[u8]) -> usize {
    // A sequence is at most 4 bytes, so only the last 3 can be a partial one.
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        let b = buf[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = buf.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}
