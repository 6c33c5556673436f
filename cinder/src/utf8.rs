//! Reassembly of UTF-8 text from token byte fragments.
//!
//! A token's bytes can end in the middle of a multi-byte character, so
//! pieces are buffered in a [`Utf8Reassembler`] and released only once the
//! buffer scans as complete UTF-8.
//!
//! The scan is an explicit state machine over leading-byte classes:
//!
//! ```text
//! 0xxxxxxx  1 unit      110xxxxx  2 units
//! 1110xxxx  3 units     11110xxx  4 units
//! 10xxxxxx  continuation, invalid as a leading byte
//! ```
//!
//! A run cut short by the end of the buffer is [`Utf8Scan::Incomplete`];
//! a continuation mismatch with bytes still following is
//! [`Utf8Scan::Malformed`]. Neither is an error for the caller: both mean
//! "nothing printable yet".

/// Outcome of scanning a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Scan {
    /// Every character has all of its units.
    Complete,
    /// The buffer ends inside a multi-unit character.
    Incomplete,
    /// A leading byte or continuation byte has the wrong shape.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    Continuation { remaining: u8 },
    Malformed,
}

/// Number of units announced by a leading byte, `None` if it cannot lead.
fn sequence_len(lead: u8) -> Option<u8> {
    match lead {
        b if b & 0x80 == 0x00 => Some(1),
        b if b & 0xE0 == 0xC0 => Some(2),
        b if b & 0xF0 == 0xE0 => Some(3),
        b if b & 0xF8 == 0xF0 => Some(4),
        _ => None,
    }
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

impl ScanState {
    fn next(self, byte: u8) -> Self {
        match self {
            Self::Start => match sequence_len(byte) {
                Some(1) => Self::Start,
                Some(n) => Self::Continuation { remaining: n - 1 },
                None => Self::Malformed,
            },
            Self::Continuation { remaining } if is_continuation(byte) => {
                if remaining == 1 {
                    Self::Start
                } else {
                    Self::Continuation {
                        remaining: remaining - 1,
                    }
                }
            }
            Self::Continuation { .. } | Self::Malformed => Self::Malformed,
        }
    }
}

/// Classify `bytes` as complete, incomplete-at-end, or malformed.
#[must_use]
pub fn scan(bytes: &[u8]) -> Utf8Scan {
    let mut state = ScanState::Start;
    for &b in bytes {
        state = state.next(b);
        if state == ScanState::Malformed {
            return Utf8Scan::Malformed;
        }
    }
    match state {
        ScanState::Start => Utf8Scan::Complete,
        ScanState::Continuation { .. } => Utf8Scan::Incomplete,
        ScanState::Malformed => Utf8Scan::Malformed,
    }
}

/// Byte accumulator that releases only complete UTF-8 text.
#[derive(Debug, Default, Clone)]
pub struct Utf8Reassembler {
    buf: Vec<u8>,
}

impl Utf8Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token's bytes.
    pub fn append(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }

    /// Scan the pending bytes.
    #[must_use]
    pub fn scan(&self) -> Utf8Scan {
        scan(&self.buf)
    }

    /// Take the whole buffer as text if it scans complete.
    ///
    /// Returns `None` and leaves the buffer untouched when it is empty,
    /// incomplete, or malformed.
    pub fn try_drain(&mut self) -> Option<String> {
        if self.buf.is_empty() || self.scan() != Utf8Scan::Complete {
            return None;
        }
        let bytes = std::mem::take(&mut self.buf);
        // The scan accepts overlong forms and surrogates that `str` rejects.
        Some(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Take whatever is pending, replacing invalid sequences with U+FFFD.
    ///
    /// Returns `None` if nothing is pending.
    pub fn drain_lossy(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Bytes waiting for more units.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
