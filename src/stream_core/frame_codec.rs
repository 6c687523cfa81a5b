//! MLLP framing
//!
//! A frame on the wire is `0x0B <payload> 0x1C 0x0D`. The decoder is fed raw
//! socket bytes and yields one payload (delimiters stripped) at a time.
//! Each malformed frame is reported exactly once, and the decoder then
//! resyncs on the next start block. Bytes outside of any frame are reported
//! as `UnexpectedBytes`; they never stand for a frame the peer sent.

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Frames larger than this without an end block are discarded
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Bytes outside of any frame
    UnexpectedBytes(usize),
    /// A new start block arrived before the current frame ended
    MissingEndBlock,
    /// End block not followed by a carriage return
    MissingCarriageReturn,
    /// Control byte inside the payload
    ControlByte(u8),
    /// No end block within the size limit
    FrameTooLarge(usize),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::UnexpectedBytes(n) => write!(f, "{} bytes outside of a frame", n),
            FramingError::MissingEndBlock => write!(f, "frame missing end block"),
            FramingError::MissingCarriageReturn => {
                write!(f, "end block not followed by carriage return")
            }
            FramingError::ControlByte(b) => write!(f, "control byte 0x{:02X} in payload", b),
            FramingError::FrameTooLarge(n) => write!(f, "frame exceeds {} bytes", n),
        }
    }
}

impl std::error::Error for FramingError {}

/// Wrap a payload in start/end delimiters
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_BLOCK);
    frame.extend_from_slice(payload);
    frame.push(END_BLOCK);
    frame.push(CARRIAGE_RETURN);
    frame
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
    /// Skipping the tail of an oversized frame that was already reported
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_frame_len,
            discarding: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True if a frame has started but not finished
    pub fn has_partial(&self) -> bool {
        self.discarding || self.buf.iter().any(|b| !is_inter_frame_whitespace(*b))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Drop bytes up to (not including) the next start block
    fn skip_to_start_block(&mut self) {
        let next = self
            .buf
            .iter()
            .position(|b| *b == START_BLOCK)
            .unwrap_or(self.buf.len());
        self.buf.drain(..next);
    }

    /// Consume the rest of an oversized frame. True once it has ended.
    fn skip_oversized_tail(&mut self) -> bool {
        match self
            .buf
            .iter()
            .position(|b| *b == END_BLOCK || *b == START_BLOCK)
        {
            Some(i) if self.buf[i] == START_BLOCK => {
                self.buf.drain(..i);
                true
            }
            Some(i) => {
                self.buf.drain(..=i);
                if self.buf.first() == Some(&CARRIAGE_RETURN) {
                    self.buf.drain(..1);
                }
                true
            }
            None => {
                self.buf.clear();
                false
            }
        }
    }

    /// Next complete frame, a framing error, or None if more bytes are needed
    pub fn decode(&mut self) -> Option<Result<Vec<u8>, FramingError>> {
        if self.discarding {
            if !self.skip_oversized_tail() {
                return None;
            }
            self.discarding = false;
        }

        // CR/LF between frames is tolerated
        let leading_ws = self
            .buf
            .iter()
            .take_while(|b| is_inter_frame_whitespace(**b))
            .count();
        self.buf.drain(..leading_ws);

        if self.buf.is_empty() {
            return None;
        }

        if self.buf[0] != START_BLOCK {
            let garbage = self
                .buf
                .iter()
                .position(|b| *b == START_BLOCK)
                .unwrap_or(self.buf.len());
            self.buf.drain(..garbage);
            return Some(Err(FramingError::UnexpectedBytes(garbage)));
        }

        for i in 1..self.buf.len() {
            match self.buf[i] {
                START_BLOCK => {
                    self.buf.drain(..i);
                    return Some(Err(FramingError::MissingEndBlock));
                }
                END_BLOCK => {
                    let Some(next) = self.buf.get(i + 1).copied() else {
                        // Wait for the byte after the end block
                        return None;
                    };
                    if next != CARRIAGE_RETURN {
                        // Whatever trails the broken end block belongs to this frame
                        self.buf.drain(..=i);
                        self.skip_to_start_block();
                        return Some(Err(FramingError::MissingCarriageReturn));
                    }
                    let frame: Vec<u8> = self.buf.drain(..i + 2).collect();
                    let payload = &frame[1..i];
                    if let Some(b) = payload.iter().copied().find(|b| is_forbidden_control(*b)) {
                        return Some(Err(FramingError::ControlByte(b)));
                    }
                    return Some(Ok(payload.to_vec()));
                }
                _ => {}
            }
        }

        if self.buf.len() > self.max_frame_len {
            let len = self.buf.len();
            self.buf.clear();
            self.discarding = true;
            return Some(Err(FramingError::FrameTooLarge(len)));
        }

        None
    }
}

fn is_inter_frame_whitespace(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// HL7 text may contain CR, LF and TAB; any other C0 control byte is corrupt
fn is_forbidden_control(b: u8) -> bool {
    b < 0x20 && b != b'\r' && b != b'\n' && b != b'\t'
}
