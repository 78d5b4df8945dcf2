//! Decoder for the engine's multiplexed stdout/stderr stream.
//!
//! Every frame starts with an 8-byte header: one byte naming the target
//! stream (0 stdin, 1 stdout, 2 stderr), three zero bytes, then the payload
//! length as a big-endian `u32`. The decoder is a push-based state machine so
//! headers and payloads may be split across any number of reads.

use crate::{Result, RuntimeError};

pub const HEADER_LEN: usize = 8;

/// Placed between stdout and stderr when logs are rendered as one text.
pub const STDERR_SEPARATOR: &str = "\n---stderr---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamTarget {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StreamTarget::Stdin),
            1 => Some(StreamTarget::Stdout),
            2 => Some(StreamTarget::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl DemuxedOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout, followed by the separator and stderr when stderr is non-empty.
    pub fn combined_logs(&self) -> String {
        let mut text = self.stdout_text();
        if !self.stderr.is_empty() {
            text.push_str(STDERR_SEPARATOR);
            text.push_str(&self.stderr_text());
        }
        text
    }
}

#[derive(Debug)]
enum State {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { target: StreamTarget, remaining: usize },
}

impl State {
    fn header() -> Self {
        State::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    output: DemuxedOutput,
    frames: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::header(),
            output: DemuxedOutput::default(),
            frames: 0,
        }
    }

    /// Number of complete frame headers decoded so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn feed(&mut self, mut input: &[u8]) -> Result<()> {
        while !input.is_empty() {
            match &mut self.state {
                State::Header { buf, filled } => {
                    let take = (HEADER_LEN - *filled).min(input.len());
                    buf[*filled..*filled + take].copy_from_slice(&input[..take]);
                    *filled += take;
                    input = &input[take..];

                    if *filled < HEADER_LEN {
                        continue;
                    }

                    let target = StreamTarget::from_byte(buf[0]).ok_or_else(|| {
                        RuntimeError::Framing(format!(
                            "unknown stream type {} in frame header {}",
                            buf[0], self.frames
                        ))
                    })?;
                    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    self.frames += 1;
                    self.state = if len == 0 {
                        State::header()
                    } else {
                        State::Payload {
                            target,
                            remaining: len,
                        }
                    };
                }
                State::Payload { target, remaining } => {
                    let take = (*remaining).min(input.len());
                    let (chunk, rest) = input.split_at(take);
                    match *target {
                        StreamTarget::Stdout => self.output.stdout.extend_from_slice(chunk),
                        StreamTarget::Stderr => self.output.stderr.extend_from_slice(chunk),
                        StreamTarget::Stdin => {}
                    }
                    *remaining -= take;
                    input = rest;

                    if *remaining == 0 {
                        self.state = State::header();
                    }
                }
            }
        }
        Ok(())
    }

    /// Ends decoding. A stream that stops inside a frame is an error.
    pub fn finish(self) -> Result<DemuxedOutput> {
        match self.state {
            State::Header { filled: 0, .. } => Ok(self.output),
            State::Header { filled, .. } => Err(RuntimeError::Framing(format!(
                "stream ended after {filled} of {HEADER_LEN} header bytes"
            ))),
            State::Payload { remaining, .. } => Err(RuntimeError::Framing(format!(
                "stream ended with {remaining} payload bytes outstanding"
            ))),
        }
    }
}

/// Encodes one frame. Used by tests and fake engines.
pub fn encode_frame(target: StreamTarget, payload: &[u8]) -> Vec<u8> {
    let kind = match target {
        StreamTarget::Stdin => 0u8,
        StreamTarget::Stdout => 1,
        StreamTarget::Stderr => 2,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[kind, 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
