//! Frame assembly.
//!
//! Turns an unbounded byte stream, delivered in reads of arbitrary size, into
//! [RawFrame]s. Two strategies are provided:
//!
//! * [FixedLengthAssembler] for instruments emitting frames of a known length
//! * [DelimitedAssembler] for instruments emitting terminated lines that start with a
//!   known marker
//!
//! Neither assembler ever blocks. Each call to [FrameAssembler::feed] returns whatever
//! complete frames are currently available and keeps the remainder for the next call.
use std::fmt::Display;

use tracing::{trace, warn};

use crate::prelude::*;

/// A complete, not yet validated, frame of instrument data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Offset of the first frame byte in the stream, counted from the first byte fed
    /// to the assembler.
    pub offset: usize,
    pub data: Vec<u8>,
}

impl Display for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RawFrame{{offset={}, data:[len={}]}}",
            self.offset,
            self.data.len()
        )
    }
}

/// Accumulates stream bytes into frames.
pub trait FrameAssembler: Send {
    /// Ingest bytes from a single transport read, returning the frames completed by
    /// them in stream order.
    ///
    /// An `Err` entry indicates framing was lost and the buffered bytes were discarded.
    /// Accumulation always resumes on the next call.
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<RawFrame>>;

    /// Discard any partially accumulated frame.
    fn reset(&mut self);

    /// Number of bytes currently buffered waiting for a frame to complete.
    fn buffered(&self) -> usize;
}

/// Assembles frames of a fixed, known length.
///
/// Frame boundaries are decided purely by length arithmetic. A buffer holding an exact
/// multiple of the frame length is a burst of back-to-back frames; any other length
/// longer than one frame means a byte was dropped somewhere and the whole buffer is
/// discarded.
///
/// # Examples
/// ```
/// use magstream::framing::{FixedLengthAssembler, FrameAssembler};
///
/// let mut asm = FixedLengthAssembler::new(4);
/// assert!(asm.feed(&[1, 2]).is_empty());
/// let frames = asm.feed(&[3, 4, 5, 6, 7, 8]);
/// assert_eq!(frames.len(), 2);
/// assert_eq!(asm.buffered(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct FixedLengthAssembler {
    frame_len: usize,
    buf: Vec<u8>,
    // stream offset of buf[0]
    offset: usize,
}

impl FixedLengthAssembler {
    /// Create an assembler for frames of `frame_len` bytes.
    ///
    /// # Panics
    /// If `frame_len` is zero.
    pub fn new(frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame length must be non-zero");
        FixedLengthAssembler {
            frame_len,
            buf: Vec::with_capacity(frame_len * 2),
            offset: 0,
        }
    }

    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl FrameAssembler for FixedLengthAssembler {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<RawFrame>> {
        self.buf.extend_from_slice(bytes);

        if self.buf.len() < self.frame_len {
            return vec![];
        }

        let buffered = self.buf.len();
        let start = self.offset;
        self.offset += buffered;

        if buffered % self.frame_len != 0 {
            warn!(
                buffered,
                frame_len = self.frame_len,
                "buffer not aligned to frame length, discarding"
            );
            self.buf.clear();
            return vec![Err(Error::Framing {
                buffered,
                expected: self.frame_len,
            })];
        }

        if buffered > self.frame_len {
            trace!(
                count = buffered / self.frame_len,
                "multiple frames arrived in a single read"
            );
        }
        let frames = self
            .buf
            .chunks_exact(self.frame_len)
            .enumerate()
            .map(|(idx, chunk)| {
                Ok(RawFrame {
                    offset: start + idx * self.frame_len,
                    data: chunk.to_vec(),
                })
            })
            .collect();
        self.buf.clear();
        frames
    }

    fn reset(&mut self) {
        self.offset += self.buf.len();
        self.buf.clear();
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Assembles delimiter terminated lines that begin with a marker.
///
/// Lines are reduced to printable ASCII and trimmed before the marker is checked. Lines
/// without the marker, e.g., command acknowledgements sharing the channel, are skipped
/// silently. A line that grows past `max_len` without a delimiter is discarded as a
/// framing error.
#[derive(Debug, Clone)]
pub struct DelimitedAssembler {
    delimiter: u8,
    marker: Vec<u8>,
    max_len: usize,
    buf: Vec<u8>,
    offset: usize,
}

impl DelimitedAssembler {
    pub const DEFAULT_MAX_LEN: usize = 1024;

    pub fn new(delimiter: u8, marker: &[u8]) -> Self {
        DelimitedAssembler {
            delimiter,
            marker: marker.to_vec(),
            max_len: Self::DEFAULT_MAX_LEN,
            buf: Vec::with_capacity(Self::DEFAULT_MAX_LEN),
            offset: 0,
        }
    }

    /// Maximum number of bytes allowed to accumulate without seeing a delimiter.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn clean(line: &[u8]) -> Vec<u8> {
        let printable: Vec<u8> = line
            .iter()
            .copied()
            .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
            .collect();
        let Some(start) = printable.iter().position(|b| !b.is_ascii_whitespace()) else {
            return vec![];
        };
        // a non-whitespace byte exists, so rposition finds one too
        let end = printable
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .unwrap_or(start);
        printable[start..=end].to_vec()
    }
}

impl FrameAssembler for DelimitedAssembler {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<RawFrame>> {
        let mut frames = Vec::new();
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = self.buf.iter().position(|b| *b == self.delimiter) {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let start = self.offset;
            self.offset += line.len();

            let data = Self::clean(&line[..line.len() - 1]);
            if !data.starts_with(&self.marker) {
                trace!(offset = start, len = data.len(), "skipping line without marker");
                continue;
            }
            frames.push(Ok(RawFrame {
                offset: start,
                data,
            }));
        }

        if self.buf.len() > self.max_len {
            let buffered = self.buf.len();
            warn!(buffered, max_len = self.max_len, "no delimiter found, discarding");
            self.offset += buffered;
            self.buf.clear();
            frames.push(Err(Error::Framing {
                buffered,
                expected: self.max_len,
            }));
        }

        frames
    }

    fn reset(&mut self) {
        self.offset += self.buf.len();
        self.buf.clear();
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L: usize = 44;

    fn frame(fill: u8) -> Vec<u8> {
        vec![fill; L]
    }

    #[test]
    fn single_frame() {
        let mut asm = FixedLengthAssembler::new(L);
        let frames = asm.feed(&frame(1));

        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.offset, 0);
        assert_eq!(frame.data.len(), L);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn frame_split_across_reads() {
        let mut asm = FixedLengthAssembler::new(L);
        let dat = frame(7);

        assert!(asm.feed(&dat[..10]).is_empty());
        assert!(asm.feed(&dat[10..30]).is_empty());
        assert_eq!(asm.buffered(), 30);
        let frames = asm.feed(&dat[30..]);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data, dat);
    }

    #[test]
    fn burst_of_frames_is_split_in_order() {
        for k in 1..=5usize {
            let mut asm = FixedLengthAssembler::new(L);
            let mut dat = Vec::new();
            for i in 0..k {
                dat.extend(frame(i as u8));
            }

            let frames: Vec<RawFrame> = asm.feed(&dat).into_iter().map(Result::unwrap).collect();

            assert_eq!(frames.len(), k, "expected {k} frames");
            for (i, frame) in frames.iter().enumerate() {
                assert_eq!(frame.data, self::frame(i as u8));
                assert_eq!(frame.offset, i * L);
            }
            assert_eq!(asm.buffered(), 0);
        }
    }

    #[test]
    fn misaligned_buffer_is_discarded_then_recovers() {
        let mut asm = FixedLengthAssembler::new(L);

        let zult = asm.feed(&[0u8; 50]);
        assert_eq!(zult.len(), 1);
        match &zult[0] {
            Err(Error::Framing { buffered, expected }) => {
                assert_eq!(*buffered, 50);
                assert_eq!(*expected, L);
            }
            other => panic!("expected framing error, got {other:?}"),
        }
        assert_eq!(asm.buffered(), 0);

        let frames = asm.feed(&frame(9));
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.data, self::frame(9));
        assert_eq!(frame.offset, 50);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut asm = FixedLengthAssembler::new(L);
        asm.feed(&[1u8; 20]);
        asm.reset();
        assert_eq!(asm.buffered(), 0);

        let frames = asm.feed(&frame(2));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn delimited_lines_with_marker() {
        let mut asm = DelimitedAssembler::new(b'\r', b":R");
        let frames = asm.feed(b":R,00,one\r:R,00,two\r:R,00,th");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().data, b":R,00,one");
        assert_eq!(frames[1].as_ref().unwrap().offset, 10);
        assert_eq!(asm.buffered(), 8);

        let frames = asm.feed(b"ree\r");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data, b":R,00,three");
    }

    #[test]
    fn delimited_skips_lines_without_marker() {
        let mut asm = DelimitedAssembler::new(b'\r', b":R");
        let frames = asm.feed(b"!01\r\r\n$01M\r\n:R,00,x\r");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data, b":R,00,x");
    }

    #[test]
    fn delimited_strips_unprintable_bytes() {
        let mut asm = DelimitedAssembler::new(b'\r', b":R");
        let frames = asm.feed(b"\x00\x11:R,0\xff0,x\x00\r");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data, b":R,00,x");
    }

    #[test]
    fn delimited_overlong_line_is_discarded() {
        let mut asm = DelimitedAssembler::new(b'\r', b":R").with_max_len(16);

        let zult = asm.feed(&[b'a'; 17]);
        assert_eq!(zult.len(), 1);
        assert!(matches!(zult[0], Err(Error::Framing { buffered: 17, .. })));
        assert_eq!(asm.buffered(), 0);

        let frames = asm.feed(b":R,ok\r");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().offset, 17);
    }

    #[test]
    fn framing_error_names_the_limit() {
        let mut fixed = FixedLengthAssembler::new(L);
        let mut delimited = DelimitedAssembler::new(b'\r', b":R").with_max_len(16);

        let Some(Err(err)) = fixed.feed(&[0u8; 50]).pop() else {
            panic!("expected framing error");
        };
        assert_eq!(
            err.to_string(),
            "framing lost; discarded 50 buffered bytes (frame limit 44)"
        );
        let Some(Err(err)) = delimited.feed(&[b'a'; 17]).pop() else {
            panic!("expected framing error");
        };
        assert_eq!(
            err.to_string(),
            "framing lost; discarded 17 buffered bytes (frame limit 16)"
        );
    }
}
