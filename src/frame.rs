//! Brace-delimited framing of JSON messages carried on a byte stream.
//!
//! Firmware emits one JSON object per message with no length prefix and no
//! delimiter byte. Frame boundaries are implied by braces alone: a frame runs
//! from the last `{` before the first `}` up to and including that `}`.
//! Payload values therefore never contain literal braces, and nested objects
//! are not supported.
//!
//! [`FrameBuffer`] has exactly one producer (the transport read loop) and one
//! consumer (the same loop draining frames), so it needs no locking.

use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Opening brace of a frame.
pub const FRAME_START: u8 = b'{';
/// Closing brace of a frame.
pub const FRAME_END: u8 = b'}';

/// Default upper bound on buffered, not yet framed bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2_500_000;

/// Outcome of a single extraction step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// A complete frame was removed from the buffer.
    Frame(Bytes),
    /// An orphan `}` and everything before it were discarded. More frames
    /// may already be buffered.
    Discarded(usize),
    /// No terminator is buffered yet.
    Incomplete,
}

/// Accumulates transport bytes and extracts complete JSON-object frames.
///
/// # Examples
///
/// ```
/// use modilink::frame::FrameBuffer;
///
/// let mut buffer = FrameBuffer::default();
/// buffer.append(br#"noise{"a":1}{"b"#);
/// assert_eq!(buffer.extract_frame().as_deref(), Some(&br#"{"a":1}"#[..]));
/// assert_eq!(buffer.extract_frame(), None);
/// buffer.append(br#":2}"#);
/// assert_eq!(buffer.extract_frame().as_deref(), Some(&br#"{"b":2}"#[..]));
/// ```
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    capacity: usize,
    discarded: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self { Self::with_capacity(DEFAULT_BUFFER_CAPACITY) }
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` unframed bytes.
    ///
    /// A zero capacity is raised to one byte.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity: capacity.max(1),
            discarded: 0,
        }
    }

    /// Append raw bytes read from a transport.
    ///
    /// Returns the number of bytes dropped by the overflow policy, which is
    /// zero unless the buffer exceeded its capacity. See
    /// [`FrameBuffer::enforce_capacity`].
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        self.buf.extend_from_slice(bytes);
        let dropped = self.enforce_capacity();
        if dropped > 0 {
            warn!(
                dropped,
                capacity = self.capacity,
                "frame buffer overflow, discarding unframed bytes"
            );
            crate::metrics::inc_discarded_bytes(dropped);
        }
        dropped
    }

    /// Apply the overflow policy and return how many bytes were dropped.
    ///
    /// When the buffer holds more than `capacity` bytes, everything before
    /// the last `{` is dropped, keeping the most recent plausible frame start.
    /// If no `{` is buffered, or the tail from the last `{` still exceeds the
    /// capacity, the buffer is cleared. This is lossy recovery, not an error.
    pub fn enforce_capacity(&mut self) -> usize {
        let len = self.buf.len();
        if len <= self.capacity {
            return 0;
        }
        let dropped = match self.buf.iter().rposition(|&b| b == FRAME_START) {
            Some(start) if len - start <= self.capacity => {
                let _ = self.buf.split_to(start);
                start
            }
            _ => {
                self.buf.clear();
                len
            }
        };
        self.discarded += dropped as u64;
        dropped
    }

    /// Run one step of the extraction scan.
    ///
    /// 1. With no `}` buffered, drop everything before the last `{` (or the
    ///    whole buffer if there is none) and report [`Extraction::Incomplete`].
    /// 2. Otherwise take the last `{` before the first `}` as the frame start.
    ///    Bytes before it are garbage and dropped together with the frame.
    /// 3. With no `{` before the first `}`, drop through that orphan `}`.
    pub fn extract(&mut self) -> Extraction {
        let Some(end) = self.buf.iter().position(|&b| b == FRAME_END) else {
            match self.buf.iter().rposition(|&b| b == FRAME_START) {
                Some(start) => {
                    let _ = self.buf.split_to(start);
                    self.discarded += start as u64;
                }
                None => {
                    self.discarded += self.buf.len() as u64;
                    self.buf.clear();
                }
            }
            return Extraction::Incomplete;
        };

        let mut consumed = self.buf.split_to(end + 1);
        match consumed[..end].iter().rposition(|&b| b == FRAME_START) {
            Some(start) => {
                self.discarded += start as u64;
                Extraction::Frame(consumed.split_off(start).freeze())
            }
            None => {
                self.discarded += consumed.len() as u64;
                Extraction::Discarded(consumed.len())
            }
        }
    }

    /// Extract at most one frame.
    ///
    /// Returns `None` both when no terminator is buffered and when an orphan
    /// `}` was discarded; in the latter case a further call may succeed.
    pub fn extract_frame(&mut self) -> Option<Bytes> {
        match self.extract() {
            Extraction::Frame(frame) => Some(frame),
            Extraction::Discarded(_) | Extraction::Incomplete => None,
        }
    }

    /// Extract every complete frame currently buffered, in arrival order.
    ///
    /// Unlike looping on [`FrameBuffer::extract_frame`], this keeps scanning
    /// past discarded orphan braces, so the frames produced do not depend on
    /// how the byte stream was chunked.
    pub fn drain_frames(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        loop {
            match self.extract() {
                Extraction::Frame(frame) => frames.push(frame),
                Extraction::Discarded(_) => {}
                Extraction::Incomplete => return frames,
            }
        }
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize { self.buf.len() }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize { self.capacity }

    /// Total bytes discarded as garbage or overflow since creation.
    #[must_use]
    pub fn discarded(&self) -> u64 { self.discarded }

    /// Borrow the unframed bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] { &self.buf }
}
