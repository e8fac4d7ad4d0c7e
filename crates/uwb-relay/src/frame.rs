//! # Frame Decoder
//!
//! Turns the sensor's raw byte stream into validated [`DistanceSample`]s.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────┬────────┬───────┬──────┐
//! │ 0x02 │ D_HIGH │ D_LOW │ 0x03 │   distance_mm = (D_HIGH << 8) | D_LOW
//! └──────┴────────┴───────┴──────┘
//! ```
//!
//! The decoder scans one byte at a time for the start byte, then reads the
//! three bytes that follow. A body whose last byte is not the end byte is
//! discarded without rewinding, so a corrupted frame costs at most three
//! bytes and scanning can never stall on it.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{FrameError, LinkError};

pub const START_BYTE: u8 = 0x02;
pub const END_BYTE: u8 = 0x03;
/// Bytes read after a start byte.
pub const BODY_LEN: usize = 3;
pub const FRAME_LEN: usize = 1 + BODY_LEN;

// ─── Sample ─────────────────────────────────────────────────────────────────

/// One validated distance reading.
///
/// Only the decoder constructs samples, and only from a complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceSample {
    distance_mm: u16,
    observed_at: DateTime<Utc>,
}

impl DistanceSample {
    pub(crate) fn new(distance_mm: u16, observed_at: DateTime<Utc>) -> Self {
        Self {
            distance_mm,
            observed_at,
        }
    }

    pub fn distance_mm(&self) -> u16 {
        self.distance_mm
    }

    /// Wall-clock time at which the frame's end byte was validated.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Encodes a distance as a wire frame.
pub fn encode_frame(distance_mm: u16) -> [u8; FRAME_LEN] {
    let [hi, lo] = distance_mm.to_be_bytes();
    [START_BYTE, hi, lo, END_BYTE]
}

/// Validates the three bytes following a start byte.
pub fn decode_frame(body: [u8; BODY_LEN]) -> Result<u16, FrameError> {
    let [hi, lo, end] = body;
    if end != END_BYTE {
        return Err(FrameError::BadEndByte { found: end });
    }
    Ok(u16::from_be_bytes([hi, lo]))
}

// ─── Byte sources ───────────────────────────────────────────────────────────

/// Something the decoder can pull bytes from.
pub trait ByteSource {
    /// Fills `buf` as far as possible, waiting at most `timeout`.
    ///
    /// Returns the number of bytes written; fewer than `buf.len()` means the
    /// timeout elapsed first.
    fn fill(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;
}

/// In-memory byte source over a finite slice. Never blocks.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn fill(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, LinkError> {
        let rest = &self.bytes[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Outcome of one scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A complete, valid frame.
    Sample(DistanceSample),
    /// One byte that was not a start byte was consumed.
    Skipped,
    /// No byte arrived within the read timeout.
    Idle,
    /// A start byte was followed by a bad or short body.
    Malformed(FrameError),
}

#[derive(Debug, Clone)]
pub struct FrameDecoder {
    read_timeout: Duration,
}

impl FrameDecoder {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Performs one scan step: reads a byte and, if it is a start byte, the
    /// frame body behind it.
    ///
    /// Consumes either one byte (`Skipped`), zero bytes (`Idle`) or a start
    /// byte plus up to [`BODY_LEN`] body bytes. Only link errors are
    /// returned as `Err`; decode errors are reported as `Malformed`.
    pub fn next_event<S: ByteSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<DecodeEvent, LinkError> {
        let mut byte = [0u8; 1];
        if source.fill(&mut byte, self.read_timeout)? == 0 {
            return Ok(DecodeEvent::Idle);
        }
        if byte[0] != START_BYTE {
            return Ok(DecodeEvent::Skipped);
        }

        let mut body = [0u8; BODY_LEN];
        let got = source.fill(&mut body, self.read_timeout)?;
        if got < BODY_LEN {
            return Ok(DecodeEvent::Malformed(FrameError::ShortRead { got }));
        }

        Ok(match decode_frame(body) {
            Ok(distance_mm) => DecodeEvent::Sample(DistanceSample::new(distance_mm, Utc::now())),
            Err(e) => DecodeEvent::Malformed(e),
        })
    }

    /// Lazy, unbounded sequence of scan steps over `source`.
    pub fn events<'a, S: ByteSource + ?Sized>(&'a mut self, source: &'a mut S) -> Events<'a, S> {
        Events {
            decoder: self,
            source,
        }
    }
}

/// Iterator returned by [`FrameDecoder::events`]. Never yields `None`.
pub struct Events<'a, S: ?Sized> {
    decoder: &'a mut FrameDecoder,
    source: &'a mut S,
}

impl<S: ByteSource + ?Sized> Iterator for Events<'_, S> {
    type Item = Result<DecodeEvent, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.decoder.next_event(self.source))
    }
}

/// Decodes every frame in a finite byte slice.
///
/// Yields one entry per start byte found: the distance for a valid frame or
/// the decode error for a malformed one. Uses the same scanner as the live
/// decoder.
pub fn decode_all(bytes: &[u8]) -> Vec<Result<u16, FrameError>> {
    let mut source = SliceSource::new(bytes);
    let mut decoder = FrameDecoder::new(Duration::ZERO);
    let mut out = Vec::new();

    while !source.is_exhausted() {
        match decoder.next_event(&mut source) {
            Ok(DecodeEvent::Sample(sample)) => out.push(Ok(sample.distance_mm())),
            Ok(DecodeEvent::Malformed(e)) => out.push(Err(e)),
            Ok(DecodeEvent::Skipped) => {}
            Ok(DecodeEvent::Idle) | Err(_) => break,
        }
    }
    out
}
