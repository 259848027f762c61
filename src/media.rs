//! Decode/IO plugin contract and the synthetic reader used by tests.
//!
//! The engine never touches containers or codecs itself: a leaf source node
//! asks its reader for a frame and caches the result exactly like any other
//! node. Readers may be called concurrently from several evaluation threads.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::audio::AudioBuffer;
use crate::graph::node::{RangeInfo, StructureInfo};

/// Decoded samples for one frame
#[derive(Debug, Clone)]
pub struct FramePayload {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Interleaved samples, `width * height * channels` long
    pub data: Vec<f32>,
}

impl FramePayload {
    pub fn solid(width: u32, height: u32, channels: u8, value: f32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![value; (width * height * channels as u32) as usize],
        }
    }

    /// Payload bytes
    pub fn mem(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Media read failures
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("frame {frame} outside media range {start}..{end}")]
    OutOfRange { frame: i32, start: i32, end: i32 },

    #[error("unreadable media: {0}")]
    Unreadable(String),
}

/// Leaf media producer.
///
/// `identifier` must be unique per distinct frame content - it seeds the
/// content-identity trees the cache keys on.
pub trait FrameReader: Send + Sync {
    /// Stable content identity for a frame
    fn identifier(&self, frame: i32) -> String;

    /// Frame range this media covers
    fn range(&self) -> RangeInfo;

    /// Image geometry
    fn structure(&self) -> StructureInfo;

    /// Decode one frame
    fn read_frame(&self, frame: i32) -> Result<FramePayload, MediaError>;

    /// Fill `buf` with samples for its window; returns samples written.
    /// Sample 0 aligns with the media's start frame. Default: no audio.
    fn read_audio(&self, _buf: &mut AudioBuffer) -> usize {
        0
    }
}

/// Deterministic procedural media for tests and demos.
///
/// Pixels encode (frame, x, y); audio is a sine so retime and mixdown
/// behavior is observable without files on disk.
#[derive(Debug)]
pub struct SyntheticReader {
    name: String,
    range: RangeInfo,
    width: u32,
    height: u32,
    /// Total read_frame calls, visible to build-once tests
    reads: AtomicUsize,
}

impl SyntheticReader {
    pub fn new(name: impl Into<String>, start: i32, end: i32, fps: f32) -> Self {
        Self {
            name: name.into(),
            range: RangeInfo {
                start,
                end,
                cut_in: start,
                cut_out: end,
                fps,
            },
            width: 64,
            height: 32,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_cuts(mut self, cut_in: i32, cut_out: i32) -> Self {
        self.range.cut_in = cut_in;
        self.range.cut_out = cut_out;
        self
    }

    /// How many frames have actually been decoded
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl FrameReader for SyntheticReader {
    fn identifier(&self, frame: i32) -> String {
        format!("{}/{}", self.name, frame)
    }

    fn range(&self) -> RangeInfo {
        self.range
    }

    fn structure(&self) -> StructureInfo {
        StructureInfo {
            width: self.width,
            height: self.height,
            pixel_aspect: 1.0,
        }
    }

    fn read_frame(&self, frame: i32) -> Result<FramePayload, MediaError> {
        if frame < self.range.start || frame > self.range.end {
            return Err(MediaError::OutOfRange {
                frame,
                start: self.range.start,
                end: self.range.end,
            });
        }
        self.reads.fetch_add(1, Ordering::Relaxed);

        let mut payload = FramePayload::solid(self.width, self.height, 3, 0.0);
        let w = self.width as usize;
        for y in 0..self.height as usize {
            for x in 0..w {
                let i = (y * w + x) * 3;
                payload.data[i] = frame as f32;
                payload.data[i + 1] = x as f32 / w as f32;
                payload.data[i + 2] = y as f32 / self.height as f32;
            }
        }
        Ok(payload)
    }

    fn read_audio(&self, buf: &mut AudioBuffer) -> usize {
        let rate = buf.rate();
        let ch = buf.channels() as usize;
        let start = buf.start_sample();
        let n = buf.len();
        let freq = 220.0;
        for i in 0..n {
            let t = (start + i as i64) as f64 / rate as f64;
            let v = (t * freq * std::f64::consts::TAU).sin() as f32 * 0.25;
            for c in 0..ch {
                buf.data_mut()[i * ch + c] = v;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_identity_and_range() {
        let reader = SyntheticReader::new("clipA", 1, 48, 24.0);
        assert_eq!(reader.identifier(7), "clipA/7");
        assert_eq!(reader.range().start, 1);
        assert_eq!(reader.range().end, 48);
    }

    #[test]
    fn test_synthetic_pixels_encode_frame() {
        let reader = SyntheticReader::new("clipA", 1, 48, 24.0).with_size(8, 4);
        let payload = reader.read_frame(13).unwrap();
        assert_eq!(payload.data[0], 13.0);
        assert_eq!(reader.read_count(), 1);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let reader = SyntheticReader::new("clipA", 1, 48, 24.0);
        assert!(reader.read_frame(0).is_err());
        assert!(reader.read_frame(49).is_err());
    }

    #[test]
    fn test_synthetic_audio_fills_window() {
        let reader = SyntheticReader::new("clipA", 1, 48, 24.0);
        let mut buf = AudioBuffer::new(64, 2, 48000, 4800);
        let n = reader.read_audio(&mut buf);
        assert_eq!(n, 64);
        assert!(buf.data().iter().any(|s| *s != 0.0));
    }
}
