//! Video decoder seam.
//!
//! The runtime treats the codec as an opaque collaborator behind the
//! [`Decoder`] trait: chunked encoded input goes in, decoded images come out.
//! A decoder is constructed from an [`ImageSpec`] by a [`DecoderFactory`]
//! whenever stream metadata changes, receives that metadata exactly once via
//! [`Decoder::set_metadata`], and is then fed frame chunks in arrival order.
//!
//! Decode failures are reported in-band: the decoder stays usable for the
//! next frame and the pipeline counts the failure instead of aborting.

pub mod identity;

use bytes::Bytes;

use crate::config::ImageSpec;
use crate::error::Result;

/// Per-stream frame identity, carried as a pair of unsigned 64-bit values on
/// the wire and monotonic per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameId {
    pub hi: u64,
    pub lo: u64,
}

impl FrameId {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

/// Codec identification plus codec-specific initialization bytes.
///
/// Two metadata values are equal only when both the codec name and the
/// initialization bytes match; the pipeline rebuilds the decoder on any
/// change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecMetadata {
    pub codec_name: String,
    pub codec_data: Bytes,
}

impl CodecMetadata {
    pub fn new(codec_name: impl Into<String>, codec_data: impl Into<Bytes>) -> Self {
        Self {
            codec_name: codec_name.into(),
            codec_data: codec_data.into(),
        }
    }
}

/// One decoded picture.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: Bytes,
    pub width: u16,
    pub height: u16,
    /// Bytes per pixel row.
    pub linesize: u16,
}

/// An opaque video decoder.
///
/// Chunks belonging to one frame share a [`FrameId`] and must be submitted in
/// chunk-index order, completely, before [`Decoder::frame_ready`] can report
/// true for that frame. Implementations must tolerate partial chunk
/// sequences: after the pipeline sheds a burst, the next submitted chunk may
/// open a fresh frame while a previous one was half-delivered.
pub trait Decoder: Send {
    /// Install stream metadata. Called exactly once, on a freshly
    /// constructed decoder, before any chunk is submitted.
    fn set_metadata(&mut self, metadata: &CodecMetadata) -> Result<()>;

    /// Submit one chunk of an encoded frame. `chunk_index` is 1-based;
    /// `chunk_total` is constant across the chunks of one frame.
    fn process_chunk(
        &mut self,
        id: FrameId,
        chunk: &[u8],
        chunk_index: u32,
        chunk_total: u32,
    ) -> Result<()>;

    /// Whether a decoded image is waiting to be consumed.
    fn frame_ready(&self) -> bool;

    /// Consume the pending image, clearing readiness.
    fn take_image(&mut self) -> Option<DecodedImage>;
}

/// Constructs decoders for a target image geometry.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, spec: &ImageSpec) -> Result<Box<dyn Decoder>>;
}
