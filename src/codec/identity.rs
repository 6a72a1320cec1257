//! Reference decoder for uncompressed streams.
//!
//! Handles the codec name `"raw"`: frame payloads are raw pixel rows in the
//! stream's own geometry, and the metadata initialization bytes are a JSON
//! object `{"width": W, "height": H}`. Used by the demos and as the
//! pipeline's test double for real codec bindings.

use bytes::Bytes;

use super::{CodecMetadata, DecodedImage, Decoder, DecoderFactory, FrameId};
use crate::config::ImageSpec;
use crate::error::{Error, Result};

/// Codec name handled by [`IdentityDecoder`].
pub const RAW_CODEC_NAME: &str = "raw";

#[derive(Debug, Clone, Copy)]
struct Geometry {
    width: u16,
    height: u16,
    bytes_per_pixel: usize,
}

impl Geometry {
    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel
    }

    fn linesize(&self) -> u16 {
        (self.width as usize * self.bytes_per_pixel) as u16
    }
}

/// In-progress reassembly of one chunked frame.
struct ChunkState {
    id: FrameId,
    next_index: u32,
    total: u32,
    data: Vec<u8>,
}

/// Passthrough decoder: reassembles chunks and emits the bytes unchanged.
pub struct IdentityDecoder {
    spec: ImageSpec,
    geometry: Option<Geometry>,
    assembling: Option<ChunkState>,
    pending: Option<Vec<u8>>,
}

impl IdentityDecoder {
    pub fn new(spec: ImageSpec) -> Self {
        Self {
            spec,
            geometry: None,
            assembling: None,
            pending: None,
        }
    }
}

impl Decoder for IdentityDecoder {
    fn set_metadata(&mut self, metadata: &CodecMetadata) -> Result<()> {
        if self.geometry.is_some() {
            return Err(Error::Codec("metadata already installed".into()));
        }
        if metadata.codec_name != RAW_CODEC_NAME {
            return Err(Error::Codec(format!(
                "unsupported codec: {}",
                metadata.codec_name
            )));
        }

        let dims: serde_json::Value = serde_json::from_slice(&metadata.codec_data)
            .map_err(|e| Error::Codec(format!("bad raw codec data: {e}")))?;
        let width = dims["width"]
            .as_u64()
            .ok_or_else(|| Error::Codec("raw codec data missing width".into()))?;
        let height = dims["height"]
            .as_u64()
            .ok_or_else(|| Error::Codec("raw codec data missing height".into()))?;

        self.geometry = Some(Geometry {
            width: width as u16,
            height: height as u16,
            bytes_per_pixel: self.spec.pixel_format.bytes_per_pixel(),
        });
        Ok(())
    }

    fn process_chunk(
        &mut self,
        id: FrameId,
        chunk: &[u8],
        chunk_index: u32,
        chunk_total: u32,
    ) -> Result<()> {
        let geometry = self
            .geometry
            .ok_or_else(|| Error::Codec("no metadata installed".into()))?;

        if chunk_index == 1 {
            // A fresh frame abandons any half-assembled predecessor.
            self.assembling = Some(ChunkState {
                id,
                next_index: 2,
                total: chunk_total,
                data: chunk.to_vec(),
            });
        } else {
            let Some(state) = self.assembling.as_mut() else {
                // Continuation without a start: a shed burst took the head.
                return Ok(());
            };
            if state.id != id || chunk_index != state.next_index || chunk_total != state.total {
                self.assembling = None;
                return Ok(());
            }
            state.next_index += 1;
            state.data.extend_from_slice(chunk);
        }

        let complete = self
            .assembling
            .as_ref()
            .is_some_and(|s| s.next_index > s.total);
        if complete {
            if let Some(state) = self.assembling.take() {
                if state.data.len() != geometry.frame_size() {
                    return Err(Error::Codec(format!(
                        "frame size mismatch: got {} bytes, expected {}",
                        state.data.len(),
                        geometry.frame_size()
                    )));
                }
                self.pending = Some(state.data);
            }
        }
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.pending.is_some()
    }

    fn take_image(&mut self) -> Option<DecodedImage> {
        let geometry = self.geometry?;
        let pixels = self.pending.take()?;
        Some(DecodedImage {
            pixels: Bytes::from(pixels),
            width: geometry.width,
            height: geometry.height,
            linesize: geometry.linesize(),
        })
    }
}

/// Factory producing [`IdentityDecoder`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDecoderFactory;

impl DecoderFactory for IdentityDecoderFactory {
    fn create(&self, spec: &ImageSpec) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(IdentityDecoder::new(*spec)))
    }
}

/// Metadata initialization bytes for a raw stream of the given geometry.
pub fn raw_codec_data(width: u16, height: u16) -> Vec<u8> {
    serde_json::json!({ "width": width, "height": height })
        .to_string()
        .into_bytes()
}
