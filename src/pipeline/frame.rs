//! Channel payload shapes.
//!
//! Messages on the frames channel carry base64 chunk data under short keys:
//! `d` (payload), `i` (frame id pair), `rt` (rtp timestamp), `t` (ntp
//! timestamp, seconds since epoch), `c`/`l` (1-based chunk index and chunk
//! count, both present or both absent). The metadata channel carries
//! `{codecName, codecData?}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use crate::codec::{CodecMetadata, FrameId};
use crate::error::{Error, Result};

/// One frames-channel PDU, possibly a chunk of a larger encoded frame.
#[derive(Debug, Clone)]
pub struct NetworkFrame {
    /// Encoded chunk bytes, already base64-decoded.
    pub payload: Bytes,
    pub id: FrameId,
    pub rtp_timestamp: u32,
    /// Seconds since the Unix epoch; zero when the field was absent.
    pub ntp_timestamp: f64,
    /// 1-based index of this chunk within its frame.
    pub chunk_index: u32,
    pub chunk_total: u32,
}

/// One decoded picture together with the id of its source frame.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub pixels: Bytes,
    pub width: u16,
    pub height: u16,
    /// Bytes per pixel row.
    pub linesize: u16,
    pub id: FrameId,
}

/// Parse a frames-channel message.
pub fn parse_network_frame(message: &Value) -> Result<NetworkFrame> {
    let data = message
        .get("d")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidFrame("missing payload field d".into()))?;
    let payload = BASE64
        .decode(data)
        .map_err(|e| Error::InvalidFrame(format!("payload is not base64: {e}")))?;

    let id_pair = message
        .get("i")
        .and_then(Value::as_array)
        .filter(|pair| pair.len() == 2)
        .ok_or_else(|| Error::InvalidFrame("missing or malformed id field i".into()))?;
    let hi = id_pair[0]
        .as_u64()
        .ok_or_else(|| Error::InvalidFrame("frame id is not unsigned".into()))?;
    let lo = id_pair[1]
        .as_u64()
        .ok_or_else(|| Error::InvalidFrame("frame id is not unsigned".into()))?;

    // Some producers encode rt as a signed 64-bit value; truncate.
    let rtp_timestamp = message.get("rt").and_then(Value::as_i64).unwrap_or(0) as u32;
    let ntp_timestamp = message.get("t").and_then(Value::as_f64).unwrap_or(0.0);

    let (chunk_index, chunk_total) = match (message.get("c"), message.get("l")) {
        (None, None) => (1, 1),
        (Some(c), Some(l)) => {
            let index = c
                .as_u64()
                .filter(|&index| index >= 1)
                .ok_or_else(|| Error::InvalidFrame("bad chunk index".into()))?;
            let total = l
                .as_u64()
                .filter(|&total| total >= 1)
                .ok_or_else(|| Error::InvalidFrame("bad chunk count".into()))?;
            (index as u32, total as u32)
        }
        _ => {
            return Err(Error::InvalidFrame(
                "chunk fields c and l must appear together".into(),
            ))
        }
    };

    Ok(NetworkFrame {
        payload: Bytes::from(payload),
        id: FrameId::new(hi, lo),
        rtp_timestamp,
        ntp_timestamp,
        chunk_index,
        chunk_total,
    })
}

/// Parse a metadata-channel message.
pub fn parse_metadata(message: &Value) -> Result<CodecMetadata> {
    let codec_name = message
        .get("codecName")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidFrame("missing codecName".into()))?;

    let codec_data = match message.get("codecData").and_then(Value::as_str) {
        Some(encoded) => BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidFrame(format!("codecData is not base64: {e}")))?,
        None => Vec::new(),
    };

    Ok(CodecMetadata::new(codec_name, codec_data))
}
