//! Per-pipeline counters.
//!
//! Unlike the client metrics these are instance-scoped: one bot pipeline
//! owns one `PipelineStats`, shared with its worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one frame pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Frame PDUs seen on the frames channel.
    pub messages_received: AtomicU64,
    /// Decoded frames produced by the decoder.
    pub frames_received: AtomicU64,
    /// Encoded payload bytes accepted into the pipeline.
    pub bytes_received: AtomicU64,
    /// Metadata PDUs seen on the metadata channel.
    pub metadata_received: AtomicU64,
    /// Frames shed because the decoder queue was full.
    pub network_buffer_dropped: AtomicU64,
    /// Decoded images shed because the process queue was full.
    pub image_frames_dropped: AtomicU64,
    /// Chunk submissions the decoder rejected.
    pub decode_errors: AtomicU64,
    /// Channel payloads that failed shape validation.
    pub invalid_messages: AtomicU64,

    decode_time_micros: AtomicU64,
    decode_samples: AtomicU64,
    processing_time_micros: AtomicU64,
    processing_samples: AtomicU64,
}

impl PipelineStats {
    pub fn observe_decode(&self, elapsed: Duration) {
        self.decode_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.decode_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_processing(&self, elapsed: Duration) {
        self.processing_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean_decode_millis(&self) -> f64 {
        mean_millis(
            self.decode_time_micros.load(Ordering::Relaxed),
            self.decode_samples.load(Ordering::Relaxed),
        )
    }

    pub fn mean_processing_millis(&self) -> f64 {
        mean_millis(
            self.processing_time_micros.load(Ordering::Relaxed),
            self.processing_samples.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            metadata_received: self.metadata_received.load(Ordering::Relaxed),
            network_buffer_dropped: self.network_buffer_dropped.load(Ordering::Relaxed),
            image_frames_dropped: self.image_frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            invalid_messages: self.invalid_messages.load(Ordering::Relaxed),
        }
    }
}

fn mean_millis(total_micros: u64, samples: u64) -> f64 {
    if samples == 0 {
        0.0
    } else {
        total_micros as f64 / samples as f64 / 1000.0
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub messages_received: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub metadata_received: u64,
    pub network_buffer_dropped: u64,
    pub image_frames_dropped: u64,
    pub decode_errors: u64,
    pub invalid_messages: u64,
}
