//! Two-stage frame pipeline.
//!
//! ```text
//!  reactor ──try_send──► decoder worker ──try_send──► process worker
//!  (frame PDUs)          (cap 1024)                   (cap 2)
//!                        submits chunks,              runs the image
//!                        snapshots ready images       callback
//! ```
//!
//! Shedding policy: the producer never blocks. When the decoder queue is
//! full the whole backlog is cleared and the new frame is dropped too, so
//! sustained overload sheds a burst entirely rather than serving stale
//! frames. When the process queue is full only the newest image is dropped;
//! that queue is two entries deep and drains quickly.
//!
//! The decoder is shared between the decoder worker (chunk submission) and
//! the reactor (rebuild on metadata change) behind one mutex, so a metadata
//! change is atomic with respect to chunk ingestion.

pub mod frame;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{CodecMetadata, Decoder, DecoderFactory};
use crate::config::ImageSpec;
use crate::error::Result;
use crate::stats::PipelineStats;
use crate::worker::BoundedWorker;

pub use frame::{parse_metadata, parse_network_frame, ImageFrame, NetworkFrame};

/// Capacity of the network→decoder queue.
pub const NETWORK_FRAMES_MAX_BUFFER_SIZE: usize = 1024;

/// Capacity of the decoder→process queue.
pub const IMAGE_FRAMES_MAX_BUFFER_SIZE: usize = 2;

type SharedDecoder = Arc<Mutex<Option<Box<dyn Decoder>>>>;

/// The decode-and-process pipeline owned by one bot instance.
pub struct FramePipeline {
    spec: ImageSpec,
    factory: Arc<dyn DecoderFactory>,
    decoder: SharedDecoder,
    /// Most recently applied metadata; compared before any rebuild.
    metadata: Option<CodecMetadata>,
    decoder_worker: BoundedWorker<NetworkFrame>,
    process_worker: Arc<BoundedWorker<ImageFrame>>,
    stats: Arc<PipelineStats>,
}

impl FramePipeline {
    /// Build the pipeline and spawn both workers. `on_image` runs on the
    /// process worker for every decoded frame; it is expected to invoke the
    /// bot callback and flush outbound messages.
    pub fn new<F>(
        spec: ImageSpec,
        factory: Arc<dyn DecoderFactory>,
        stats: Arc<PipelineStats>,
        mut on_image: F,
    ) -> Self
    where
        F: FnMut(ImageFrame) + Send + 'static,
    {
        let decoder: SharedDecoder = Arc::new(Mutex::new(None));

        let process_stats = Arc::clone(&stats);
        let process_worker = Arc::new(BoundedWorker::spawn(
            "bot-process",
            IMAGE_FRAMES_MAX_BUFFER_SIZE,
            move |image: ImageFrame| {
                let started = Instant::now();
                on_image(image);
                process_stats.observe_processing(started.elapsed());
            },
        ));

        let decode_decoder = Arc::clone(&decoder);
        let decode_stats = Arc::clone(&stats);
        let decode_process = Arc::clone(&process_worker);
        let decoder_worker = BoundedWorker::spawn(
            "bot-decode",
            NETWORK_FRAMES_MAX_BUFFER_SIZE,
            move |frame: NetworkFrame| {
                decode_one(&decode_decoder, &decode_stats, &decode_process, frame);
            },
        );

        Self {
            spec,
            factory,
            decoder,
            metadata: None,
            decoder_worker,
            process_worker,
            stats,
        }
    }

    /// Reactor entry point for one frames-channel message.
    ///
    /// Frames arriving before any metadata are dropped silently; malformed
    /// frames are counted and dropped; a full decoder queue sheds the whole
    /// backlog plus this frame.
    pub fn on_network_frame(&self, message: &Value) -> Result<()> {
        self.stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        if self.metadata.is_none() {
            return Ok(());
        }

        let frame = match parse_network_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed network frame");
                self.stats
                    .invalid_messages
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        self.stats
            .bytes_received
            .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);

        if !self.decoder_worker.try_send(frame) {
            self.stats
                .network_buffer_dropped
                .fetch_add(1, Ordering::Relaxed);
            let shed = self.decoder_worker.clear();
            tracing::warn!(shed, "decoder queue full, shedding backlog");
        }
        Ok(())
    }

    /// Reactor entry point for one metadata-channel message.
    ///
    /// Identical metadata is a no-op; changed metadata tears the decoder
    /// down and builds a fresh one under the decoder lock.
    pub fn on_metadata(&mut self, message: &Value) -> Result<()> {
        let metadata = match parse_metadata(message) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed metadata");
                self.stats
                    .invalid_messages
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        self.stats
            .metadata_received
            .fetch_add(1, Ordering::Relaxed);

        if self.metadata.as_ref() == Some(&metadata) {
            return Ok(());
        }
        self.metadata = Some(metadata.clone());

        let mut guard = self.decoder.lock();
        *guard = None;

        let mut decoder = match self.factory.create(&self.spec) {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::error!(error = %e, codec = %metadata.codec_name, "decoder construction failed");
                self.stats
                    .decode_errors
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        if let Err(e) = decoder.set_metadata(&metadata) {
            tracing::error!(error = %e, codec = %metadata.codec_name, "decoder rejected metadata");
            self.stats
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        *guard = Some(decoder);
        tracing::info!(codec = %metadata.codec_name, "video decoder initialized");
        Ok(())
    }

    /// Whether a decoder currently exists (metadata has been applied).
    pub fn decoder_exists(&self) -> bool {
        self.decoder.lock().is_some()
    }

    pub fn network_queue_len(&self) -> usize {
        self.decoder_worker.len()
    }

    pub fn image_queue_len(&self) -> usize {
        self.process_worker.len()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Stop both workers, draining queued items in order.
    pub fn close(&mut self) {
        self.decoder_worker.close();
        // The decoder worker can no longer feed it; safe to close.
        if let Some(worker) = Arc::get_mut(&mut self.process_worker) {
            worker.close();
        }
    }
}

/// Decoder-worker body: submit one chunk, snapshot a ready image.
fn decode_one(
    decoder: &SharedDecoder,
    stats: &PipelineStats,
    process_worker: &BoundedWorker<ImageFrame>,
    frame: NetworkFrame,
) {
    let mut guard = decoder.lock();
    let Some(active) = guard.as_mut() else {
        // Metadata changed under us and construction failed; nothing to do.
        return;
    };

    let started = Instant::now();
    if let Err(e) = active.process_chunk(
        frame.id,
        &frame.payload,
        frame.chunk_index,
        frame.chunk_total,
    ) {
        tracing::warn!(error = %e, "decoder rejected chunk");
        stats
            .decode_errors
            .fetch_add(1, Ordering::Relaxed);
        return;
    }
    stats.observe_decode(started.elapsed());

    if active.frame_ready() {
        stats
            .frames_received
            .fetch_add(1, Ordering::Relaxed);
        if let Some(image) = active.take_image() {
            let item = ImageFrame {
                pixels: image.pixels,
                width: image.width,
                height: image.height,
                linesize: image.linesize,
                id: frame.id,
            };
            if !process_worker.try_send(item) {
                stats
                    .image_frames_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;

    use super::*;
    use crate::codec::identity::{raw_codec_data, IdentityDecoderFactory};
    use crate::codec::{DecodedImage, FrameId};
    use crate::config::PixelFormat;
    use crate::error::Error;

    /// Counts constructions and decodes every chunk set into a fixed image.
    struct CountingFactory {
        built: Arc<AtomicU32>,
    }

    impl DecoderFactory for CountingFactory {
        fn create(&self, _spec: &ImageSpec) -> crate::Result<Box<dyn Decoder>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TrackingDecoder::default()))
        }
    }

    #[derive(Default)]
    struct TrackingDecoder {
        chunks_seen: u32,
        expected_total: u32,
        ready: bool,
    }

    impl Decoder for TrackingDecoder {
        fn set_metadata(&mut self, _metadata: &CodecMetadata) -> crate::Result<()> {
            Ok(())
        }

        fn process_chunk(
            &mut self,
            _id: FrameId,
            _chunk: &[u8],
            chunk_index: u32,
            chunk_total: u32,
        ) -> crate::Result<()> {
            if chunk_index == 1 {
                self.chunks_seen = 0;
                self.expected_total = chunk_total;
            }
            self.chunks_seen += 1;
            if self.chunks_seen == self.expected_total {
                self.ready = true;
            }
            Ok(())
        }

        fn frame_ready(&self) -> bool {
            self.ready
        }

        fn take_image(&mut self) -> Option<DecodedImage> {
            if !self.ready {
                return None;
            }
            self.ready = false;
            Some(DecodedImage {
                pixels: bytes::Bytes::from_static(&[0, 0, 0, 0]),
                width: 2,
                height: 2,
                linesize: 2,
            })
        }
    }

    fn frame_message(id: (u64, u64), payload: &[u8], chunk: Option<(u32, u32)>) -> Value {
        let mut message = json!({
            "d": BASE64.encode(payload),
            "i": [id.0, id.1],
        });
        if let Some((c, l)) = chunk {
            message["c"] = c.into();
            message["l"] = l.into();
        }
        message
    }

    fn metadata_message(codec: &str, data: &[u8]) -> Value {
        json!({ "codecName": codec, "codecData": BASE64.encode(data) })
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn counting_pipeline() -> (FramePipeline, Arc<AtomicU32>, mpsc::Receiver<ImageFrame>) {
        let built = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(CountingFactory {
            built: Arc::clone(&built),
        });
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel();
        let pipeline = FramePipeline::new(
            ImageSpec::new(2, 2).pixel_format(PixelFormat::Gray8),
            factory,
            stats,
            move |image| {
                tx.send(image).unwrap();
            },
        );
        (pipeline, built, rx)
    }

    #[test]
    fn test_frames_before_metadata_are_dropped() {
        let (pipeline, built, rx) = counting_pipeline();

        pipeline
            .on_network_frame(&frame_message((0, 1), b"data", None))
            .unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pipeline.stats().snapshot().messages_received, 1);
        assert_eq!(pipeline.stats().snapshot().frames_received, 0);
    }

    #[test]
    fn test_chunked_frame_reassembly() {
        let (mut pipeline, _built, rx) = counting_pipeline();

        pipeline
            .on_metadata(&metadata_message("vp9", b""))
            .unwrap();
        assert!(pipeline.decoder_exists());

        for chunk in 1..=3u32 {
            pipeline
                .on_network_frame(&frame_message((0, 1), b"part", Some((chunk, 3))))
                .unwrap();
        }

        let image = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(image.id, FrameId::new(0, 1));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        wait_for("frame counter", || {
            pipeline.stats().snapshot().frames_received == 1
        });
    }

    #[test]
    fn test_metadata_churn_rebuilds_decoder_once() {
        let (mut pipeline, built, rx) = counting_pipeline();

        pipeline.on_metadata(&metadata_message("a", b"1")).unwrap();
        pipeline
            .on_network_frame(&frame_message((0, 1), b"f1", None))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Identical metadata: decoder untouched.
        pipeline.on_metadata(&metadata_message("a", b"1")).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        // Changed metadata: exactly one rebuild.
        pipeline.on_metadata(&metadata_message("b", b"2")).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);

        pipeline
            .on_network_frame(&frame_message((0, 2), b"f2", None))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(pipeline.stats().snapshot().metadata_received, 3);
        assert_eq!(pipeline.stats().snapshot().frames_received, 2);
    }

    #[test]
    fn test_overload_sheds_without_blocking() {
        // A gate holds the decoder worker inside its first item so the queue
        // genuinely fills.
        struct GatedFactory {
            gate: Arc<std::sync::Mutex<()>>,
        }
        struct GatedDecoder {
            gate: Arc<std::sync::Mutex<()>>,
        }
        impl DecoderFactory for GatedFactory {
            fn create(&self, _spec: &ImageSpec) -> crate::Result<Box<dyn Decoder>> {
                Ok(Box::new(GatedDecoder {
                    gate: Arc::clone(&self.gate),
                }))
            }
        }
        impl Decoder for GatedDecoder {
            fn set_metadata(&mut self, _m: &CodecMetadata) -> crate::Result<()> {
                Ok(())
            }
            fn process_chunk(&mut self, _id: FrameId, _c: &[u8], _i: u32, _t: u32) -> crate::Result<()> {
                drop(self.gate.lock().map_err(|_| Error::Codec("gate poisoned".into()))?);
                Ok(())
            }
            fn frame_ready(&self) -> bool {
                false
            }
            fn take_image(&mut self) -> Option<DecodedImage> {
                None
            }
        }

        let gate = Arc::new(std::sync::Mutex::new(()));
        let factory = Arc::new(GatedFactory {
            gate: Arc::clone(&gate),
        });
        let stats = Arc::new(PipelineStats::default());
        let mut pipeline = FramePipeline::new(
            ImageSpec::new(2, 2),
            factory,
            Arc::clone(&stats),
            |_image| {},
        );
        pipeline.on_metadata(&metadata_message("a", b"")).unwrap();

        let held = gate.lock().unwrap();
        let started = Instant::now();
        for n in 0..2000u64 {
            pipeline
                .on_network_frame(&frame_message((0, n), b"x", None))
                .unwrap();
        }
        // The producer shed instead of blocking on the stalled worker.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stats.snapshot().network_buffer_dropped >= 1);

        drop(held);
        wait_for("queue drain", || pipeline.network_queue_len() == 0);
    }

    #[test]
    fn test_decode_failure_keeps_pipeline_alive() {
        let spec = ImageSpec::new(2, 2).pixel_format(PixelFormat::Gray8);
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel();
        let mut pipeline = FramePipeline::new(
            spec,
            Arc::new(IdentityDecoderFactory),
            Arc::clone(&stats),
            move |image| {
                tx.send(image).unwrap();
            },
        );

        pipeline
            .on_metadata(&metadata_message("raw", &raw_codec_data(2, 2)))
            .unwrap();

        // Wrong size: the decoder reports the failure in-band.
        pipeline
            .on_network_frame(&frame_message((0, 1), b"abc", None))
            .unwrap();
        wait_for("decode error counter", || {
            stats.snapshot().decode_errors == 1
        });

        // The next well-formed frame still decodes.
        pipeline
            .on_network_frame(&frame_message((0, 2), &[9, 9, 9, 9], None))
            .unwrap();
        let image = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(image.id, FrameId::new(0, 2));
        assert_eq!(&image.pixels[..], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_malformed_frame_counted_and_dropped() {
        let (mut pipeline, _built, _rx) = counting_pipeline();
        pipeline.on_metadata(&metadata_message("a", b"")).unwrap();

        pipeline
            .on_network_frame(&json!({ "d": "!!!", "i": [0, 1] }))
            .unwrap();

        assert_eq!(pipeline.stats().snapshot().invalid_messages, 1);
    }
}
