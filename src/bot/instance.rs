//! One bot bound to one channel family.
//!
//! The instance owns the frame pipeline and the three inbound subscriptions
//! (frames, control, metadata with a history depth of one so the latest
//! metadata arrives immediately). Inbound data is routed by subscription
//! handle; outbound messages buffered by callbacks are flushed to the
//! analysis and debug channels through the reactor-bound [`Publisher`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{Bot, BotContext, ChannelNames, MessageKind, QueuedMessage};
use crate::codec::{DecoderFactory, FrameId};
use crate::config::ImageSpec;
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::{FramePipeline, ImageFrame};
use crate::rtm::{
    ChannelMessage, Client, Publisher, SubscriptionHandler, SubscriptionId, SubscriptionOptions,
};
use crate::stats::PipelineStats;

/// A running bot: pipeline, subscriptions, outbound buffer.
pub struct BotInstance {
    channels: ChannelNames,
    frames_sub: SubscriptionId,
    control_sub: SubscriptionId,
    metadata_sub: SubscriptionId,
    pipeline: RefCell<FramePipeline>,
    bot: Arc<Mutex<dyn Bot>>,
    ctx: BotContext,
    publisher: Publisher,
}

impl BotInstance {
    pub fn new<B: Bot + 'static>(
        bot_id: &str,
        base_channel: &str,
        spec: ImageSpec,
        factory: Arc<dyn DecoderFactory>,
        stats: Arc<PipelineStats>,
        publisher: Publisher,
        bot: B,
    ) -> Rc<Self> {
        let channels = ChannelNames::new(base_channel);
        let ctx = BotContext::new(bot_id);
        let bot: Arc<Mutex<dyn Bot>> = Arc::new(Mutex::new(bot));

        // Process-worker body: run the image callback, then flush whatever
        // it queued, stamped with this frame's id.
        let worker_bot = Arc::clone(&bot);
        let worker_ctx = ctx.clone();
        let worker_publisher = publisher.clone();
        let analysis_channel = channels.analysis.clone();
        let debug_channel = channels.debug.clone();
        let on_image = move |frame: ImageFrame| {
            worker_bot.lock().on_image(&worker_ctx, &frame);
            flush_messages(
                &worker_ctx,
                &worker_publisher,
                &analysis_channel,
                &debug_channel,
                Some(frame.id),
            );
        };

        let pipeline = FramePipeline::new(spec, factory, stats, on_image);

        Rc::new(Self {
            channels,
            frames_sub: SubscriptionId::next(),
            control_sub: SubscriptionId::next(),
            metadata_sub: SubscriptionId::next(),
            pipeline: RefCell::new(pipeline),
            bot,
            ctx,
            publisher,
        })
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    pub fn context(&self) -> &BotContext {
        &self.ctx
    }

    /// Deliver the configure command. Any response is buffered as a debug
    /// message and rides along with the first frame-time flush; the client
    /// is not connected yet when this runs.
    pub fn configure(&self, config: Value) {
        let command = super::configure_command(config);
        let response = self.bot.lock().on_control(&self.ctx, command);
        if let Some(response) = response {
            self.ctx.queue_message(MessageKind::Debug, response);
        }
    }

    /// Declare the three subscriptions on a client. Takes the shared handle
    /// because the instance itself is the data callback for all three.
    pub fn subscribe<C: Client>(
        instance: &Rc<Self>,
        client: &mut crate::rtm::ResilientClient<C>,
    ) {
        let handler: Rc<dyn SubscriptionHandler> =
            Rc::clone(instance) as Rc<dyn SubscriptionHandler>;

        client.subscribe(
            &instance.channels.frames,
            instance.frames_sub,
            Rc::clone(&handler),
            None,
            &SubscriptionOptions::default(),
        );
        client.subscribe(
            &instance.channels.control,
            instance.control_sub,
            Rc::clone(&handler),
            None,
            &SubscriptionOptions::default(),
        );
        client.subscribe(
            &instance.channels.metadata,
            instance.metadata_sub,
            handler,
            None,
            &SubscriptionOptions::with_history_count(1),
        );
    }

    /// Pipeline counters, for logging and tests.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(self.pipeline.borrow().stats())
    }

    pub fn decoder_exists(&self) -> bool {
        self.pipeline.borrow().decoder_exists()
    }

    /// Stop the pipeline workers, draining what they hold.
    pub fn close(&self) {
        self.pipeline.borrow_mut().close();
    }

    /// Control payloads may be one command object or an array of them.
    fn on_control_data(&self, value: &Value) -> Result<()> {
        if let Some(commands) = value.as_array() {
            for command in commands {
                self.on_control_data(command)?;
            }
            return Ok(());
        }

        if value.is_object() {
            let response = self.bot.lock().on_control(&self.ctx, value.clone());
            if let Some(response) = response {
                self.ctx.queue_message(MessageKind::Debug, response);
            }
            // Control responses flush immediately, with no frame id.
            flush_messages(
                &self.ctx,
                &self.publisher,
                &self.channels.analysis,
                &self.channels.debug,
                None,
            );
            return Ok(());
        }

        tracing::error!(payload = %value, "unsupported control message");
        Ok(())
    }
}

impl SubscriptionHandler for BotInstance {
    fn on_data(&self, sub: SubscriptionId, message: ChannelMessage) -> Result<()> {
        if sub == self.metadata_sub {
            self.pipeline.borrow_mut().on_metadata(&message.value)
        } else if sub == self.frames_sub {
            self.pipeline.borrow().on_network_frame(&message.value)
        } else if sub == self.control_sub {
            self.on_control_data(&message.value)
        } else {
            panic!("data for unknown subscription {}", sub.raw());
        }
    }

    fn on_error(&self, sub: SubscriptionId, kind: ErrorKind) -> Result<()> {
        tracing::error!(sub = sub.raw(), kind = %kind, "subscription failure");
        Err(Error::Bot {
            kind,
            message: format!("subscription failure: {kind}"),
        })
    }
}

/// Drain the outbound buffer: stamp each message with the processed frame id
/// when one is supplied, then publish per kind.
fn flush_messages(
    ctx: &BotContext,
    publisher: &Publisher,
    analysis_channel: &str,
    debug_channel: &str,
    id: Option<FrameId>,
) {
    for QueuedMessage { kind, mut body } in ctx.drain() {
        if let Some(id) = id {
            body["i"] = serde_json::json!([id.hi, id.lo]);
        }
        let channel = match kind {
            MessageKind::Analysis => analysis_channel,
            MessageKind::Debug => debug_channel,
        };
        publisher.publish(channel, body);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::identity::{raw_codec_data, IdentityDecoderFactory};
    use crate::config::PixelFormat;
    use crate::rtm::ClientCommand;

    /// Emits one analysis message per frame and echoes control commands.
    struct EchoBot;

    impl Bot for EchoBot {
        fn on_image(&mut self, ctx: &BotContext, frame: &ImageFrame) {
            ctx.queue_message(
                MessageKind::Analysis,
                json!({ "width": frame.width, "height": frame.height }),
            );
        }

        fn on_control(&mut self, _ctx: &BotContext, command: Value) -> Option<Value> {
            Some(json!({ "echo": command }))
        }
    }

    fn instance() -> (Rc<BotInstance>, mpsc::UnboundedReceiver<ClientCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = BotInstance::new(
            "bot-1",
            "cam",
            ImageSpec::new(2, 2).pixel_format(PixelFormat::Gray8),
            Arc::new(IdentityDecoderFactory),
            Arc::new(PipelineStats::default()),
            Publisher::new(tx),
            EchoBot,
        );
        (instance, rx)
    }

    fn data(sub_value: &Value) -> ChannelMessage {
        ChannelMessage {
            value: sub_value.clone(),
            arrival: Instant::now(),
        }
    }

    fn recv_publish(
        rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
        timeout: Duration,
    ) -> (String, Value) {
        let deadline = Instant::now() + timeout;
        loop {
            match rx.try_recv() {
                Ok(ClientCommand::Publish { channel, message }) => return (channel, message),
                Err(_) => {
                    assert!(Instant::now() < deadline, "timed out waiting for a publish");
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }

    #[test]
    fn test_configure_response_is_buffered_not_flushed() {
        let (instance, mut rx) = instance();

        instance.configure(json!({"threshold": 3}));

        assert_eq!(instance.context().buffered(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_control_object_round_trip() {
        let (instance, mut rx) = instance();

        instance
            .on_data(instance.control_sub, data(&json!({"cmd": "tune"})))
            .unwrap();

        let (channel, message) = recv_publish(&mut rx, Duration::from_secs(1));
        assert_eq!(channel, "cam/debug");
        assert_eq!(message, json!({ "echo": {"cmd": "tune"} }));
        // Control flushes carry no frame id.
        assert!(message.get("i").is_none());
    }

    #[test]
    fn test_control_array_demultiplexes_in_order() {
        let (instance, mut rx) = instance();

        instance
            .on_data(
                instance.control_sub,
                data(&json!([{"cmd": "a"}, {"cmd": "b"}])),
            )
            .unwrap();

        let (_, first) = recv_publish(&mut rx, Duration::from_secs(1));
        let (_, second) = recv_publish(&mut rx, Duration::from_secs(1));
        assert_eq!(first["echo"]["cmd"], "a");
        assert_eq!(second["echo"]["cmd"], "b");
    }

    #[test]
    fn test_unsupported_control_payload_is_ignored() {
        let (instance, mut rx) = instance();

        instance
            .on_data(instance.control_sub, data(&json!("just a string")))
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_flow_stamps_analysis_with_frame_id() {
        let (instance, mut rx) = instance();

        instance
            .on_data(
                instance.metadata_sub,
                data(&json!({
                    "codecName": "raw",
                    "codecData": BASE64.encode(raw_codec_data(2, 2)),
                })),
            )
            .unwrap();
        assert!(instance.decoder_exists());

        instance
            .on_data(
                instance.frames_sub,
                data(&json!({
                    "d": BASE64.encode([7u8, 7, 7, 7]),
                    "i": [0, 5],
                })),
            )
            .unwrap();

        let (channel, message) = recv_publish(&mut rx, Duration::from_secs(5));
        assert_eq!(channel, "cam/analysis");
        assert_eq!(message["width"], 2);
        assert_eq!(message["i"], json!([0, 5]));
    }

    #[test]
    fn test_configure_response_rides_with_first_frame_flush() {
        let (instance, mut rx) = instance();

        instance.configure(json!({"threshold": 3}));
        instance
            .on_data(
                instance.metadata_sub,
                data(&json!({
                    "codecName": "raw",
                    "codecData": BASE64.encode(raw_codec_data(2, 2)),
                })),
            )
            .unwrap();
        instance
            .on_data(
                instance.frames_sub,
                data(&json!({ "d": BASE64.encode([1u8, 2, 3, 4]), "i": [0, 1] })),
            )
            .unwrap();

        // The buffered configure response flushes first, stamped like the
        // rest of the batch, then the frame's own analysis message.
        let (debug_channel, configure_response) = recv_publish(&mut rx, Duration::from_secs(5));
        assert_eq!(debug_channel, "cam/debug");
        assert_eq!(configure_response["echo"]["action"], "configure");
        assert_eq!(configure_response["i"], json!([0, 1]));

        let (analysis_channel, analysis) = recv_publish(&mut rx, Duration::from_secs(5));
        assert_eq!(analysis_channel, "cam/analysis");
        assert_eq!(analysis["i"], json!([0, 1]));
    }

    #[test]
    fn test_subscription_error_propagates_as_bot_error() {
        let (instance, _rx) = instance();

        let result = instance.on_error(instance.frames_sub, ErrorKind::Subscription);
        assert!(matches!(
            result,
            Err(Error::Bot {
                kind: ErrorKind::Subscription,
                ..
            })
        ));
    }

    #[test]
    #[should_panic(expected = "unknown subscription")]
    fn test_unknown_subscription_is_fatal() {
        let (instance, _rx) = instance();
        let _ = instance.on_data(SubscriptionId::next(), data(&json!({})));
    }
}
