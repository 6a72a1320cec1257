//! Bot-facing surface.
//!
//! A bot is two callbacks: [`Bot::on_image`], invoked on the process worker
//! for every decoded frame, and [`Bot::on_control`], invoked on the reactor
//! for the configure command and for every message on the control channel.
//! Both may emit outbound messages through [`BotContext::queue_message`];
//! queued messages are flushed together after the callback returns, analysis
//! messages stamped with the id of the frame that produced them.

pub mod instance;
pub mod runner;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::pipeline::ImageFrame;

pub use instance::BotInstance;
pub use runner::{BotRuntime, BotRuntimeBuilder};

pub const FRAMES_CHANNEL_SUFFIX: &str = "/frames";
pub const CONTROL_CHANNEL_SUFFIX: &str = "/control";
pub const METADATA_CHANNEL_SUFFIX: &str = "/metadata";
pub const ANALYSIS_CHANNEL_SUFFIX: &str = "/analysis";
pub const DEBUG_CHANNEL_SUFFIX: &str = "/debug";

/// Destination of an outbound bot message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Analysis,
    Debug,
}

/// The channel family derived from one base name.
#[derive(Debug, Clone)]
pub struct ChannelNames {
    pub frames: String,
    pub control: String,
    pub metadata: String,
    pub analysis: String,
    pub debug: String,
}

impl ChannelNames {
    pub fn new(base: &str) -> Self {
        Self {
            frames: format!("{base}{FRAMES_CHANNEL_SUFFIX}"),
            control: format!("{base}{CONTROL_CHANNEL_SUFFIX}"),
            metadata: format!("{base}{METADATA_CHANNEL_SUFFIX}"),
            analysis: format!("{base}{ANALYSIS_CHANNEL_SUFFIX}"),
            debug: format!("{base}{DEBUG_CHANNEL_SUFFIX}"),
        }
    }
}

/// One message waiting in the outbound buffer.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub kind: MessageKind,
    pub body: Value,
}

/// Handle through which bot callbacks emit messages.
///
/// Cloneable and shared between the reactor (control callbacks) and the
/// process worker (image callbacks); the buffer is drained as one batch when
/// the invoking callback returns.
#[derive(Debug, Clone)]
pub struct BotContext {
    bot_id: String,
    buffer: Arc<Mutex<Vec<QueuedMessage>>>,
}

impl BotContext {
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Buffer one outbound message. The body must be an object: the flush
    /// step injects the processed frame id at its top level.
    pub fn queue_message(&self, kind: MessageKind, body: Value) {
        assert!(body.is_object(), "bot message body must be an object");
        self.buffer.lock().push(QueuedMessage { kind, body });
    }

    /// Take every buffered message, leaving the buffer empty.
    pub(crate) fn drain(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut *self.buffer.lock())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

/// The user-supplied bot.
pub trait Bot: Send {
    /// Invoked on the process worker for every decoded frame.
    fn on_image(&mut self, ctx: &BotContext, frame: &ImageFrame);

    /// Invoked on the reactor for the configure command and for control
    /// messages. A returned object is published as a debug message.
    fn on_control(&mut self, ctx: &BotContext, command: Value) -> Option<Value> {
        let _ = (ctx, command);
        None
    }
}

/// Wrap the parsed `--config` payload the way the control channel will see
/// it.
pub fn configure_command(config: Value) -> Value {
    json!({ "action": "configure", "body": config })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_derivation() {
        let names = ChannelNames::new("traffic-cam");

        assert_eq!(names.frames, "traffic-cam/frames");
        assert_eq!(names.control, "traffic-cam/control");
        assert_eq!(names.metadata, "traffic-cam/metadata");
        assert_eq!(names.analysis, "traffic-cam/analysis");
        assert_eq!(names.debug, "traffic-cam/debug");
    }

    #[test]
    fn test_context_buffers_and_drains() {
        let ctx = BotContext::new("bot-1");
        ctx.queue_message(MessageKind::Analysis, json!({"found": 2}));
        ctx.queue_message(MessageKind::Debug, json!({"note": "x"}));
        assert_eq!(ctx.buffered(), 2);

        let drained = ctx.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, MessageKind::Analysis);
        assert_eq!(drained[1].kind, MessageKind::Debug);
        assert_eq!(ctx.buffered(), 0);
    }

    #[test]
    #[should_panic(expected = "must be an object")]
    fn test_non_object_message_body_panics() {
        let ctx = BotContext::new("bot-1");
        ctx.queue_message(MessageKind::Analysis, json!([1, 2, 3]));
    }

    #[test]
    fn test_configure_command_shape() {
        let cmd = configure_command(json!({"threshold": 10}));
        assert_eq!(
            cmd,
            json!({ "action": "configure", "body": {"threshold": 10} })
        );
    }
}
