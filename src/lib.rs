//! Video-bot runtime over the RTM pub/sub protocol.
//!
//! A bot subscribes to a channel family derived from one base name, decodes
//! the encoded video stream arriving on `<base>/frames`, runs a user-supplied
//! callback on every decoded image, and publishes the callback's output to
//! `<base>/analysis` and `<base>/debug`. Bot authors implement the [`Bot`]
//! trait; the runtime owns everything else: the resilient WebSocket client,
//! request/ack correlation, subscription restoration after reconnect, chunked
//! frame reassembly, decoder lifecycle, and load shedding.
//!
//! # Architecture
//!
//! ```text
//!                reactor task (current-thread tokio runtime)
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │  WsConnection ──► RtmClient ──► SubscriptionRegistry         │
//!   │      ▲                │              │                       │
//!   │      │          RequestTracker   BotInstance ── control cb   │
//!   │   write FIFO                         │                       │
//!   └──────────────────────────────────────┼───────────────────────┘
//!                                          ▼ try_send
//!                               decoder worker (thread, cap 1024)
//!                                          ▼ try_send
//!                               process worker (thread, cap 2)
//!                                   image cb + message flush
//! ```
//!
//! Delivery is lossy but ordered: when a queue is full the producer never
//! blocks, frames are dropped and counted, and surviving frames keep their
//! original order.

pub mod bot;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rtm;
pub mod stats;
pub mod worker;

pub use bot::{Bot, BotContext, BotRuntime, MessageKind};
pub use codec::{CodecMetadata, DecodedImage, Decoder, DecoderFactory, FrameId};
pub use config::{ImageSpec, PixelFormat, RtmConfig};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::ImageFrame;
