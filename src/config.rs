//! Client and decoder configuration.

use std::time::Duration;

use crate::rtm::pdu::WireFormat;

/// Default interval between WebSocket pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single inbound WebSocket message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100_000;

/// RTM endpoint configuration.
///
/// The client connects to `wss://<endpoint>:<port>/v2?appkey=<appkey>`,
/// negotiating the `cbor` subprotocol when [`WireFormat::Cbor`] is selected.
#[derive(Debug, Clone)]
pub struct RtmConfig {
    /// Host name of the RTM endpoint.
    pub endpoint: String,

    /// TCP port, kept as a string because it is spliced into the URL.
    pub port: String,

    /// Application key, sent as a query parameter on upgrade.
    pub appkey: String,

    /// PDU framing on the wire.
    pub wire: WireFormat,

    /// Interval between pings. A ping timer re-arms only after the previous
    /// ping write completed successfully.
    pub ping_interval: Duration,

    /// Maximum inbound message size accepted from the socket.
    pub max_message_size: usize,
}

impl RtmConfig {
    pub fn new(
        endpoint: impl Into<String>,
        port: impl Into<String>,
        appkey: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: port.into(),
            appkey: appkey.into(),
            wire: WireFormat::Cbor,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set the wire framing.
    pub fn wire(mut self, wire: WireFormat) -> Self {
        self.wire = wire;
        self
    }

    /// Set the ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the maximum inbound message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// URL used for the WebSocket upgrade.
    pub fn url(&self) -> String {
        format!("wss://{}:{}/v2?appkey={}", self.endpoint, self.port, self.appkey)
    }
}

/// Pixel layout of decoded images handed to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }
}

/// Target geometry for decoded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
    /// Requested output width in pixels.
    pub width: u16,

    /// Requested output height in pixels.
    pub height: u16,

    pub pixel_format: PixelFormat,

    /// Preserve the source aspect ratio when scaling to the requested size.
    pub keep_aspect_ratio: bool,
}

impl ImageSpec {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixel_format: PixelFormat::Rgb24,
            keep_aspect_ratio: true,
        }
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn stretch(mut self) -> Self {
        self.keep_aspect_ratio = false;
        self
    }
}
