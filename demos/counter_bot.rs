//! Demo bot: counts bright pixels in every decoded frame.
//!
//! ```text
//! counter_bot --endpoint my.endpoint --appkey KEY --channel cam-7 \
//!     --config '{"threshold": 200}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};

use videobot_rs::codec::identity::IdentityDecoderFactory;
use videobot_rs::pipeline::ImageFrame;
use videobot_rs::rtm::WireFormat;
use videobot_rs::{Bot, BotContext, BotRuntime, ImageSpec, MessageKind, PixelFormat};

#[derive(Parser)]
#[command(about = "Publish bright-pixel counts for a video channel")]
struct Args {
    /// RTM endpoint host
    #[arg(long)]
    endpoint: String,

    /// Application key
    #[arg(long)]
    appkey: String,

    /// Endpoint port
    #[arg(long, default_value = "443")]
    port: String,

    /// Base channel name
    #[arg(long)]
    channel: String,

    /// Bot id
    #[arg(long, default_value = "")]
    id: String,

    /// Inline JSON configuration
    #[arg(long, conflicts_with = "config_file")]
    config: Option<String>,

    /// Path to a JSON configuration file
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use JSON text frames instead of CBOR
    #[arg(long)]
    json: bool,
}

struct CounterBot {
    threshold: u8,
    frames_seen: u64,
}

impl Bot for CounterBot {
    fn on_image(&mut self, ctx: &BotContext, frame: &ImageFrame) {
        self.frames_seen += 1;

        let bright = frame
            .pixels
            .iter()
            .filter(|&&value| value >= self.threshold)
            .count();

        ctx.queue_message(
            MessageKind::Analysis,
            json!({
                "bright": bright,
                "total": frame.pixels.len(),
                "width": frame.width,
                "height": frame.height,
            }),
        );
    }

    fn on_control(&mut self, _ctx: &BotContext, command: Value) -> Option<Value> {
        match command["action"].as_str() {
            Some("configure") => {
                if let Some(threshold) = command["body"]["threshold"].as_u64() {
                    self.threshold = threshold.min(255) as u8;
                }
                Some(json!({ "configured": true, "threshold": self.threshold }))
            }
            Some("status") => Some(json!({ "frames_seen": self.frames_seen })),
            _ => None,
        }
    }
}

type DemoResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn load_config(args: &Args) -> DemoResult<Value> {
    if let Some(inline) = &args.config {
        return serde_json::from_str(inline).map_err(Into::into);
    }
    if let Some(path) = &args.config_file {
        let text = std::fs::read_to_string(path)?;
        return serde_json::from_str(&text).map_err(Into::into);
    }
    Ok(json!({}))
}

fn main() -> DemoResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let runtime = BotRuntime::builder()
        .endpoint(args.endpoint.as_str())
        .port(args.port.as_str())
        .appkey(args.appkey.as_str())
        .channel(args.channel.as_str())
        .bot_id(args.id.as_str())
        .config(config)
        .wire(if args.json {
            WireFormat::Json
        } else {
            WireFormat::Cbor
        })
        .image_spec(ImageSpec::new(320, 240).pixel_format(PixelFormat::Gray8))
        .decoder_factory(Arc::new(IdentityDecoderFactory))
        .build()?;

    let bot = CounterBot {
        threshold: 200,
        frames_seen: 0,
    };

    // One reactor task; client state never leaves it.
    let reactor = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    reactor.block_on(runtime.run_until(bot, async {
        let _ = tokio::signal::ctrl_c().await;
    }))?;

    Ok(())
}
