//! The bot runtime: construction and the reactor loop.
//!
//! [`BotRuntime`] is built explicitly by `main` and run on a current-thread
//! tokio runtime; that task is the reactor, and it is the only place client
//! state is touched. The loop multiplexes commands posted by worker threads,
//! socket reads, the ping timer, and the shutdown future, and after every
//! step drains the client's outbound FIFO one write at a time.
//!
//! Broken-connection-class failures rebuild the client, replay its
//! subscriptions, and reconnect with exponential backoff; bot-signalled
//! failures rebuild the same way. Any other failure breaks the loop and
//! surfaces to the caller. Shutdown stops the client, closes the socket, and
//! waits for the read side to confirm.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use super::{Bot, BotInstance};
use crate::codec::DecoderFactory;
use crate::config::{ImageSpec, RtmConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::rtm::transport::{TransportEvent, WsConnection};
use crate::rtm::{
    ClientCommand, ClientState, Publisher, ReadDisposition, ResilientClient, RtmClient, WireFormat,
    WriteOutcome,
};
use crate::stats::client as metrics;
use crate::stats::PipelineStats;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Builder for [`BotRuntime`].
pub struct BotRuntimeBuilder {
    endpoint: Option<String>,
    port: String,
    appkey: Option<String>,
    channel: Option<String>,
    bot_id: String,
    config: Value,
    wire: WireFormat,
    ping_interval: Duration,
    spec: ImageSpec,
    factory: Option<Arc<dyn DecoderFactory>>,
}

impl BotRuntimeBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            port: "443".to_string(),
            appkey: None,
            channel: None,
            bot_id: String::new(),
            config: serde_json::json!({}),
            wire: WireFormat::Cbor,
            ping_interval: crate::config::DEFAULT_PING_INTERVAL,
            spec: ImageSpec::new(320, 240),
            factory: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn appkey(mut self, appkey: impl Into<String>) -> Self {
        self.appkey = Some(appkey.into());
        self
    }

    /// Base channel name; the frames/control/metadata/analysis/debug family
    /// is derived from it.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn bot_id(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = bot_id.into();
        self
    }

    /// Parsed `--config` payload, delivered to the bot as the configure
    /// command before the connection opens.
    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn wire(mut self, wire: WireFormat) -> Self {
        self.wire = wire;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn image_spec(mut self, spec: ImageSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn decoder_factory(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<BotRuntime> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| Error::Config("endpoint is required".into()))?;
        let appkey = self
            .appkey
            .ok_or_else(|| Error::Config("appkey is required".into()))?;
        let channel = self
            .channel
            .ok_or_else(|| Error::Config("channel is required".into()))?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Config("decoder factory is required".into()))?;

        let rtm = RtmConfig::new(endpoint, self.port, appkey)
            .wire(self.wire)
            .ping_interval(self.ping_interval);

        Ok(BotRuntime {
            rtm,
            channel,
            bot_id: self.bot_id,
            config: self.config,
            spec: self.spec,
            factory,
        })
    }
}

/// A fully configured bot runtime.
pub struct BotRuntime {
    rtm: RtmConfig,
    channel: String,
    bot_id: String,
    config: Value,
    spec: ImageSpec,
    factory: Arc<dyn DecoderFactory>,
}

enum DriveOutcome {
    /// The client stopped on request.
    Stopped,
    /// The transport died underneath a running client.
    ConnectionLost(Error),
    /// A bot handler signalled failure.
    BotFailed(Error),
}

impl BotRuntime {
    pub fn builder() -> BotRuntimeBuilder {
        BotRuntimeBuilder::new()
    }

    /// Run until the process is killed.
    pub async fn run<B: Bot + 'static>(self, bot: B) -> Result<()> {
        self.run_until(bot, std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves, then stop cleanly.
    pub async fn run_until<B, S>(self, bot: B, shutdown: S) -> Result<()>
    where
        B: Bot + 'static,
        S: Future<Output = ()>,
    {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let publisher = Publisher::new(cmd_tx);
        let stats = Arc::new(PipelineStats::default());

        let instance = BotInstance::new(
            &self.bot_id,
            &self.channel,
            self.spec,
            Arc::clone(&self.factory),
            Arc::clone(&stats),
            publisher,
            bot,
        );
        instance.configure(self.config.clone());

        let wire = self.rtm.wire;
        let mut client: ResilientClient<RtmClient> =
            ResilientClient::new(Box::new(move || RtmClient::new(wire)));

        tokio::pin!(shutdown);
        let mut stopping = false;
        let mut subscribed = false;
        let mut backoff = INITIAL_BACKOFF;

        let result = loop {
            if stopping {
                break Ok(());
            }

            let connected = tokio::select! {
                biased;
                _ = shutdown.as_mut(), if !stopping => {
                    stopping = true;
                    continue;
                }
                connected = WsConnection::connect(&self.rtm) => connected,
            };

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?backoff, "connect failed, retrying");
                    metrics::CLIENT_ERRORS.with_label_values(&["connect"]).inc();
                    tokio::select! {
                        biased;
                        _ = shutdown.as_mut(), if !stopping => { stopping = true; }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            backoff = INITIAL_BACKOFF;

            // A client rebuilt after an error is already running with its
            // subscriptions queued; only a fresh client needs starting.
            if client_needs_start(&mut client, subscribed) {
                client.start()?;
            }
            if !subscribed {
                BotInstance::subscribe(&instance, &mut client);
                subscribed = true;
            }

            let outcome = drive(
                &mut client,
                &mut conn,
                &mut cmd_rx,
                &mut shutdown,
                &mut stopping,
                self.rtm.ping_interval,
            )
            .await;

            match outcome {
                DriveOutcome::Stopped => break Ok(()),
                DriveOutcome::ConnectionLost(e) => {
                    if stopping {
                        break Ok(());
                    }
                    if !e.is_retryable() {
                        tracing::error!(error = %e, "unrecoverable transport failure");
                        break Err(e);
                    }
                    tracing::warn!(error = %e, "connection lost");
                    client.on_error(e.kind())?;
                }
                DriveOutcome::BotFailed(e) => {
                    if !e.is_retryable() {
                        tracing::error!(error = %e, "unrecoverable bot failure");
                        break Err(e);
                    }
                    tracing::error!(error = %e, "bot failure, rebuilding client");
                    client.on_error(e.kind())?;
                }
            }
        };

        instance.close();
        tracing::info!(stats = ?stats.snapshot(), "bot runtime finished");
        result
    }
}

fn client_needs_start(client: &mut ResilientClient<RtmClient>, subscribed: bool) -> bool {
    if !subscribed {
        // First connection: the inner client does not exist yet.
        return true;
    }
    client.inner_mut().state() == ClientState::Stopped
}

/// Multiplex one connection until it stops, dies, or the bot fails.
async fn drive<S>(
    client: &mut ResilientClient<RtmClient>,
    conn: &mut WsConnection,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: &mut Pin<&mut S>,
    stopping: &mut bool,
    ping_interval: Duration,
) -> DriveOutcome
where
    S: Future<Output = ()>,
{
    let ping_sleep = tokio::time::sleep(ping_interval);
    tokio::pin!(ping_sleep);
    let mut ping_armed = true;

    loop {
        // Drain the outbound FIFO, one write in flight at a time.
        while let Some(item) = client.inner_mut().poll_write() {
            let sent = conn.send(item).await;
            match client.inner_mut().complete_write(sent) {
                Ok(WriteOutcome::PingSent) => {
                    // A ping timer only re-arms after its ping went out.
                    ping_sleep
                        .as_mut()
                        .reset(tokio::time::Instant::now() + ping_interval);
                    ping_armed = true;
                }
                Ok(WriteOutcome::Sent) => {}
                Err(e) => return DriveOutcome::ConnectionLost(e),
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.as_mut(), if !*stopping => {
                *stopping = true;
                tracing::info!("shutdown requested");
                if client.inner_mut().is_running() {
                    let _ = client.stop();
                }
                conn.close().await;
                // Keep looping: the read side confirms the stop.
            }
            command = cmd_rx.recv() => {
                if let Some(ClientCommand::Publish { channel, message }) = command {
                    client.publish(&channel, message, None);
                }
            }
            event = conn.next_event() => {
                match event {
                    Ok(TransportEvent::Payload(payload)) => {
                        if let Err(e) = client.inner_mut().handle_payload(&payload, Instant::now()) {
                            return DriveOutcome::BotFailed(e);
                        }
                    }
                    Ok(TransportEvent::Pong(payload)) => {
                        client.inner_mut().on_pong(&payload);
                    }
                    Ok(TransportEvent::Closed) => {
                        return closed_outcome(client, Error::Client(ErrorKind::Transport));
                    }
                    Err(e) => {
                        return closed_outcome(client, e);
                    }
                }
            }
            _ = ping_sleep.as_mut(), if ping_armed && client.inner_mut().is_running() => {
                ping_armed = false;
                client.inner_mut().enqueue_ping();
            }
        }
    }
}

fn closed_outcome(client: &mut ResilientClient<RtmClient>, error: Error) -> DriveOutcome {
    match client.inner_mut().on_transport_closed() {
        ReadDisposition::Stopped => DriveOutcome::Stopped,
        ReadDisposition::Lost => {
            tracing::error!(error = %error, "read side failed");
            DriveOutcome::ConnectionLost(error)
        }
    }
}
