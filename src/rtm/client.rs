//! RTM protocol core.
//!
//! [`RtmClient`] holds every piece of client state (lifecycle, subscription
//! registry, outstanding requests, outbound write FIFO, ping bookkeeping)
//! and is driven by exactly one reactor task feeding it transport events.
//! It never touches a socket itself: the reactor pulls encoded items out
//! with [`RtmClient::poll_write`], performs the write, and reports back with
//! [`RtmClient::complete_write`]. That split keeps the single-write-in-flight
//! and FIFO ordering invariants in one place and makes them testable without
//! a connection.
//!
//! Protocol violations (unknown action, an ack for an id that was never
//! issued, a pong that echoes an unknown payload, double registration) are
//! programming errors and panic. Runtime conditions such as parse failures
//! and request-level or subscription errors are logged, counted, and routed
//! to the affected callback without tearing the connection down.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::pdu::{self, Pdu, WireFormat, WireMessage};
use super::requests::{next_request_id, RequestKind, RequestRecord, RequestTracker};
use super::subscriptions::{SubscriptionRegistry, SubscriptionStatus};
use super::{
    ChannelMessage, RequestCallbacksRef, SubscriptionHandler, SubscriptionId, SubscriptionOptions,
};
use crate::error::{Error, ErrorKind, Result};
use crate::stats::client as metrics;

/// Client lifecycle. `start` requires `Stopped`; `stop` requires `Running`
/// and parks the client in `PendingStopped` until the outstanding read
/// observes the closed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Running,
    PendingStopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Stopped => write!(f, "STOPPED"),
            ClientState::Running => write!(f, "RUNNING"),
            ClientState::PendingStopped => write!(f, "PENDING_STOPPED"),
        }
    }
}

/// Queued outbound work: either an encoded PDU or a ping.
enum OutboundItem {
    Write { id: u64, message: WireMessage },
    Ping { id: u64 },
}

/// The single write the transport is currently performing.
enum InFlight {
    Write { id: u64 },
    Ping { id: u64 },
}

/// Data handed to the transport for one write.
#[derive(Debug, PartialEq)]
pub enum WriteItem {
    Message(WireMessage),
    Ping(Vec<u8>),
}

/// What completed, so the reactor knows whether to re-arm the ping timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    PingSent,
}

/// How the reactor should react to the read side ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDisposition {
    /// The client asked for this; the stop is now complete.
    Stopped,
    /// The connection died underneath a running client.
    Lost,
}

/// The RTM pub/sub protocol client, minus the socket.
pub struct RtmClient {
    wire: WireFormat,
    state: ClientState,
    subscriptions: SubscriptionRegistry,
    requests: RequestTracker,
    ping_times: HashMap<u64, Instant>,
    pending: VecDeque<OutboundItem>,
    in_flight: Option<InFlight>,
}

impl RtmClient {
    pub fn new(wire: WireFormat) -> Self {
        Self {
            wire,
            state: ClientState::Stopped,
            subscriptions: SubscriptionRegistry::new(),
            requests: RequestTracker::new(),
            ping_times: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClientState::Running
    }

    pub fn wire(&self) -> WireFormat {
        self.wire
    }

    /// Transition `Stopped → Running`. The transport must already be
    /// connected; the reactor arms the ping timer right after this.
    pub fn start(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            ClientState::Stopped,
            "start requires a stopped client"
        );
        self.state = ClientState::Running;
        metrics::CLIENT_STARTS.inc();
        tracing::info!("rtm client running");
        Ok(())
    }

    /// Transition `Running → PendingStopped`. The reactor cancels the ping
    /// timer and closes the socket; the read side then finishes the stop.
    pub fn stop(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            ClientState::Running,
            "stop requires a running client"
        );
        tracing::info!("stopping rtm client");
        self.state = ClientState::PendingStopped;
        Ok(())
    }

    /// Publish a message. Returns the request id, or `None` when the client
    /// is shutting down and the request was dropped.
    pub fn publish(
        &mut self,
        channel: &str,
        message: Value,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        if !self.guard_running("publish", channel) {
            return None;
        }

        let id = next_request_id();
        let request = pdu::publish_pdu(id, channel, message);
        let message = self.encode_or_drop(&request)?;

        self.requests.insert(
            id,
            RequestRecord {
                kind: RequestKind::Publish,
                channel: channel.to_string(),
                pdu: request,
                issued_at: Instant::now(),
                wire_bytes: message.len(),
                callbacks,
            },
        );
        self.enqueue(OutboundItem::Write { id, message });
        Some(id)
    }

    /// Subscribe a handle to a channel. The registry entry is created
    /// immediately in `PendingSubscribe`; the ack moves it to `Current`.
    pub fn subscribe(
        &mut self,
        channel: &str,
        sub: SubscriptionId,
        handler: Rc<dyn SubscriptionHandler>,
        callbacks: Option<RequestCallbacksRef>,
        options: &SubscriptionOptions,
    ) -> Option<u64> {
        if !self.guard_running("subscribe", channel) {
            return None;
        }

        let id = next_request_id();
        let request = pdu::subscribe_pdu(id, channel, options);
        let message = self.encode_or_drop(&request)?;

        self.subscriptions.add(channel, sub, handler, id);
        self.requests.insert(
            id,
            RequestRecord {
                kind: RequestKind::Subscribe,
                channel: channel.to_string(),
                pdu: request,
                issued_at: Instant::now(),
                wire_bytes: message.len(),
                callbacks,
            },
        );
        self.enqueue(OutboundItem::Write { id, message });
        Some(id)
    }

    /// Unsubscribe a previously subscribed handle. Panics if the handle is
    /// unknown.
    pub fn unsubscribe(
        &mut self,
        sub: SubscriptionId,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        if !self.guard_running("unsubscribe", "") {
            return None;
        }

        let id = next_request_id();
        let channel = {
            let entry = self
                .subscriptions
                .find_by_sub_mut(sub)
                .unwrap_or_else(|| panic!("unsubscribe for unknown handle {}", sub.raw()));
            entry.status = SubscriptionStatus::PendingUnsubscribe;
            entry.pending_request_id = Some(id);
            entry.channel.clone()
        };

        let request = pdu::unsubscribe_pdu(id, &channel);
        let message = self.encode_or_drop(&request)?;

        self.requests.insert(
            id,
            RequestRecord {
                kind: RequestKind::Unsubscribe,
                channel,
                pdu: request,
                issued_at: Instant::now(),
                wire_bytes: message.len(),
                callbacks,
            },
        );
        self.enqueue(OutboundItem::Write { id, message });
        Some(id)
    }

    /// Queue a ping carrying a fresh request id as its payload. No-op
    /// outside `Running`.
    pub fn enqueue_ping(&mut self) -> Option<u64> {
        if self.state != ClientState::Running {
            return None;
        }
        let id = next_request_id();
        self.ping_times.insert(id, Instant::now());
        self.enqueue(OutboundItem::Ping { id });
        Some(id)
    }

    /// Hand the next outbound item to the transport. Returns `None` while a
    /// write is already in flight or the queue is empty; this is the only
    /// place enforcing byte ordering on the socket.
    pub fn poll_write(&mut self) -> Option<WriteItem> {
        if self.in_flight.is_some() {
            return None;
        }
        let item = self.pending.pop_front()?;
        metrics::PENDING_WRITES.set(self.pending.len() as i64);

        match item {
            OutboundItem::Write { id, message } => {
                self.in_flight = Some(InFlight::Write { id });
                Some(WriteItem::Message(message))
            }
            OutboundItem::Ping { id } => {
                self.in_flight = Some(InFlight::Ping { id });
                Some(WriteItem::Ping(id.to_string().into_bytes()))
            }
        }
    }

    /// Report the result of the write handed out by [`Self::poll_write`].
    ///
    /// On a failed data write the per-request callback receives the
    /// kind-specific error and the request record is dropped. A failure
    /// while `Running` additionally surfaces as a transport error so the
    /// resilient layer can restart; failures during shutdown are ignored.
    pub fn complete_write(&mut self, result: Result<()>) -> Result<WriteOutcome> {
        let flight = self
            .in_flight
            .take()
            .expect("write completion without a write in flight");

        match flight {
            InFlight::Write { id } => {
                if let Some(record) = self.requests.get(id) {
                    metrics::WRITE_DELAY_MICROSECONDS
                        .observe(record.issued_at.elapsed().as_micros() as f64);
                }

                match result {
                    Ok(()) => {
                        if let Some(record) = self.requests.get(id) {
                            metrics::BYTES_WRITTEN.inc_by(record.wire_bytes as u64);
                            if record.kind == RequestKind::Publish {
                                metrics::MESSAGES_SENT
                                    .with_label_values(&[record.channel.as_str()])
                                    .inc();
                                metrics::MESSAGES_SENT_BYTES
                                    .with_label_values(&[record.channel.as_str()])
                                    .inc_by(record.wire_bytes as u64);
                            }
                        }
                        Ok(WriteOutcome::Sent)
                    }
                    Err(e) => {
                        metrics::CLIENT_ERRORS.with_label_values(&["write"]).inc();
                        if let Some(record) = self.requests.take(id) {
                            tracing::error!(error = %e, pdu = ?record.pdu, "write request failed");
                            let kind = match record.kind {
                                RequestKind::Publish => ErrorKind::Publish,
                                RequestKind::Subscribe => ErrorKind::Subscribe,
                                RequestKind::Unsubscribe => ErrorKind::Unsubscribe,
                            };
                            notify_error(record.callbacks, kind);
                        }
                        self.transport_failure("write", e)
                    }
                }
            }
            InFlight::Ping { id } => match result {
                Ok(()) => {
                    metrics::PINGS_SENT.inc();
                    metrics::LAST_PING_TIME_SECONDS.set(unix_seconds());
                    Ok(WriteOutcome::PingSent)
                }
                Err(e) => {
                    self.ping_times.remove(&id);
                    metrics::CLIENT_ERRORS.with_label_values(&["ping"]).inc();
                    self.transport_failure("ping", e)
                }
            },
        }
    }

    /// Feed one inbound WebSocket payload.
    ///
    /// Undecodable payloads are logged, counted, and dropped without
    /// touching the connection.
    pub fn handle_payload(&mut self, payload: &[u8], arrival: Instant) -> Result<()> {
        metrics::BYTES_READ.inc_by(payload.len() as u64);

        let pdu = match self.wire.decode(payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                tracing::error!(error = %e, "inbound message could not be decoded");
                metrics::CLIENT_ERRORS.with_label_values(&["parse"]).inc();
                return Ok(());
            }
        };

        self.process_pdu(pdu, payload.len(), arrival)
    }

    /// Demultiplex one inbound PDU by action.
    pub fn process_pdu(&mut self, pdu: Pdu, byte_size: usize, arrival: Instant) -> Result<()> {
        metrics::ACTIONS_RECEIVED
            .with_label_values(&[pdu.action.as_str()])
            .inc();

        match pdu.action.as_str() {
            pdu::ACTION_SUBSCRIPTION_DATA => {
                let channel = subscription_channel(&pdu);
                let (sub, handler) = self.subscription_target(&channel, &pdu);

                let messages = pdu
                    .body
                    .get("messages")
                    .and_then(Value::as_array)
                    .unwrap_or_else(|| panic!("subscription data without messages: {pdu:?}"));

                metrics::MESSAGES_RECEIVED
                    .with_label_values(&[channel.as_str()])
                    .inc();
                metrics::MESSAGES_RECEIVED_BYTES
                    .with_label_values(&[channel.as_str()])
                    .inc_by(byte_size as u64);
                metrics::MESSAGES_IN_PDU.observe(messages.len() as f64);

                for message in messages {
                    handler.on_data(
                        sub,
                        ChannelMessage {
                            value: message.clone(),
                            arrival,
                        },
                    )?;
                }
            }
            pdu::ACTION_SUBSCRIPTION_ERROR => {
                tracing::error!(pdu = ?pdu, "subscription error");
                metrics::SUBSCRIPTION_ERRORS.inc();
                let channel = subscription_channel(&pdu);
                let (sub, handler) = self.subscription_target(&channel, &pdu);
                // The subscription itself stays registered.
                handler.on_error(sub, ErrorKind::Subscription)?;
            }
            pdu::ACTION_PUBLISH_OK => {
                let record = self.confirm(&pdu, arrival);
                notify_ok(record.callbacks);
            }
            pdu::ACTION_PUBLISH_ERROR => {
                tracing::error!(pdu = ?pdu, "publish error");
                metrics::PUBLISH_ERRORS.inc();
                let record = self.confirm(&pdu, arrival);
                notify_error(record.callbacks, ErrorKind::Publish);
            }
            pdu::ACTION_SUBSCRIBE_OK => {
                let record = self.confirm(&pdu, arrival);
                if let Some(entry) = self.subscriptions.find_by_channel_mut(&record.channel) {
                    entry.status = SubscriptionStatus::Current;
                    entry.pending_request_id = None;
                }
                notify_ok(record.callbacks);
            }
            pdu::ACTION_SUBSCRIBE_ERROR => {
                tracing::error!(pdu = ?pdu, "subscribe error");
                metrics::SUBSCRIBE_ERRORS.inc();
                let record = self.confirm(&pdu, arrival);
                notify_error(record.callbacks, ErrorKind::Subscribe);
                assert!(
                    self.subscriptions.delete_by_channel(&record.channel),
                    "subscribe error for unregistered channel {}",
                    record.channel
                );
            }
            pdu::ACTION_UNSUBSCRIBE_OK => {
                let record = self.confirm(&pdu, arrival);
                notify_ok(record.callbacks);
                assert!(
                    self.subscriptions.delete_by_channel(&record.channel),
                    "unsubscribe ack for unregistered channel {}",
                    record.channel
                );
            }
            pdu::ACTION_UNSUBSCRIBE_ERROR => {
                tracing::error!(pdu = ?pdu, "unsubscribe error");
                metrics::UNSUBSCRIBE_ERRORS.inc();
                let record = self.confirm(&pdu, arrival);
                notify_error(record.callbacks, ErrorKind::Unsubscribe);
                assert!(
                    self.subscriptions.delete_by_channel(&record.channel),
                    "unsubscribe error for unregistered channel {}",
                    record.channel
                );
            }
            pdu::ACTION_GENERAL_ERROR => {
                panic!("protocol failure: {pdu:?}");
            }
            other => {
                panic!("unsupported action {other}: {pdu:?}");
            }
        }

        Ok(())
    }

    /// Handle a pong frame. The payload must echo the decimal id of an
    /// outstanding ping; anything else is a protocol violation.
    pub fn on_pong(&mut self, payload: &[u8]) {
        metrics::LAST_PONG_TIME_SECONDS.set(unix_seconds());

        let id: u64 = std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.parse().ok())
            .unwrap_or_else(|| panic!("invalid pong payload: {payload:?}"));

        let issued = self
            .ping_times
            .remove(&id)
            .unwrap_or_else(|| panic!("unexpected pong id {id}"));

        metrics::PING_LATENCY_MILLIS.observe(issued.elapsed().as_secs_f64() * 1000.0);
    }

    /// React to the read side ending, either because `stop` closed the
    /// socket or because the connection died.
    pub fn on_transport_closed(&mut self) -> ReadDisposition {
        match self.state {
            ClientState::PendingStopped => {
                tracing::info!("read cancelled, stop complete");
                self.finish_stop();
                ReadDisposition::Stopped
            }
            ClientState::Running => {
                metrics::CLIENT_ERRORS.with_label_values(&["read"]).inc();
                ReadDisposition::Lost
            }
            ClientState::Stopped => ReadDisposition::Stopped,
        }
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_write_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn outstanding_pings(&self) -> usize {
        self.ping_times.len()
    }

    fn guard_running(&self, operation: &str, channel: &str) -> bool {
        match self.state {
            ClientState::Running => true,
            ClientState::PendingStopped => {
                tracing::debug!(operation, channel, "client is stopping, request dropped");
                false
            }
            ClientState::Stopped => {
                panic!("{operation} requires a running client (channel {channel:?})")
            }
        }
    }

    fn encode_or_drop(&self, request: &Pdu) -> Option<WireMessage> {
        match self.wire.encode(request) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::error!(error = %e, pdu = ?request, "failed to encode outbound pdu");
                metrics::CLIENT_ERRORS.with_label_values(&["encode"]).inc();
                None
            }
        }
    }

    fn enqueue(&mut self, item: OutboundItem) {
        self.pending.push_back(item);
        metrics::PENDING_WRITES.set(self.pending.len() as i64);
    }

    fn subscription_target(&self, channel: &str, pdu: &Pdu) -> (SubscriptionId, Rc<dyn SubscriptionHandler>) {
        let entry = self
            .subscriptions
            .find_by_channel(channel)
            .unwrap_or_else(|| panic!("no subscription for pdu: {pdu:?}"));
        (entry.sub, Rc::clone(&entry.handler))
    }

    /// Take the request record an acknowledgement refers to. An ack whose id
    /// was never issued is a protocol violation.
    fn confirm(&mut self, pdu: &Pdu, arrival: Instant) -> RequestRecord {
        let id = pdu
            .id
            .unwrap_or_else(|| panic!("acknowledgement without id: {pdu:?}"));
        let record = self
            .requests
            .take(id)
            .unwrap_or_else(|| panic!("unexpected acknowledgement id {id}: {pdu:?}"));

        if record.kind == RequestKind::Publish {
            let latency = arrival
                .saturating_duration_since(record.issued_at)
                .as_secs_f64()
                * 1000.0;
            metrics::PUBLISH_ACK_LATENCY_MILLIS.observe(latency);
            metrics::PUBLISH_INFLIGHT.set(self.requests.len() as i64);
        }
        record
    }

    fn transport_failure(&self, operation: &str, error: Error) -> Result<WriteOutcome> {
        if self.state == ClientState::Running {
            tracing::error!(operation, error = %error, "transport failure");
            Err(Error::Client(ErrorKind::Transport))
        } else {
            tracing::debug!(
                operation,
                state = %self.state,
                error = %error,
                "ignoring transport failure while stopping"
            );
            Ok(WriteOutcome::Sent)
        }
    }

    fn finish_stop(&mut self) {
        self.state = ClientState::Stopped;
        self.subscriptions.clear();
        self.pending.clear();
        self.in_flight = None;
        self.ping_times.clear();
        metrics::PENDING_WRITES.set(0);
    }
}

fn subscription_channel(pdu: &Pdu) -> String {
    pdu.body
        .get("subscription_id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("subscription pdu without subscription_id: {pdu:?}"))
        .to_string()
}

fn notify_ok(callbacks: Option<RequestCallbacksRef>) {
    if let Some(callbacks) = callbacks {
        callbacks.borrow_mut().on_ok();
    }
}

fn notify_error(callbacks: Option<RequestCallbacksRef>, kind: ErrorKind) {
    if let Some(callbacks) = callbacks {
        callbacks.borrow_mut().on_error(kind);
    }
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
