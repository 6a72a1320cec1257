//! RTM pub/sub protocol client.
//!
//! Layering, bottom up:
//!
//! - [`pdu`]: PDU model and the JSON/CBOR wire codec
//! - [`subscriptions`] / [`requests`]: channel/handle registry and
//!   outstanding-request correlation
//! - [`client`]: the protocol core, holding the state machine, the outbound
//!   write FIFO with a single write in flight, the inbound demultiplexer,
//!   and ping/pong accounting
//! - [`transport`]: the WebSocket shell (connect, TLS, upgrade, pump)
//! - [`resilient`]: restart-and-resubscribe wrapper around the core
//!
//! The protocol core is deliberately socket-free: one reactor task owns it
//! and drives it from transport events, which keeps every ordering invariant
//! single-threaded and testable.

pub mod client;
pub mod pdu;
pub mod requests;
pub mod resilient;
pub mod subscriptions;
pub mod transport;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result};

pub use client::{ClientState, ReadDisposition, RtmClient, WriteItem, WriteOutcome};
pub use pdu::{Pdu, WireFormat};
pub use resilient::{Client, ResilientClient};
pub use transport::{TransportEvent, WsConnection};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable opaque identity of one subscription.
///
/// Allocated by the application before subscribing and passed back to
/// unsubscribe; the registry keys on this value, so it stays valid however
/// entries move in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// History replay requested at subscribe time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct History {
    pub age: Option<u64>,
    pub count: Option<u64>,
}

/// Options attached to a subscription request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub history: History,
}

impl SubscriptionOptions {
    /// Deliver the latest `count` retained messages on subscribe.
    pub fn with_history_count(count: u64) -> Self {
        Self {
            history: History {
                age: None,
                count: Some(count),
            },
        }
    }
}

/// One message delivered on a subscription, stamped with its arrival time.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub value: Value,
    pub arrival: Instant,
}

/// Callbacks attached to a subscription for its lifetime.
///
/// Invoked on the reactor task. An `Err` return unwinds to the reactor loop,
/// which rebuilds the connection.
pub trait SubscriptionHandler {
    fn on_data(&self, sub: SubscriptionId, message: ChannelMessage) -> Result<()>;

    fn on_error(&self, sub: SubscriptionId, kind: ErrorKind) -> Result<()>;
}

/// Per-request acknowledgement callbacks.
pub trait RequestCallbacks {
    fn on_ok(&mut self) {}

    fn on_error(&mut self, kind: ErrorKind) {
        let _ = kind;
    }
}

/// Shared, reactor-local handle to request callbacks. Shared so the
/// resilient wrapper can replay a subscribe with the callbacks it was
/// declared with.
pub type RequestCallbacksRef = Rc<RefCell<dyn RequestCallbacks>>;

/// Work posted onto the reactor task from other threads.
#[derive(Debug)]
pub enum ClientCommand {
    Publish { channel: String, message: Value },
}

/// Cloneable, thread-safe handle that forwards publishes to the reactor.
///
/// Worker threads never touch client state; they post through this handle
/// and the reactor loop applies the command in arrival order.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl Publisher {
    pub fn new(tx: mpsc::UnboundedSender<ClientCommand>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, channel: impl Into<String>, message: Value) {
        // A dropped receiver means the reactor is gone; nothing to do.
        let _ = self.tx.send(ClientCommand::Publish {
            channel: channel.into(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids_are_unique() {
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_history_options() {
        let options = SubscriptionOptions::with_history_count(1);
        assert_eq!(options.history.count, Some(1));
        assert_eq!(options.history.age, None);
        assert_ne!(options, SubscriptionOptions::default());
    }

    #[test]
    fn test_publisher_forwards_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = Publisher::new(tx);

        publisher.publish("ch", serde_json::json!({"x": 1}));

        match rx.try_recv().unwrap() {
            ClientCommand::Publish { channel, message } => {
                assert_eq!(channel, "ch");
                assert_eq!(message, serde_json::json!({"x": 1}));
            }
        }
    }
}
