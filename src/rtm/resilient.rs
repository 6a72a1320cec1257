//! Restart-and-resubscribe wrapper.
//!
//! [`ResilientClient`] owns the current protocol client plus the list of
//! subscriptions the application has declared. When the connection dies it
//! builds a fresh inner client from its factory and, if the application had
//! started it, starts the new client and replays every declared subscription
//! with the options it was declared with. Publishes written before the
//! failure and not yet acked are lost; callers needing delivery guarantees
//! must re-publish on their own.

use std::rc::Rc;

use serde_json::Value;

use super::{RequestCallbacksRef, SubscriptionHandler, SubscriptionId, SubscriptionOptions};
use crate::error::{ErrorKind, Result};

/// Operations shared by the concrete protocol client and test doubles.
pub trait Client {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn publish(
        &mut self,
        channel: &str,
        message: Value,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64>;

    fn subscribe(
        &mut self,
        channel: &str,
        sub: SubscriptionId,
        handler: Rc<dyn SubscriptionHandler>,
        callbacks: Option<RequestCallbacksRef>,
        options: &SubscriptionOptions,
    ) -> Option<u64>;

    fn unsubscribe(&mut self, sub: SubscriptionId, callbacks: Option<RequestCallbacksRef>)
        -> Option<u64>;
}

impl Client for super::client::RtmClient {
    fn start(&mut self) -> Result<()> {
        super::client::RtmClient::start(self)
    }

    fn stop(&mut self) -> Result<()> {
        super::client::RtmClient::stop(self)
    }

    fn publish(
        &mut self,
        channel: &str,
        message: Value,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        super::client::RtmClient::publish(self, channel, message, callbacks)
    }

    fn subscribe(
        &mut self,
        channel: &str,
        sub: SubscriptionId,
        handler: Rc<dyn SubscriptionHandler>,
        callbacks: Option<RequestCallbacksRef>,
        options: &SubscriptionOptions,
    ) -> Option<u64> {
        super::client::RtmClient::subscribe(self, channel, sub, handler, callbacks, options)
    }

    fn unsubscribe(
        &mut self,
        sub: SubscriptionId,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        super::client::RtmClient::unsubscribe(self, sub, callbacks)
    }
}

/// A subscription as the application declared it, kept for replay.
struct DeclaredSubscription {
    channel: String,
    sub: SubscriptionId,
    handler: Rc<dyn SubscriptionHandler>,
    callbacks: Option<RequestCallbacksRef>,
    options: SubscriptionOptions,
}

/// Client wrapper that survives connection loss.
pub struct ResilientClient<C: Client> {
    factory: Box<dyn FnMut() -> C>,
    inner: Option<C>,
    declared: Vec<DeclaredSubscription>,
    started: bool,
}

impl<C: Client> ResilientClient<C> {
    pub fn new(factory: Box<dyn FnMut() -> C>) -> Self {
        Self {
            factory,
            inner: None,
            declared: Vec::new(),
            started: false,
        }
    }

    /// Access the current inner client. Panics before the first `start`.
    pub fn inner_mut(&mut self) -> &mut C {
        self.inner.as_mut().expect("client was never started")
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn declared_count(&self) -> usize {
        self.declared.len()
    }

    /// Build the inner client if needed and start it.
    pub fn start(&mut self) -> Result<()> {
        if self.inner.is_none() {
            tracing::debug!("creating new client");
            self.inner = Some((self.factory)());
        }
        self.started = true;
        self.inner_mut().start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.inner_mut().stop()
    }

    /// React to a connection-level failure: rebuild the inner client and,
    /// if started, start it and replay every declared subscription.
    pub fn on_error(&mut self, kind: ErrorKind) -> Result<()> {
        tracing::info!(kind = %kind, "restarting rtm client after error");
        self.restart()
    }

    fn restart(&mut self) -> Result<()> {
        tracing::debug!("creating new client");
        let mut inner = (self.factory)();

        if self.started {
            tracing::debug!("starting new client");
            inner.start()?;

            tracing::debug!(count = self.declared.len(), "restoring subscriptions");
            for d in &self.declared {
                inner.subscribe(
                    &d.channel,
                    d.sub,
                    Rc::clone(&d.handler),
                    d.callbacks.clone(),
                    &d.options,
                );
            }
            tracing::debug!("client restart done");
        }

        self.inner = Some(inner);
        Ok(())
    }

    pub fn publish(
        &mut self,
        channel: &str,
        message: Value,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        self.inner_mut().publish(channel, message, callbacks)
    }

    /// Subscribe and remember the declaration for replay after restarts.
    pub fn subscribe(
        &mut self,
        channel: &str,
        sub: SubscriptionId,
        handler: Rc<dyn SubscriptionHandler>,
        callbacks: Option<RequestCallbacksRef>,
        options: &SubscriptionOptions,
    ) -> Option<u64> {
        self.declared.push(DeclaredSubscription {
            channel: channel.to_string(),
            sub,
            handler: Rc::clone(&handler),
            callbacks: callbacks.clone(),
            options: *options,
        });
        self.inner_mut()
            .subscribe(channel, sub, handler, callbacks, options)
    }

    /// Unsubscribe and drop the declaration so a later restart does not
    /// resurrect the channel.
    pub fn unsubscribe(
        &mut self,
        sub: SubscriptionId,
        callbacks: Option<RequestCallbacksRef>,
    ) -> Option<u64> {
        let id = self.inner_mut().unsubscribe(sub, callbacks);
        self.declared.retain(|d| d.sub != sub);
        id
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::error::Result;
    use crate::rtm::ChannelMessage;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Start,
        Stop,
        Publish(String),
        Subscribe(String, SubscriptionOptions),
        Unsubscribe(SubscriptionId),
    }

    struct MockClient {
        serial: u32,
        ops: Rc<RefCell<Vec<(u32, Op)>>>,
    }

    impl Client for MockClient {
        fn start(&mut self) -> Result<()> {
            self.ops.borrow_mut().push((self.serial, Op::Start));
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.ops.borrow_mut().push((self.serial, Op::Stop));
            Ok(())
        }

        fn publish(
            &mut self,
            channel: &str,
            _message: Value,
            _callbacks: Option<RequestCallbacksRef>,
        ) -> Option<u64> {
            self.ops
                .borrow_mut()
                .push((self.serial, Op::Publish(channel.to_string())));
            Some(1)
        }

        fn subscribe(
            &mut self,
            channel: &str,
            _sub: SubscriptionId,
            _handler: Rc<dyn SubscriptionHandler>,
            _callbacks: Option<RequestCallbacksRef>,
            options: &SubscriptionOptions,
        ) -> Option<u64> {
            self.ops
                .borrow_mut()
                .push((self.serial, Op::Subscribe(channel.to_string(), *options)));
            Some(2)
        }

        fn unsubscribe(
            &mut self,
            sub: SubscriptionId,
            _callbacks: Option<RequestCallbacksRef>,
        ) -> Option<u64> {
            self.ops.borrow_mut().push((self.serial, Op::Unsubscribe(sub)));
            Some(3)
        }
    }

    struct NullHandler;

    impl SubscriptionHandler for NullHandler {
        fn on_data(&self, _: SubscriptionId, _: ChannelMessage) -> Result<()> {
            Ok(())
        }

        fn on_error(&self, _: SubscriptionId, _: ErrorKind) -> Result<()> {
            Ok(())
        }
    }

    fn mock_resilient() -> (ResilientClient<MockClient>, Rc<RefCell<Vec<(u32, Op)>>>) {
        let ops: Rc<RefCell<Vec<(u32, Op)>>> = Rc::new(RefCell::new(Vec::new()));
        let ops_for_factory = Rc::clone(&ops);
        let serial = Rc::new(RefCell::new(0u32));
        let client = ResilientClient::new(Box::new(move || {
            *serial.borrow_mut() += 1;
            MockClient {
                serial: *serial.borrow(),
                ops: Rc::clone(&ops_for_factory),
            }
        }));
        (client, ops)
    }

    #[test]
    fn test_start_builds_inner_once() {
        let (mut client, ops) = mock_resilient();
        client.start().unwrap();
        client.publish("c", json!({}), None);

        let ops = ops.borrow();
        assert_eq!(*ops, vec![(1, Op::Start), (1, Op::Publish("c".into()))]);
    }

    #[test]
    fn test_error_rebuilds_and_replays_subscriptions() {
        let (mut client, ops) = mock_resilient();
        client.start().unwrap();

        let frames = SubscriptionId::next();
        let meta = SubscriptionId::next();
        let meta_options = SubscriptionOptions::with_history_count(1);
        client.subscribe("b/frames", frames, Rc::new(NullHandler), None, &SubscriptionOptions::default());
        client.subscribe("b/metadata", meta, Rc::new(NullHandler), None, &meta_options);

        client.on_error(ErrorKind::Transport).unwrap();

        let ops = ops.borrow();
        // The second client starts and re-subscribes both channels with the
        // options they were declared with.
        assert_eq!(
            ops[3..],
            [
                (2, Op::Start),
                (2, Op::Subscribe("b/frames".into(), SubscriptionOptions::default())),
                (2, Op::Subscribe("b/metadata".into(), meta_options)),
            ]
        );
    }

    #[test]
    fn test_error_before_start_only_rebuilds() {
        let (mut client, ops) = mock_resilient();
        client.start().unwrap();
        client.stop().unwrap();

        client.on_error(ErrorKind::Transport).unwrap();

        let ops = ops.borrow();
        assert_eq!(*ops, vec![(1, Op::Start), (1, Op::Stop)]);
    }

    #[test]
    fn test_unsubscribe_prunes_declaration() {
        let (mut client, ops) = mock_resilient();
        client.start().unwrap();

        let keep = SubscriptionId::next();
        let drop = SubscriptionId::next();
        client.subscribe("keep", keep, Rc::new(NullHandler), None, &SubscriptionOptions::default());
        client.subscribe("drop", drop, Rc::new(NullHandler), None, &SubscriptionOptions::default());
        client.unsubscribe(drop, None);
        assert_eq!(client.declared_count(), 1);

        client.on_error(ErrorKind::Transport).unwrap();

        let ops = ops.borrow();
        let second_client_subs: Vec<String> = ops
            .iter()
            .filter_map(|(serial, op)| match op {
                Op::Subscribe(channel, _) if *serial == 2 => Some(channel.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(second_client_subs, vec!["keep".to_string()]);
    }
}
