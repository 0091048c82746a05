//! Relay engine
//!
//! This module contains the in-memory forwarding state responsible for:
//! - keeping a registry of connected publishers and subscribers
//! - tracking each subscriber's prefixes and the aggregate reference counts
//! - forwarding subscribe/unsubscribe directives to publishers on the first
//!   and last holder of a prefix
//! - fanning published messages out to every matching subscriber
//!
//! Concurrency and usage notes:
//! - The API is synchronous and designed to be held behind a lock
//!   (`SharedRelay`) by the transport layer. Nothing here awaits, so the
//!   lock is never held across network I/O.
//! - Fan-out never blocks: a subscriber whose queue is full loses the new
//!   message (drop-newest) and everybody else is served as usual.

use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::relay::message::{Directive, Message};
use crate::relay::peer::{PeerId, Publisher, Subscriber};
use crate::relay::subscription::AggregateView;
use crate::transport::message::to_ws;
use crate::utils::RelayError;

#[derive(Debug, Default)]
pub struct Relay {
    pub publishers: HashMap<PeerId, Publisher>,
    pub subscribers: HashMap<PeerId, Subscriber>,
    pub aggregate: AggregateView,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher and tell it about every prefix already wanted.
    pub fn register_publisher(&mut self, publisher: Publisher) {
        for prefix in self.aggregate.prefixes() {
            let directive = Directive::Subscribe(prefix.to_vec());
            if publisher.sender.send(directive).is_err() {
                debug!("publisher {} went away during registration", publisher.id);
                break;
            }
        }
        self.publishers.insert(publisher.id.clone(), publisher);
    }

    pub fn remove_publisher(&mut self, publisher_id: &PeerId) {
        self.publishers.remove(publisher_id);
    }

    pub fn register_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.id.clone(), subscriber);
    }

    /// Add `prefix` to a subscriber's set.
    ///
    /// Returns `true` if a subscribe directive was forwarded to publishers,
    /// i.e. this is now the only connection holding the prefix.
    pub fn subscribe(&mut self, subscriber_id: &PeerId, prefix: Vec<u8>) -> bool {
        let Some(subscriber) = self.subscribers.get_mut(subscriber_id) else {
            warn!("subscribe from unknown subscriber {subscriber_id}");
            return false;
        };
        if subscriber.subscriptions.contains(&prefix) {
            return false;
        }
        let first = self.aggregate.acquire(&prefix);
        debug!(
            "{subscriber_id} subscribed to {:?}",
            String::from_utf8_lossy(&prefix)
        );
        subscriber.subscriptions.insert(prefix.clone());
        if first {
            self.forward_upstream(&Directive::Subscribe(prefix));
        }
        first
    }

    /// Remove `prefix` from a subscriber's set.
    ///
    /// Returns `true` if an unsubscribe directive was forwarded to
    /// publishers, i.e. no connection holds the prefix any more.
    pub fn unsubscribe(&mut self, subscriber_id: &PeerId, prefix: &[u8]) -> bool {
        let Some(subscriber) = self.subscribers.get_mut(subscriber_id) else {
            warn!("unsubscribe from unknown subscriber {subscriber_id}");
            return false;
        };
        if !subscriber.subscriptions.remove(prefix) {
            return false;
        }
        debug!(
            "{subscriber_id} unsubscribed from {:?}",
            String::from_utf8_lossy(prefix)
        );
        let last = self.aggregate.release(prefix);
        if last {
            self.forward_upstream(&Directive::Unsubscribe(prefix.to_vec()));
        }
        last
    }

    /// Apply a control frame received on the backend.
    ///
    /// # Errors
    ///
    /// `MalformedControl` if the message is not a control frame; the caller
    /// is expected to close the connection.
    pub fn handle_control(
        &mut self,
        subscriber_id: &PeerId,
        message: &Message,
    ) -> Result<(), RelayError> {
        match Directive::parse(message)? {
            Directive::Subscribe(prefix) => {
                self.subscribe(subscriber_id, prefix);
            }
            Directive::Unsubscribe(prefix) => {
                self.unsubscribe(subscriber_id, &prefix);
            }
        }
        Ok(())
    }

    /// Forward a message to every subscriber holding a matching prefix.
    ///
    /// The message is encoded once and shared. Returns the number of
    /// subscribers it was queued for.
    pub fn publish(&self, message: &Message) -> usize {
        let topic = message.topic();
        let mut encoded: Option<WsMessage> = None;
        let mut delivered = 0;

        for (sub_id, subscriber) in &self.subscribers {
            if !subscriber.subscriptions.matches(topic) {
                continue;
            }
            let ws_msg = encoded.get_or_insert_with(|| to_ws(message)).clone();
            match subscriber.sender.try_send(ws_msg) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("queue full for {sub_id}, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("{sub_id} is closing, message not delivered");
                }
            }
        }
        delivered
    }

    /// Remove a subscriber and release all of its prefixes, forwarding an
    /// unsubscribe for each prefix nobody else holds.
    pub fn cleanup_subscriber(&mut self, subscriber_id: &PeerId) {
        let Some(mut subscriber) = self.subscribers.remove(subscriber_id) else {
            return;
        };

        let released: Vec<Vec<u8>> = subscriber.subscriptions.drain().collect();
        for prefix in released {
            if self.aggregate.release(&prefix) {
                self.forward_upstream(&Directive::Unsubscribe(prefix));
            }
        }

        info!("cleaned up {subscriber_id}");
    }

    fn forward_upstream(&self, directive: &Directive) {
        for (pub_id, publisher) in &self.publishers {
            if let Err(e) = publisher.sender.send(directive.clone()) {
                debug!("failed to forward directive to {pub_id}: {e}");
            }
        }
    }
}
