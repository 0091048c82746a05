use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc::{Sender, UnboundedSender};
use tungstenite::protocol::Message as WsMessage;

use crate::relay::message::Directive;
use crate::relay::subscription::SubscriptionSet;

/// Opaque identity of one connection, e.g. `subscriber-<uuid>`.
pub type PeerId = String;

/// A publisher connected to the frontend endpoint.
#[derive(Debug)]
pub struct Publisher {
    pub id: PeerId,

    /// Directives headed to the publisher. Unbounded so that forwarding
    /// never blocks; the connection drains it into `PendingDirectives`.
    pub sender: UnboundedSender<Directive>,
}

impl Publisher {
    pub fn new(sender: UnboundedSender<Directive>) -> Self {
        Self {
            id: format!("publisher-{}", uuid::Uuid::new_v4()),
            sender,
        }
    }
}

/// A subscriber connected to the backend endpoint.
#[derive(Debug)]
pub struct Subscriber {
    pub id: PeerId,

    /// Bounded queue of messages headed to the subscriber.
    pub sender: Sender<WsMessage>,

    pub subscriptions: SubscriptionSet,
}

impl Subscriber {
    pub fn new(sender: Sender<WsMessage>) -> Self {
        Self {
            id: format!("subscriber-{}", uuid::Uuid::new_v4()),
            sender,
            subscriptions: SubscriptionSet::new(),
        }
    }
}

/// Directives waiting to be written to one publisher.
///
/// At most one entry is kept per prefix. A directive arriving for a prefix
/// that still has the opposite one queued cancels it, since the publisher
/// never saw the state change. The backlog is therefore bounded by the
/// number of prefixes whose state differs from what the publisher was told,
/// however long the publisher stops reading.
#[derive(Debug, Default)]
pub struct PendingDirectives {
    queue: BTreeMap<u64, Directive>,
    by_prefix: HashMap<Vec<u8>, u64>,
    next_seq: u64,
}

impl PendingDirectives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, directive: Directive) {
        if let Some(seq) = self.by_prefix.remove(directive.prefix()) {
            let queued = self.queue.remove(&seq);
            if queued.as_ref() != Some(&directive) {
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_prefix.insert(directive.prefix().to_vec(), seq);
        self.queue.insert(seq, directive);
    }

    /// Oldest pending directive.
    pub fn pop(&mut self) -> Option<Directive> {
        let (_, directive) = self.queue.pop_first()?;
        self.by_prefix.remove(directive.prefix());
        Some(directive)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
