#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::events::isolate;
use super::traits::MessageHandler;
use crate::types::Message;

/// Handle returned by `subscribe`/`once`, used to unsubscribe.
///
/// Identifiers are allocated in increasing order, so ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscription {
    /// Exact type tag, or [`WILDCARD`](crate::types::WILDCARD)
    filter: String,
    handler: Arc<dyn MessageHandler>,
    once: bool,
}

/// A handler picked for one inbound message.
pub(crate) struct Matched {
    id: SubscriptionId,
    handler: Arc<dyn MessageHandler>,
}

/// Insertion-ordered subscription registry.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, Subscription>,
}

impl SubscriptionTable {
    pub(crate) fn insert(
        &mut self,
        filter: String,
        handler: Arc<dyn MessageHandler>,
        once: bool,
    ) -> SubscriptionId {
        self.next_id = self.next_id.saturating_add(1);
        let id = SubscriptionId(self.next_id);
        self.entries.insert(
            id,
            Subscription {
                filter,
                handler,
                once,
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Handlers selected by `message`, in registration order.
    ///
    /// One-shot subscriptions are removed here, before their handler runs, so they can fire at
    /// most once and are gone even if the handler panics.
    pub(crate) fn take_matching(&mut self, message: &Message) -> Vec<Matched> {
        let mut matched = Vec::new();
        let mut spent = Vec::new();

        for (id, subscription) in &self.entries {
            if message.matches(&subscription.filter) {
                matched.push(Matched {
                    id: *id,
                    handler: Arc::clone(&subscription.handler),
                });
                if subscription.once {
                    spent.push(*id);
                }
            }
        }

        for id in spent {
            self.entries.remove(&id);
        }

        matched
    }
}

/// Invoke each handler in order, isolating panics. Must be called without the engine lock held.
pub(crate) fn dispatch(matched: &[Matched], message: &Message) {
    for Matched { id, handler } in matched {
        if !isolate("subscription handler", || handler.handle(message)) {
            #[cfg(feature = "tracing")]
            tracing::warn!(subscription = %id, msg_type = %message.msg_type, "handler panicked");
            #[cfg(not(feature = "tracing"))]
            let _ = id;
        }
    }
}
