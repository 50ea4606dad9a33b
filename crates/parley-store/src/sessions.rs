//! Connected sessions and their broadcast subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use parley_shared::event::BroadcastEvent;
use parley_shared::types::{AccountId, CardId, SessionId};
use tokio::sync::mpsc;

/// The caller of an event: a connection acting for one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    pub id: SessionId,
    pub account: AccountId,
}

impl Session {
    pub fn new(account: impl Into<AccountId>) -> Self {
        Self {
            id: SessionId::generate(),
            account: account.into(),
        }
    }
}

struct Subscriber {
    account: AccountId,
    sender: mpsc::UnboundedSender<BroadcastEvent>,
    cards: HashSet<CardId>,
    contexts: bool,
}

impl Subscriber {
    fn wants(&self, event: &BroadcastEvent) -> bool {
        let by_card = event.card().is_some_and(|c| self.cards.contains(c));
        let by_account = self.contexts && event.account() == Some(&self.account);
        by_card || by_account
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<SessionId, Subscriber>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return the receiving end of its broadcasts.
    /// Registering an id again replaces the previous channel.
    pub fn register(&self, session: &Session) -> mpsc::UnboundedReceiver<BroadcastEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            session.id.clone(),
            Subscriber {
                account: session.account.clone(),
                sender: tx,
                cards: HashSet::new(),
                contexts: false,
            },
        );
        tracing::debug!(session = %session.id, account = %session.account, "session registered");
        rx
    }

    pub fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session = %id, "session unregistered");
        }
        removed
    }

    pub fn subscribe_card(&self, id: &SessionId, card: CardId) -> bool {
        match self.lock().get_mut(id) {
            Some(sub) => {
                sub.cards.insert(card);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_card(&self, id: &SessionId, card: &CardId) -> bool {
        self.lock()
            .get_mut(id)
            .is_some_and(|sub| sub.cards.remove(card))
    }

    /// Deliver inbox changes of the session's own account.
    pub fn subscribe_contexts(&self, id: &SessionId) -> bool {
        match self.lock().get_mut(id) {
            Some(sub) => {
                sub.contexts = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `events` to the origin session and to every session subscribed
    /// to their card or account. Sessions whose receiver is gone are pruned.
    pub fn publish(&self, origin: Option<&SessionId>, events: &[BroadcastEvent]) {
        if events.is_empty() {
            return;
        }

        let mut sessions = self.lock();
        let mut closed = Vec::new();

        for (id, sub) in sessions.iter() {
            let is_origin = origin == Some(id);
            for event in events.iter().filter(|e| is_origin || sub.wants(e)) {
                if sub.sender.send(event.clone()).is_err() {
                    closed.push(id.clone());
                    break;
                }
            }
        }

        for id in closed {
            sessions.remove(&id);
            tracing::debug!(session = %id, "pruned closed session");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Subscriber>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::model::Collaborator;

    use super::*;

    fn card_removed(card: &str) -> BroadcastEvent {
        BroadcastEvent::CardRemoved {
            card: CardId::from(card),
        }
    }

    #[test]
    fn card_subscribers_and_origin_receive() {
        let registry = SessionRegistry::new();
        let origin = Session::new("alice");
        let watcher = Session::new("bob");
        let bystander = Session::new("carol");

        let mut origin_rx = registry.register(&origin);
        let mut watcher_rx = registry.register(&watcher);
        let mut bystander_rx = registry.register(&bystander);
        registry.subscribe_card(&watcher.id, CardId::from("C1"));

        registry.publish(Some(&origin.id), &[card_removed("C1")]);

        assert!(origin_rx.try_recv().is_ok());
        assert!(watcher_rx.try_recv().is_ok());
        assert!(bystander_rx.try_recv().is_err());
    }

    #[test]
    fn context_subscribers_get_their_own_account_only() {
        let registry = SessionRegistry::new();
        let bob = Session::new("bob");
        let mut rx = registry.register(&bob);
        registry.subscribe_contexts(&bob.id);

        let for_bob = BroadcastEvent::NotificationsRemoved {
            context: Default::default(),
            account: AccountId::from("bob"),
            ids: vec![],
        };
        let for_carol = BroadcastEvent::NotificationsRemoved {
            context: Default::default(),
            account: AccountId::from("carol"),
            ids: vec![],
        };
        registry.publish(None, &[for_carol, for_bob.clone()]);

        assert_eq!(rx.try_recv().unwrap(), for_bob);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let registry = SessionRegistry::new();
        let gone = Session::new("alice");
        drop(registry.register(&gone));
        registry.subscribe_card(&gone.id, CardId::from("C1"));

        registry.publish(
            None,
            &[BroadcastEvent::CollaboratorsAdded {
                card: CardId::from("C1"),
                collaborators: Vec::<Collaborator>::new(),
            }],
        );
        assert!(registry.is_empty());
    }
}
