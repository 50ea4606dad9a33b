//! Live queries: a find result kept current by applying broadcasts.
//!
//! Each query runs as a small state machine on its own task. While the
//! initial (or a repeated) find is in flight, incoming broadcasts are
//! queued and replayed on top of the fresh result. Once ready, every
//! broadcast is classified by the query definition into deltas:
//!
//! - `Add` inserts only while the result is below its limit; an add for
//!   a key already present replaces it.
//! - `Remove` from a full result triggers a new find so the window
//!   refills from the source.
//! - `Terminate` clears the result, notifies once and ignores the rest.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parley_shared::event::BroadcastEvent;
use parley_shared::model::{Collaborator, Message, Notification, NotificationContext};
use parley_shared::query::{
    FindCollaboratorsParams, FindMessagesParams, FindNotificationContextsParams,
    FindNotificationsParams, SortOrder,
};
use parley_shared::types::{AccountId, CardId, ContextId, MessageId, NotificationId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{Broadcasts, CommunicationApi};
use crate::error::Result;

/// One change to a live result.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T, K> {
    Add(T),
    /// Replace the item with the same key, if present.
    Update(T),
    Remove(K),
    Terminate,
    Refetch,
}

/// Items kept in query order, addressable by key.
#[derive(Debug, Clone)]
pub struct QueryResult<T, K> {
    entries: Vec<(K, T)>,
}

impl<T, K> Default for QueryResult<T, K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Clone, K: PartialEq> QueryResult<T, K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, t)| t)
    }

    pub fn items(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    fn insert(&mut self, key: K, item: T, cmp: impl Fn(&T, &T) -> Ordering) {
        let at = self
            .entries
            .partition_point(|(_, e)| cmp(e, &item) != Ordering::Greater);
        self.entries.insert(at, (key, item));
    }

    fn remove(&mut self, key: &K) -> Option<T> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(at).1)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A query whose result can be maintained from broadcasts.
#[async_trait]
pub trait QueryDef: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    type Key: Clone + PartialEq + Send + Sync + 'static;

    fn key(&self, item: &Self::Item) -> Self::Key;
    fn compare(&self, a: &Self::Item, b: &Self::Item) -> Ordering;
    fn limit(&self) -> Option<usize>;

    async fn find(&self, api: &dyn CommunicationApi) -> Result<Vec<Self::Item>>;

    /// Deltas implied by `event`; empty when the event is irrelevant.
    fn classify(
        &self,
        event: &BroadcastEvent,
        current: &QueryResult<Self::Item, Self::Key>,
    ) -> Vec<Delta<Self::Item, Self::Key>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveQueryState {
    Initializing { queued: Vec<BroadcastEvent> },
    Ready,
    Terminated,
}

#[derive(Debug)]
enum Command {
    Event(BroadcastEvent),
    Refresh,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Changed,
    Refetch,
    Terminated,
}

type Callback<T> = Box<dyn FnMut(Vec<T>) + Send>;
type PendingFind<T> = BoxFuture<'static, Result<Vec<T>>>;

/// Control side of a running live query.
pub struct LiveQueryHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl LiveQueryHandle {
    /// Feed one broadcast. Returns false once the query has stopped.
    pub fn event(&self, event: BroadcastEvent) -> bool {
        self.commands.send(Command::Event(event)).is_ok()
    }

    /// Discard the current result and find again.
    pub fn refresh(&self) -> bool {
        self.commands.send(Command::Refresh).is_ok()
    }

    /// Detach the callback. A find already in flight still completes and
    /// its result is discarded.
    pub fn unsubscribe(&self) {
        let _ = self.commands.send(Command::Unsubscribe);
    }

    /// Forward a broadcast stream into this query until either side closes.
    pub fn forward(&self, mut broadcasts: Broadcasts) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = broadcasts.recv().await {
                if commands.send(Command::Event(event)).is_err() {
                    break;
                }
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unsubscribe and wait for the task to stop.
    pub async fn close(self) {
        self.unsubscribe();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "live query task failed");
        }
    }
}

pub struct LiveQuery<Q: QueryDef> {
    def: Arc<Q>,
    api: Arc<dyn CommunicationApi>,
    callback: Option<Callback<Q::Item>>,
    result: QueryResult<Q::Item, Q::Key>,
    state: LiveQueryState,
    pending: Option<PendingFind<Q::Item>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<Q: QueryDef> LiveQuery<Q> {
    /// Start the initial find and return a handle to the running query.
    /// `callback` receives the full result after every change.
    pub fn spawn(
        def: Q,
        api: Arc<dyn CommunicationApi>,
        callback: impl FnMut(Vec<Q::Item>) + Send + 'static,
    ) -> LiveQueryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut query = Self {
            def: Arc::new(def),
            api,
            callback: Some(Box::new(callback)),
            result: QueryResult::new(),
            state: LiveQueryState::Initializing { queued: Vec::new() },
            pending: None,
            commands: rx,
        };
        query.pending = Some(query.start_find());
        LiveQueryHandle {
            commands: tx,
            task: tokio::spawn(query.run()),
        }
    }

    fn start_find(&self) -> PendingFind<Q::Item> {
        let def = self.def.clone();
        let api = self.api.clone();
        Box::pin(async move { def.find(api.as_ref()).await })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                found = next_find(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    if !self.on_found(found) {
                        break;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.on_command(command) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("live query stopped");
    }

    fn on_found(&mut self, found: Result<Vec<Q::Item>>) -> bool {
        if self.callback.is_none() {
            tracing::debug!("discarding find result of an unsubscribed query");
            return false;
        }

        let items = found.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "live query find failed, starting empty");
            Vec::new()
        });
        self.result.clear();
        for item in items {
            if self.is_full() {
                break;
            }
            let key = self.def.key(&item);
            let def = &self.def;
            self.result.insert(key, item, |a, b| def.compare(a, b));
        }

        let queued = match std::mem::replace(&mut self.state, LiveQueryState::Ready) {
            LiveQueryState::Initializing { queued } => queued,
            other => {
                self.state = other;
                Vec::new()
            }
        };

        for (i, event) in queued.iter().enumerate() {
            match self.apply(event) {
                Outcome::Refetch => {
                    self.begin_find(queued[i + 1..].to_vec());
                    return true;
                }
                Outcome::Terminated => break,
                Outcome::Changed | Outcome::Unchanged => {}
            }
        }
        self.notify();
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Event(event) => {
                if let LiveQueryState::Initializing { queued } = &mut self.state {
                    queued.push(event);
                } else if self.state == LiveQueryState::Ready {
                    match self.apply(&event) {
                        Outcome::Changed | Outcome::Terminated => self.notify(),
                        Outcome::Refetch => self.begin_find(Vec::new()),
                        Outcome::Unchanged => {}
                    }
                }
            }
            Command::Refresh => match self.state {
                LiveQueryState::Initializing { .. } => self.pending = Some(self.start_find()),
                LiveQueryState::Ready => self.begin_find(Vec::new()),
                LiveQueryState::Terminated => {}
            },
            Command::Unsubscribe => {
                self.callback = None;
                return self.pending.is_some();
            }
        }
        true
    }

    fn begin_find(&mut self, queued: Vec<BroadcastEvent>) {
        self.state = LiveQueryState::Initializing { queued };
        self.pending = Some(self.start_find());
    }

    fn is_full(&self) -> bool {
        self.def.limit().is_some_and(|l| self.result.len() >= l)
    }

    fn apply(&mut self, event: &BroadcastEvent) -> Outcome {
        let deltas = self.def.classify(event, &self.result);
        let mut outcome = Outcome::Unchanged;
        let def = self.def.clone();
        let cmp = |a: &Q::Item, b: &Q::Item| def.compare(a, b);

        for delta in deltas {
            match delta {
                Delta::Add(item) => {
                    let key = def.key(&item);
                    if self.result.remove(&key).is_some() || !self.is_full() {
                        self.result.insert(key, item, cmp);
                        outcome = Outcome::Changed;
                    }
                }
                Delta::Update(item) => {
                    let key = def.key(&item);
                    if self.result.remove(&key).is_some() {
                        self.result.insert(key, item, cmp);
                        outcome = Outcome::Changed;
                    }
                }
                Delta::Remove(key) => {
                    if !self.result.contains(&key) {
                        continue;
                    }
                    if self.is_full() {
                        return Outcome::Refetch;
                    }
                    self.result.remove(&key);
                    outcome = Outcome::Changed;
                }
                Delta::Refetch => return Outcome::Refetch,
                Delta::Terminate => {
                    self.result.clear();
                    self.state = LiveQueryState::Terminated;
                    return Outcome::Terminated;
                }
            }
        }
        outcome
    }

    fn notify(&mut self) {
        if let Some(callback) = &mut self.callback {
            callback(self.result.items());
        }
    }
}

async fn next_find<T>(pending: &mut Option<PendingFind<T>>) -> Result<Vec<T>> {
    match pending {
        Some(find) => find.await,
        None => std::future::pending().await,
    }
}

fn ordered<T: Ord>(order: SortOrder, a: &T, b: &T) -> Ordering {
    match order {
        SortOrder::Ascending => a.cmp(b),
        SortOrder::Descending => b.cmp(a),
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub struct MessagesQuery {
    pub params: FindMessagesParams,
}

impl MessagesQuery {
    pub fn new(params: FindMessagesParams) -> Self {
        Self { params }
    }

    fn accepts(&self, message: &Message) -> bool {
        let p = &self.params;
        p.card.as_ref().map_or(true, |c| c == &message.card)
            && p.id.as_ref().map_or(true, |c| c.matches(&message.id))
            && p.created.as_ref().map_or(true, |c| c.matches(&message.created))
            && p.creator.as_ref().map_or(true, |c| c == &message.creator)
    }
}

#[async_trait]
impl QueryDef for MessagesQuery {
    type Item = Message;
    type Key = (CardId, MessageId);

    fn key(&self, item: &Message) -> Self::Key {
        (item.card.clone(), item.id)
    }

    fn compare(&self, a: &Message, b: &Message) -> Ordering {
        ordered(self.params.order.unwrap_or_default(), &a.id, &b.id)
            .then_with(|| a.card.cmp(&b.card))
    }

    fn limit(&self) -> Option<usize> {
        self.params.limit.map(|l| l as usize)
    }

    async fn find(&self, api: &dyn CommunicationApi) -> Result<Vec<Message>> {
        api.find_messages(&self.params).await
    }

    fn classify(
        &self,
        event: &BroadcastEvent,
        current: &QueryResult<Message, Self::Key>,
    ) -> Vec<Delta<Message, Self::Key>> {
        match event {
            BroadcastEvent::MessageCreated { message } if self.accepts(message) => {
                vec![Delta::Add(message.clone())]
            }
            BroadcastEvent::PatchCreated { card, patch } => {
                match current.get(&(card.clone(), patch.message_id)) {
                    Some(message) => {
                        let mut message = message.clone();
                        message.apply_patch(patch);
                        vec![Delta::Update(message)]
                    }
                    None => Vec::new(),
                }
            }
            BroadcastEvent::CardRemoved { card } if self.params.card.as_ref() == Some(card) => {
                vec![Delta::Terminate]
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub struct CollaboratorsQuery {
    pub params: FindCollaboratorsParams,
}

impl CollaboratorsQuery {
    pub fn new(params: FindCollaboratorsParams) -> Self {
        Self { params }
    }

    fn watches(&self, card: &CardId) -> bool {
        self.params.card.as_ref().map_or(true, |c| c == card)
    }
}

#[async_trait]
impl QueryDef for CollaboratorsQuery {
    type Item = Collaborator;
    type Key = (CardId, AccountId);

    fn key(&self, item: &Collaborator) -> Self::Key {
        (item.card.clone(), item.account.clone())
    }

    fn compare(&self, a: &Collaborator, b: &Collaborator) -> Ordering {
        a.date
            .cmp(&b.date)
            .then_with(|| a.account.cmp(&b.account))
            .then_with(|| a.card.cmp(&b.card))
    }

    fn limit(&self) -> Option<usize> {
        self.params.limit.map(|l| l as usize)
    }

    async fn find(&self, api: &dyn CommunicationApi) -> Result<Vec<Collaborator>> {
        api.find_collaborators(&self.params).await
    }

    fn classify(
        &self,
        event: &BroadcastEvent,
        _current: &QueryResult<Collaborator, Self::Key>,
    ) -> Vec<Delta<Collaborator, Self::Key>> {
        match event {
            BroadcastEvent::CollaboratorsAdded {
                card,
                collaborators,
            } if self.watches(card) => collaborators
                .iter()
                .filter(|c| self.params.account.as_ref().map_or(true, |a| a == &c.account))
                .cloned()
                .map(Delta::Add)
                .collect(),
            BroadcastEvent::CollaboratorsRemoved { card, accounts } if self.watches(card) => {
                accounts
                    .iter()
                    .map(|a| Delta::Remove((card.clone(), a.clone())))
                    .collect()
            }
            BroadcastEvent::CardRemoved { card } if self.params.card.as_ref() == Some(card) => {
                vec![Delta::Terminate]
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notification contexts
// ---------------------------------------------------------------------------

pub struct NotificationContextsQuery {
    pub params: FindNotificationContextsParams,
}

impl NotificationContextsQuery {
    pub fn new(params: FindNotificationContextsParams) -> Self {
        Self { params }
    }

    fn accepts(&self, context: &NotificationContext) -> bool {
        let p = &self.params;
        p.id.as_ref().map_or(true, |id| id == &context.id)
            && p.card.as_ref().map_or(true, |c| c == &context.card)
            && p.account.as_ref().map_or(true, |a| a == &context.account)
            && p.last_update
                .as_ref()
                .map_or(true, |c| c.matches(&context.last_update))
    }

    /// Carry embedded notifications over from the current copy, since
    /// context broadcasts never include them.
    fn with_embedded(
        &self,
        mut context: NotificationContext,
        current: Option<&NotificationContext>,
    ) -> NotificationContext {
        if self.params.notifications.is_some() {
            context.notifications = Some(
                current
                    .and_then(|c| c.notifications.clone())
                    .unwrap_or_default(),
            );
        }
        context
    }

    fn with_notifications(
        &self,
        current: &QueryResult<NotificationContext, ContextId>,
        id: &ContextId,
        edit: impl FnOnce(&mut Vec<Notification>),
    ) -> Vec<Delta<NotificationContext, ContextId>> {
        if self.params.notifications.is_none() {
            return Vec::new();
        }
        match current.get(id) {
            Some(context) => {
                let mut context = context.clone();
                edit(context.notifications.get_or_insert_with(Vec::new));
                vec![Delta::Update(context)]
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl QueryDef for NotificationContextsQuery {
    type Item = NotificationContext;
    type Key = ContextId;

    fn key(&self, item: &NotificationContext) -> ContextId {
        item.id.clone()
    }

    fn compare(&self, a: &NotificationContext, b: &NotificationContext) -> Ordering {
        let order = self.params.order.unwrap_or(SortOrder::Descending);
        ordered(order, &a.last_update, &b.last_update).then_with(|| a.id.cmp(&b.id))
    }

    fn limit(&self) -> Option<usize> {
        self.params.limit.map(|l| l as usize)
    }

    async fn find(&self, api: &dyn CommunicationApi) -> Result<Vec<NotificationContext>> {
        api.find_notification_contexts(&self.params).await
    }

    fn classify(
        &self,
        event: &BroadcastEvent,
        current: &QueryResult<NotificationContext, ContextId>,
    ) -> Vec<Delta<NotificationContext, ContextId>> {
        match event {
            BroadcastEvent::NotificationContextCreated { context } if self.accepts(context) => {
                vec![Delta::Add(self.with_embedded(context.clone(), None))]
            }
            BroadcastEvent::NotificationContextUpdated { context } => {
                let present = current.get(&context.id);
                if self.accepts(context) {
                    vec![Delta::Add(self.with_embedded(context.clone(), present))]
                } else if present.is_some() {
                    vec![Delta::Remove(context.id.clone())]
                } else {
                    Vec::new()
                }
            }
            BroadcastEvent::NotificationContextRemoved { context } => {
                vec![Delta::Remove(context.id.clone())]
            }
            BroadcastEvent::NotificationCreated { notification } => {
                let embed = self.params.notifications.clone().unwrap_or_default();
                if embed.read.is_some_and(|r| r != notification.read) {
                    return Vec::new();
                }
                self.with_notifications(current, &notification.context, |list| {
                    list.insert(0, notification.clone());
                    if let Some(limit) = embed.limit {
                        list.truncate(limit as usize);
                    }
                })
            }
            BroadcastEvent::NotificationsRemoved { context, ids, .. } => {
                self.with_notifications(current, context, |list| {
                    list.retain(|n| !ids.contains(&n.id));
                })
            }
            BroadcastEvent::NotificationsUpdated { context, .. }
                if self.params.notifications.is_some() && current.contains(context) =>
            {
                vec![Delta::Refetch]
            }
            BroadcastEvent::CardRemoved { card } => current
                .iter()
                .filter(|c| &c.card == card)
                .map(|c| Delta::Remove(c.id.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub struct NotificationsQuery {
    pub params: FindNotificationsParams,
}

impl NotificationsQuery {
    pub fn new(params: FindNotificationsParams) -> Self {
        Self { params }
    }

    fn accepts(&self, n: &Notification) -> bool {
        let p = &self.params;
        p.id.as_ref().map_or(true, |id| id == &n.id)
            && p.context.as_ref().map_or(true, |c| c == &n.context)
            && p.card.as_ref().map_or(true, |c| c == &n.card)
            && p.account.as_ref().map_or(true, |a| a == &n.account)
            && p.read.map_or(true, |r| r == n.read)
            && p.archived.map_or(true, |a| a == n.archived)
            && p.created.as_ref().map_or(true, |c| c.matches(&n.created))
    }
}

#[async_trait]
impl QueryDef for NotificationsQuery {
    type Item = Notification;
    type Key = NotificationId;

    fn key(&self, item: &Notification) -> NotificationId {
        item.id.clone()
    }

    fn compare(&self, a: &Notification, b: &Notification) -> Ordering {
        let order = self.params.order.unwrap_or(SortOrder::Descending);
        ordered(order, &a.created, &b.created).then_with(|| a.id.cmp(&b.id))
    }

    fn limit(&self) -> Option<usize> {
        self.params.limit.map(|l| l as usize)
    }

    async fn find(&self, api: &dyn CommunicationApi) -> Result<Vec<Notification>> {
        api.find_notifications(&self.params).await
    }

    fn classify(
        &self,
        event: &BroadcastEvent,
        current: &QueryResult<Notification, NotificationId>,
    ) -> Vec<Delta<Notification, NotificationId>> {
        match event {
            BroadcastEvent::NotificationCreated { notification } if self.accepts(notification) => {
                vec![Delta::Add(notification.clone())]
            }
            BroadcastEvent::NotificationsUpdated {
                context,
                id,
                until,
                read,
                archived,
                ..
            } => current
                .iter()
                .filter(|n| &n.context == context)
                .filter(|n| id.as_ref().map_or(true, |id| id == &n.id))
                .filter(|n| until.map_or(true, |u| n.created <= u))
                .map(|n| {
                    let mut n = n.clone();
                    if let Some(read) = read {
                        n.read = *read;
                    }
                    if let Some(archived) = archived {
                        n.archived = *archived;
                    }
                    if self.accepts(&n) {
                        Delta::Update(n)
                    } else {
                        Delta::Remove(n.id)
                    }
                })
                .collect(),
            BroadcastEvent::NotificationsRemoved { ids, .. } => {
                ids.iter().cloned().map(Delta::Remove).collect()
            }
            BroadcastEvent::NotificationContextRemoved { context } => {
                if self.params.context.as_ref() == Some(&context.id) {
                    vec![Delta::Terminate]
                } else {
                    current
                        .iter()
                        .filter(|n| n.context == context.id)
                        .map(|n| Delta::Remove(n.id.clone()))
                        .collect()
                }
            }
            BroadcastEvent::CardRemoved { card } => {
                if self.params.card.as_ref() == Some(card) {
                    vec![Delta::Terminate]
                } else {
                    current
                        .iter()
                        .filter(|n| &n.card == card)
                        .map(|n| Delta::Remove(n.id.clone()))
                        .collect()
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, TimeZone, Utc};
    use parley_shared::event::{Event, EventResult};
    use parley_shared::model::{MessageMeta, MessageType, MessagesGroup};
    use parley_shared::query::FindMessagesGroupsParams;
    use parley_shared::types::SocialId;
    use parley_shared::CommunicationError;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::api::Subscription;
    use crate::error::ClientError;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn message(id: u64) -> Message {
        Message {
            id: MessageId(id),
            card: CardId::from("C1"),
            message_type: MessageType::Message,
            content: format!("m{id}"),
            creator: SocialId::from("alice"),
            created: at(id as u32),
            edited: None,
            removed: false,
            extra: None,
            reactions: Vec::new(),
            attachments: Vec::new(),
            thread: None,
        }
    }

    fn notification(id: &str, minute: u32) -> Notification {
        Notification {
            id: NotificationId::from(id),
            context: ContextId::from("ctx"),
            card: CardId::from("C1"),
            account: AccountId::from("bob"),
            message: MessageId(minute as u64),
            message_created: at(minute),
            created: at(minute),
            read: false,
            archived: false,
        }
    }

    /// Serves canned results; `gate` holds every find until released.
    #[derive(Default)]
    struct FakeApi {
        messages: Mutex<Vec<Message>>,
        notifications: Mutex<Vec<Notification>>,
        collaborators: Mutex<Vec<Collaborator>>,
        finds: Mutex<u32>,
        fail: bool,
        gate: Option<Semaphore>,
    }

    impl FakeApi {
        fn finds(&self) -> u32 {
            *self.finds.lock().unwrap()
        }

        async fn enter(&self) -> Result<()> {
            *self.finds.lock().unwrap() += 1;
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail {
                return Err(CommunicationError::Network("down".into()).into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CommunicationApi for FakeApi {
        async fn event(&self, _: Event) -> Result<EventResult> {
            Ok(EventResult::default())
        }

        async fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
            self.enter().await?;
            let all = self.messages.lock().unwrap().clone();
            Ok(all
                .into_iter()
                .take(params.limit.map_or(usize::MAX, |l| l as usize))
                .collect())
        }

        async fn find_messages_meta(&self, _: &FindMessagesParams) -> Result<Vec<MessageMeta>> {
            Ok(Vec::new())
        }

        async fn find_messages_groups(
            &self,
            _: &FindMessagesGroupsParams,
        ) -> Result<Vec<MessagesGroup>> {
            Ok(Vec::new())
        }

        async fn find_notification_contexts(
            &self,
            _: &FindNotificationContextsParams,
        ) -> Result<Vec<NotificationContext>> {
            Ok(Vec::new())
        }

        async fn find_notifications(
            &self,
            params: &FindNotificationsParams,
        ) -> Result<Vec<Notification>> {
            self.enter().await?;
            let all = self.notifications.lock().unwrap().clone();
            Ok(all
                .into_iter()
                .take(params.limit.map_or(usize::MAX, |l| l as usize))
                .collect())
        }

        async fn find_collaborators(
            &self,
            params: &FindCollaboratorsParams,
        ) -> Result<Vec<Collaborator>> {
            self.enter().await?;
            let all = self.collaborators.lock().unwrap().clone();
            Ok(all
                .into_iter()
                .take(params.limit.map_or(usize::MAX, |l| l as usize))
                .collect())
        }

        async fn subscribe(&self, _: &Subscription) -> Result<Broadcasts> {
            Err(ClientError::NotInitialized)
        }
    }

    fn recorder<T: Send + 'static, U: Send + 'static>(
        project: impl Fn(&T) -> U + Send + 'static,
    ) -> (
        impl FnMut(Vec<T>) + Send + 'static,
        mpsc::UnboundedReceiver<Vec<U>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |items: Vec<T>| {
            let _ = tx.send(items.iter().map(&project).collect());
        };
        (callback, rx)
    }

    fn ids(m: &Message) -> u64 {
        m.id.0
    }

    fn created(id: u64) -> BroadcastEvent {
        BroadcastEvent::MessageCreated {
            message: message(id),
        }
    }

    fn messages_query(limit: Option<u32>) -> MessagesQuery {
        MessagesQuery::new(FindMessagesParams {
            limit,
            ..FindMessagesParams::for_card("C1")
        })
    }

    #[tokio::test]
    async fn adds_only_while_below_limit() {
        let api = Arc::new(FakeApi::default());
        *api.messages.lock().unwrap() = vec![message(1), message(2)];
        let (callback, mut rx) = recorder(ids);

        let handle = LiveQuery::spawn(messages_query(Some(3)), api.clone(), callback);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);

        handle.event(created(3));
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);

        handle.event(created(4));
        handle.event(BroadcastEvent::CardRemoved {
            card: CardId::from("other"),
        });
        handle.close().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn patches_update_items_in_place() {
        use parley_shared::model::{Patch, PatchData, UpdatePatchData};

        let api = Arc::new(FakeApi::default());
        *api.messages.lock().unwrap() = vec![message(1)];
        let (callback, mut rx) = recorder(|m: &Message| m.content.clone());

        let handle = LiveQuery::spawn(messages_query(None), api, callback);
        assert_eq!(rx.recv().await.unwrap(), vec!["m1"]);

        handle.event(BroadcastEvent::PatchCreated {
            card: CardId::from("C1"),
            patch: Patch {
                card: CardId::from("C1"),
                message_id: MessageId(1),
                creator: SocialId::from("alice"),
                created: at(30),
                data: PatchData::Update(UpdatePatchData {
                    content: Some("edited".into()),
                    extra: None,
                }),
            },
        });
        assert_eq!(rx.recv().await.unwrap(), vec!["edited"]);
        handle.close().await;
    }

    #[tokio::test]
    async fn removal_from_full_result_refetches() {
        let api = Arc::new(FakeApi::default());
        *api.notifications.lock().unwrap() = vec![notification("n1", 1), notification("n2", 2)];
        let (callback, mut rx) = recorder(|n: &Notification| n.id.to_string());

        let query = NotificationsQuery::new(FindNotificationsParams {
            limit: Some(2),
            order: Some(SortOrder::Ascending),
            ..Default::default()
        });
        let handle = LiveQuery::spawn(query, api.clone(), callback);
        assert_eq!(rx.recv().await.unwrap(), vec!["n1", "n2"]);

        *api.notifications.lock().unwrap() = vec![notification("n2", 2), notification("n3", 3)];
        handle.event(BroadcastEvent::NotificationsRemoved {
            context: ContextId::from("ctx"),
            account: AccountId::from("bob"),
            ids: vec![NotificationId::from("n1")],
        });
        assert_eq!(rx.recv().await.unwrap(), vec!["n2", "n3"]);
        assert_eq!(api.finds(), 2);
        handle.close().await;
    }

    fn collaborator(account: &str, minute: u32) -> Collaborator {
        Collaborator {
            card: CardId::from("C1"),
            account: AccountId::from(account),
            date: at(minute),
        }
    }

    #[tokio::test]
    async fn collaborators_respect_the_limit() {
        let api = Arc::new(FakeApi::default());
        *api.collaborators.lock().unwrap() = vec![collaborator("alice", 1)];
        let (callback, mut rx) = recorder(|c: &Collaborator| c.account.to_string());

        let query = CollaboratorsQuery::new(FindCollaboratorsParams {
            card: Some(CardId::from("C1")),
            limit: Some(2),
            ..Default::default()
        });
        let handle = LiveQuery::spawn(query, api.clone(), callback);
        assert_eq!(rx.recv().await.unwrap(), vec!["alice"]);

        handle.event(BroadcastEvent::CollaboratorsAdded {
            card: CardId::from("C1"),
            collaborators: vec![collaborator("bob", 2)],
        });
        assert_eq!(rx.recv().await.unwrap(), vec!["alice", "bob"]);

        // Full: a newcomer is dropped rather than growing the result.
        handle.event(BroadcastEvent::CollaboratorsAdded {
            card: CardId::from("C1"),
            collaborators: vec![collaborator("carol", 3)],
        });

        *api.collaborators.lock().unwrap() = vec![collaborator("bob", 2)];
        handle.event(BroadcastEvent::CollaboratorsRemoved {
            card: CardId::from("C1"),
            accounts: vec![AccountId::from("alice")],
        });
        assert_eq!(rx.recv().await.unwrap(), vec!["bob"]);
        assert_eq!(api.finds(), 2);

        // Below the limit again, removals apply without a find.
        handle.event(BroadcastEvent::CollaboratorsRemoved {
            card: CardId::from("C1"),
            accounts: vec![AccountId::from("bob")],
        });
        assert_eq!(rx.recv().await.unwrap(), Vec::<String>::new());
        assert_eq!(api.finds(), 2);
        handle.close().await;
    }

    #[tokio::test]
    async fn removal_below_limit_applies_locally() {
        let api = Arc::new(FakeApi::default());
        *api.notifications.lock().unwrap() = vec![notification("n1", 1), notification("n2", 2)];
        let (callback, mut rx) = recorder(|n: &Notification| n.id.to_string());

        let handle = LiveQuery::spawn(
            NotificationsQuery::new(FindNotificationsParams::default()),
            api.clone(),
            callback,
        );
        assert_eq!(rx.recv().await.unwrap(), vec!["n2", "n1"]);

        handle.event(BroadcastEvent::NotificationsUpdated {
            context: ContextId::from("ctx"),
            account: AccountId::from("bob"),
            id: Some(NotificationId::from("n2")),
            until: None,
            read: Some(true),
            archived: None,
        });
        let after = rx.recv().await.unwrap();
        assert_eq!(after, vec!["n2", "n1"]);

        handle.event(BroadcastEvent::NotificationsRemoved {
            context: ContextId::from("ctx"),
            account: AccountId::from("bob"),
            ids: vec![NotificationId::from("n2")],
        });
        assert_eq!(rx.recv().await.unwrap(), vec!["n1"]);
        assert_eq!(api.finds(), 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn events_during_initialisation_are_replayed() {
        let api = Arc::new(FakeApi {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        });
        *api.messages.lock().unwrap() = vec![message(1)];
        let (callback, mut rx) = recorder(ids);

        let handle = LiveQuery::spawn(messages_query(None), api.clone(), callback);
        handle.event(created(2));
        handle.event(created(1));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        api.gate.as_ref().unwrap().add_permits(1);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);
        handle.close().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_notifies_once_then_ignores() {
        let api = Arc::new(FakeApi::default());
        *api.messages.lock().unwrap() = vec![message(1)];
        let (callback, mut rx) = recorder(ids);

        let handle = LiveQuery::spawn(messages_query(None), api, callback);
        assert_eq!(rx.recv().await.unwrap(), vec![1]);

        handle.event(BroadcastEvent::CardRemoved {
            card: CardId::from("C1"),
        });
        handle.event(created(2));
        handle.refresh();
        assert_eq!(rx.recv().await.unwrap(), Vec::<u64>::new());

        handle.close().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_discards_in_flight_find() {
        let api = Arc::new(FakeApi {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        });
        *api.messages.lock().unwrap() = vec![message(1)];
        let (callback, mut rx) = recorder(ids);

        let handle = LiveQuery::spawn(messages_query(None), api.clone(), callback);
        handle.unsubscribe();
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        api.gate.as_ref().unwrap().add_permits(1);
        handle.close().await;
        assert_eq!(api.finds(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_find_starts_empty() {
        let api = Arc::new(FakeApi {
            fail: true,
            ..Default::default()
        });
        let (callback, mut rx) = recorder(ids);

        let handle = LiveQuery::spawn(messages_query(None), api, callback);
        assert_eq!(rx.recv().await.unwrap(), Vec::<u64>::new());

        handle.event(created(5));
        assert_eq!(rx.recv().await.unwrap(), vec![5]);
        handle.close().await;
    }

    #[test]
    fn context_updates_keep_embedded_notifications() {
        let query = NotificationContextsQuery::new(FindNotificationContextsParams {
            account: Some(AccountId::from("bob")),
            notifications: Some(Default::default()),
            ..Default::default()
        });
        let context = NotificationContext {
            id: ContextId::from("ctx"),
            card: CardId::from("C1"),
            account: AccountId::from("bob"),
            last_view: None,
            last_update: at(1),
            last_notify: None,
            notifications: Some(vec![notification("n1", 1)]),
        };
        let mut current = QueryResult::new();
        current.insert(context.id.clone(), context.clone(), |a, b| query.compare(a, b));

        let updated = NotificationContext {
            last_update: at(5),
            notifications: None,
            ..context
        };
        let deltas = query.classify(
            &BroadcastEvent::NotificationContextUpdated {
                context: updated.clone(),
            },
            &current,
        );
        match deltas.as_slice() {
            [Delta::Add(ctx)] => {
                assert_eq!(ctx.last_update, at(5));
                assert_eq!(ctx.notifications.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("unexpected deltas {other:?}"),
        }
    }
}
