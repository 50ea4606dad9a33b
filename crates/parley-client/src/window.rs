//! Client-driven paging over a newest-first ordering.
//!
//! A [`Window`] shows a growing slice of a source. `load_prev_page` walks
//! towards older items and keeps fetching until the visible count grew by
//! a full page or the source ran dry, so a client-side filter can never
//! turn a short page into a premature end. Items fetched beyond the page
//! are buffered for the next call.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_shared::model::NotificationContext;
use parley_shared::query::{
    Comparison, EmbeddedNotifications, FindNotificationContextsParams, SortOrder,
};
use parley_shared::types::AccountId;

use crate::api::CommunicationApi;
use crate::error::Result;

/// Notifications embedded per context by [`Window::inbox`].
const INBOX_NOTIFICATIONS_PER_CONTEXT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards older items (previous page).
    Older,
    /// Towards newer items (next page).
    Newer,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Clone + Send + Sync;
    type Anchor: Clone + Send + Sync;

    fn anchor(&self, item: &Self::Item) -> Self::Anchor;

    /// Up to `limit` items strictly past `anchor` in `direction`, newest
    /// first. `None` starts from the newest end.
    async fn fetch(
        &self,
        direction: Direction,
        anchor: Option<&Self::Anchor>,
        limit: usize,
    ) -> Result<Vec<Self::Item>>;
}

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Window<S: PageSource> {
    source: S,
    limit: usize,
    filter: Option<Filter<S::Item>>,
    visible: Vec<S::Item>,
    surplus: VecDeque<S::Item>,
    oldest: Option<S::Anchor>,
    newest: Option<S::Anchor>,
    older_exhausted: bool,
    has_newer: bool,
}

impl<S: PageSource> Window<S> {
    pub fn new(source: S, limit: usize) -> Self {
        Self {
            source,
            limit: limit.max(1),
            filter: None,
            visible: Vec::new(),
            surplus: VecDeque::new(),
            oldest: None,
            newest: None,
            older_exhausted: false,
            has_newer: false,
        }
    }

    /// Hide items the predicate rejects. Must be set before loading.
    pub fn with_filter(mut self, filter: impl Fn(&S::Item) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn get_result(&self) -> &[S::Item] {
        &self.visible
    }

    pub fn has_prev_page(&self) -> bool {
        !self.surplus.is_empty() || !self.older_exhausted
    }

    pub fn has_next_page(&self) -> bool {
        self.has_newer
    }

    fn accepts(&self, item: &S::Item) -> bool {
        self.filter.as_ref().map_or(true, |f| f(item))
    }

    /// Grow the window by up to one page of older items. Returns how many
    /// became visible.
    pub async fn load_prev_page(&mut self) -> Result<usize> {
        let target = self.visible.len() + self.limit;
        let before = self.visible.len();

        while self.visible.len() < target {
            match self.surplus.pop_front() {
                Some(item) => self.visible.push(item),
                None => break,
            }
        }

        while self.visible.len() < target && !self.older_exhausted {
            let raw = self
                .source
                .fetch(Direction::Older, self.oldest.as_ref(), self.limit)
                .await?;
            self.older_exhausted = raw.len() < self.limit;
            if let Some(last) = raw.last() {
                self.oldest = Some(self.source.anchor(last));
            }
            if self.newest.is_none() {
                self.newest = raw.first().map(|i| self.source.anchor(i));
            }

            for item in raw {
                if !self.accepts(&item) {
                    continue;
                }
                if self.visible.len() < target {
                    self.visible.push(item);
                } else {
                    self.surplus.push_back(item);
                }
            }
        }

        let added = self.visible.len() - before;
        tracing::trace!(
            added,
            visible = self.visible.len(),
            buffered = self.surplus.len(),
            "loaded previous page"
        );
        Ok(added)
    }

    /// Prepend up to one page of items newer than the newest seen.
    pub async fn load_next_page(&mut self) -> Result<usize> {
        if self.newest.is_none() {
            return self.load_prev_page().await;
        }

        let raw = self
            .source
            .fetch(Direction::Newer, self.newest.as_ref(), self.limit)
            .await?;
        self.has_newer = raw.len() >= self.limit;
        if let Some(first) = raw.first() {
            self.newest = Some(self.source.anchor(first));
        }

        let fresh: Vec<S::Item> = raw.into_iter().filter(|i| self.accepts(i)).collect();
        let added = fresh.len();
        self.visible.splice(0..0, fresh);
        Ok(added)
    }
}

/// Notification contexts of one account, most recently updated first.
pub struct ContextPages {
    api: Arc<dyn CommunicationApi>,
    account: AccountId,
    notifications: Option<EmbeddedNotifications>,
}

impl ContextPages {
    pub fn new(api: Arc<dyn CommunicationApi>, account: impl Into<AccountId>) -> Self {
        Self {
            api,
            account: account.into(),
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, embed: EmbeddedNotifications) -> Self {
        self.notifications = Some(embed);
        self
    }
}

#[async_trait]
impl PageSource for ContextPages {
    type Item = NotificationContext;
    type Anchor = DateTime<Utc>;

    fn anchor(&self, item: &NotificationContext) -> DateTime<Utc> {
        item.last_update
    }

    async fn fetch(
        &self,
        direction: Direction,
        anchor: Option<&DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<NotificationContext>> {
        let (last_update, order) = match direction {
            Direction::Older => (anchor.map(|a| Comparison::less(*a)), SortOrder::Descending),
            Direction::Newer => (anchor.map(|a| Comparison::greater(*a)), SortOrder::Ascending),
        };
        let mut contexts = self
            .api
            .find_notification_contexts(&FindNotificationContextsParams {
                account: Some(self.account.clone()),
                last_update,
                order: Some(order),
                limit: Some(limit as u32),
                notifications: self.notifications.clone(),
                ..Default::default()
            })
            .await?;
        if direction == Direction::Newer {
            contexts.reverse();
        }
        Ok(contexts)
    }
}

impl Window<ContextPages> {
    /// The account's inbox: contexts that hold at least one notification.
    pub fn inbox(api: Arc<dyn CommunicationApi>, account: impl Into<AccountId>, limit: usize) -> Self {
        let pages = ContextPages::new(api, account).with_notifications(EmbeddedNotifications {
            limit: Some(INBOX_NOTIFICATIONS_PER_CONTEXT),
            read: None,
        });
        Window::new(pages, limit)
            .with_filter(|ctx| ctx.notifications.as_ref().is_some_and(|n| !n.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use parley_shared::event::{
        CreateNotificationContextEvent, CreateNotificationEvent, Event,
    };
    use parley_shared::types::{CardId, MessageId};
    use parley_store::MemoryBlobStorage;

    use super::*;
    use crate::local::{LocalClient, LocalClientConfig};

    /// Numbers `n..=1`, newest (largest) first.
    struct Countdown {
        top: u32,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl PageSource for Countdown {
        type Item = u32;
        type Anchor = u32;

        fn anchor(&self, item: &u32) -> u32 {
            *item
        }

        async fn fetch(
            &self,
            direction: Direction,
            anchor: Option<&u32>,
            limit: usize,
        ) -> Result<Vec<u32>> {
            *self.fetches.lock().unwrap() += 1;
            let all = (1..=self.top).rev();
            Ok(match direction {
                Direction::Older => all
                    .filter(|n| anchor.map_or(true, |a| n < a))
                    .take(limit)
                    .collect(),
                Direction::Newer => {
                    let mut newer: Vec<u32> = (1..=self.top)
                        .filter(|n| anchor.map_or(true, |a| n > a))
                        .take(limit)
                        .collect();
                    newer.reverse();
                    newer
                }
            })
        }
    }

    fn countdown(top: u32) -> Countdown {
        Countdown {
            top,
            fetches: Mutex::new(0),
        }
    }

    #[tokio::test]
    async fn filtered_pages_keep_loading_until_full() {
        let mut window = Window::new(countdown(12), 3).with_filter(|n| n % 3 != 0);

        assert_eq!(window.load_prev_page().await.unwrap(), 3);
        assert_eq!(window.get_result(), [11, 10, 8]);
        assert!(window.has_prev_page());

        assert_eq!(window.load_prev_page().await.unwrap(), 3);
        assert_eq!(window.get_result(), [11, 10, 8, 7, 5, 4]);

        while window.has_prev_page() {
            window.load_prev_page().await.unwrap();
        }
        assert_eq!(window.get_result(), [11, 10, 8, 7, 5, 4, 2, 1]);
        assert!(!window.has_next_page());
    }

    #[tokio::test]
    async fn surplus_is_served_before_fetching() {
        let mut window = Window::new(countdown(12), 3).with_filter(|n| n % 3 != 0);
        window.load_prev_page().await.unwrap();
        let fetched = *window.source.fetches.lock().unwrap();
        assert_eq!(fetched, 2);

        window.load_prev_page().await.unwrap();
        assert_eq!(*window.source.fetches.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn next_page_prepends_newer_items() {
        let mut window = Window::new(countdown(5), 2);
        window.load_prev_page().await.unwrap();
        assert_eq!(window.get_result(), [5, 4]);

        window.source.top = 8;
        assert_eq!(window.load_next_page().await.unwrap(), 2);
        assert_eq!(window.get_result(), [7, 6, 5, 4]);
        assert!(window.has_next_page());

        assert_eq!(window.load_next_page().await.unwrap(), 1);
        assert_eq!(window.get_result(), [8, 7, 6, 5, 4]);
        assert!(!window.has_next_page());
    }

    #[tokio::test]
    async fn inbox_skips_contexts_without_notifications() {
        let client = Arc::new(LocalClient::new(
            LocalClientConfig::new(":memory:", "bob"),
            Arc::new(MemoryBlobStorage::new()),
        ));
        client.init().await.unwrap();

        let at = |minute: u32| Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap();
        for i in 0..10u32 {
            let result = client
                .event(Event::CreateNotificationContext(CreateNotificationContextEvent {
                    card: CardId::new(format!("C{i}")),
                    account: AccountId::from("bob"),
                    last_view: None,
                    last_update: at(i),
                }))
                .await
                .unwrap();
            if i % 2 == 1 {
                client
                    .event(Event::CreateNotification(CreateNotificationEvent {
                        context: result.context_id.unwrap(),
                        account: AccountId::from("bob"),
                        message_id: MessageId(1),
                        message_created: at(i),
                        created: at(i),
                    }))
                    .await
                    .unwrap();
            }
        }

        let mut inbox = Window::inbox(client.clone(), "bob", 3);
        inbox.load_prev_page().await.unwrap();
        let cards: Vec<_> = inbox.get_result().iter().map(|c| c.card.to_string()).collect();
        assert_eq!(cards, ["C9", "C7", "C5"]);

        while inbox.has_prev_page() {
            inbox.load_prev_page().await.unwrap();
        }
        assert_eq!(inbox.get_result().len(), 5);
    }
}
