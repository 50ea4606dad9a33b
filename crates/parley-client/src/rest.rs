//! Gateway over the server's REST surface.
//!
//! Events are posted as `{event, modifiedBy, modifiedOn}` envelopes; finds
//! are `GET` requests carrying their filter as a JSON `params` query
//! value. Broadcasts arrive over a server-sent event stream whose first
//! `session` event names the session used for every later request.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parley_shared::event::{BroadcastEvent, Event, EventResult, TxEnvelope};
use parley_shared::model::{
    Collaborator, Message, MessageMeta, MessagesGroup, Notification, NotificationContext,
};
use parley_shared::query::{
    FindCollaboratorsParams, FindMessagesGroupsParams, FindMessagesParams,
    FindNotificationContextsParams, FindNotificationsParams, Operation,
};
use parley_shared::retry::{Retry, RetryOptions};
use parley_shared::types::{AccountId, SessionId, SocialId};
use parley_shared::CommunicationError;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::api::{Broadcasts, CommunicationApi, Subscription};
use crate::error::{check_status, from_reqwest, ClientError, Result};

pub use parley_shared::constants::{ACCOUNT_HEADER, SESSION_HEADER};

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Server origin, e.g. `http://localhost:3000`.
    pub base_url: String,
    pub workspace: String,
    pub account: AccountId,
    /// Recorded as `modifiedBy` on every transaction.
    pub social_id: SocialId,
    pub retry: RetryOptions,
    /// Per-request timeout; the broadcast stream is exempt.
    pub timeout: Duration,
}

impl RestClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        workspace: impl Into<String>,
        account: impl Into<AccountId>,
    ) -> Self {
        let account = account.into();
        Self {
            base_url: base_url.into(),
            workspace: workspace.into(),
            social_id: SocialId::new(account.as_str()),
            account,
            retry: RetryOptions::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct RestClient {
    http: reqwest::Client,
    config: RestClientConfig,
    base_url: String,
    session: Mutex<Option<SessionId>>,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| ClientError::InvalidConfig(format!("base url {base_url:?}: {e}")))?;
        if config.workspace.is_empty() {
            return Err(ClientError::InvalidConfig("workspace must not be empty".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCOUNT_HEADER,
            HeaderValue::from_str(config.account.as_str())
                .map_err(|e| ClientError::InvalidConfig(format!("account header: {e}")))?,
        );

        // gzip(true) negotiates `accept-encoding` and decodes transparently.
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            http,
            config,
            base_url,
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Session announced by the broadcast stream, once subscribed.
    pub fn session(&self) -> Option<SessionId> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, id: SessionId) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session() {
            Some(id) => request.header(SESSION_HEADER, id.as_str()),
            None => request,
        }
    }

    /// Only transport failures are retried; the server has already
    /// judged anything that produced a status.
    async fn send<T, F>(&self, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let value = Retry::new(self.config.retry.clone())
            .retry_if(|e: &CommunicationError| matches!(e, CommunicationError::Network(_)))
            .run(|| {
                let request = self.with_session(build()).timeout(self.config.timeout);
                async move {
                    let response = request.send().await.map_err(from_reqwest)?;
                    let response = check_status(response).await?;
                    response.json::<T>().await.map_err(from_reqwest)
                }
            })
            .await?;
        Ok(value)
    }

    async fn find<P, T>(&self, operation: Operation, params: &P) -> Result<Vec<T>>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!(
            "{}/api/v1/request/communication/{}/{}",
            self.base_url,
            operation.as_str(),
            self.config.workspace
        );
        let params = serde_json::to_string(params).map_err(CommunicationError::from)?;
        tracing::debug!(operation = %operation, "find request");
        self.send(|| self.http.get(&url).query(&[("params", params.as_str())]))
            .await
    }
}

#[async_trait]
impl CommunicationApi for RestClient {
    async fn event(&self, event: Event) -> Result<EventResult> {
        event.validate()?;
        let url = format!("{}/api/v1/tx/{}", self.base_url, self.config.workspace);
        let envelope = TxEnvelope {
            event,
            modified_by: self.config.social_id.clone(),
            modified_on: Utc::now(),
        };
        tracing::debug!(kind = envelope.event.kind(), "posting event");
        self.send(|| self.http.post(&url).json(&envelope)).await
    }

    async fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        self.find(Operation::FindMessages, params).await
    }

    async fn find_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>> {
        self.find(Operation::FindMessagesMeta, params).await
    }

    async fn find_messages_groups(
        &self,
        params: &FindMessagesGroupsParams,
    ) -> Result<Vec<MessagesGroup>> {
        self.find(Operation::FindMessagesGroups, params).await
    }

    async fn find_notification_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>> {
        self.find(Operation::FindNotificationContexts, params).await
    }

    async fn find_notifications(
        &self,
        params: &FindNotificationsParams,
    ) -> Result<Vec<Notification>> {
        self.find(Operation::FindNotifications, params).await
    }

    async fn find_collaborators(
        &self,
        params: &FindCollaboratorsParams,
    ) -> Result<Vec<Collaborator>> {
        self.find(Operation::FindCollaborators, params).await
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<Broadcasts> {
        let url = format!("{}/api/v1/events/{}", self.base_url, self.config.workspace);
        let cards = subscription
            .cards
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut query = vec![("cards", cards)];
        if subscription.contexts {
            query.push(("contexts", "true".to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = check_status(response).await?;
        let mut stream = Box::pin(response.bytes_stream().eventsource());

        // The server announces the session before anything else.
        let session = loop {
            match stream.next().await {
                Some(Ok(event)) if event.event == "session" => break SessionId::new(event.data),
                Some(Ok(event)) => {
                    tracing::debug!(kind = %event.event, "skipping event before session");
                }
                Some(Err(e)) => return Err(CommunicationError::Network(e.to_string()).into()),
                None => {
                    return Err(CommunicationError::Network(
                        "broadcast stream closed before session".into(),
                    )
                    .into())
                }
            }
        };
        tracing::info!(session = %session, "subscribed to broadcasts");
        self.set_session(session.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(session = %session, error = %e, "broadcast stream failed");
                        break;
                    }
                };
                if event.event != "broadcast" {
                    continue;
                }
                match serde_json::from_str::<BroadcastEvent>(&event.data) {
                    Ok(broadcast) => {
                        if tx.send(broadcast).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session = %session, error = %e, "undecodable broadcast");
                    }
                }
            }
            tracing::debug!(session = %session, "broadcast stream ended");
        });

        Ok(rx)
    }
}
