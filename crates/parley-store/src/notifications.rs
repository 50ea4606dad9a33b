//! Notification contexts (one per account and card) and their notifications.

use parley_shared::model::{Notification, NotificationContext};
use parley_shared::query::{
    EmbeddedNotifications, FindNotificationContextsParams, FindNotificationsParams, SortOrder,
};
use parley_shared::types::{AccountId, CardId, ContextId, NotificationId};
use rusqlite::params;
use rusqlite::types::Value;

use crate::adapter::{ContextUpdate, NotificationUpdate};
use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value, limit_sql, order_sql, Filter};

const CONTEXT_COLUMNS: &str = "id, card, account, last_view, last_update, last_notify";
const NOTIFICATION_COLUMNS: &str =
    "id, context, card, account, message_id, message_created, created, read, archived";

impl Database {
    // -- notifications ------------------------------------------------------

    pub fn insert_notification(&self, n: &Notification) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO notifications
                 (id, context, card, account, message_id, message_created, created, read, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                n.id.as_str(),
                n.context.as_str(),
                n.card.as_str(),
                n.account.as_str(),
                id_value(n.message),
                sql::ts(&n.message_created),
                sql::ts(&n.created),
                n.read,
                n.archived,
            ],
        )?;
        Ok(())
    }

    pub fn mark_notifications(&self, update: &NotificationUpdate) -> Result<usize> {
        if update.read.is_none() && update.archived.is_none() {
            return Ok(0);
        }

        let mut filter = Filter::new();
        filter
            .eq("context", update.context.to_string())
            .eq("account", update.account.to_string())
            .eq_opt("id", update.id.as_ref().map(|id| id.to_string()));
        if let Some(until) = &update.until {
            filter.raw("created <= ?", [Value::Text(sql::ts(until))]);
        }

        let mut values: Vec<Value> = vec![
            update.read.map(Value::from).unwrap_or(Value::Null),
            update.archived.map(Value::from).unwrap_or(Value::Null),
        ];
        values.extend(filter.values().iter().cloned());

        let affected = self.conn()?.execute(
            &format!(
                "UPDATE notifications
                 SET read = COALESCE(?, read), archived = COALESCE(?, archived){}",
                filter.where_sql()
            ),
            rusqlite::params_from_iter(values.iter()),
        )?;
        Ok(affected)
    }

    pub fn delete_notifications(&self, context: &ContextId, ids: &[NotificationId]) -> Result<usize> {
        let tx = self.conn()?.unchecked_transaction()?;
        let mut affected = 0;
        for id in ids {
            affected += tx.execute(
                "DELETE FROM notifications WHERE context = ?1 AND id = ?2",
                params![context.as_str(), id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(affected)
    }

    pub fn get_notifications(&self, params: &FindNotificationsParams) -> Result<Vec<Notification>> {
        let mut filter = Filter::new();
        filter
            .eq_opt("id", params.id.as_ref().map(|v| v.to_string()))
            .eq_opt("context", params.context.as_ref().map(|v| v.to_string()))
            .eq_opt("card", params.card.as_ref().map(|v| v.to_string()))
            .eq_opt("account", params.account.as_ref().map(|v| v.to_string()))
            .eq_opt("read", params.read)
            .eq_opt("archived", params.archived)
            .compare("created", params.created.as_ref());

        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications{}{}{}",
            filter.where_sql(),
            order_sql("created", Some(params.order.unwrap_or(SortOrder::Descending))),
            limit_sql(params.limit),
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(filter.params(), row_to_notification)?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    // -- contexts -----------------------------------------------------------

    pub fn insert_context(&self, ctx: &NotificationContext) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO notification_contexts
                 (id, card, account, last_view, last_update, last_notify)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ctx.id.as_str(),
                ctx.card.as_str(),
                ctx.account.as_str(),
                ctx.last_view.as_ref().map(sql::ts),
                sql::ts(&ctx.last_update),
                ctx.last_notify.as_ref().map(sql::ts),
            ],
        )?;
        Ok(())
    }

    /// Apply the set fields of `update`; returns the context after the change.
    pub fn patch_context(
        &self,
        id: &ContextId,
        update: &ContextUpdate,
    ) -> Result<Option<NotificationContext>> {
        self.conn()?.execute(
            "UPDATE notification_contexts SET
                 last_view = COALESCE(?2, last_view),
                 last_update = COALESCE(?3, last_update),
                 last_notify = COALESCE(?4, last_notify)
             WHERE id = ?1",
            params![
                id.as_str(),
                update.last_view.as_ref().map(sql::ts),
                update.last_update.as_ref().map(sql::ts),
                update.last_notify.as_ref().map(sql::ts),
            ],
        )?;
        self.get_context(id)
    }

    pub fn delete_context(&self, id: &ContextId) -> Result<Option<NotificationContext>> {
        let Some(ctx) = self.get_context(id)? else {
            return Ok(None);
        };

        let tx = self.conn()?.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM notifications WHERE context = ?1",
            params![id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM notification_contexts WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(Some(ctx))
    }

    pub fn get_context(&self, id: &ContextId) -> Result<Option<NotificationContext>> {
        let mut found = self.get_contexts(&FindNotificationContextsParams {
            id: Some(id.clone()),
            ..Default::default()
        })?;
        Ok(found.pop())
    }

    pub fn get_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>> {
        let mut filter = Filter::new();
        filter
            .eq_opt("id", params.id.as_ref().map(|v| v.to_string()))
            .eq_opt("card", params.card.as_ref().map(|v| v.to_string()))
            .eq_opt("account", params.account.as_ref().map(|v| v.to_string()))
            .compare("last_update", params.last_update.as_ref());

        let query = format!(
            "SELECT {CONTEXT_COLUMNS} FROM notification_contexts{}{}, id ASC{}",
            filter.where_sql(),
            order_sql("last_update", Some(params.order.unwrap_or(SortOrder::Descending))),
            limit_sql(params.limit),
        );

        let mut contexts = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(filter.params(), row_to_context)?;
            let mut contexts = Vec::new();
            for row in rows {
                contexts.push(row?);
            }
            contexts
        };

        if let Some(embed) = &params.notifications {
            for ctx in &mut contexts {
                ctx.notifications = Some(self.embedded_notifications(&ctx.id, embed)?);
            }
        }
        Ok(contexts)
    }

    fn embedded_notifications(
        &self,
        context: &ContextId,
        embed: &EmbeddedNotifications,
    ) -> Result<Vec<Notification>> {
        self.get_notifications(&FindNotificationsParams {
            context: Some(context.clone()),
            read: embed.read,
            limit: embed.limit,
            order: Some(SortOrder::Descending),
            ..Default::default()
        })
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let context: String = row.get(1)?;
    let card: String = row.get(2)?;
    let account: String = row.get(3)?;
    let message_id: i64 = row.get(4)?;
    let message_created: String = row.get(5)?;
    let created: String = row.get(6)?;
    let read: bool = row.get(7)?;
    let archived: bool = row.get(8)?;

    Ok(Notification {
        id: NotificationId::new(id),
        context: ContextId::new(context),
        card: CardId::new(card),
        account: AccountId::new(account),
        message: sql::message_id(4, message_id)?,
        message_created: sql::parse_ts(5, &message_created)?,
        created: sql::parse_ts(6, &created)?,
        read,
        archived,
    })
}

fn row_to_context(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationContext> {
    let id: String = row.get(0)?;
    let card: String = row.get(1)?;
    let account: String = row.get(2)?;
    let last_view: Option<String> = row.get(3)?;
    let last_update: String = row.get(4)?;
    let last_notify: Option<String> = row.get(5)?;

    Ok(NotificationContext {
        id: ContextId::new(id),
        card: CardId::new(card),
        account: AccountId::new(account),
        last_view: sql::parse_opt_ts(3, last_view)?,
        last_update: sql::parse_ts(4, &last_update)?,
        last_notify: sql::parse_opt_ts(5, last_notify)?,
        notifications: None,
    })
}
