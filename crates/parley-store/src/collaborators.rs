use chrono::{DateTime, Utc};
use parley_shared::model::Collaborator;
use parley_shared::query::FindCollaboratorsParams;
use parley_shared::types::{AccountId, CardId};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, limit_sql, Filter};

impl Database {
    /// Add accounts to a card; returns only the newly added collaborators.
    pub fn insert_collaborators(
        &self,
        card: &CardId,
        accounts: &[AccountId],
        date: DateTime<Utc>,
    ) -> Result<Vec<Collaborator>> {
        let tx = self.conn()?.unchecked_transaction()?;
        let mut added = Vec::new();

        for account in accounts {
            let affected = tx.execute(
                "INSERT OR IGNORE INTO collaborators (card, account, date) VALUES (?1, ?2, ?3)",
                params![card.as_str(), account.as_str(), sql::ts(&date)],
            )?;
            if affected > 0 {
                added.push(Collaborator {
                    card: card.clone(),
                    account: account.clone(),
                    date,
                });
            }
        }

        tx.commit()?;
        Ok(added)
    }

    pub fn delete_collaborators(
        &self,
        card: &CardId,
        accounts: &[AccountId],
    ) -> Result<Vec<AccountId>> {
        let tx = self.conn()?.unchecked_transaction()?;
        let mut removed = Vec::new();

        for account in accounts {
            let affected = tx.execute(
                "DELETE FROM collaborators WHERE card = ?1 AND account = ?2",
                params![card.as_str(), account.as_str()],
            )?;
            if affected > 0 {
                removed.push(account.clone());
            }
        }

        tx.commit()?;
        Ok(removed)
    }

    pub fn get_collaborators(&self, params: &FindCollaboratorsParams) -> Result<Vec<Collaborator>> {
        let mut filter = Filter::new();
        filter
            .eq_opt("card", params.card.as_ref().map(|v| v.to_string()))
            .eq_opt("account", params.account.as_ref().map(|v| v.to_string()));

        let query = format!(
            "SELECT card, account, date FROM collaborators{} ORDER BY date ASC, account ASC{}",
            filter.where_sql(),
            limit_sql(params.limit),
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(filter.params(), |row| {
            let card: String = row.get(0)?;
            let account: String = row.get(1)?;
            let date: String = row.get(2)?;
            Ok(Collaborator {
                card: CardId::new(card),
                account: AccountId::new(account),
                date: sql::parse_ts(2, &date)?,
            })
        })?;

        let mut collaborators = Vec::new();
        for row in rows {
            collaborators.push(row?);
        }
        Ok(collaborators)
    }
}
